//! Call-service lifecycle orchestration.
//!
//! [`LifecycleEngine`] consumes start, answer and stop actions and turns the
//! current session plus its live call lists into a debounced stream of
//! [`Decision`](callkeep_core::Decision)s for the service host.

pub mod aggregator;
pub mod answer;
pub mod error;
pub mod lifecycle;
mod pipeline;
pub mod policy;
pub mod queue;
pub mod resolver;

pub use aggregator::{decide, AnswerTarget, CallStateAggregator, CombinedCalls};
pub use answer::{AnswerCoordinator, AnswerOutcome};
pub use error::EngineError;
pub use lifecycle::{DecisionStream, EngineConfig, LifecycleEngine, Published, DEFAULT_STOP_DEBOUNCE};
pub use policy::{DecisionPolicy, MAX_DEBOUNCE_WINDOW};
pub use queue::{ActionQueue, DEFAULT_QUEUE_CAPACITY};
pub use resolver::{ResolvedSession, SessionResolver};
