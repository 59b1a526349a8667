//! Service-host side of the call orchestrator.

pub mod host;
pub mod orchestrator;

pub use host::{CallService, ServiceHost, ServiceStateCell, StopCause};
pub use orchestrator::{engine_config, CallOrchestrator, EngineOrchestrator};
