//! Shared vocabulary of the call-service orchestrator: identifiers, call and
//! session models, decisions, and the collaborator traits.

pub mod calls;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod memory;
pub mod session;

pub use calls::{Call, CallStatus, ConversationType, NotificationData};
pub use decision::{Action, ActionTicket, Decision, DecisionResult, ServiceState, StartAction, StopReason};
pub use errors::CallError;
pub use ids::{ConversationId, UserId};
pub use session::{LiveStream, LogoutReason, SelfUser, Session, SessionStatus, SessionStore, UserScope};
