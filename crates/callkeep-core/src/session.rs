//! Session model and the collaborator traits the orchestrator consumes.
//!
//! `SessionStore` and `UserScope` are implemented outside this workspace by
//! the messaging core. [`crate::memory`] provides an in-process version.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::calls::Call;
use crate::errors::CallError;
use crate::ids::{ConversationId, UserId};

/// A live, possibly-suspending stream of values from a collaborator.
pub type LiveStream<T> = Pin<Box<dyn Stream<Item = Result<T, CallError>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    SelfSoftLogout,
    SelfHardLogout,
    SessionExpired,
    RemovedClient,
    DeletedAccount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Valid,
    Invalid { reason: LogoutReason },
}

/// The currently authenticated account as reported by the session store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub status: SessionStatus,
}

impl Session {
    pub fn valid(user_id: UserId) -> Self {
        Self {
            user_id,
            status: SessionStatus::Valid,
        }
    }

    pub fn invalid(user_id: UserId, reason: LogoutReason) -> Self {
        Self {
            user_id,
            status: SessionStatus::Invalid { reason },
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.status, SessionStatus::Valid)
    }
}

/// The local user of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfUser {
    pub id: UserId,
    pub name: Option<String>,
    pub handle: Option<String>,
}

impl SelfUser {
    /// Handle first, then name, then empty.
    pub fn display_name(&self) -> String {
        self.handle
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}

/// Global session store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Current session, `None` when nobody is logged in. Emits on every change.
    fn current_session(&self) -> LiveStream<Option<Session>>;

    async fn has_valid_session(&self, user_id: &UserId) -> Result<bool, CallError>;

    /// Operations scoped to one account.
    async fn user_scope(&self, user_id: &UserId) -> Result<Arc<dyn UserScope>, CallError>;
}

/// Call and user operations of one account.
#[async_trait]
pub trait UserScope: Send + Sync {
    fn established_calls(&self) -> LiveStream<Vec<Call>>;
    fn outgoing_calls(&self) -> LiveStream<Vec<Call>>;
    fn incoming_calls(&self) -> LiveStream<Vec<Call>>;

    async fn answer_call(&self, conversation_id: &ConversationId) -> Result<(), CallError>;

    async fn self_user(&self) -> Result<SelfUser, CallError>;
}
