use std::fmt;

use serde::{Deserialize, Serialize};

use crate::calls::NotificationData;
use crate::errors::CallError;
use crate::ids::{ConversationId, UserId};

/// Command submitted to the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Start(StartAction),
    Stop,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StartAction {
    /// Resume or refresh, e.g. after an OS restart of the service.
    Default,
    /// An incoming call is being answered from a notification.
    AnswerCall {
        user_id: UserId,
        conversation_id: ConversationId,
    },
}

impl Action {
    pub fn start() -> Self {
        Self::Start(StartAction::Default)
    }

    pub fn answer(user_id: UserId, conversation_id: ConversationId) -> Self {
        Self::Start(StartAction::AnswerCall {
            user_id,
            conversation_id,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(StartAction::Default) => "start",
            Self::Start(StartAction::AnswerCall { .. }) => "answer_call",
            Self::Stop => "stop",
        }
    }
}

/// Sequence number handed out for every submitted action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionTicket(pub u64);

impl fmt::Display for ActionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Session is valid but no active, outgoing or answering call remains.
    NoCalls,
    /// Session absent or invalid.
    NoValidSession,
    /// Explicit stop action.
    ActionStopCalled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCalls => "no_calls",
            Self::NoValidSession => "no_valid_session",
            Self::ActionStopCalled => "action_stop_called",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output of the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "data", rename_all = "snake_case")]
pub enum Decision {
    /// The host should terminate.
    Stop(StopReason),
    /// The host should stay alive and display this call.
    Update(NotificationData),
}

impl Decision {
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop(_))
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            Self::Stop(reason) => Some(*reason),
            Self::Update(_) => None,
        }
    }

    pub fn notification(&self) -> Option<&NotificationData> {
        match self {
            Self::Stop(_) => None,
            Self::Update(data) => Some(data),
        }
    }
}

/// A decision, or the collaborator failure that ended the pipeline.
pub type DecisionResult = Result<Decision, CallError>;

/// Lifecycle of the process hosting the call service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    NotStarted,
    Started,
    Foreground,
}
