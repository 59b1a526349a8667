use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, UserId};

/// Lifecycle status of a call as reported by the call engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Outgoing call placed by the local user, not yet picked up.
    Started,
    Incoming,
    Missed,
    Answered,
    Established,
    StillOngoing,
    Closing,
    Closed,
    Rejected,
    ClosedInternally,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Incoming => "incoming",
            Self::Missed => "missed",
            Self::Answered => "answered",
            Self::Established => "established",
            Self::StillOngoing => "still_ongoing",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Rejected => "rejected",
            Self::ClosedInternally => "closed_internally",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    #[default]
    OneOnOne,
    Group,
    #[serde(rename = "self")]
    SelfConversation,
    ConnectionPending,
}

/// Snapshot of a call. Owned by the call engine; only observed here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub conversation_id: ConversationId,
    pub status: CallStatus,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_camera_on: bool,
    #[serde(default)]
    pub is_cbr_enabled: bool,
    pub caller_id: UserId,
    pub conversation_name: Option<String>,
    #[serde(default)]
    pub conversation_type: ConversationType,
    pub caller_name: Option<String>,
    pub caller_team_name: Option<String>,
}

impl Call {
    /// A muted, camera-off one-on-one call; tests and demos tweak from here.
    pub fn new(conversation_id: ConversationId, caller_id: UserId, status: CallStatus) -> Self {
        Self {
            conversation_id,
            status,
            is_muted: true,
            is_camera_on: false,
            is_cbr_enabled: false,
            caller_id,
            conversation_name: None,
            conversation_type: ConversationType::OneOnOne,
            caller_name: None,
            caller_team_name: None,
        }
    }

    pub fn with_status(&self, status: CallStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Data the service host needs to render the call notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    pub user_id: UserId,
    pub call: Call,
    pub display_name: String,
}

impl NotificationData {
    pub fn new(user_id: UserId, call: Call, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            call,
            display_name: display_name.into(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.call.conversation_id
    }

    /// Outgoing calls get a different notification layout than ongoing ones.
    pub fn is_outgoing(&self) -> bool {
        self.call.status == CallStatus::Started
    }
}
