//! Observable call state

use airtalk_protocol::{DEFAULT_COUNTRY, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Idle,
    Searching,
    Connecting,
    Connected,
    Disconnected,
}

impl CallStatus {
    /// Searching, negotiating or talking
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CallStatus::Searching | CallStatus::Connecting | CallStatus::Connected
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Searching => write!(f, "searching"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatSender {
    #[serde(rename = "self")]
    Local,
    #[serde(rename = "peer")]
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub sender: ChatSender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything a UI needs to render the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
    pub status: CallStatus,
    pub my_country: String,
    pub partner_country: String,
    pub partner_id: Option<UserId>,
    pub is_muted: bool,
    pub chat_open: bool,
    pub chat_history: Vec<ChatEntry>,
    /// Seconds since inbound media was first observed
    pub call_seconds: u64,
}

impl CallState {
    pub fn new(my_country: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Idle,
            my_country: my_country.into(),
            partner_country: DEFAULT_COUNTRY.to_string(),
            partner_id: None,
            is_muted: false,
            chat_open: false,
            chat_history: Vec::new(),
            call_seconds: 0,
        }
    }

    /// Forget the previous partner and conversation
    pub(crate) fn reset_partner(&mut self) {
        self.partner_country = DEFAULT_COUNTRY.to_string();
        self.partner_id = None;
        self.chat_open = false;
        self.chat_history.clear();
        self.call_seconds = 0;
    }
}

impl Default for CallState {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTRY)
    }
}
