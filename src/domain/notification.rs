use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-originated notification, visible until its display window lapses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Per-channel sequence number, used to tell a replaced event from its successor
    pub seq: u64,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Push channel connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChannelState {
    /// Not started yet
    #[default]
    Idle,
    /// Connection attempt in progress
    Connecting,
    /// Open and receiving frames
    Connected,
    /// Closed by the peer; reconnect pending
    Closed,
    /// Connect or read failure; reconnect pending
    Errored,
    /// Backend refused the credential. No reconnect until started again.
    Rejected,
    /// Explicitly shut down. Terminal.
    Shutdown,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Idle => "IDLE",
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Connected => "CONNECTED",
            ChannelState::Closed => "CLOSED",
            ChannelState::Errored => "ERRORED",
            ChannelState::Rejected => "REJECTED",
            ChannelState::Shutdown => "SHUTDOWN",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: ChannelState) -> bool {
        use ChannelState::*;

        match (self, target) {
            (_, Shutdown) => !matches!(self, Shutdown),
            (Idle, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, Errored) => true,
            (Connecting, Rejected) => true,
            (Connected, Closed) => true,
            (Connected, Errored) => true,
            (Closed, Connecting) => true,
            (Errored, Connecting) => true,
            (Rejected, Connecting) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Shutdown)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sticky connectivity warning, raised once per disconnect episode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityBanner {
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// What the console renders for the push channel
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelView {
    pub state: ChannelState,
    pub banner: Option<ConnectivityBanner>,
    pub notification: Option<NotificationEvent>,
}

/// Discrete channel events broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    BannerRaised(ConnectivityBanner),
    BannerCleared,
    Notification(NotificationEvent),
    /// Visible notification with this sequence number was hidden
    Expired(u64),
    /// Channel cannot start; reported once
    ConfigurationError(String),
    /// Push endpoint refused the credential; the channel stopped retrying
    CredentialRejected(String),
}
