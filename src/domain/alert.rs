use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of an operator-authored alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertResult {
    Sent,
    /// Trimmed message was empty; nothing was sent
    ValidationFailed(String),
    /// Network error or non-2xx, with the server detail when present
    TransportFailed(String),
}

impl AlertResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, AlertResult::Sent)
    }
}

impl fmt::Display for AlertResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertResult::Sent => write!(f, "Alert sent successfully"),
            AlertResult::ValidationFailed(reason) => write!(f, "Alert rejected: {}", reason),
            AlertResult::TransportFailed(reason) => write!(f, "Failed to send alert: {}", reason),
        }
    }
}

/// Alert dispatch state machine, rendered directly by the console
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlertState {
    /// Nothing pending; composer closed
    #[default]
    Idle,
    /// Confirmation surface open for this message
    Confirming { message: String },
    /// Send in flight. Resubmission is disabled.
    Sending { message: String },
    /// Last send failed; the surface stays open until dismissed or re-entered
    Failed { reason: String },
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Idle => "IDLE",
            AlertState::Confirming { .. } => "CONFIRMING",
            AlertState::Sending { .. } => "SENDING",
            AlertState::Failed { .. } => "FAILED",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, AlertState::Sending { .. })
    }

    /// States from which the operator may open a new confirmation
    pub fn accepts_new_message(&self) -> bool {
        matches!(self, AlertState::Idle | AlertState::Failed { .. })
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatcher view: current state plus the last settled outcome
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertView {
    pub state: AlertState,
    pub last_result: Option<AlertResult>,
}
