//! Operator-authored alert dispatch
//!
//! Two-step flow: a validated message opens a confirmation, and only an
//! explicit confirm issues `POST /send_alert`. The outcome is never retried
//! automatically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::adapters::ConsoleBackend;
use crate::domain::{AlertResult, AlertState, AlertView};
use crate::error::{OpsdeckError, Result};
use crate::services::Confirmer;

pub struct AlertDispatcher {
    backend: Arc<dyn ConsoleBackend>,
    view_tx: watch::Sender<AlertView>,
    /// Bumped by `reset`; a response from an older generation is ignored
    generation: AtomicU64,
}

impl AlertDispatcher {
    pub fn new(backend: Arc<dyn ConsoleBackend>) -> Self {
        let (view_tx, _) = watch::channel(AlertView::default());
        Self {
            backend,
            view_tx,
            generation: AtomicU64::new(0),
        }
    }

    /// Trimmed message, or a validation error for blank input
    pub fn validate(message: &str) -> Result<String> {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Err(OpsdeckError::Validation(
                "alert message must not be empty".to_string(),
            ));
        }
        Ok(trimmed.to_string())
    }

    pub fn subscribe(&self) -> watch::Receiver<AlertView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> AlertView {
        self.view_tx.borrow().clone()
    }

    pub fn state(&self) -> AlertState {
        self.view_tx.borrow().state.clone()
    }

    /// Open the confirmation surface for `message`
    pub fn request_confirmation(&self, message: &str) -> Result<()> {
        let message = match Self::validate(message) {
            Ok(message) => message,
            Err(e) => {
                self.view_tx.send_modify(|view| {
                    view.last_result = Some(AlertResult::ValidationFailed(e.operator_message()));
                });
                return Err(e);
            }
        };

        let mut refused = None;
        self.view_tx.send_if_modified(|view| {
            if !view.state.accepts_new_message() {
                refused = Some(view.state.as_str());
                return false;
            }
            view.state = AlertState::Confirming { message };
            true
        });

        match refused {
            Some(state) => Err(OpsdeckError::InvalidState(format!(
                "cannot open a new alert while {}",
                state
            ))),
            None => Ok(()),
        }
    }

    /// Close the confirmation or failure surface. A send in flight cannot be
    /// cancelled.
    pub fn cancel(&self) -> Result<()> {
        let mut refused = false;
        self.view_tx.send_if_modified(|view| match view.state {
            AlertState::Confirming { .. } | AlertState::Failed { .. } => {
                view.state = AlertState::Idle;
                true
            }
            AlertState::Sending { .. } => {
                refused = true;
                false
            }
            AlertState::Idle => false,
        });
        if refused {
            return Err(OpsdeckError::InvalidState(
                "alert is already being sent".to_string(),
            ));
        }
        Ok(())
    }

    /// Forget the surface entirely, e.g. when the operator navigates away.
    /// A response still in flight will be ignored.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.view_tx.send_replace(AlertView::default());
    }

    /// Send the confirmed message. Only valid while confirming, so a second
    /// confirm during the send is refused instead of sending twice.
    pub async fn confirm(&self) -> Result<AlertResult> {
        let mut pending = None;
        self.view_tx.send_if_modified(|view| {
            if let AlertState::Confirming { message } = &view.state {
                let message = message.clone();
                view.state = AlertState::Sending {
                    message: message.clone(),
                };
                pending = Some((message, self.generation.load(Ordering::SeqCst)));
                true
            } else {
                false
            }
        });
        let Some((message, generation)) = pending else {
            return Err(OpsdeckError::InvalidState(format!(
                "no alert awaiting confirmation ({})",
                self.state()
            )));
        };

        info!("Dispatching alert ({} chars)", message.chars().count());

        let result = match self.backend.send_alert(&message).await {
            Ok(()) => AlertResult::Sent,
            Err(e) => {
                warn!("Alert dispatch failed: {}", e);
                AlertResult::TransportFailed(e.operator_message())
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Ignoring alert response after reset");
            return Ok(result);
        }

        let state = match &result {
            AlertResult::TransportFailed(reason) => AlertState::Failed {
                reason: reason.clone(),
            },
            _ => AlertState::Idle,
        };
        self.view_tx.send_replace(AlertView {
            state,
            last_result: Some(result.clone()),
        });
        Ok(result)
    }

    /// Full flow: validate, ask `confirmer`, send. `None` when the operator
    /// declined. An alert already pending or in flight is refused with
    /// `InvalidState`.
    pub async fn submit(
        &self,
        message: &str,
        confirmer: &dyn Confirmer,
    ) -> Result<Option<AlertResult>> {
        if let Err(e) = self.request_confirmation(message) {
            return match e {
                OpsdeckError::Validation(reason) => Ok(Some(AlertResult::ValidationFailed(reason))),
                other => Err(other),
            };
        }

        let prompt = format!("Send alert \"{}\"?", message.trim());
        if !confirmer.confirm(&prompt).await {
            let _ = self.cancel();
            info!("Alert cancelled by operator");
            return Ok(None);
        }

        self.confirm().await.map(Some)
    }
}
