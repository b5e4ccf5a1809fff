pub mod alert_dispatcher;
pub mod health_poller;
pub mod notification_channel;
pub mod report_workflow;

pub use alert_dispatcher::AlertDispatcher;
pub use health_poller::{fan_out, HealthPoller, HealthPollerConfig, HealthSource, PollFailure};
pub use notification_channel::{NotificationChannel, NotificationChannelConfig};
pub use report_workflow::{artifact_from_message, PreviewHandle, ReportWorkflow};

use async_trait::async_trait;

/// Explicit operator confirmation step ahead of a side-effecting call
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}
