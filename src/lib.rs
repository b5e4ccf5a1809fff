pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod services;
pub mod session;

pub use adapters::{ConsoleBackend, HttpBackend, HttpProbe, TungsteniteConnector};
pub use config::{AppConfig, PollMode};
pub use error::{OpsdeckError, Result};
pub use services::{
    AlertDispatcher, Confirmer, HealthPoller, HealthPollerConfig, HealthSource,
    NotificationChannel, NotificationChannelConfig, ReportWorkflow,
};
pub use session::Session;
