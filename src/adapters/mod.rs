pub mod backend;
pub mod notify_ws;
pub mod probe;

#[cfg(test)]
pub use backend::MockConsoleBackend;
pub use backend::{ArtifactAccess, ByteStream, ConsoleBackend, HttpBackend};
pub use notify_ws::{push_url, PushConnector, PushFrame, PushStream, TungsteniteConnector};
pub use probe::{HttpProbe, ServiceProbe};
