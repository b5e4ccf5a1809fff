//! Push channel transport
//!
//! Receive-only WebSocket connection to the backend's `/ws/notify` endpoint.
//! The channel state machine only sees `PushConnector`/`PushStream`, so a
//! fake transport can stand in for tokio-tungstenite in tests.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::{OpsdeckError, Result};
use crate::session::Session;

/// Connection attempt timeout
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// One inbound signal from the push endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    /// One notification per text frame
    Text(String),
    /// Peer closed. `clean` when a normal close frame was exchanged.
    Closed { clean: bool },
    /// Read failure; the connection is unusable
    Failed(String),
}

#[async_trait]
pub trait PushStream: Send {
    /// Next meaningful frame. Control frames are handled internally.
    async fn next_frame(&mut self) -> PushFrame;

    /// Close the connection; errors are ignored
    async fn close(&mut self);
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn PushStream>>;
}

/// Push endpoint derived from the backend base address
/// (`http` → `ws`, `https` → `wss`, path `/ws/notify`)
pub fn push_url(base: &Url) -> Result<Url> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(OpsdeckError::Configuration(format!(
                "unsupported backend scheme for push channel: {}",
                other
            )))
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme).map_err(|_| {
        OpsdeckError::Configuration(format!("cannot derive push address from {}", base))
    })?;
    url.path_segments_mut()
        .map_err(|_| {
            OpsdeckError::Configuration(format!("backend base address has no path: {}", base))
        })?
        .pop_if_empty()
        .extend(["ws", "notify"]);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// tokio-tungstenite implementation
pub struct TungsteniteConnector {
    session: Option<Arc<Session>>,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self {
            session: None,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }

    /// Attach the bearer credential to the upgrade request
    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TungsteniteConnector {
    /// A 401/403 upgrade response is a credential rejection, not a transport fault
    fn handshake_error(&self, err: WsError) -> OpsdeckError {
        let status = match &err {
            WsError::Http(response) => response.status(),
            _ => return OpsdeckError::WebSocket(err),
        };
        if status != StatusCode::UNAUTHORIZED && status != StatusCode::FORBIDDEN {
            return OpsdeckError::WebSocket(err);
        }
        let detail = format!("push channel upgrade refused: HTTP {}", status.as_u16());
        if let Some(session) = &self.session {
            session.reject(&detail);
        }
        OpsdeckError::Unauthenticated(detail)
    }
}

#[async_trait]
impl PushConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn PushStream>> {
        let mut request = url.as_str().into_client_request()?;
        if let Some(bearer) = self.session.as_ref().and_then(|s| s.bearer()) {
            let value = HeaderValue::from_str(&bearer)
                .map_err(|e| OpsdeckError::Configuration(format!("invalid bearer token: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        info!("Connecting to push channel: {}", url);

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| OpsdeckError::Transport("push channel connection timeout".to_string()))?
            .map_err(|e| self.handshake_error(e))?;

        Ok(Box::new(TungsteniteStream { inner: ws_stream }))
    }
}

struct TungsteniteStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushStream for TungsteniteStream {
    async fn next_frame(&mut self) -> PushFrame {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return PushFrame::Text(text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return PushFrame::Text(text),
                    Err(_) => debug!("Ignoring non-UTF-8 binary push frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.inner.send(Message::Pong(data)).await {
                        return PushFrame::Failed(format!("failed to send pong: {}", e));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let clean = frame
                        .as_ref()
                        .map(|f| f.code == CloseCode::Normal)
                        .unwrap_or(false);
                    debug!("Push channel close frame: {:?}", frame);
                    return PushFrame::Closed { clean };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return PushFrame::Failed(e.to_string()),
                None => return PushFrame::Closed { clean: false },
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_url_swaps_scheme() {
        let base = Url::parse("http://localhost:8000").unwrap();
        assert_eq!(push_url(&base).unwrap().as_str(), "ws://localhost:8000/ws/notify");

        let base = Url::parse("https://console.example.com/api/").unwrap();
        assert_eq!(
            push_url(&base).unwrap().as_str(),
            "wss://console.example.com/api/ws/notify"
        );
    }

    #[test]
    fn test_push_url_rejects_other_schemes() {
        let base = Url::parse("ftp://files.example.com").unwrap();
        assert!(matches!(push_url(&base), Err(OpsdeckError::Configuration(_))));
    }
}
