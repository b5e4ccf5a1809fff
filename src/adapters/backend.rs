//! Console backend REST adapter
//!
//! Every endpoint the live-status core needs, behind the `ConsoleBackend`
//! trait so workflows can be driven against a mock in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::AppConfig;
use crate::domain::{
    ArtifactIndex, GroupedStatus, ReportRequest, ReportSpan, ReportType, DATE_FORMAT,
};
use crate::error::{OpsdeckError, Result};
use crate::session::Session;

/// Chunked artifact body; never buffered whole by the core
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// How an artifact body is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactAccess {
    /// Inline display
    Preview,
    /// Attachment for a local save
    Download,
}

impl ArtifactAccess {
    fn as_str(&self) -> &'static str {
        match self {
            ArtifactAccess::Preview => "preview",
            ArtifactAccess::Download => "download",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsoleBackend: Send + Sync {
    /// `GET /statuses` → `{serviceName: bool}`
    async fn fetch_statuses(&self) -> Result<HashMap<String, bool>>;

    /// `GET /ping` → `{category: [{name, status}]}`
    async fn fetch_grouped_statuses(&self) -> Result<HashMap<String, Vec<GroupedStatus>>>;

    /// `POST /send_alert`
    async fn send_alert(&self, message: &str) -> Result<()>;

    /// Submit a generation request; returns the backend's status message
    async fn generate_report(&self, request: &ReportRequest) -> Result<String>;

    /// `GET /schedule/files`
    async fn list_artifacts(&self) -> Result<ArtifactIndex>;

    /// `GET /schedule/files/{type}/{name}/{preview|download}`
    async fn open_artifact(
        &self,
        report_type: ReportType,
        file_name: &str,
        access: ArtifactAccess,
    ) -> Result<ByteStream>;

    /// `DELETE /schedule/files/{type}/{name}`; returns the backend's message
    async fn delete_artifact(&self, report_type: ReportType, file_name: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: Url,
    session: Arc<Session>,
}

impl HttpBackend {
    pub fn new(base_url: Url, session: Arc<Session>, request_timeout: Duration) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(OpsdeckError::Configuration(format!(
                "backend base address cannot carry paths: {}",
                base_url
            )));
        }

        let http = Client::builder()
            .user_agent(concat!("opsdeck/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| OpsdeckError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            session,
        })
    }

    pub fn from_config(config: &AppConfig, session: Arc<Session>) -> Result<Self> {
        Self::new(config.base_url()?, session, config.request_timeout())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Base address with path segments appended (percent-encoded)
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let mut req = self.http.request(method, self.endpoint(segments));
        if let Some(bearer) = self.session.bearer() {
            req = req.header(AUTHORIZATION, bearer);
        }
        req
    }

    /// Send and map non-2xx into typed errors
    async fn send(&self, req: RequestBuilder, require_auth: bool) -> Result<Response> {
        if require_auth {
            self.session.require()?;
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let detail = server_detail(status, &body);

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.session.reject(&detail);
            return Err(OpsdeckError::Unauthenticated(detail));
        }

        warn!("Backend request failed: {}", detail);
        Err(OpsdeckError::Transport(detail))
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        require_auth: bool,
    ) -> Result<T> {
        let resp = self.send(req, require_auth).await?;
        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Extract a human-readable reason from an error body
fn server_detail(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["detail", "error", "message"] {
            if let Some(text) = value.get(key).and_then(Value::as_str) {
                return text.to_string();
            }
        }
    }
    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        let excerpt: String = body.chars().take(200).collect();
        format!("HTTP {}: {}", status, excerpt)
    }
}

/// Status message of a generation response. A 2xx body carrying `error`
/// is a failed generation.
fn generation_message(body: &Value) -> Result<String> {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        return Err(OpsdeckError::Transport(error.to_string()));
    }
    Ok(body
        .get("message")
        .or_else(|| body.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("report generated")
        .to_string())
}

#[async_trait]
impl ConsoleBackend for HttpBackend {
    async fn fetch_statuses(&self) -> Result<HashMap<String, bool>> {
        let raw: HashMap<String, Value> = self
            .request_json(self.request(Method::GET, &["statuses"]), false)
            .await?;
        Ok(raw
            .into_iter()
            .map(|(name, v)| (name, v.as_bool().unwrap_or(false)))
            .collect())
    }

    async fn fetch_grouped_statuses(&self) -> Result<HashMap<String, Vec<GroupedStatus>>> {
        self.request_json(self.request(Method::GET, &["ping"]), false)
            .await
    }

    async fn send_alert(&self, message: &str) -> Result<()> {
        let req = self
            .request(Method::POST, &["send_alert"])
            .json(&json!({ "message": message }));
        self.send(req, true).await?;
        debug!("Alert accepted by backend");
        Ok(())
    }

    async fn generate_report(&self, request: &ReportRequest) -> Result<String> {
        let req = match request.span {
            ReportSpan::Single(date) => {
                let path = format!("schedule-{}-report", request.report_type.as_str());
                self.request(Method::POST, &[path.as_str()])
                    .json(&json!({ "date": date.format(DATE_FORMAT).to_string() }))
            }
            ReportSpan::Range { start, end } => self
                .request(Method::POST, &["report", "generate"])
                .json(&json!({
                    "report_type": request.report_type.as_str(),
                    "start_date": start.format(DATE_FORMAT).to_string(),
                    "end_date": end.format(DATE_FORMAT).to_string(),
                })),
        };

        let body: Value = self.request_json(req, true).await?;
        generation_message(&body)
    }

    async fn list_artifacts(&self) -> Result<ArtifactIndex> {
        self.request_json(self.request(Method::GET, &["schedule", "files"]), true)
            .await
    }

    async fn open_artifact(
        &self,
        report_type: ReportType,
        file_name: &str,
        access: ArtifactAccess,
    ) -> Result<ByteStream> {
        let req = self.request(
            Method::GET,
            &[
                "schedule",
                "files",
                report_type.as_str(),
                file_name,
                access.as_str(),
            ],
        );
        let resp = self.send(req, true).await?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(OpsdeckError::from))
            .boxed())
    }

    async fn delete_artifact(&self, report_type: ReportType, file_name: &str) -> Result<String> {
        let req = self.request(
            Method::DELETE,
            &["schedule", "files", report_type.as_str(), file_name],
        );
        let resp = self.send(req, true).await?;
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| format!("{} deleted", file_name));
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(
            Url::parse(base).unwrap(),
            Arc::new(Session::anonymous()),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_appends_encoded_segments() {
        let b = backend("http://localhost:8000/api");
        assert_eq!(
            b.endpoint(&["schedule", "files", "weekly", "my report.pdf", "preview"])
                .as_str(),
            "http://localhost:8000/api/schedule/files/weekly/my%20report.pdf/preview"
        );

        let b = backend("http://localhost:8000/");
        assert_eq!(b.endpoint(&["statuses"]).as_str(), "http://localhost:8000/statuses");
    }

    #[test]
    fn test_server_detail_prefers_json_fields() {
        assert_eq!(
            server_detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"detail":"Failed to send alert to Google Chat"}"#
            ),
            "Failed to send alert to Google Chat"
        );
        assert_eq!(
            server_detail(StatusCode::BAD_GATEWAY, "upstream down"),
            "HTTP 502 Bad Gateway: upstream down"
        );
        assert_eq!(server_detail(StatusCode::NOT_FOUND, ""), "HTTP 404 Not Found");
    }

    #[test]
    fn test_generation_message_error_field_is_failure() {
        let ok = json!({"message": "schedule daily report generated: x.pdf"});
        assert_eq!(
            generation_message(&ok).unwrap(),
            "schedule daily report generated: x.pdf"
        );

        let bad = json!({"error": "Invalid date format, expected YYYY-MM-DD."});
        let err = generation_message(&bad).unwrap_err();
        assert_eq!(err.operator_message(), "Invalid date format, expected YYYY-MM-DD.");
    }

    #[tokio::test]
    async fn test_authenticated_call_fails_fast_without_session() {
        // Port 9 is never contacted: the session check runs first.
        let b = backend("http://127.0.0.1:9");
        let err = b.send_alert("disk full").await.unwrap_err();
        assert!(matches!(err, OpsdeckError::Unauthenticated(_)));
    }
}
