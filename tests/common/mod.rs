#![allow(dead_code)]

//! In-process fake console backend

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use url::Url;

pub const TOKEN: &str = "test-token";

#[derive(Clone, Default)]
pub struct Recorded {
    pub alerts: Arc<Mutex<Vec<String>>>,
    pub generated: Arc<Mutex<Vec<Value>>>,
    pub deleted: Arc<Mutex<Vec<(String, String)>>>,
    pub files: Arc<Mutex<Vec<String>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", TOKEN))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"detail": "Invalid session"}))).into_response()
}

async fn statuses() -> Json<Value> {
    Json(json!({"Zabbix": true, "Grafana": false}))
}

async fn ping() -> Json<Value> {
    Json(json!({
        "Dashboard": [
            {"name": "Zabbix", "status": "✅ Up"},
            {"name": "Grafana", "status": "❌ Down"}
        ]
    }))
}

async fn send_alert(State(rec): State<Recorded>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let message = body["message"].as_str().unwrap_or_default().to_string();
    if message == "chat down" {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": "Failed to send alert to Google Chat"})),
        )
            .into_response();
    }
    rec.alerts.lock().unwrap().push(message);
    Json(json!({"message": "Alert sent successfully"})).into_response()
}

async fn schedule_report(
    State(rec): State<Recorded>,
    Path(report): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let date = body["date"].as_str().unwrap_or_default().to_string();
    if chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_err() {
        return Json(json!({"error": "Invalid date format, expected YYYY-MM-DD."})).into_response();
    }
    let kind = report
        .trim_start_matches("schedule-")
        .trim_end_matches("-report")
        .to_string();
    let name = format!("{}-report-{}.pdf", kind, date);
    rec.files.lock().unwrap().push(name.clone());
    rec.generated
        .lock()
        .unwrap()
        .push(json!({"path": report, "date": date}));
    Json(json!({"message": format!("schedule {} report generated: /reports/{}", kind, name)}))
        .into_response()
}

async fn generate_range(State(rec): State<Recorded>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    rec.generated.lock().unwrap().push(body.clone());
    Json(json!({"message": "Report generated: custom.pdf"})).into_response()
}

async fn list_files(State(rec): State<Recorded>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let files = rec.files.lock().unwrap().clone();
    let of = |prefix: &str| -> Vec<String> {
        files.iter().filter(|f| f.starts_with(prefix)).cloned().collect()
    };
    Json(json!({"daily": of("daily"), "weekly": of("weekly"), "monthly": of("monthly")})).into_response()
}

async fn preview_file(headers: HeaderMap, Path((kind, name)): Path<(String, String)>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    format!("{}:{}", kind, name).into_response()
}

async fn download_file(headers: HeaderMap, Path((_kind, name)): Path<(String, String)>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    format!("contents of {}", name).into_response()
}

async fn delete_file(
    State(rec): State<Recorded>,
    headers: HeaderMap,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut files = rec.files.lock().unwrap();
    let before = files.len();
    files.retain(|f| f != &name);
    if files.len() == before {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "File not found"}))).into_response();
    }
    rec.deleted.lock().unwrap().push((kind, name));
    Json(json!({"message": "File deleted successfully"})).into_response()
}

async fn notify(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(push_two_then_close)
}

/// Same push stream behind the bearer check
async fn secure_notify(headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    ws.on_upgrade(push_two_then_close)
}

async fn push_two_then_close(mut socket: WebSocket) {
    for text in ["host-1 disk full", "host-3 CPU high"] {
        if socket.send(Message::Text(text.to_string())).await.is_err() {
            return;
        }
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "bye".into(),
        })))
        .await;
}

pub struct FakeBackend {
    pub addr: SocketAddr,
    pub recorded: Recorded,
}

impl FakeBackend {
    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }
}

pub async fn spawn_backend() -> FakeBackend {
    let recorded = Recorded::default();
    recorded
        .files
        .lock()
        .unwrap()
        .push("weekly-report-2024-01-01.pdf".to_string());

    let app = Router::new()
        .route("/statuses", get(statuses))
        .route("/ping", get(ping))
        .route("/send_alert", post(send_alert))
        .route("/report/generate", post(generate_range))
        .route("/:report", post(schedule_report))
        .route("/schedule/files", get(list_files))
        .route("/schedule/files/:kind/:name/preview", get(preview_file))
        .route("/schedule/files/:kind/:name/download", get(download_file))
        .route("/schedule/files/:kind/:name", delete(delete_file))
        .route("/ws/notify", get(notify))
        .route("/secure/ws/notify", get(secure_notify))
        .with_state(recorded.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeBackend { addr, recorded }
}
