//! HTTP surface of the relay service
//!
//! Ingress upload, result callback egress, poll/forget status endpoints,
//! plus health and metrics. Handlers share state through [`AppState`]; the
//! result store is the only shared-mutable resource behind it.

use axum::extract::{
    ConnectInfo, DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, Path, Request, State,
};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::metrics::{self, RELAY_METRICS};
use crate::receiver::{CallbackFile, CallbackReceiver, CallbackRequest, ReceiveOutcome};
use crate::relay::{ProcessorRelay, RelayError, SubmitOutcome, SubmitRequest, UploadFile};
use crate::store::{create_store, ResultStore};

/// Errors that can take the server down during startup or serving
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to set up relay state: {0}")]
    Setup(#[from] RelayError),

    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Shared state injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ResultStore>,
    pub receiver: CallbackReceiver,
    pub relay: Arc<ProcessorRelay>,
    pub max_body_bytes: usize,
}

impl AppState {
    /// Build store, receiver, and relay from configuration
    pub fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        let store = create_store(config.result_ttl_ms);
        let receiver = CallbackReceiver::new(Arc::clone(&store));
        let relay = ProcessorRelay::new(config.processor_url.clone())?
            .with_accept_timeout(Duration::from_millis(config.accept_timeout_ms))
            .with_strategy(config.forward_strategy);

        Ok(Self {
            store,
            receiver,
            relay: Arc::new(relay),
            max_body_bytes: config.max_body_bytes,
        })
    }
}

/// ConnectInfo wrapper that yields `None` when the socket address was never
/// attached, so handlers stay callable from plain router tests.
#[derive(Debug, Clone, Copy)]
pub struct MaybeClientAddr(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for MaybeClientAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        async move { Ok(MaybeClientAddr(addr)) }
    }
}

/// Build the service router over the given state. Request bodies are
/// capped at the configured limit.
pub fn router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);
    Router::new()
        .route("/upload", post(upload_handler))
        .route("/webhook-result", post(callback_handler))
        .route(
            "/analysis-result/{session_id}",
            get(poll_handler).delete(forget_handler),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(body_limit)
        .with_state(state)
}

/// Bind and serve until a shutdown signal arrives. Runs the TTL sweep
/// alongside the listener; the sweep stops with the process.
pub async fn serve(config: RelayConfig) -> Result<(), ServerError> {
    let state = AppState::new(&config)?;
    metrics::init_relay_metrics();

    let sweep_store = Arc::clone(&state.store);
    let sweep_interval = Duration::from_millis(config.sweep_interval_ms.max(1000));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = sweep_store.cleanup_expired();
            if removed > 0 {
                debug!(removed, "evicted expired results");
            }
            RELAY_METRICS.stored_results.set(sweep_store.size() as i64);
        }
    });

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Bind(addr.clone(), e))?;

    info!(
        addr = %addr,
        processor = %state.relay.endpoint(),
        strategy = %config.forward_strategy,
        "relay listening"
    );

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(ServerError::Serve)
}

/// Resolves when SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

fn error_body(message: &str, details: Option<&str>) -> serde_json::Value {
    match details {
        Some(details) => json!({"error": message, "details": details}),
        None => json!({"error": message}),
    }
}

/// POST /upload: forward a document batch to the processor.
///
/// Acceptance by the processor is not completion; the result arrives later
/// through the callback route.
async fn upload_handler(
    State(state): State<AppState>,
    MaybeClientAddr(client): MaybeClientAddr,
    multipart: Multipart,
) -> Response {
    let submission = match read_submission(multipart).await {
        Ok(submission) => submission,
        Err(detail) => {
            warn!("failed to read upload body: {detail}");
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("Failed to read upload", Some(&detail)),
            );
        }
    };

    let session_id = submission
        .fields
        .iter()
        .find(|(name, _)| name == "session_id")
        .map(|(_, value)| value.as_str())
        .unwrap_or("-")
        .to_string();

    info!(
        session_id = %session_id,
        files = submission.files.len(),
        client = ?client,
        "forwarding submission to processor"
    );

    let started = Instant::now();
    let outcome = state.relay.submit(submission).await;
    RELAY_METRICS
        .forward_seconds
        .observe(started.elapsed().as_secs_f64());
    RELAY_METRICS.submissions.inc(outcome.label());

    match outcome {
        SubmitOutcome::Accepted => json_response(
            StatusCode::OK,
            json!({
                "success": true,
                "message": "Files forwarded for analysis; the result arrives via callback"
            }),
        ),
        SubmitOutcome::Timeout => {
            warn!(session_id = %session_id, "processor accept window elapsed");
            json_response(
                StatusCode::GATEWAY_TIMEOUT,
                error_body(
                    "Processor did not respond in time; retry or check that the workflow is active",
                    None,
                ),
            )
        }
        SubmitOutcome::Rejected {
            status,
            body_excerpt,
        } => {
            warn!(session_id = %session_id, status, "processor rejected the submission");
            json_response(
                StatusCode::BAD_GATEWAY,
                error_body(
                    &format!("Processor rejected the submission (status {status})"),
                    Some(&body_excerpt),
                ),
            )
        }
        SubmitOutcome::TransportError(detail) => {
            warn!(session_id = %session_id, "failed to reach processor: {detail}");
            json_response(
                StatusCode::BAD_GATEWAY,
                error_body("Failed to reach the processor", Some(&detail)),
            )
        }
    }
}

/// Drain an upload body into a forwardable submission
async fn read_submission(mut multipart: Multipart) -> Result<SubmitRequest, String> {
    let mut submission = SubmitRequest::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| e.to_string())? {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(file_name) = field.file_name().map(|f| f.to_string()) {
            let content_type = field
                .content_type()
                .map(|mime| mime.to_string())
                .unwrap_or_default();
            let data = field.bytes().await.map_err(|e| e.to_string())?.to_vec();
            submission.files.push(UploadFile {
                field_name: name,
                file_name,
                content_type,
                data,
            });
        } else {
            let value = field.text().await.map_err(|e| e.to_string())?;
            submission.fields.push((name, value));
        }
    }
    Ok(submission)
}

/// POST /webhook-result: result callback from the processor
async fn callback_handler(
    State(state): State<AppState>,
    MaybeClientAddr(client): MaybeClientAddr,
    request: Request,
) -> Response {
    debug!(client = ?client, "result callback received");

    let callback = match read_callback(request, state.max_body_bytes).await {
        Ok(callback) => callback,
        Err(detail) => {
            warn!("unreadable callback body: {detail}");
            RELAY_METRICS.callbacks.inc("unreadable");
            return json_response(
                StatusCode::BAD_REQUEST,
                error_body("Invalid callback body", Some(&detail)),
            );
        }
    };

    match state.receiver.receive(callback) {
        ReceiveOutcome::Stored { session_id } => {
            RELAY_METRICS.callbacks.inc("stored");
            RELAY_METRICS.stored_results.set(state.store.size() as i64);
            json_response(
                StatusCode::OK,
                json!({
                    "success": true,
                    "session_id": session_id.0,
                    "message": "Result received"
                }),
            )
        }
        ReceiveOutcome::MissingSession { received } => {
            RELAY_METRICS.callbacks.inc("missing_session");
            json_response(
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "session_id missing from callback",
                    "received": received,
                    "hint": "send the session identifier as session_id or sessionId"
                }),
            )
        }
    }
}

/// Normalize a callback body from whichever encoding it arrived in.
/// Multipart and urlencoded match the processor's form senders; JSON covers
/// workflow nodes that post objects directly.
async fn read_callback(request: Request, body_limit: usize) -> Result<CallbackRequest, String> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| e.to_string())?;
        let mut callback = CallbackRequest::new();
        while let Some(field) = multipart.next_field().await.map_err(|e| e.to_string())? {
            let name = field.name().unwrap_or_default().to_string();
            if let Some(file_name) = field.file_name().map(|f| f.to_string()) {
                let data = field.bytes().await.map_err(|e| e.to_string())?.to_vec();
                callback.files.push(CallbackFile {
                    field_name: name,
                    file_name,
                    data,
                });
            } else {
                let value = field.text().await.map_err(|e| e.to_string())?;
                callback.fields.push((name, value));
            }
        }
        return Ok(callback);
    }

    let body = axum::body::to_bytes(request.into_body(), body_limit)
        .await
        .map_err(|e| e.to_string())?;

    if content_type.starts_with("application/json") {
        let value: serde_json::Value = serde_json::from_slice(&body).map_err(|e| e.to_string())?;
        return Ok(CallbackRequest::from_json(&value));
    }

    Ok(CallbackRequest::from_urlencoded(&body))
}

/// GET /analysis-result/{session_id}: stored record or the implicit
/// processing state
async fn poll_handler(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            error_body("session_id is required", None),
        );
    }

    match state.store.get(session_id) {
        Some(result) => {
            RELAY_METRICS.polls.inc("hit");
            json_response(StatusCode::OK, json!(result))
        }
        None => {
            RELAY_METRICS.polls.inc("processing");
            json_response(
                StatusCode::OK,
                json!({"status": "processing", "session_id": session_id}),
            )
        }
    }
}

/// DELETE /analysis-result/{session_id}: unconditional cleanup
async fn forget_handler(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            error_body("session_id is required", None),
        );
    }

    let existed = state.store.delete(session_id);
    debug!(session_id, existed, "result forgotten");
    RELAY_METRICS.stored_results.set(state.store.size() as i64);

    json_response(
        StatusCode::OK,
        json!({"success": true, "message": "Result discarded"}),
    )
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "stored_results": state.store.size(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_error_body_shapes() {
        let with = error_body("boom", Some("detail"));
        assert_eq!(with["error"], "boom");
        assert_eq!(with["details"], "detail");

        let without = error_body("boom", None);
        assert_eq!(without["error"], "boom");
        assert!(without.get("details").is_none());
    }

    #[tokio::test]
    async fn test_read_callback_json() {
        let request = Request::builder()
            .method("POST")
            .uri("/webhook-result")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"sessionId": "abc-2", "htmlContent": "PGgxPkhpPC9oMT4=", "status": "completed"}"#,
            ))
            .unwrap();

        let callback = read_callback(request, 1024 * 1024).await.unwrap();
        assert_eq!(callback.field("sessionId"), Some("abc-2"));
        assert_eq!(callback.field("htmlContent"), Some("PGgxPkhpPC9oMT4="));
        assert_eq!(callback.field("status"), Some("completed"));
    }

    #[tokio::test]
    async fn test_read_callback_urlencoded() {
        let request = Request::builder()
            .method("POST")
            .uri("/webhook-result")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("session_id=s-1&status=error&error=model+crashed"))
            .unwrap();

        let callback = read_callback(request, 1024 * 1024).await.unwrap();
        assert_eq!(callback.field("session_id"), Some("s-1"));
        assert_eq!(callback.field("error"), Some("model crashed"));
    }

    #[tokio::test]
    async fn test_read_callback_multipart() {
        let body = "--XBOUND\r\n\
            Content-Disposition: form-data; name=\"session_id\"\r\n\r\n\
            abc-7\r\n\
            --XBOUND\r\n\
            Content-Disposition: form-data; name=\"html_file\"; filename=\"r.html\"\r\n\
            Content-Type: text/html\r\n\r\n\
            <h1>Hi</h1>\r\n\
            --XBOUND--\r\n";
        let request = Request::builder()
            .method("POST")
            .uri("/webhook-result")
            .header(
                header::CONTENT_TYPE,
                "multipart/form-data; boundary=XBOUND",
            )
            .body(Body::from(body))
            .unwrap();

        let callback = read_callback(request, 1024 * 1024).await.unwrap();
        assert_eq!(callback.field("session_id"), Some("abc-7"));
        assert_eq!(callback.files.len(), 1);
        assert_eq!(callback.files[0].field_name, "html_file");
        assert_eq!(callback.files[0].file_name, "r.html");
        assert_eq!(callback.files[0].data, b"<h1>Hi</h1>");
    }

    #[tokio::test]
    async fn test_read_callback_bad_json_is_error() {
        let request = Request::builder()
            .method("POST")
            .uri("/webhook-result")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        assert!(read_callback(request, 1024 * 1024).await.is_err());
    }
}
