//! Ingress relay to the external analysis processor
//!
//! Rebuilds client submissions as outbound multipart requests and forwards
//! them with bounded-accept semantics: the processor only has to acknowledge
//! receipt within the accept window. Analysis itself completes out-of-band
//! and arrives later via the result callback.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// How long the processor gets to acknowledge a submission (15 seconds)
pub const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 15_000;

/// Cap on how much of a rejection body is kept for the error envelope
const REJECTION_EXCERPT_MAX_CHARS: usize = 500;

/// Errors raised while constructing the relay or an outbound request
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("failed to build form part: {0}")]
    FormPart(String),
}

/// How submissions are handed to the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStrategy {
    /// Wait for the processor to acknowledge receipt within the accept window
    #[default]
    BoundedAccept,
    /// Spawn the forward and report acceptance immediately
    FireAndForget,
}

impl ForwardStrategy {
    /// Parse a strategy name case-insensitively. Returns `None` for
    /// unrecognized values.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bounded_accept" => Some(Self::BoundedAccept),
            "fire_and_forget" => Some(Self::FireAndForget),
            _ => None,
        }
    }
}

impl std::fmt::Display for ForwardStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BoundedAccept => write!(f, "bounded_accept"),
            Self::FireAndForget => write!(f, "fire_and_forget"),
        }
    }
}

/// One file attachment to forward, carried unchanged
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Multipart field name (convention: `arquivo_0`, `arquivo_1`, ...)
    pub field_name: String,
    /// Original filename
    pub file_name: String,
    /// MIME type as supplied by the client; empty means unspecified
    pub content_type: String,
    /// Raw file bytes
    pub data: Vec<u8>,
}

/// A submission to forward: scalar fields plus file attachments.
///
/// The relay imposes no count or size limits; those belong to the
/// collaborator that builds the request.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub fields: Vec<(String, String)>,
    pub files: Vec<UploadFile>,
}

impl SubmitRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a scalar field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Add a file attachment
    pub fn with_file(mut self, file: UploadFile) -> Self {
        self.files.push(file);
        self
    }
}

/// Outcome of forwarding one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Processor acknowledged receipt; analysis continues out-of-band
    Accepted,
    /// Accept window elapsed with no response; the in-flight request was
    /// cancelled
    Timeout,
    /// Processor answered with a non-success status
    Rejected { status: u16, body_excerpt: String },
    /// DNS, connection, or request-construction failure before any response
    TransportError(String),
}

impl SubmitOutcome {
    /// Whether the caller can reasonably retry as-is. Rejections should be
    /// inspected against the processor configuration first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::TransportError(_))
    }

    /// Stable label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Timeout => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::TransportError(_) => "transport_error",
        }
    }
}

/// Forwards submissions to the external processor endpoint.
///
/// Never touches the result store; acceptance only means the processor has
/// the job, not that a result exists.
#[derive(Debug, Clone)]
pub struct ProcessorRelay {
    client: reqwest::Client,
    endpoint: String,
    accept_timeout: Duration,
    strategy: ForwardStrategy,
}

impl ProcessorRelay {
    /// Create a relay targeting the given processor endpoint
    pub fn new(endpoint: impl Into<String>) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| RelayError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            accept_timeout: Duration::from_millis(DEFAULT_ACCEPT_TIMEOUT_MS),
            strategy: ForwardStrategy::BoundedAccept,
        })
    }

    /// Set a custom accept window
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set the forward strategy
    pub fn with_strategy(mut self, strategy: ForwardStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// The configured processor endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Forward a submission according to the configured strategy
    pub async fn submit(&self, request: SubmitRequest) -> SubmitOutcome {
        match self.strategy {
            ForwardStrategy::BoundedAccept => self.forward_bounded(request).await,
            ForwardStrategy::FireAndForget => {
                let client = self.client.clone();
                let endpoint = self.endpoint.clone();
                tokio::spawn(async move {
                    let outcome = forward_once(&client, &endpoint, request).await;
                    match outcome {
                        SubmitOutcome::Accepted => {
                            debug!(endpoint = %endpoint, "fire-and-forget forward accepted")
                        }
                        other => {
                            warn!(endpoint = %endpoint, outcome = other.label(), "fire-and-forget forward failed")
                        }
                    }
                });
                SubmitOutcome::Accepted
            }
        }
    }

    /// Forward and wait for acknowledgment within the accept window.
    /// Elapsing the window drops the in-flight request.
    async fn forward_bounded(&self, request: SubmitRequest) -> SubmitOutcome {
        let forward = forward_once(&self.client, &self.endpoint, request);
        match tokio::time::timeout(self.accept_timeout, forward).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    endpoint = %self.endpoint,
                    timeout_ms = self.accept_timeout.as_millis() as u64,
                    "processor did not acknowledge within the accept window"
                );
                SubmitOutcome::Timeout
            }
        }
    }
}

/// Issue one outbound multipart request and classify the response
async fn forward_once(
    client: &reqwest::Client,
    endpoint: &str,
    request: SubmitRequest,
) -> SubmitOutcome {
    let form = match build_form(request) {
        Ok(form) => form,
        Err(e) => return SubmitOutcome::TransportError(e.to_string()),
    };

    let response = match client.post(endpoint).multipart(form).send().await {
        Ok(response) => response,
        Err(e) => return SubmitOutcome::TransportError(e.to_string()),
    };

    let status = response.status();
    if !status.is_success() {
        let body_text = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".to_string());
        return SubmitOutcome::Rejected {
            status: status.as_u16(),
            body_excerpt: excerpt(&body_text),
        };
    }

    SubmitOutcome::Accepted
}

/// Rebuild the outbound multipart form, fields and files unchanged
fn build_form(request: SubmitRequest) -> Result<reqwest::multipart::Form, RelayError> {
    let mut form = reqwest::multipart::Form::new();

    for (name, value) in request.fields {
        form = form.text(name, value);
    }

    for file in request.files {
        let part = reqwest::multipart::Part::bytes(file.data).file_name(file.file_name);
        let part = if file.content_type.is_empty() {
            part
        } else {
            part.mime_str(&file.content_type)
                .map_err(|e| RelayError::FormPart(e.to_string()))?
        };
        form = form.part(file.field_name, part);
    }

    Ok(form)
}

/// Cap a rejection body for the error envelope
fn excerpt(body: &str) -> String {
    body.chars().take(REJECTION_EXCERPT_MAX_CHARS).collect()
}
