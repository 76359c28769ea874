//! Programmatic polling client.
//!
//! Embodies the caller side of the relay contract: create a session id,
//! submit files through `POST /upload`, then poll
//! `GET /analysis-result/{session_id}` until the record settles or the
//! wait budget runs out.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{AnalysisStatus, SessionId};

/// Pause between consecutive polls.
pub const POLL_INTERVAL_MS: u64 = 3_000;

/// Longest a polling loop keeps going before giving up.
pub const MAX_POLL_WAIT_MS: u64 = 600_000;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to build http client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("poll request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("poll returned status {0}")]
    UnexpectedStatus(u16),
    #[error("stored payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("no settled result for session {session_id} after {waited_ms}ms")]
    Deadline { session_id: String, waited_ms: u64 },
}

/// Terminal outcome of a polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettledResult {
    /// Analysis finished; the payload is the decoded report (empty when
    /// the callback carried no content).
    Completed { html: Vec<u8> },
    /// The processor reported a failure for this session.
    Failed { detail: String },
}

/// Response body of a single poll. Covers both the placeholder envelope
/// and the full stored record; fields the caller does not need are
/// ignored.
#[derive(Debug, Deserialize)]
struct PollEnvelope {
    status: String,
    #[serde(default)]
    html_content: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for one relay instance.
#[derive(Debug, Clone)]
pub struct ResultClient {
    client: Client,
    base_url: String,
    poll_interval: Duration,
    max_wait: Duration,
}

impl ResultClient {
    /// Create a client for the relay at `base_url` with the stock poll
    /// interval and wait budget.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ClientError::ClientBuild)?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            client,
            base_url,
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            max_wait: Duration::from_millis(MAX_POLL_WAIT_MS),
        })
    }

    /// Override the pause between polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the total wait budget.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Fresh v4 session identifier for a new submission.
    pub fn new_session_id() -> SessionId {
        SessionId::new()
    }

    /// Poll until the record for `session_id` settles.
    ///
    /// Polls once immediately and then on the configured interval. A
    /// failed poll (transport error, non-success status, undecodable
    /// body) is logged and the loop continues; only exhausting the wait
    /// budget ends it without a result.
    pub async fn poll_until_settled(&self, session_id: &str) -> Result<SettledResult, ClientError> {
        let url = format!("{}/analysis-result/{}", self.base_url, session_id);
        let started = Instant::now();
        loop {
            match self.poll_once(&url).await {
                Ok(Some(settled)) => return Ok(settled),
                Ok(None) => debug!(session_id, "result not ready yet"),
                Err(err) => warn!(session_id, error = %err, "poll attempt failed"),
            }
            if started.elapsed() >= self.max_wait {
                return Err(ClientError::Deadline {
                    session_id: session_id.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn poll_once(&self, url: &str) -> Result<Option<SettledResult>, ClientError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::UnexpectedStatus(status.as_u16()));
        }
        let envelope: PollEnvelope = response.json().await?;
        match AnalysisStatus::parse(&envelope.status) {
            Some(AnalysisStatus::Completed) => {
                let html = match envelope.html_content {
                    Some(encoded) => STANDARD.decode(encoded.trim().as_bytes())?,
                    None => Vec::new(),
                };
                Ok(Some(SettledResult::Completed { html }))
            }
            Some(AnalysisStatus::Error) => Ok(Some(SettledResult::Failed {
                detail: envelope
                    .error
                    .unwrap_or_else(|| "processor reported an error".to_string()),
            })),
            Some(AnalysisStatus::Processing) | None => Ok(None),
        }
    }
}
