//! Egress receiver for processor result callbacks
//!
//! The external processor reports results out-of-band with loosely agreed
//! field names. This module normalizes the variants through ordered rule
//! tables and writes the outcome into the result store. The receiver is
//! permissive: only a missing session identifier rejects a callback.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use tracing::{info, warn};

use crate::store::{AnalysisResult, AnalysisStatus, ResultStore, SessionId};

/// Accepted spellings for the session identifier, in priority order
const SESSION_FIELDS: [&str; 2] = ["session_id", "sessionId"];

/// Scalar field carrying the reported status
const STATUS_FIELD: &str = "status";

/// Scalar field carrying the failure detail
const ERROR_FIELD: &str = "error";

/// Filename suffixes that mark an attachment as result content
const CONTENT_FILE_EXTENSIONS: [&str; 2] = [".html", ".htm"];

/// Where result content may come from, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentRule {
    /// Field carrying base64 transit content
    EncodedField(&'static str),
    /// Field carrying raw content
    RawField(&'static str),
    /// First attachment recognized as result content
    Attachment,
}

/// First matching rule wins; new spellings go here, not into control flow
const CONTENT_RULES: [ContentRule; 4] = [
    ContentRule::EncodedField("html_content"),
    ContentRule::EncodedField("htmlContent"),
    ContentRule::RawField("html"),
    ContentRule::Attachment,
];

/// One file attachment carried by a callback
#[derive(Debug, Clone)]
pub struct CallbackFile {
    pub field_name: String,
    pub file_name: String,
    pub data: Vec<u8>,
}

/// A callback body normalized to scalar fields plus attachments, whatever
/// transport encoding it arrived in
#[derive(Debug, Clone, Default)]
pub struct CallbackRequest {
    pub fields: Vec<(String, String)>,
    pub files: Vec<CallbackFile>,
}

impl CallbackRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a scalar field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Add a file attachment
    pub fn with_file(mut self, file: CallbackFile) -> Self {
        self.files.push(file);
        self
    }

    /// Build from a JSON body. Top-level string values are taken verbatim,
    /// numbers and booleans are stringified, everything else is ignored.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut request = Self::new();
        if let Some(object) = value.as_object() {
            for (name, value) in object {
                let scalar = match value {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    serde_json::Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                };
                if let Some(scalar) = scalar {
                    request.fields.push((name.clone(), scalar));
                }
            }
        }
        request
    }

    /// Build from an urlencoded body
    pub fn from_urlencoded(body: &[u8]) -> Self {
        let mut request = Self::new();
        for (name, value) in url::form_urlencoded::parse(body) {
            request.fields.push((name.into_owned(), value.into_owned()));
        }
        request
    }

    /// First value for an exact field name
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field_name, _)| field_name == name)
            .map(|(_, value)| value.as_str())
    }

    /// All field names present, scalar fields first then attachments,
    /// in arrival order. Used to report integration mismatches.
    pub fn field_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .map(|(name, _)| name.clone())
            .chain(self.files.iter().map(|file| file.field_name.clone()))
            .collect()
    }
}

/// Outcome of handling one callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Record written; acknowledgment echoes the session
    Stored { session_id: SessionId },
    /// No usable session identifier; the store was not touched
    MissingSession { received: Vec<String> },
}

/// Normalizes callbacks and writes them into the result store
#[derive(Debug, Clone)]
pub struct CallbackReceiver {
    store: Arc<ResultStore>,
}

impl CallbackReceiver {
    pub fn new(store: Arc<ResultStore>) -> Self {
        Self { store }
    }

    /// Normalize one callback and store the result. Overwrites any earlier
    /// record for the same session (last write wins).
    pub fn receive(&self, request: CallbackRequest) -> ReceiveOutcome {
        let session_id = match resolve_session(&request) {
            Some(session_id) => session_id,
            None => {
                let received = request.field_names();
                warn!(received = ?received, "callback without a session identifier");
                return ReceiveOutcome::MissingSession { received };
            }
        };

        let status = resolve_status(&request);
        let html_content = resolve_content(&request);
        let error = first_non_empty(&request, &[ERROR_FIELD]).map(|value| value.to_string());

        let has_content = html_content.is_some();
        let mut result = AnalysisResult::new(SessionId::from_string(&*session_id), status);
        result.html_content = html_content;
        result.error = error;
        self.store.put(result);

        info!(
            session_id = %session_id,
            status = %status,
            has_content,
            "analysis result stored"
        );
        ReceiveOutcome::Stored {
            session_id: SessionId::from_string(session_id),
        }
    }
}

/// Session identifier after trimming, if any spelling carries one
fn resolve_session(request: &CallbackRequest) -> Option<String> {
    SESSION_FIELDS.iter().find_map(|name| {
        request
            .field(name)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
    })
}

/// Reported status, defaulting to completed. Unrecognized values degrade to
/// the same default a missing field gets.
fn resolve_status(request: &CallbackRequest) -> AnalysisStatus {
    match first_non_empty(request, &[STATUS_FIELD]) {
        Some(value) => AnalysisStatus::parse(value).unwrap_or_else(|| {
            warn!(status = value, "unrecognized callback status, storing as completed");
            AnalysisStatus::Completed
        }),
        None => AnalysisStatus::Completed,
    }
}

/// Walk the content rules in order; first match wins
fn resolve_content(request: &CallbackRequest) -> Option<Vec<u8>> {
    for rule in CONTENT_RULES {
        match rule {
            ContentRule::EncodedField(name) => {
                if let Some(value) = first_non_empty(request, &[name]) {
                    return Some(decode_transit(value));
                }
            }
            ContentRule::RawField(name) => {
                if let Some(value) = first_non_empty(request, &[name]) {
                    return Some(value.as_bytes().to_vec());
                }
            }
            ContentRule::Attachment => {
                if let Some(file) = request.files.iter().find(|file| is_content_attachment(file)) {
                    return Some(file.data.clone());
                }
            }
        }
    }
    None
}

/// Decode base64 transit content, keeping the raw bytes when the value is
/// not valid base64
fn decode_transit(value: &str) -> Vec<u8> {
    match STANDARD.decode(value.trim().as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("callback content is not valid base64, storing raw: {e}");
            value.as_bytes().to_vec()
        }
    }
}

/// Whether an attachment looks like result content: field name mentions
/// html, or the filename carries a recognized extension
fn is_content_attachment(file: &CallbackFile) -> bool {
    let field = file.field_name.to_ascii_lowercase();
    if field.contains("html") {
        return true;
    }
    let name = file.file_name.to_ascii_lowercase();
    CONTENT_FILE_EXTENSIONS
        .iter()
        .any(|extension| name.ends_with(extension))
}

/// First non-empty value among the given field names, in order. Empty
/// strings fall through to the next candidate.
fn first_non_empty<'a>(request: &'a CallbackRequest, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| {
        request
            .field(name)
            .filter(|value| !value.is_empty())
    })
}
