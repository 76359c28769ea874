//! Ephemeral analysis result store
//!
//! Maps client-generated session identifiers to analysis results written by
//! the result callback and read by the polling endpoint. A session with no
//! record is in the implicit "processing" state.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Maximum number of results to retain before opportunistic cleanup kicks in
const MAX_STORED_RESULTS: usize = 10_000;

/// Default TTL for stored results (1 hour)
pub const DEFAULT_RESULT_TTL_MS: i64 = 3600 * 1000;

/// Correlation key linking a submission to its eventual result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new unique session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a session ID from a string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// State of an analysis as seen by the polling client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// No result yet; the processor is still working
    #[default]
    Processing,
    /// Analysis finished and a result payload may be present
    Completed,
    /// Analysis failed; error detail may be present
    Error,
}

impl AnalysisStatus {
    /// Parse a status string case-insensitively. Returns `None` for
    /// unrecognized values so callers can pick their own fallback.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this status ends the wait for a result
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Base64 transit form for the optional result payload. Absent payloads
/// serialize as an explicit `null` so pollers always see the field.
mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(payload: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match payload {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// One stored analysis result, at most one per session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Session this result belongs to
    pub session_id: SessionId,
    /// Result artifact bytes; base64 on the wire, `null` when absent
    #[serde(with = "base64_opt", default)]
    pub html_content: Option<Vec<u8>>,
    /// Terminal state reported by the processor
    pub status: AnalysisStatus,
    /// Human-readable failure detail, `null` unless the processor sent one
    pub error: Option<String>,
    /// When the callback was received
    pub received_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Create a result with the given status, received now
    pub fn new(session_id: SessionId, status: AnalysisStatus) -> Self {
        Self {
            session_id,
            html_content: None,
            status,
            error: None,
            received_at: Utc::now(),
        }
    }

    /// Attach the result payload bytes
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.html_content = Some(payload);
        self
    }

    /// Attach a failure detail
    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error = Some(detail.into());
        self
    }

    /// Check whether the record has outlived the TTL (non-positive = never
    /// expires)
    pub fn is_expired(&self, ttl_ms: i64) -> bool {
        if ttl_ms <= 0 {
            return false;
        }
        Utc::now()
            .signed_duration_since(self.received_at)
            .num_milliseconds()
            > ttl_ms
    }
}

/// Store counters for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_writes: u64,
    pub total_evicted: u64,
    pub current_size: usize,
}

/// Shared in-memory result store
///
/// The single shared-mutable resource in the service. All operations are
/// infallible; key validation happens in the layers that accept input.
#[derive(Debug)]
pub struct ResultStore {
    results: RwLock<HashMap<String, AnalysisResult>>,
    result_ttl_ms: i64,
    stats_writes: AtomicU64,
    stats_evicted: AtomicU64,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    /// Create a store with the default retention TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_RESULT_TTL_MS)
    }

    /// Create a store with an explicit retention TTL in milliseconds
    /// (non-positive disables eviction)
    pub fn with_ttl(result_ttl_ms: i64) -> Self {
        Self {
            results: RwLock::new(HashMap::new()),
            result_ttl_ms,
            stats_writes: AtomicU64::new(0),
            stats_evicted: AtomicU64::new(0),
        }
    }

    /// Insert or replace the result for a session. Last write wins.
    pub fn put(&self, result: AnalysisResult) {
        let key = result.session_id.0.clone();
        {
            let mut results = self.results.write();
            results.insert(key, result);
        }
        self.stats_writes.fetch_add(1, Ordering::Relaxed);
        self.maybe_cleanup_expired();
    }

    /// Look up the result for a session. `None` means still processing.
    pub fn get(&self, session_id: &str) -> Option<AnalysisResult> {
        let results = self.results.read();
        results.get(session_id).cloned()
    }

    /// Remove the result for a session. Returns whether a record existed;
    /// deleting an absent session is not an error.
    pub fn delete(&self, session_id: &str) -> bool {
        let mut results = self.results.write();
        results.remove(session_id).is_some()
    }

    /// Number of records currently stored
    pub fn size(&self) -> usize {
        let results = self.results.read();
        results.len()
    }

    /// Clean up expired results if the map is getting too large
    fn maybe_cleanup_expired(&self) {
        let results = self.results.read();
        if results.len() <= MAX_STORED_RESULTS {
            return;
        }
        drop(results);

        self.cleanup_expired();
    }

    /// Remove results older than the retention TTL. Returns how many were
    /// evicted.
    pub fn cleanup_expired(&self) -> usize {
        if self.result_ttl_ms <= 0 {
            return 0;
        }

        let ttl = self.result_ttl_ms;
        let mut results = self.results.write();
        let before = results.len();
        results.retain(|_, result| !result.is_expired(ttl));
        let removed = before - results.len();

        if removed > 0 {
            self.stats_evicted.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Get store statistics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            total_writes: self.stats_writes.load(Ordering::Relaxed),
            total_evicted: self.stats_evicted.load(Ordering::Relaxed),
            current_size: self.size(),
        }
    }

    /// Remove all records (for testing or shutdown)
    pub fn clear(&self) {
        let mut results = self.results.write();
        results.clear();
    }
}

/// Create a shared result store with the given retention TTL
pub fn create_store(result_ttl_ms: i64) -> Arc<ResultStore> {
    Arc::new(ResultStore::with_ttl(result_ttl_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_generation() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_session_id_from_string() {
        let id = SessionId::from_string("abc-123");
        assert_eq!(id.0, "abc-123");
        assert_eq!(id.to_string(), "abc-123");
        assert_eq!(id.as_ref(), "abc-123");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(AnalysisStatus::Processing.to_string(), "processing");
        assert_eq!(AnalysisStatus::Completed.to_string(), "completed");
        assert_eq!(AnalysisStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            AnalysisStatus::parse("completed"),
            Some(AnalysisStatus::Completed)
        );
        assert_eq!(
            AnalysisStatus::parse("ERROR"),
            Some(AnalysisStatus::Error)
        );
        assert_eq!(
            AnalysisStatus::parse("  Processing  "),
            Some(AnalysisStatus::Processing)
        );
        assert_eq!(AnalysisStatus::parse("done"), None);
        assert_eq!(AnalysisStatus::parse(""), None);
    }

    #[test]
    fn test_status_is_terminal() {
        assert!(!AnalysisStatus::Processing.is_terminal());
        assert!(AnalysisStatus::Completed.is_terminal());
        assert!(AnalysisStatus::Error.is_terminal());
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&AnalysisStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let parsed: AnalysisStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, AnalysisStatus::Error);
    }

    #[test]
    fn test_result_serializes_payload_as_base64() {
        let result = AnalysisResult::new(
            SessionId::from_string("abc-2"),
            AnalysisStatus::Completed,
        )
        .with_payload(b"<h1>Hi</h1>".to_vec());

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["session_id"], "abc-2");
        assert_eq!(value["html_content"], "PGgxPkhpPC9oMT4=");
        assert_eq!(value["status"], "completed");
        assert!(value["error"].is_null());
        assert!(value["received_at"].is_string());
    }

    #[test]
    fn test_result_serializes_absent_payload_as_null() {
        let result = AnalysisResult::new(
            SessionId::from_string("s-1"),
            AnalysisStatus::Error,
        )
        .with_error("model unavailable");

        let value = serde_json::to_value(&result).unwrap();
        assert!(value["html_content"].is_null());
        assert_eq!(value["error"], "model unavailable");
    }

    #[test]
    fn test_result_deserializes_base64_payload() {
        let json = r#"{
            "session_id": "abc-2",
            "html_content": "PGgxPkhpPC9oMT4=",
            "status": "completed",
            "error": null,
            "received_at": "2026-01-05T12:00:00Z"
        }"#;
        let result: AnalysisResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.html_content.as_deref(), Some(b"<h1>Hi</h1>".as_ref()));
        assert_eq!(result.status, AnalysisStatus::Completed);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_put_then_get() {
        let store = ResultStore::new();
        let result = AnalysisResult::new(
            SessionId::from_string("s-1"),
            AnalysisStatus::Completed,
        )
        .with_payload(b"report".to_vec());

        store.put(result);

        let fetched = store.get("s-1").unwrap();
        assert_eq!(fetched.session_id.0, "s-1");
        assert_eq!(fetched.html_content.as_deref(), Some(b"report".as_ref()));
        assert_eq!(fetched.status, AnalysisStatus::Completed);
    }

    #[test]
    fn test_get_unknown_session_is_none() {
        let store = ResultStore::new();
        assert!(store.get("never-written").is_none());
    }

    #[test]
    fn test_put_overwrites_previous_record() {
        let store = ResultStore::new();
        let session = SessionId::from_string("s-1");

        store.put(
            AnalysisResult::new(session.clone(), AnalysisStatus::Completed)
                .with_payload(b"first".to_vec()),
        );
        store.put(
            AnalysisResult::new(session, AnalysisStatus::Error).with_error("second run failed"),
        );

        assert_eq!(store.size(), 1);
        let fetched = store.get("s-1").unwrap();
        assert_eq!(fetched.status, AnalysisStatus::Error);
        assert!(fetched.html_content.is_none());
        assert_eq!(fetched.error.as_deref(), Some("second run failed"));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = ResultStore::new();
        store.put(AnalysisResult::new(
            SessionId::from_string("s-1"),
            AnalysisStatus::Completed,
        ));

        assert!(store.delete("s-1"));
        assert_eq!(store.size(), 0);
        assert!(!store.delete("s-1"));
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_delete_absent_leaves_size_unchanged() {
        let store = ResultStore::new();
        store.put(AnalysisResult::new(
            SessionId::from_string("s-1"),
            AnalysisStatus::Completed,
        ));

        assert!(!store.delete("never-written"));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_cleanup_removes_expired_records() {
        let store = ResultStore::with_ttl(1000);

        let mut old = AnalysisResult::new(
            SessionId::from_string("old"),
            AnalysisStatus::Completed,
        );
        old.received_at = Utc::now() - chrono::Duration::milliseconds(5000);
        store.put(old);
        store.put(AnalysisResult::new(
            SessionId::from_string("fresh"),
            AnalysisStatus::Completed,
        ));

        let removed = store.cleanup_expired();
        assert_eq!(removed, 1);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
        assert_eq!(store.stats().total_evicted, 1);
    }

    #[test]
    fn test_cleanup_disabled_when_ttl_zero() {
        let store = ResultStore::with_ttl(0);

        let mut old = AnalysisResult::new(
            SessionId::from_string("old"),
            AnalysisStatus::Completed,
        );
        old.received_at = Utc::now() - chrono::Duration::days(30);
        store.put(old);

        assert_eq!(store.cleanup_expired(), 0);
        assert!(store.get("old").is_some());
    }

    #[test]
    fn test_cleanup_disabled_when_ttl_negative() {
        let store = ResultStore::with_ttl(-1);

        let fresh = AnalysisResult::new(
            SessionId::from_string("fresh"),
            AnalysisStatus::Completed,
        );
        assert!(!fresh.is_expired(-1));
        store.put(fresh);

        assert_eq!(store.cleanup_expired(), 0);
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn test_stats_counts_writes() {
        let store = ResultStore::new();
        store.put(AnalysisResult::new(
            SessionId::from_string("a"),
            AnalysisStatus::Completed,
        ));
        store.put(AnalysisResult::new(
            SessionId::from_string("a"),
            AnalysisStatus::Completed,
        ));
        store.put(AnalysisResult::new(
            SessionId::from_string("b"),
            AnalysisStatus::Error,
        ));

        let stats = store.stats();
        assert_eq!(stats.total_writes, 3);
        assert_eq!(stats.current_size, 2);
    }

    #[test]
    fn test_clear() {
        let store = ResultStore::new();
        store.put(AnalysisResult::new(
            SessionId::from_string("a"),
            AnalysisStatus::Completed,
        ));
        store.clear();
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_store_thread_safety() {
        use std::thread;

        let store = create_store(DEFAULT_RESULT_TTL_MS);
        let mut handles = vec![];

        // Spawn multiple threads that write distinct sessions
        for i in 0..10 {
            let s = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                let result = AnalysisResult::new(
                    SessionId::from_string(format!("session-{}", i)),
                    AnalysisStatus::Completed,
                )
                .with_payload(format!("<p>{}</p>", i).into_bytes());
                s.put(result);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.size(), 10);
        for i in 0..10 {
            assert!(store.get(&format!("session-{}", i)).is_some());
        }
    }
}
