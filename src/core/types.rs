use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Front-end surface
// ---------------------------------------------------------------------------

/// Body of `POST /crawl` — one crawl job for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRequest {
    /// Entry URL — a department/category page or a flat listing, depending
    /// on the traversal shape.
    pub department: String,
    /// Which traversal shape to run. Accepts the legacy `option1`..`option5`
    /// labels as well as the shape names.
    pub option: String,
    /// Target collection name for extracted records (pass-through metadata).
    pub collection: String,
    /// Optional `host:port[:user:pass]` proxy forwarded into the browser profile.
    #[serde(default)]
    pub proxy: Option<String>,
    /// First listing page (inclusive). Defaults to 1.
    #[serde(default)]
    pub start: Option<u32>,
    /// Last listing page (inclusive). Defaults to 10.
    #[serde(default)]
    pub end: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------------

/// Coarse progress communicated to polling clients. Cancellation intent
/// travels separately on the cooperative stop flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Running,
    /// Stop was requested but the owning task has not yet observed the flag.
    StopRequested,
    Stopped,
    /// The owning task panicked before its completion sequence could run.
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Stopped | SessionPhase::Failed)
    }
}

/// One entry in a session's append-only event log.
///
/// Insertion order is the only ordering guarantee; the log is written by the
/// single owning task and read by polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlEvent {
    /// Subject of the event — the page or item link, when there is one.
    pub link: Option<String>,
    /// Human-readable status line.
    pub status: String,
    /// Machine-usable payload (extracted record, option list, classification).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl CrawlEvent {
    pub fn new(link: impl Into<Option<String>>, status: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            status: status.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

// ---------------------------------------------------------------------------
// Automation-service envelope
// ---------------------------------------------------------------------------

/// The `{status: {...}, data: {...}}` envelope every automation-service
/// response is wrapped in. An HTTP 200 transport status is **not** proof of
/// logical success — callers must branch on `status.http_code` / `message`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEnvelope {
    pub status: EnvelopeStatus,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeStatus {
    pub http_code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl ServiceEnvelope {
    /// Logical success: the envelope itself reports 200.
    pub fn is_ok(&self) -> bool {
        self.status.http_code == 200
    }

    /// Pull a string field out of `data`, e.g. a token.
    pub fn data_str(&self, field: &str) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|d| d.get(field))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Pull an unsigned integer field out of `data`, e.g. a debug port.
    pub fn data_u64(&self, field: &str) -> Option<u64> {
        self.data
            .as_ref()
            .and_then(|d| d.get(field))
            .and_then(|v| v.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_http_200_is_not_enough() {
        // Transport-level 200 with a logical 401 inside the envelope.
        let env: ServiceEnvelope = serde_json::from_value(json!({
            "status": {"http_code": 401, "message": "token expired"},
            "data": {}
        }))
        .unwrap();
        assert!(!env.is_ok());
        assert_eq!(env.status.message, "token expired");
    }

    #[test]
    fn envelope_data_accessors() {
        let env: ServiceEnvelope = serde_json::from_value(json!({
            "status": {"http_code": 200, "message": "Successful signin"},
            "data": {"token": "abc", "port": 39211}
        }))
        .unwrap();
        assert!(env.is_ok());
        assert_eq!(env.data_str("token").as_deref(), Some("abc"));
        assert_eq!(env.data_u64("port"), Some(39211));
        assert!(env.data_str("missing").is_none());
    }

    #[test]
    fn phase_terminality() {
        assert!(SessionPhase::Stopped.is_terminal());
        assert!(SessionPhase::Failed.is_terminal());
        assert!(!SessionPhase::Running.is_terminal());
        assert!(!SessionPhase::StopRequested.is_terminal());
    }
}
