//! Resilient call layer for the automation service and its local launcher.
//!
//! One call = payload variants (outer) × endpoints (inner) × bounded
//! exponential-backoff retries (innermost). The launcher's request validation
//! is stricter on optional fields in some deployments, so a reduced "minimal"
//! payload is kept behind the "full" one; within a variant the IPv6 loopback
//! address family is preferred because that is where the launcher binds first.
//!
//! Classification contract:
//! * transport errors / HTTP 5xx / 429 — retryable, capped attempts
//! * 401 (transport or envelope) — [`CallError::StaleCredential`]; the caller
//!   performs exactly one forced re-authentication and one whole-call retry
//! * 400 / 403 / 422 — terminal [`CallError::Rejected`] with remediation
//!   suggestions keyed by status code
//! * malformed envelope — [`CallError::Protocol`]

use crate::core::types::{EnvelopeStatus, ServiceEnvelope};
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("transient failure after {attempts} attempt(s): {detail}")]
    Transient { attempts: u32, detail: String },

    #[error("stale credential (401): {detail}")]
    StaleCredential { detail: String },

    #[error("request rejected ({status}): {reason}")]
    Rejected {
        status: u16,
        reason: String,
        error_code: Option<String>,
        suggestions: Vec<String>,
    },

    #[error("service not ready at {url} after {waited_secs}s")]
    NotReady { url: String, waited_secs: u64 },

    #[error("protocol error: {detail}")]
    Protocol { detail: String },
}

impl CallError {
    /// Human-readable classification plus remediation, for event logs.
    pub fn describe(&self) -> String {
        match self {
            CallError::Rejected {
                status,
                reason,
                suggestions,
                ..
            } if !suggestions.is_empty() => {
                format!("{} ({}) — try: {}", reason, status, suggestions.join(" | "))
            }
            other => other.to_string(),
        }
    }
}

/// Attempt policy for one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(8),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl CallPolicy {
    /// Tight policy for tests and liveness probes.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            backoff_factor: 2.0,
            max_backoff: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Remediation suggestions keyed by the classified status code.
pub fn suggestions_for(status: u16, message: &str) -> Vec<String> {
    match status {
        500 if message.to_lowercase().contains("internal core error") => vec![
            "retry in 2-3 minutes".into(),
            "check that the launcher is running".into(),
            "restart the automation app if the error persists".into(),
        ],
        500..=599 => vec![
            "retry the request".into(),
            "check the automation service status".into(),
        ],
        403 => vec![
            "check workspace permissions".into(),
            "verify folder permissions".into(),
            "refresh the authentication token".into(),
        ],
        429 => vec![
            "wait 30-60 seconds before retrying".into(),
            "reduce concurrent requests".into(),
        ],
        422 => vec![
            "check the profile payload".into(),
            "verify the proxy format".into(),
            "check the browser settings".into(),
        ],
        400 => vec![
            "check the request payload fields".into(),
            "retry with the minimal payload variant".into(),
        ],
        _ => vec![
            "retry in a few seconds".into(),
            "check connectivity to the service".into(),
        ],
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status) || (520..=524).contains(&status)
}

pub struct ResilientClient {
    http: reqwest::Client,
}

impl ResilientClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn backoff_for(policy: &CallPolicy) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(policy.initial_backoff)
            .with_multiplier(policy.backoff_factor)
            .with_max_interval(policy.max_backoff)
            .with_max_elapsed_time(None) // attempts are capped explicitly
            .build()
    }

    /// POST `payload` to `url`, retrying transport errors and retryable HTTP
    /// statuses with exponential backoff, up to `policy.max_attempts`.
    ///
    /// A successful HTTP exchange is then branched on the *envelope* status,
    /// which is authoritative over the transport status.
    pub async fn post_envelope(
        &self,
        url: &str,
        payload: &Value,
        bearer: Option<&str>,
        policy: &CallPolicy,
    ) -> Result<ServiceEnvelope, CallError> {
        let mut req = self
            .http
            .post(url)
            .timeout(policy.request_timeout)
            .json(payload);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        self.execute(url, req, policy).await
    }

    /// GET counterpart of [`post_envelope`](Self::post_envelope) — same retry
    /// and envelope classification, query params already on `url`.
    pub async fn get_envelope(
        &self,
        url: &str,
        bearer: Option<&str>,
        policy: &CallPolicy,
    ) -> Result<ServiceEnvelope, CallError> {
        let mut req = self.http.get(url).timeout(policy.request_timeout);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        self.execute(url, req, policy).await
    }

    async fn execute(
        &self,
        url: &str,
        req: reqwest::RequestBuilder,
        policy: &CallPolicy,
    ) -> Result<ServiceEnvelope, CallError> {
        let attempts = AtomicU32::new(0);
        // The retry loop only decides "retryable or not"; classification of
        // the final body happens below, outside the loop.
        let op = || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let cloned = req.try_clone().ok_or_else(|| {
                backoff::Error::permanent(CallError::Protocol {
                    detail: "request body is not cloneable".into(),
                })
            })?;
            match cloned.send().await {
                Err(e) => {
                    let err = CallError::Transient {
                        attempts: n,
                        detail: format!("{}: {}", url, e),
                    };
                    if n >= policy.max_attempts {
                        Err(backoff::Error::permanent(err))
                    } else {
                        warn!("resilient: attempt {}/{} failed: {}", n, policy.max_attempts, e);
                        Err(backoff::Error::transient(err))
                    }
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if is_retryable_status(status) {
                        let err = CallError::Transient {
                            attempts: n,
                            detail: format!("{} returned HTTP {}", url, status),
                        };
                        if n >= policy.max_attempts {
                            return Err(backoff::Error::permanent(err));
                        }
                        warn!(
                            "resilient: attempt {}/{} got HTTP {} from {}",
                            n, policy.max_attempts, status, url
                        );
                        return Err(backoff::Error::transient(err));
                    }
                    let text = resp.text().await.unwrap_or_default();
                    Ok((status, text))
                }
            }
        };

        let (status, body) = retry(Self::backoff_for(policy), op).await?;
        classify_response(status, &body)
    }

    /// Full fallback matrix: payload variants outer, endpoints inner.
    ///
    /// * success — returned immediately
    /// * 400/422 — validation rejection; skip to the next (reduced) variant
    /// * 401 — returned immediately (the credential is the same everywhere)
    /// * 403 — returned immediately (permissions don't vary by endpoint)
    /// * transient exhaustion — try the next endpoint
    pub async fn post_with_fallback(
        &self,
        endpoints: &[String],
        variants: &[(&str, Value)],
        bearer: Option<&str>,
        policy: &CallPolicy,
    ) -> Result<ServiceEnvelope, CallError> {
        let mut last_err = CallError::Protocol {
            detail: "no endpoints configured".into(),
        };

        for (variant_name, payload) in variants {
            for (i, url) in endpoints.iter().enumerate() {
                info!(
                    "resilient: trying payload '{}' against endpoint {}/{}: {}",
                    variant_name,
                    i + 1,
                    endpoints.len(),
                    url
                );
                match self.post_envelope(url, payload, bearer, policy).await {
                    Ok(env) => {
                        info!(
                            "resilient: success with payload '{}' via {}",
                            variant_name, url
                        );
                        return Ok(env);
                    }
                    Err(e @ CallError::StaleCredential { .. }) => return Err(e),
                    Err(e @ CallError::Rejected { status: 403, .. }) => return Err(e),
                    Err(e @ CallError::Rejected { status: 400 | 422, .. }) => {
                        warn!(
                            "resilient: payload '{}' rejected by validation — moving to next variant",
                            variant_name
                        );
                        last_err = e;
                        break; // next payload variant
                    }
                    Err(e) => {
                        warn!("resilient: endpoint {} failed: {}", url, e);
                        last_err = e;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Probe a lightweight liveness endpoint for up to `wait_secs`, one
    /// request per second. Lets callers fail fast with "service not ready"
    /// instead of burning the retry budget against a service still starting.
    pub async fn probe_ready(&self, url: &str, wait_secs: u64) -> Result<(), CallError> {
        for i in 0..wait_secs.max(1) {
            match self
                .http
                .get(url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!("resilient: {} ready after {}s", url, i);
                    return Ok(());
                }
                Ok(resp) => {
                    warn!("resilient: probe {} returned HTTP {}", url, resp.status());
                }
                Err(e) => {
                    warn!("resilient: probe {} failed: {}", url, e);
                }
            }
            if i + 1 < wait_secs {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        Err(CallError::NotReady {
            url: url.to_string(),
            waited_secs: wait_secs,
        })
    }
}

fn classify_response(transport_status: u16, body: &str) -> Result<ServiceEnvelope, CallError> {
    // The envelope's own status is authoritative; fall back to the transport
    // status when the body is not an envelope (e.g. a proxy error page).
    let env = match serde_json::from_str::<ServiceEnvelope>(body) {
        Ok(env) => env,
        Err(_) if transport_status == 200 => {
            // Transport 200 with a non-envelope body — the service broke contract.
            return Err(CallError::Protocol {
                detail: format!("expected status envelope, got: {}", truncate(body, 200)),
            });
        }
        Err(_) if transport_status == 401 => {
            return Err(CallError::StaleCredential {
                detail: "authorization rejected".into(),
            });
        }
        Err(_) => {
            return Err(CallError::Rejected {
                status: transport_status,
                reason: truncate(body, 200),
                error_code: None,
                suggestions: suggestions_for(transport_status, body),
            });
        }
    };

    if env.is_ok() {
        Ok(env)
    } else {
        Err(envelope_failure(&env.status))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Synthesize an envelope-status error for places that already hold a parsed
/// envelope reporting failure (e.g. the auth protocol steps).
pub fn envelope_failure(status: &EnvelopeStatus) -> CallError {
    match status.http_code {
        401 => CallError::StaleCredential {
            detail: status.message.clone(),
        },
        code => CallError::Rejected {
            status: code,
            reason: status.message.clone(),
            error_code: status.error_code.clone(),
            suggestions: suggestions_for(code, &status.message),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn client() -> ResilientClient {
        ResilientClient::new(reqwest::Client::new())
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn ok_envelope() -> serde_json::Value {
        json!({"status": {"http_code": 200, "message": "ok"}, "data": {"port": 4321}})
    }

    #[test]
    fn suggestion_catalog_is_status_keyed() {
        assert!(suggestions_for(429, "")[0].contains("wait"));
        assert!(suggestions_for(403, "").iter().any(|s| s.contains("workspace")));
        assert!(suggestions_for(500, "internal core error")
            .iter()
            .any(|s| s.contains("2-3 minutes")));
    }

    #[test]
    fn retryable_statuses() {
        for s in [429, 500, 502, 503, 504, 520, 524] {
            assert!(is_retryable_status(s), "{} should be retryable", s);
        }
        for s in [200, 400, 401, 403, 404, 422] {
            assert!(!is_retryable_status(s), "{} must not be retryable", s);
        }
    }

    #[tokio::test]
    async fn retries_5xx_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let app = Router::new().route(
            "/call",
            post(move || {
                let hits = hits2.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy".to_string())
                    } else {
                        (axum::http::StatusCode::OK, ok_envelope().to_string())
                    }
                }
            }),
        );
        let base = serve(app).await;

        let env = client()
            .post_envelope(
                &format!("{}/call", base),
                &json!({}),
                None,
                &CallPolicy::fast(),
            )
            .await
            .unwrap();
        assert!(env.is_ok());
        assert_eq!(env.data_u64("port"), Some(4321));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempt_budget_is_bounded() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let app = Router::new().route(
            "/call",
            post(move || {
                let hits = hits2.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let base = serve(app).await;

        let policy = CallPolicy::fast();
        let err = client()
            .post_envelope(&format!("{}/call", base), &json!({}), None, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Transient { attempts, .. } if attempts == policy.max_attempts));
        assert_eq!(hits.load(Ordering::SeqCst), policy.max_attempts as usize);
    }

    #[tokio::test]
    async fn envelope_401_maps_to_stale_credential() {
        // Transport 200, envelope 401 — the envelope wins.
        let app = Router::new().route(
            "/call",
            post(|| async {
                json!({"status": {"http_code": 401, "message": "token expired"}})
                    .to_string()
            }),
        );
        let base = serve(app).await;

        let err = client()
            .post_envelope(&format!("{}/call", base), &json!({}), None, &CallPolicy::fast())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::StaleCredential { .. }));
    }

    #[tokio::test]
    async fn rejection_carries_suggestions_and_no_retry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let app = Router::new().route(
            "/call",
            post(move || {
                let hits = hits2.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (
                        axum::http::StatusCode::UNPROCESSABLE_ENTITY,
                        json!({"status": {"http_code": 422, "message": "BAD_REQUEST_VALUES", "error_code": "BAD_REQUEST_VALUES"}}).to_string(),
                    )
                }
            }),
        );
        let base = serve(app).await;

        let err = client()
            .post_envelope(&format!("{}/call", base), &json!({}), None, &CallPolicy::fast())
            .await
            .unwrap_err();
        match err {
            CallError::Rejected {
                status,
                error_code,
                suggestions,
                ..
            } => {
                assert_eq!(status, 422);
                assert_eq!(error_code.as_deref(), Some("BAD_REQUEST_VALUES"));
                assert!(!suggestions.is_empty());
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
        // Terminal rejection must not consume the retry budget.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn minimal_variant_wins_when_full_is_rejected() {
        let app = Router::new().route(
            "/quick",
            post(|body: String| async move {
                let v: serde_json::Value = serde_json::from_str(&body).unwrap();
                if v.get("fingerprint").is_some() {
                    json!({"status": {"http_code": 422, "message": "BAD_REQUEST_VALUES"}}).to_string()
                } else {
                    ok_envelope().to_string()
                }
            }),
        );
        let base = serve(app).await;
        let endpoints = vec![format!("{}/quick", base)];
        let variants = vec![
            ("full", json!({"fingerprint": {}, "os_type": "linux"})),
            ("minimal", json!({"os_type": "linux"})),
        ];

        let env = client()
            .post_with_fallback(&endpoints, &variants, None, &CallPolicy::fast())
            .await
            .unwrap();
        assert!(env.is_ok());
    }

    #[tokio::test]
    async fn endpoint_fallback_on_connection_refused() {
        let app = Router::new().route("/quick", post(|| async { ok_envelope().to_string() }));
        let base = serve(app).await;
        // First endpoint is a dead port; the second serves.
        let endpoints = vec![
            "http://127.0.0.1:1/quick".to_string(),
            format!("{}/quick", base),
        ];
        let variants = vec![("full", json!({}))];

        let mut policy = CallPolicy::fast();
        policy.max_attempts = 1; // keep the dead-endpoint phase quick

        let env = client()
            .post_with_fallback(&endpoints, &variants, None, &policy)
            .await
            .unwrap();
        assert!(env.is_ok());
    }

    #[tokio::test]
    async fn probe_ready_fails_fast_when_down() {
        let err = client().probe_ready("http://127.0.0.1:1/statuses", 1).await;
        assert!(matches!(err, Err(CallError::NotReady { .. })));
    }

    #[tokio::test]
    async fn probe_ready_succeeds_on_200() {
        let app = Router::new().route("/statuses", get(|| async { "ok" }));
        let base = serve(app).await;
        client()
            .probe_ready(&format!("{}/statuses", base), 2)
            .await
            .unwrap();
    }
}
