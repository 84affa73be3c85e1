//! Persistent automation-token cache keyed by (workspace, principal).
//!
//! A cache hit means zero network traffic: the stored token is returned as
//! long as it is valid for at least one more day. Anything closer to expiry
//! than that buffer is treated as already stale, so a token can never expire
//! mid-crawl on a job admitted just before the deadline.

use crate::auth::protocol::{AuthError, Credentials, LoginFlow};
use crate::store::{composite_key, DocStore};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

const COLLECTION: &str = "automation_tokens";
/// Minimum remaining validity for a cached token to be served.
const VALIDITY_BUFFER_DAYS: i64 = 1;
/// Horizon recorded for `"no_exp"` tokens.
const NO_EXP_HORIZON_DAYS: i64 = 365;
/// Horizon recorded for every other expiration period.
const DEFAULT_HORIZON_DAYS: i64 = 30;

/// Process-wide bearer for ad-hoc API calls (profile status, stop-all).
///
/// Deliberately last-writer-wins: when several principals authenticate in one
/// process, the most recent login owns this slot. Flows that need a specific
/// principal's bearer must thread the [`LoginSession`] through explicitly
/// instead of reading this.
///
/// [`LoginSession`]: crate::auth::protocol::LoginSession
static CURRENT_BEARER: RwLock<Option<String>> = RwLock::new(None);

pub fn current_bearer() -> Option<String> {
    match CURRENT_BEARER.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub(crate) fn set_current_bearer(token: &str) {
    match CURRENT_BEARER.write() {
        Ok(mut guard) => *guard = Some(token.to_string()),
        Err(poisoned) => *poisoned.into_inner() = Some(token.to_string()),
    }
}

/// Serializes every test that writes the process bearer.
#[cfg(test)]
pub(crate) static BEARER_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[derive(Debug, Clone)]
pub struct AcquiredToken {
    pub token: String,
    /// True when the token came from the store without any network traffic.
    pub from_cache: bool,
}

pub struct TokenCache {
    store: Arc<DocStore>,
    flow: Arc<dyn LoginFlow>,
}

impl TokenCache {
    pub fn new(store: Arc<DocStore>, flow: Arc<dyn LoginFlow>) -> Self {
        Self { store, flow }
    }

    /// Produce a usable automation token for `creds`.
    ///
    /// With `prefer_cache`, a stored token still inside its validity buffer is
    /// returned directly. Otherwise (or on a miss) the full login ceremony
    /// runs, the fresh token is stored under the composite key, and the
    /// process bearer slot is updated.
    ///
    /// Two tasks missing the cache at the same instant will both run the
    /// ceremony; both logins succeed and the second write wins. That is
    /// wasteful, not incorrect, and not worth a cross-task lock here.
    pub async fn acquire(
        &self,
        creds: &Credentials,
        expiration_period: &str,
        prefer_cache: bool,
    ) -> Result<AcquiredToken, AuthError> {
        let key = composite_key(&creds.workspace_id, &creds.workspace_email);
        self.purge_expired();

        if prefer_cache {
            if let Some(token) = self.cached_valid(&key) {
                info!("token_cache: hit for {}", key);
                return Ok(AcquiredToken {
                    token,
                    from_cache: true,
                });
            }
            info!("token_cache: miss for {} — running login", key);
        }

        let session = self.flow.login(creds, expiration_period).await?;
        set_current_bearer(&session.bearer_token);

        let horizon = if expiration_period == "no_exp" {
            NO_EXP_HORIZON_DAYS
        } else {
            DEFAULT_HORIZON_DAYS
        };
        let now = Utc::now();
        self.store.upsert(
            COLLECTION,
            &key,
            json!({
                "token": session.automation_token,
                "expiration_period": session.expiration_period,
                "created_at": now.to_rfc3339(),
                "expires_at": (now + Duration::days(horizon)).to_rfc3339(),
            }),
        );
        info!("token_cache: stored fresh token for {} ({}d horizon)", key, horizon);

        Ok(AcquiredToken {
            token: session.automation_token,
            from_cache: false,
        })
    }

    /// Drop the stored token for `creds`. Called when the service answered
    /// 401 to a token the cache vouched for.
    pub fn invalidate(&self, creds: &Credentials) {
        let key = composite_key(&creds.workspace_id, &creds.workspace_email);
        if self.store.remove(COLLECTION, &key) {
            warn!("token_cache: invalidated token for {}", key);
        }
    }

    fn cached_valid(&self, key: &str) -> Option<String> {
        let doc = self.store.get(COLLECTION, key)?;
        let expires_at = doc
            .get("expires_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?;
        let deadline = Utc::now() + Duration::days(VALIDITY_BUFFER_DAYS);
        if expires_at.with_timezone(&Utc) <= deadline {
            return None;
        }
        doc.get("token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Lazy expiry sweep — runs on every acquire, there is no timer.
    fn purge_expired(&self) {
        let deadline = Utc::now() + Duration::days(VALIDITY_BUFFER_DAYS);
        let removed = self.store.remove_where(COLLECTION, |doc| {
            match doc
                .get("expires_at")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                Some(expires) => expires.with_timezone(&Utc) <= deadline,
                // Unparseable records are stale by definition.
                None => true,
            }
        });
        if removed > 0 {
            info!("token_cache: purged {} expired record(s)", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::protocol::LoginSession;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeFlow {
        logins: AtomicUsize,
        bearer: String,
    }

    impl FakeFlow {
        fn new(bearer: &str) -> Arc<Self> {
            Arc::new(Self {
                logins: AtomicUsize::new(0),
                bearer: bearer.to_string(),
            })
        }
    }

    #[async_trait]
    impl LoginFlow for FakeFlow {
        async fn login(
            &self,
            _creds: &Credentials,
            expiration_period: &str,
        ) -> Result<LoginSession, AuthError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(LoginSession {
                bearer_token: self.bearer.clone(),
                automation_token: format!("auto-{}", n),
                refresh_token: None,
                expiration_period: expiration_period.to_string(),
            })
        }
    }

    fn creds() -> Credentials {
        Credentials {
            email: "ops@example.com".into(),
            password: "pw".into(),
            secret_2fa: None,
            workspace_id: "ws-1".into(),
            workspace_email: "ops@example.com".into(),
        }
    }

    fn cache(flow: Arc<FakeFlow>) -> (tempfile::TempDir, TokenCache) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocStore::open(dir.path().join("store")));
        (dir, TokenCache::new(store, flow))
    }

    #[tokio::test]
    async fn cache_hit_performs_zero_logins() {
        let _guard = BEARER_GUARD.lock().unwrap();
        let flow = FakeFlow::new("bearer-a");
        let (_dir, cache) = cache(flow.clone());

        let first = cache.acquire(&creds(), "no_exp", true).await.unwrap();
        assert!(!first.from_cache);
        let second = cache.acquire(&creds(), "no_exp", true).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.token, first.token);
        assert_eq!(flow.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prefer_cache_false_always_runs_the_ceremony() {
        let _guard = BEARER_GUARD.lock().unwrap();
        let flow = FakeFlow::new("bearer-b");
        let (_dir, cache) = cache(flow.clone());

        cache.acquire(&creds(), "no_exp", true).await.unwrap();
        let forced = cache.acquire(&creds(), "no_exp", false).await.unwrap();
        assert!(!forced.from_cache);
        assert_eq!(flow.logins.load(Ordering::SeqCst), 2);
        // The refresh replaced the record; it never duplicates the key.
        assert_eq!(cache.store.len(COLLECTION), 1);
    }

    #[tokio::test]
    async fn token_inside_validity_buffer_counts_as_stale() {
        let _guard = BEARER_GUARD.lock().unwrap();
        let flow = FakeFlow::new("bearer-c");
        let (_dir, cache) = cache(flow.clone());
        let key = composite_key("ws-1", "ops@example.com");

        // Valid for 12 more hours — inside the 1-day buffer.
        cache.store.upsert(
            COLLECTION,
            &key,
            json!({
                "token": "nearly-dead",
                "expires_at": (Utc::now() + Duration::hours(12)).to_rfc3339(),
            }),
        );

        let got = cache.acquire(&creds(), "no_exp", true).await.unwrap();
        assert!(!got.from_cache);
        assert_ne!(got.token, "nearly-dead");
        assert_eq!(flow.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_next_acquire_to_login() {
        let _guard = BEARER_GUARD.lock().unwrap();
        let flow = FakeFlow::new("bearer-d");
        let (_dir, cache) = cache(flow.clone());

        cache.acquire(&creds(), "no_exp", true).await.unwrap();
        cache.invalidate(&creds());
        let got = cache.acquire(&creds(), "no_exp", true).await.unwrap();
        assert!(!got.from_cache);
        assert_eq!(flow.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn login_updates_process_bearer() {
        let _guard = BEARER_GUARD.lock().unwrap();
        let flow = FakeFlow::new("bearer-e");
        let (_dir, cache) = cache(flow);
        cache.acquire(&creds(), "no_exp", false).await.unwrap();
        assert_eq!(current_bearer().as_deref(), Some("bearer-e"));
    }

    #[tokio::test]
    async fn unparseable_records_are_purged() {
        let _guard = BEARER_GUARD.lock().unwrap();
        let flow = FakeFlow::new("bearer-f");
        let (_dir, cache) = cache(flow);
        cache
            .store
            .upsert(COLLECTION, "junk", json!({"token": "x", "expires_at": "not-a-date"}));
        cache.acquire(&creds(), "no_exp", true).await.unwrap();
        assert!(cache.store.get(COLLECTION, "junk").is_none());
    }
}
