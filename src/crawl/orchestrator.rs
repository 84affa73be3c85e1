//! The owner of one crawl run: admission, token acquisition, session open
//! (with the single forced re-auth a 401 buys), the traversal, and the
//! completion sequence every exit path funnels through.
//!
//! The spawned task owns its session exclusively until a terminal phase. A
//! separate watcher task observes the join handle so that even a panic leaves
//! the session in a terminal phase with its browser profile released.

use crate::auth::{Credentials, TokenCache};
use crate::core::types::{CrawlEvent, CrawlRequest};
use crate::crawl::driver::CrawlError;
use crate::crawl::traversal::{run_traversal, TraversalPlan, TraversalShape};
use crate::service::launcher::{LaunchError, LaunchedSession, SessionLauncher};
use crate::service::resilient::CallError;
use crate::session::{Session, SessionRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum StartError {
    #[error("session '{0}' is already running")]
    Conflict(String),

    #[error("unknown crawl option '{0}'")]
    UnknownOption(String),
}

pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
    tokens: Arc<TokenCache>,
    launcher: Arc<dyn SessionLauncher>,
    credentials: Credentials,
    http: reqwest::Client,
    reset_callback_url: String,
    recovery_page: String,
    recovery_attempts: u32,
    /// Smart login: serve cached automation tokens while valid. Off means
    /// every run pays for the full sign-in ceremony.
    prefer_cached_token: bool,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        tokens: Arc<TokenCache>,
        launcher: Arc<dyn SessionLauncher>,
        credentials: Credentials,
        http: reqwest::Client,
        reset_callback_url: String,
        recovery_page: String,
        recovery_attempts: u32,
        prefer_cached_token: bool,
    ) -> Self {
        Self {
            registry,
            tokens,
            launcher,
            credentials,
            http,
            reset_callback_url,
            recovery_page,
            recovery_attempts,
            prefer_cached_token,
        }
    }

    /// Admit and launch a crawl. Rejects synchronously — with no state
    /// mutation — when the session is already running. On accept the session
    /// is `Running` with a fresh event log before this returns.
    pub fn start(self: &Arc<Self>, session_id: &str, request: CrawlRequest) -> Result<(), StartError> {
        let shape = TraversalShape::parse(&request.option)
            .ok_or_else(|| StartError::UnknownOption(request.option.clone()))?;

        let session = self.registry.get_or_create(session_id);
        if !session.try_begin_run() {
            info!("orchestrator: start rejected, '{}' already running", session_id);
            return Err(StartError::Conflict(session_id.to_string()));
        }
        info!(
            "orchestrator: session '{}' starting ({:?}, {})",
            session_id, shape, request.department
        );

        let this = self.clone();
        let owned = session.clone();
        let handle = tokio::spawn(async move {
            this.run_session(owned, request, shape).await;
        });

        let this = self.clone();
        tokio::spawn(async move {
            this.watch(handle, session).await;
        });
        Ok(())
    }

    /// Flip the cooperative stop flag. The running task observes it before
    /// its next unit of work; an in-flight network call is never preempted.
    pub fn stop(&self, session_id: &str) {
        if let Some(session) = self.registry.get(session_id) {
            session.request_stop();
            info!("orchestrator: stop requested for '{}'", session_id);
        }
    }

    async fn run_session(
        self: Arc<Self>,
        session: Arc<Session>,
        request: CrawlRequest,
        shape: TraversalShape,
    ) {
        session.push_event(CrawlEvent::new(
            Some(request.department.clone()),
            "Crawling started",
        ));

        let opened = match self.open_with_reauth(request.proxy.as_deref()).await {
            Ok(opened) => opened,
            Err(e) => {
                error!("orchestrator: '{}' failed to open a session: {}", session.id, e);
                session.push_event(CrawlEvent::new(None, format!("Session open failed: {}", e)));
                self.complete(&session, CrawlEvent::new(None, "Crawling stopped"))
                    .await;
                return;
            }
        };
        session.set_active_profile(&opened.profile_id);

        let mut plan = TraversalPlan::new(shape, request.department.clone());
        plan.start_page = request.start.unwrap_or(1);
        plan.end_page = request.end.unwrap_or(10);
        plan.recovery_page = self.recovery_page.clone();
        plan.recovery_attempts = self.recovery_attempts;

        let result = run_traversal(opened.driver.as_ref(), &plan, &session).await;

        // Tab first, then the profile via the completion sequence. The CDP
        // connection (`opened.browser`) drops with `opened`.
        opened.driver.close().await;

        let terminal = match result {
            Ok(outcome) if outcome.stopped => {
                info!(
                    "orchestrator: '{}' stopped after {} item(s)",
                    session.id, outcome.items_extracted
                );
                CrawlEvent::new(None, "Crawling stopped")
            }
            Ok(outcome) => {
                info!(
                    "orchestrator: '{}' completed, {} extracted / {} skipped",
                    session.id, outcome.items_extracted, outcome.items_skipped
                );
                CrawlEvent::new(None, "Crawling completed").with_payload(json!({
                    "extracted": outcome.items_extracted,
                    "skipped": outcome.items_skipped,
                    "collection": request.collection,
                }))
            }
            Err(e) => {
                error!("orchestrator: '{}' failed: {}", session.id, e);
                session.push_event(CrawlEvent::new(None, format!("Crawl failed: {}", e)));
                CrawlEvent::new(None, "Crawling stopped")
            }
        };
        self.complete(&session, terminal).await;
    }

    /// Acquire a token (cached when smart login is on) and open the browser
    /// session. A 401 from the open call buys exactly one forced
    /// re-authentication and one retry; a second 401 surfaces.
    async fn open_with_reauth(&self, proxy: Option<&str>) -> Result<LaunchedSession, CrawlError> {
        let acquired = self
            .tokens
            .acquire(&self.credentials, "no_exp", self.prefer_cached_token)
            .await?;
        match self.launcher.open(&acquired.token, proxy).await {
            Err(LaunchError::Call(CallError::StaleCredential { detail })) => {
                warn!("orchestrator: token rejected ({}) — re-authenticating once", detail);
                self.tokens.invalidate(&self.credentials);
                let fresh = self
                    .tokens
                    .acquire(&self.credentials, "no_exp", false)
                    .await?;
                self.launcher
                    .open(&fresh.token, proxy)
                    .await
                    .map_err(Into::into)
            }
            other => other.map_err(Into::into),
        }
    }

    /// Shared completion sequence: terminal event + phase→Stopped + stop flag
    /// cleared (inside `finalize`), profile release, reset notification.
    async fn complete(&self, session: &Session, terminal: CrawlEvent) {
        if let Some(profile_id) = session.finalize(terminal) {
            self.launcher.close(&profile_id).await;
        }
        self.notify_reset(&session.id).await;
    }

    /// Fire-and-forget callback so co-located components can drop any lock
    /// still keyed to this session. Short timeout, failures ignored.
    async fn notify_reset(&self, session_id: &str) {
        let result = self
            .http
            .post(&self.reset_callback_url)
            .timeout(Duration::from_secs(1))
            .json(&json!({ "session_id": session_id }))
            .send()
            .await;
        if let Err(e) = result {
            info!("orchestrator: reset notification skipped: {}", e);
        }
    }

    /// Panic backstop: a task that dies without running its completion
    /// sequence must not leave the session `Running`.
    async fn watch(&self, handle: tokio::task::JoinHandle<()>, session: Arc<Session>) {
        if let Err(e) = handle.await {
            if e.is_panic() && !session.phase().is_terminal() {
                error!("orchestrator: crawl task for '{}' panicked", session.id);
                if let Some(profile_id) = session.mark_failed("Crawl task panicked") {
                    self.launcher.close(&profile_id).await;
                }
                self.notify_reset(&session.id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::protocol::{AuthError, LoginFlow, LoginSession};
    use crate::core::types::SessionPhase;
    use crate::crawl::driver::PageDriver;
    use crate::store::DocStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeFlow {
        logins: AtomicUsize,
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
                bearer_token: "bearer".into(),
                automation_token: format!("token-{}", n),
                refresh_token: None,
                expiration_period: expiration_period.to_string(),
            })
        }
    }

    /// Listing pages with three items each; extraction can be slowed to hold
    /// the session in `Running` while a test pokes at it.
    struct ScriptedDriver {
        last_url: Mutex<String>,
        extract_delay: Duration,
        extracts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PageDriver for ScriptedDriver {
        async fn navigate(&self, url: &str) -> Result<(), CrawlError> {
            *self.last_url.lock().unwrap() = url.to_string();
            Ok(())
        }
        async fn navigate_unchecked(&self, url: &str) -> Result<(), CrawlError> {
            self.navigate(url).await
        }
        async fn collect_links(&self, _selector: &str) -> Result<Vec<String>, CrawlError> {
            let at = self.last_url.lock().unwrap().clone();
            Ok((1..=3).map(|n| format!("{}/item-{}", at, n)).collect())
        }
        async fn extract_record(&self) -> Result<serde_json::Value, CrawlError> {
            tokio::time::sleep(self.extract_delay).await;
            self.extracts.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "url": *self.last_url.lock().unwrap() }))
        }
        async fn stall(&self) {}
        async fn close(&self) {}
    }

    struct MockLauncher {
        opens: AtomicUsize,
        closed: Mutex<Vec<String>>,
        stale_first_open: bool,
        extract_delay: Duration,
        extracts: Arc<AtomicUsize>,
    }

    impl MockLauncher {
        fn new() -> Self {
            Self {
                opens: AtomicUsize::new(0),
                closed: Mutex::new(Vec::new()),
                stale_first_open: false,
                extract_delay: Duration::ZERO,
                extracts: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl SessionLauncher for MockLauncher {
        async fn open(
            &self,
            _token: &str,
            _proxy: Option<&str>,
        ) -> Result<LaunchedSession, LaunchError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if self.stale_first_open && n == 0 {
                return Err(LaunchError::Call(CallError::StaleCredential {
                    detail: "token expired".into(),
                }));
            }
            Ok(LaunchedSession {
                profile_id: format!("prof-{}", n),
                debug_port: 0,
                driver: Box::new(ScriptedDriver {
                    last_url: Mutex::new(String::new()),
                    extract_delay: self.extract_delay,
                    extracts: self.extracts.clone(),
                }),
                browser: None,
            })
        }
        async fn close(&self, profile_id: &str) {
            self.closed.lock().unwrap().push(profile_id.to_string());
        }
        async fn statuses(&self) -> Result<serde_json::Value, LaunchError> {
            Ok(serde_json::Value::Null)
        }
        async fn stop_all(&self) -> Result<serde_json::Value, LaunchError> {
            Ok(serde_json::Value::Null)
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

    fn build(
        launcher: Arc<MockLauncher>,
        smart_login: bool,
    ) -> (tempfile::TempDir, Arc<Orchestrator>, Arc<SessionRegistry>, Arc<FakeFlow>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocStore::open(dir.path().join("store")));
        let flow = Arc::new(FakeFlow {
            logins: AtomicUsize::new(0),
        });
        let tokens = Arc::new(TokenCache::new(store, flow.clone()));
        let registry = Arc::new(SessionRegistry::new());
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            tokens,
            launcher,
            creds(),
            reqwest::Client::new(),
            // Dead port: notification failures must be invisible.
            "http://127.0.0.1:1/reset-session".into(),
            "https://neutral.example".into(),
            3,
            smart_login,
        ));
        (dir, orchestrator, registry, flow)
    }

    fn request(end: u32) -> CrawlRequest {
        CrawlRequest {
            department: "https://s.example/browse".into(),
            option: "option1".into(),
            collection: "products".into(),
            proxy: None,
            start: Some(1),
            end: Some(end),
        }
    }

    async fn wait_terminal(session: &Session) {
        for _ in 0..500 {
            if session.phase().is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached a terminal phase");
    }

    // Every run writes the process bearer on login; the orchestrator tests
    // lock the shared guard so bearer-asserting tests elsewhere stay stable.
    fn bearer_guard() -> std::sync::MutexGuard<'static, ()> {
        crate::auth::token_cache::BEARER_GUARD.lock().unwrap()
    }

    #[tokio::test]
    async fn happy_path_event_log_shape() {
        let _guard = bearer_guard();
        let launcher = Arc::new(MockLauncher::new());
        let (_dir, orchestrator, registry, _flow) = build(launcher.clone(), true);

        orchestrator.start("c1", request(2)).unwrap();
        let session = registry.get("c1").unwrap();
        wait_terminal(&session).await;

        assert_eq!(session.phase(), SessionPhase::Stopped);
        assert!(session.active_profile().is_none());
        assert_eq!(launcher.closed.lock().unwrap().as_slice(), ["prof-0"]);

        // One start marker, 2 pages × 3 items, one terminal event — in order.
        let events = session.events();
        assert_eq!(events.len(), 8);
        assert_eq!(events[0].status, "Crawling started");
        assert!(events[1..7].iter().all(|e| e.status == "extracted"));
        assert_eq!(events[7].status, "Crawling completed");
        assert_eq!(events[7].payload.as_ref().unwrap()["extracted"], 6);
    }

    #[tokio::test]
    async fn second_start_conflicts_without_mutation() {
        let _guard = bearer_guard();
        let launcher = Arc::new(MockLauncher {
            extract_delay: Duration::from_millis(50),
            ..MockLauncher::new()
        });
        let (_dir, orchestrator, registry, _flow) = build(launcher, true);

        orchestrator.start("c1", request(2)).unwrap();
        let session = registry.get("c1").unwrap();

        let err = orchestrator.start("c1", request(2)).unwrap_err();
        assert!(matches!(err, StartError::Conflict(_)));

        orchestrator.stop("c1");
        wait_terminal(&session).await;
        assert_eq!(session.phase(), SessionPhase::Stopped);
    }

    #[tokio::test]
    async fn stop_abandons_remaining_items() {
        let _guard = bearer_guard();
        let launcher = Arc::new(MockLauncher {
            extract_delay: Duration::from_millis(30),
            ..MockLauncher::new()
        });
        let (_dir, orchestrator, registry, _flow) = build(launcher.clone(), true);

        orchestrator.start("c1", request(2)).unwrap();
        let session = registry.get("c1").unwrap();
        // Let roughly two items through, then stop.
        tokio::time::sleep(Duration::from_millis(75)).await;
        orchestrator.stop("c1");
        wait_terminal(&session).await;

        assert_eq!(session.phase(), SessionPhase::Stopped);
        let events = session.events();
        assert_eq!(events.last().unwrap().status, "Crawling stopped");
        assert!(launcher.extracts.load(Ordering::SeqCst) < 6);
        assert!(session.active_profile().is_none());
    }

    #[tokio::test]
    async fn stale_token_buys_exactly_one_reauth() {
        let _guard = bearer_guard();
        let launcher = Arc::new(MockLauncher {
            stale_first_open: true,
            ..MockLauncher::new()
        });
        let (_dir, orchestrator, registry, flow) = build(launcher.clone(), true);

        orchestrator.start("c1", request(1)).unwrap();
        let session = registry.get("c1").unwrap();
        wait_terminal(&session).await;

        // First login fills the cache, the 401 forces exactly one more.
        assert_eq!(flow.logins.load(Ordering::SeqCst), 2);
        assert_eq!(launcher.opens.load(Ordering::SeqCst), 2);
        assert_eq!(session.phase(), SessionPhase::Stopped);
        assert_eq!(session.events().last().unwrap().status, "Crawling completed");
    }

    #[tokio::test]
    async fn unknown_option_is_rejected_synchronously() {
        let launcher = Arc::new(MockLauncher::new());
        let (_dir, orchestrator, registry, _flow) = build(launcher, true);

        let mut req = request(1);
        req.option = "option9".into();
        let err = orchestrator.start("c1", req).unwrap_err();
        assert!(matches!(err, StartError::UnknownOption(_)));
        // Rejection happened before any session mutation.
        assert!(registry.get("c1").is_none());
    }

    #[tokio::test]
    async fn smart_login_off_runs_the_full_ceremony_every_time() {
        let _guard = bearer_guard();
        let launcher = Arc::new(MockLauncher::new());
        let (_dir, orchestrator, registry, flow) = build(launcher, false);

        orchestrator.start("c1", request(1)).unwrap();
        let session = registry.get("c1").unwrap();
        wait_terminal(&session).await;

        orchestrator.start("c1", request(1)).unwrap();
        wait_terminal(&session).await;

        // No cache hits: one sign-in per run.
        assert_eq!(flow.logins.load(Ordering::SeqCst), 2);
        assert_eq!(session.events().last().unwrap().status, "Crawling completed");
    }
}
