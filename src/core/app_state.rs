use crate::auth::{AuthProtocolClient, Credentials, TokenCache};
use crate::core::config::{self, PilotConfig};
use crate::crawl::Orchestrator;
use crate::service::launcher::{QuickProfileLauncher, SessionLauncher};
use crate::service::resilient::{CallPolicy, ResilientClient};
use crate::session::SessionRegistry;
use crate::store::DocStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub http_client: reqwest::Client,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<DocStore>,
    pub tokens: Arc<TokenCache>,
    pub launcher: Arc<dyn SessionLauncher>,
    pub orchestrator: Arc<Orchestrator>,
    /// File-based config loaded from `crawlpilot.json` (env-var fallback for all fields).
    pub pilot_config: Arc<PilotConfig>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("sessions", &self.registry.ids().len())
            .finish()
    }
}

impl AppState {
    pub fn new(http_client: reqwest::Client) -> anyhow::Result<Self> {
        let pilot_config = Arc::new(config::load_pilot_config());
        let store = Arc::new(DocStore::open(config::data_dir().join("store")));
        let registry = Arc::new(SessionRegistry::new());

        let service_client = Arc::new(ResilientClient::new(http_client.clone()));
        let flow = Arc::new(AuthProtocolClient::new(
            service_client,
            pilot_config.resolve_service_base_url(),
            CallPolicy::default(),
        ));
        let tokens = Arc::new(TokenCache::new(store.clone(), flow));

        let launcher: Arc<dyn SessionLauncher> =
            Arc::new(QuickProfileLauncher::from_config(&pilot_config)?);

        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            tokens.clone(),
            launcher.clone(),
            Credentials::from_config(&pilot_config.credentials),
            http_client.clone(),
            pilot_config.resolve_reset_callback_url(),
            pilot_config.resolve_recovery_page(),
            pilot_config.resolve_recovery_max_attempts(),
            pilot_config.resolve_smart_login(),
        ));

        Ok(Self {
            http_client,
            registry,
            store,
            tokens,
            launcher,
            orchestrator,
            pilot_config,
        })
    }
}
