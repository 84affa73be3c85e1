//! Quick-profile session launcher.
//!
//! Opens a disposable browser profile through the local launcher daemon,
//! connects over CDP to the debug port the daemon hands back, and wraps the
//! session in a [`PageDriver`]. The daemon serves HTTPS with a self-signed
//! certificate on the loopback interfaces, so the HTTP client here accepts
//! invalid certs — it never talks to anything non-local except the configured
//! fallback URL.

use crate::auth::current_bearer;
use crate::core::config::PilotConfig;
use crate::crawl::driver::{CdpDriver, PageDriver};
use crate::service::resilient::{CallError, CallPolicy, ResilientClient};
use async_trait::async_trait;
use chromiumoxide::Browser;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("invalid proxy '{0}': expected host:port[:user:pass]")]
    Proxy(String),

    #[error("launcher response missing '{0}'")]
    MissingField(&'static str),

    #[error("browser connect failed: {0}")]
    Connect(String),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// One opened browser session. Dropping `browser` tears down the CDP
/// connection, so the handle lives here for the whole run.
pub struct LaunchedSession {
    pub profile_id: String,
    pub debug_port: u16,
    pub driver: Box<dyn PageDriver>,
    pub browser: Option<Browser>,
}

/// Session open/close as a seam, so orchestration tests run without the
/// launcher daemon or a browser.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn open(&self, token: &str, proxy: Option<&str>) -> Result<LaunchedSession, LaunchError>;

    /// Best-effort profile stop; errors are logged and swallowed.
    async fn close(&self, profile_id: &str);

    /// Per-profile state map from the daemon.
    async fn statuses(&self) -> Result<Value, LaunchError>;

    /// Stop every running profile. Returns the daemon's response data.
    async fn stop_all(&self) -> Result<Value, LaunchError>;
}

/// `host:port[:user:pass]`, extra segments ignored. The proxy block lives
/// under `parameters`, not at the payload root.
fn parse_proxy(spec: &str) -> Result<Value, LaunchError> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 2 {
        return Err(LaunchError::Proxy(spec.to_string()));
    }
    let port: u16 = parts[1]
        .parse()
        .map_err(|_| LaunchError::Proxy(spec.to_string()))?;
    let mut proxy = json!({
        "host": parts[0],
        "type": "http",
        "port": port,
    });
    if parts.len() >= 4 {
        proxy["username"] = json!(parts[2]);
        proxy["password"] = json!(parts[3]);
    }
    Ok(proxy)
}

/// The full quick-profile payload — complete fingerprint masking flags, the
/// shape local daemons accept.
fn full_payload(proxy: Option<&Value>) -> Value {
    let mut payload = json!({
        "browser_type": "mimic",
        "name": "QuickProfile",
        "os_type": "linux",
        "automation": "puppeteer",
        "is_headless": true,
        "browser_version": "mimic_141.3",
        "core_version": 141,
        "parameters": {
            "fingerprint": {},
            "flags": {
                "navigator_masking": "mask",
                "audio_masking": "mask",
                "localization_masking": "mask",
                "geolocation_popup": "prompt",
                "geolocation_masking": "mask",
                "timezone_masking": "mask",
                "graphics_noise": "mask",
                "graphics_masking": "mask",
                "webrtc_masking": "mask",
                "fonts_masking": "mask",
                "media_devices_masking": "mask",
                "screen_masking": "mask",
                "proxy_masking": if proxy.is_some() { "custom" } else { "disabled" },
                "ports_masking": "mask",
                "canvas_noise": "mask",
                "startup_behavior": "custom"
            },
            "storage": {
                "is_local": false,
                "save_service_worker": true
            },
            "custom_start_urls": ["https://www.google.com/"]
        },
        "quickProfilesCount": 1
    });
    if let Some(p) = proxy {
        payload["parameters"]["proxy"] = p.clone();
    }
    payload
}

/// Reduced payload for deployments whose validation rejects optional fields
/// (`fingerprint`, `name`, the profile count) it does not support.
fn minimal_payload(full: &Value) -> Value {
    let mut payload = json!({
        "browser_type": full["browser_type"],
        "os_type": full["os_type"],
        "automation": full["automation"],
        "is_headless": full["is_headless"],
        "browser_version": full["browser_version"],
        "core_version": full["core_version"],
        "parameters": {
            "flags": full["parameters"]["flags"],
            "storage": full["parameters"]["storage"],
            "custom_start_urls": full["parameters"]["custom_start_urls"],
        }
    });
    if let Some(p) = full["parameters"].get("proxy") {
        payload["parameters"]["proxy"] = p.clone();
    }
    payload
}

pub struct QuickProfileLauncher {
    resilient: Arc<ResilientClient>,
    http: reqwest::Client,
    quick_endpoints: Vec<String>,
    launcher_url: String,
    readiness_wait_secs: u64,
    block_markers: Vec<String>,
    policy: CallPolicy,
}

impl QuickProfileLauncher {
    pub fn from_config(config: &PilotConfig) -> Result<Self, LaunchError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            resilient: Arc::new(ResilientClient::new(http.clone())),
            http,
            quick_endpoints: config.quick_profile_endpoints(),
            launcher_url: config.resolve_launcher_url(),
            readiness_wait_secs: config.resolve_readiness_wait_secs(),
            block_markers: config.resolve_block_markers(),
            policy: CallPolicy::default(),
        })
    }

    /// Ask the daemon for a quick profile. Returns (profile id, debug port).
    /// Split from [`open`](SessionLauncher::open) so the HTTP exchange is
    /// testable without a browser.
    async fn request_quick_profile(
        &self,
        token: &str,
        proxy: Option<&str>,
    ) -> Result<(String, u16), LaunchError> {
        self.resilient
            .probe_ready(
                &format!("{}/profile/statuses", self.launcher_url),
                self.readiness_wait_secs,
            )
            .await?;

        let proxy_block = proxy.map(parse_proxy).transpose()?;
        let full = full_payload(proxy_block.as_ref());
        let minimal = minimal_payload(&full);
        let variants = vec![("full", full), ("minimal", minimal)];

        let env = self
            .resilient
            .post_with_fallback(&self.quick_endpoints, &variants, Some(token), &self.policy)
            .await?;

        let port = env
            .data_u64("port")
            .and_then(|p| u16::try_from(p).ok())
            .ok_or(LaunchError::MissingField("port"))?;
        let profile_id = env.data_str("id").ok_or(LaunchError::MissingField("id"))?;
        info!("launcher: profile {} up on port {}", profile_id, port);
        Ok((profile_id, port))
    }

    async fn connect_cdp(&self, port: u16) -> Result<Browser, LaunchError> {
        // The debug port speaks plain HTTP on loopback.
        let version_url = format!("http://127.0.0.1:{}/json/version", port);
        let meta: Value = self
            .http
            .get(&version_url)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| LaunchError::Connect(format!("{}: {}", version_url, e)))?;
        let ws_url = meta
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or(LaunchError::MissingField("webSocketDebuggerUrl"))?;

        let (browser, mut handler) = Browser::connect(ws_url)
            .await
            .map_err(|e| LaunchError::Connect(format!("{}: {}", ws_url, e)))?;
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("launcher: CDP handler error: {}", e);
                }
            }
        });
        Ok(browser)
    }

    /// v1 daemon call, authenticated with the process-wide bearer the most
    /// recent login installed.
    async fn daemon_get(&self, path_and_query: &str) -> Result<Value, LaunchError> {
        let url = format!("{}{}", self.launcher_url, path_and_query);
        let bearer = current_bearer();
        let env = self
            .resilient
            .get_envelope(&url, bearer.as_deref(), &self.policy)
            .await?;
        Ok(env.data.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl SessionLauncher for QuickProfileLauncher {
    async fn open(&self, token: &str, proxy: Option<&str>) -> Result<LaunchedSession, LaunchError> {
        let (profile_id, port) = self.request_quick_profile(token, proxy).await?;
        let browser = self.connect_cdp(port).await?;

        // The profile opens its start URL in the first tab; reuse it.
        let page = match browser.pages().await.ok().and_then(|mut p| {
            if p.is_empty() {
                None
            } else {
                Some(p.remove(0))
            }
        }) {
            Some(page) => page,
            None => browser
                .new_page("about:blank")
                .await
                .map_err(|e| LaunchError::Connect(format!("no usable tab: {}", e)))?,
        };

        let driver = CdpDriver::new(page, &self.block_markers)
            .map_err(|e| LaunchError::Connect(e.to_string()))?;
        Ok(LaunchedSession {
            profile_id,
            debug_port: port,
            driver: Box::new(driver),
            browser: Some(browser),
        })
    }

    async fn close(&self, profile_id: &str) {
        match self
            .daemon_get(&format!("/profile/stop/p/{}", profile_id))
            .await
        {
            Ok(_) => info!("launcher: profile {} stopped", profile_id),
            Err(e) => warn!("launcher: stop of {} failed (ignored): {}", profile_id, e),
        }
    }

    async fn statuses(&self) -> Result<Value, LaunchError> {
        let data = self.daemon_get("/profile/statuses").await?;
        Ok(data.get("states").cloned().unwrap_or(data))
    }

    async fn stop_all(&self) -> Result<Value, LaunchError> {
        self.daemon_get("/profile/stop_all?type=all").await
    }
}
