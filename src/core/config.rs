use std::path::PathBuf;

// ---------------------------------------------------------------------------
// PilotConfig — file-based config loader (crawlpilot.json) with env-var fallback
// ---------------------------------------------------------------------------

/// Credentials sub-config (mirrors the `credentials` key in crawlpilot.json).
///
/// Every field falls back to an env var so the file can stay secret-free.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct CredentialsConfig {
    /// Principal email for the automation-service sign-in.
    pub email: Option<String>,
    /// Plain password; hashed before it leaves the process.
    pub password: Option<String>,
    /// Base32 TOTP secret for the optional second-factor step.
    pub secret_2fa: Option<String>,
    /// Workspace (tenant) to switch into before issuing automation tokens.
    pub workspace_id: Option<String>,
    /// Email the workspace is registered under, when it differs from `email`.
    pub workspace_email: Option<String>,
}

impl CredentialsConfig {
    pub fn resolve_email(&self) -> String {
        self.email
            .clone()
            .or_else(|| std::env::var("MLX_EMAIL").ok())
            .unwrap_or_default()
    }

    pub fn resolve_password(&self) -> String {
        self.password
            .clone()
            .or_else(|| std::env::var("MLX_PASSWORD").ok())
            .unwrap_or_default()
    }

    pub fn resolve_secret_2fa(&self) -> Option<String> {
        self.secret_2fa
            .clone()
            .or_else(|| std::env::var("MLX_SECRET_2FA").ok())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn resolve_workspace_id(&self) -> String {
        self.workspace_id
            .clone()
            .or_else(|| std::env::var("MLX_WORKSPACE_ID").ok())
            .unwrap_or_default()
    }

    /// Principal email used for the workspace switch; falls back to the
    /// sign-in email when the workspace is owned by the same account.
    pub fn resolve_workspace_email(&self) -> String {
        self.workspace_email
            .clone()
            .or_else(|| std::env::var("MLX_WORKSPACE_EMAIL").ok())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.resolve_email())
    }
}

/// Top-level config loaded from `crawlpilot.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct PilotConfig {
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Automation-service API base, e.g. `https://api.multilogin.com`.
    pub service_base_url: Option<String>,
    /// Local launcher base (v1 API) — status / stop endpoints.
    pub launcher_url: Option<String>,
    /// Local launcher base (v2 API) — quick-profile open endpoint.
    pub launcher_v2_url: Option<String>,

    /// Neutral page the recovery maneuver navigates to after a block.
    pub recovery_page: Option<String>,
    /// Marker phrases whose presence on a page means "challenge detected".
    pub block_markers: Option<Vec<String>>,
    /// Recovery attempts per call site before surfacing a blocked error.
    pub recovery_max_attempts: Option<u32>,

    /// Serve cached automation tokens while they are still valid ("smart
    /// login"). Off forces the full sign-in ceremony on every run.
    pub smart_login: Option<bool>,
    /// Seconds to wait for the launcher liveness probe before giving up.
    pub readiness_wait_secs: Option<u64>,
    /// Best-effort callback invoked after every terminal session transition.
    pub reset_callback_url: Option<String>,
}

impl PilotConfig {
    /// Service API base: JSON field → `MLX_BASE` env var → production default.
    pub fn resolve_service_base_url(&self) -> String {
        resolve(&self.service_base_url, "MLX_BASE", "https://api.multilogin.com")
    }

    pub fn resolve_launcher_url(&self) -> String {
        resolve(
            &self.launcher_url,
            "MLX_LAUNCHER",
            "https://127.0.0.1:45001/api/v1",
        )
    }

    pub fn resolve_launcher_v2_url(&self) -> String {
        resolve(
            &self.launcher_v2_url,
            "MLX_LAUNCHER_V2",
            "https://127.0.0.1:45001/api/v2",
        )
    }

    /// Ordered quick-profile endpoints. The launcher binds its port on the
    /// IPv6 loopback first, so that address family is preferred; the
    /// configured v2 URL is kept as the final fallback.
    pub fn quick_profile_endpoints(&self) -> Vec<String> {
        vec![
            "https://[::1]:45001/api/v2/profile/quick".to_string(),
            "https://127.0.0.1:45001/api/v2/profile/quick".to_string(),
            format!("{}/profile/quick", self.resolve_launcher_v2_url()),
        ]
    }

    pub fn resolve_recovery_page(&self) -> String {
        resolve(
            &self.recovery_page,
            "CRAWLPILOT_RECOVERY_PAGE",
            "https://www.google.com",
        )
    }

    /// Challenge-page marker phrases. The defaults match the interstitial
    /// wording seen on the target site's hold-to-verify page.
    pub fn resolve_block_markers(&self) -> Vec<String> {
        if let Some(m) = &self.block_markers {
            if !m.is_empty() {
                return m.clone();
            }
        }
        vec![
            "Activate and hold".to_string(),
            "you\u{2019}re human".to_string(),
        ]
    }

    pub fn resolve_recovery_max_attempts(&self) -> u32 {
        if let Some(n) = self.recovery_max_attempts {
            return n.max(1);
        }
        std::env::var("CRAWLPILOT_RECOVERY_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3)
    }

    pub fn resolve_smart_login(&self) -> bool {
        if let Some(v) = self.smart_login {
            return v;
        }
        match std::env::var("CRAWLPILOT_SMART_LOGIN") {
            Ok(v) => !matches!(v.trim(), "false" | "0" | "off"),
            Err(_) => true,
        }
    }

    pub fn resolve_readiness_wait_secs(&self) -> u64 {
        if let Some(n) = self.readiness_wait_secs {
            return n;
        }
        std::env::var("CRAWLPILOT_READINESS_WAIT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10)
    }

    pub fn resolve_reset_callback_url(&self) -> String {
        resolve(
            &self.reset_callback_url,
            "CRAWLPILOT_RESET_CALLBACK",
            "http://127.0.0.1:5000/reset-session",
        )
    }
}

fn resolve(field: &Option<String>, env_key: &str, default: &str) -> String {
    if let Some(v) = field {
        if !v.trim().is_empty() {
            return v.clone();
        }
    }
    std::env::var(env_key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Directory for the document store. `CRAWLPILOT_DATA_DIR` overrides the
/// default `~/.crawlpilot` so tests and multi-instance setups can isolate
/// their collections.
pub fn data_dir() -> PathBuf {
    if let Ok(p) = std::env::var("CRAWLPILOT_DATA_DIR") {
        if !p.trim().is_empty() {
            return PathBuf::from(p);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".crawlpilot")
}

/// Load `crawlpilot.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `CRAWLPILOT_CONFIG` env var path
/// 2. `./crawlpilot.json` (process cwd)
/// 3. `../crawlpilot.json` (one level up)
///
/// Missing file → `PilotConfig::default()` (silent, all env-var fallbacks apply).
/// Parse error → log a warning, return `PilotConfig::default()`.
pub fn load_pilot_config() -> PilotConfig {
    let candidates: Vec<PathBuf> = {
        let mut v = vec![
            PathBuf::from("crawlpilot.json"),
            PathBuf::from("../crawlpilot.json"),
        ];
        if let Ok(env_path) = std::env::var("CRAWLPILOT_CONFIG") {
            v.insert(0, PathBuf::from(env_path));
        }
        v
    };

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<PilotConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("crawlpilot.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "crawlpilot.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return PilotConfig::default();
                }
            },
            Err(_) => continue, // file not found at this path — try next
        }
    }

    PilotConfig::default()
}
