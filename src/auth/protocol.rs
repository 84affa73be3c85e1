//! Multi-step sign-in protocol against the automation service.
//!
//! The full ceremony is sign-in → optional second factor → workspace switch →
//! automation-token issuance. Each step goes through the resilient call layer
//! and branches on the response envelope, never on the transport status alone.
//! Credentials are passed explicitly; nothing here reads process globals.

use crate::auth::totp::{self, TotpError};
use crate::core::config::CredentialsConfig;
use crate::service::resilient::{CallError, CallPolicy, ResilientClient};
use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Envelope message that switches sign-in onto the second-factor branch.
const MSG_PROCEED_2FA: &str = "Proceed to 2FA";
/// Envelope message confirming a completed sign-in (with or without 2FA).
const MSG_SIGNIN_OK: &str = "Successful signin";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("second factor required but no 2FA secret is configured")]
    TwoFactorRequired,

    #[error(transparent)]
    Totp(#[from] TotpError),

    #[error("{step} succeeded but the response is missing '{field}'")]
    MissingField {
        step: &'static str,
        field: &'static str,
    },

    #[error("{step} failed: {message}")]
    StepFailed {
        step: &'static str,
        message: String,
    },
}

impl AuthError {
    /// True when the failure means the cached/derived credential is stale and
    /// a forced re-authentication could help.
    pub fn is_stale_credential(&self) -> bool {
        matches!(self, AuthError::Call(CallError::StaleCredential { .. }))
    }
}

/// Fully resolved sign-in material. Built from [`CredentialsConfig`] once at
/// startup and then passed by reference — call sites never re-read the
/// environment mid-flight.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub secret_2fa: Option<String>,
    pub workspace_id: String,
    pub workspace_email: String,
}

impl Credentials {
    pub fn from_config(cfg: &CredentialsConfig) -> Self {
        Self {
            email: cfg.resolve_email(),
            password: cfg.resolve_password(),
            secret_2fa: cfg.resolve_secret_2fa(),
            workspace_id: cfg.resolve_workspace_id(),
            workspace_email: cfg.resolve_workspace_email(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    // Keep secrets out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("workspace_id", &self.workspace_id)
            .field("has_2fa", &self.secret_2fa.is_some())
            .finish()
    }
}

/// Outcome of a completed login ceremony.
#[derive(Debug, Clone)]
pub struct LoginSession {
    /// Bearer for subsequent API calls — the workspace token when a switch
    /// happened, otherwise the account token.
    pub bearer_token: String,
    /// Long-lived token handed to the local launcher.
    pub automation_token: String,
    pub refresh_token: Option<String>,
    /// Expiry policy the automation token was issued under (`"no_exp"` or a
    /// concrete period).
    pub expiration_period: String,
}

/// The login ceremony as a seam, so session orchestration can be tested
/// without a live service.
#[async_trait]
pub trait LoginFlow: Send + Sync {
    async fn login(
        &self,
        creds: &Credentials,
        expiration_period: &str,
    ) -> Result<LoginSession, AuthError>;
}

pub struct AuthProtocolClient {
    resilient: Arc<ResilientClient>,
    base_url: String,
    policy: CallPolicy,
}

/// Lowercase hex MD5 — the wire format the sign-in endpoint expects for the
/// password field.
fn md5_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    digest.iter().fold(String::with_capacity(32), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    })
}

struct SigninStep {
    token: String,
    refresh_token: Option<String>,
    needs_2fa: bool,
}

impl AuthProtocolClient {
    pub fn new(resilient: Arc<ResilientClient>, base_url: String, policy: CallPolicy) -> Self {
        Self {
            resilient,
            base_url,
            policy,
        }
    }

    async fn signin(&self, creds: &Credentials) -> Result<SigninStep, AuthError> {
        let url = format!("{}/user/signin", self.base_url);
        let payload = json!({
            "email": creds.email,
            "password": md5_hex(&creds.password),
        });
        let env = self
            .resilient
            .post_envelope(&url, &payload, None, &self.policy)
            .await?;

        let needs_2fa = env.status.message == MSG_PROCEED_2FA;
        if !needs_2fa && env.status.message != MSG_SIGNIN_OK {
            return Err(AuthError::StepFailed {
                step: "signin",
                message: env.status.message,
            });
        }
        let token = env.data_str("token").ok_or(AuthError::MissingField {
            step: "signin",
            field: "token",
        })?;
        Ok(SigninStep {
            token,
            refresh_token: env.data_str("refresh_token"),
            needs_2fa,
        })
    }

    /// Exchange the temporary sign-in token plus the current TOTP code for a
    /// real session. Only the current 30-second step is tried; a failed
    /// verification surfaces as an error rather than being retried across
    /// adjacent windows.
    async fn verify_2fa(
        &self,
        creds: &Credentials,
        temp_token: &str,
    ) -> Result<SigninStep, AuthError> {
        let secret = creds
            .secret_2fa
            .as_deref()
            .ok_or(AuthError::TwoFactorRequired)?;
        let code = totp::current_code(secret)?;

        let url = format!("{}/user/verify_2fa_otp", self.base_url);
        let payload = json!({
            "temp_token": temp_token,
            "totp_code": code,
            "is_backup": false,
        });
        let env = self
            .resilient
            .post_envelope(&url, &payload, None, &self.policy)
            .await?;

        if env.status.message != MSG_SIGNIN_OK {
            return Err(AuthError::StepFailed {
                step: "verify_2fa",
                message: env.status.message,
            });
        }
        let token = env.data_str("token").ok_or(AuthError::MissingField {
            step: "verify_2fa",
            field: "token",
        })?;
        Ok(SigninStep {
            token,
            refresh_token: env.data_str("refresh_token"),
            needs_2fa: false,
        })
    }

    /// Rotate the session into the target workspace via the refresh token.
    /// Returns the workspace-scoped bearer.
    async fn switch_workspace(
        &self,
        creds: &Credentials,
        auth_token: &str,
        refresh_token: &str,
    ) -> Result<String, AuthError> {
        let url = format!("{}/user/refresh_token", self.base_url);
        let payload = json!({
            "email": creds.workspace_email,
            "refresh_token": refresh_token,
            "workspace_id": creds.workspace_id,
        });
        let env = self
            .resilient
            .post_envelope(&url, &payload, Some(auth_token), &self.policy)
            .await?;

        env.data_str("token").ok_or(AuthError::MissingField {
            step: "switch_workspace",
            field: "token",
        })
    }

    async fn automation_token(
        &self,
        bearer: &str,
        expiration_period: &str,
    ) -> Result<String, AuthError> {
        let url = format!(
            "{}/workspace/automation_token?expiration_period={}",
            self.base_url, expiration_period
        );
        let env = self
            .resilient
            .get_envelope(&url, Some(bearer), &self.policy)
            .await?;

        env.data_str("token").ok_or(AuthError::MissingField {
            step: "automation_token",
            field: "token",
        })
    }
}

#[async_trait]
impl LoginFlow for AuthProtocolClient {
    async fn login(
        &self,
        creds: &Credentials,
        expiration_period: &str,
    ) -> Result<LoginSession, AuthError> {
        let mut step = self.signin(creds).await?;
        if step.needs_2fa {
            info!("auth: sign-in requires second factor for {}", creds.email);
            step = self.verify_2fa(creds, &step.token).await?;
        }
        info!("auth: signed in as {}", creds.email);

        let bearer = if creds.workspace_id.is_empty() {
            step.token.clone()
        } else {
            let refresh = step.refresh_token.as_deref().ok_or(AuthError::MissingField {
                step: "signin",
                field: "refresh_token",
            })?;
            let ws = self.switch_workspace(creds, &step.token, refresh).await?;
            info!("auth: switched to workspace {}", creds.workspace_id);
            ws
        };

        let automation_token = self.automation_token(&bearer, expiration_period).await?;
        info!("auth: automation token issued ({})", expiration_period);

        Ok(LoginSession {
            bearer_token: bearer,
            automation_token,
            refresh_token: step.refresh_token,
            expiration_period: expiration_period.to_string(),
        })
    }
}
