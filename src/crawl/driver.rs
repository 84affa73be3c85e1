//! Page driving over CDP, with challenge-page probing built into navigation.
//!
//! [`PageDriver`] is the seam between the crawl loop and the live browser:
//! traversal and recovery are written against the trait, the sessions the
//! launcher opens are driven by [`CdpDriver`], and tests swap in fakes.

use crate::auth::AuthError;
use crate::service::launcher::LaunchError;
use crate::service::resilient::CallError;
use aho_corasick::{AhoCorasick, MatchKind};
use async_trait::async_trait;
use chromiumoxide::Page;
use rand::distr::{Distribution, Uniform};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CrawlError {
    /// A navigation landed on an interstitial/challenge page. Recoverable —
    /// see [`with_block_recovery`](crate::crawl::recovery::with_block_recovery).
    #[error("challenge page detected at {url}")]
    BlockDetected { url: String },

    /// The recovery budget for one call site is spent.
    #[error("block recovery exhausted after {attempts} attempt(s)")]
    Blocked { attempts: u32 },

    #[error("navigation failed: {0}")]
    Navigation(String),

    /// An expected page element is absent. Callers record a skipped-item
    /// event and continue with the next item.
    #[error("expected page element missing: {0}")]
    MissingElement(String),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl CrawlError {
    /// Errors that skip one item instead of aborting the whole session.
    pub fn is_item_scoped(&self) -> bool {
        matches!(self, CrawlError::MissingElement(_))
    }
}

/// Everything the crawl loop needs from an open browser session.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate, let the page settle, then probe for challenge markers.
    /// Landing on a challenge page is [`CrawlError::BlockDetected`].
    async fn navigate(&self, url: &str) -> Result<(), CrawlError>;

    /// Navigate without the challenge probe — used for the neutral recovery
    /// page, which must never itself trip the detector.
    async fn navigate_unchecked(&self, url: &str) -> Result<(), CrawlError>;

    /// Absolute hrefs of every element matching `selector`, in DOM order,
    /// deduplicated.
    async fn collect_links(&self, selector: &str) -> Result<Vec<String>, CrawlError>;

    /// Structured record for the current page (embedded state blob when the
    /// page carries one, a minimal title/url record otherwise).
    async fn extract_record(&self) -> Result<serde_json::Value, CrawlError>;

    /// Bounded idle wait — part of the recovery maneuver.
    async fn stall(&self);

    /// Best-effort tab close; errors are swallowed.
    async fn close(&self);
}

/// Challenge-marker probe shared by the live driver and its tests.
pub fn build_marker_probe(markers: &[String]) -> Result<AhoCorasick, CrawlError> {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostFirst)
        .build(markers)
        .map_err(|e| CrawlError::Navigation(format!("bad block markers: {}", e)))
}

pub struct CdpDriver {
    page: Page,
    probe: AhoCorasick,
    /// Post-navigation settle delay before the content probe runs.
    settle_ms: u64,
    /// Inclusive-exclusive bounds for the stall maneuver.
    stall_ms: (u64, u64),
}

impl CdpDriver {
    pub fn new(page: Page, markers: &[String]) -> Result<Self, CrawlError> {
        Ok(Self {
            page,
            probe: build_marker_probe(markers)?,
            settle_ms: 1500,
            stall_ms: (1000, 3000),
        })
    }

    async fn body_text(&self) -> String {
        self.page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_str().map(|s| s.to_string()))
            .unwrap_or_default()
    }

    async fn goto(&self, url: &str) -> Result<(), CrawlError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| CrawlError::Navigation(format!("{}: {}", url, e)))?;
        tokio::time::sleep(std::time::Duration::from_millis(self.settle_ms)).await;
        Ok(())
    }
}

#[async_trait]
impl PageDriver for CdpDriver {
    async fn navigate(&self, url: &str) -> Result<(), CrawlError> {
        self.goto(url).await?;
        let text = self.body_text().await;
        if self.probe.is_match(&text) {
            warn!("driver: challenge markers present at {}", url);
            return Err(CrawlError::BlockDetected {
                url: url.to_string(),
            });
        }
        Ok(())
    }

    async fn navigate_unchecked(&self, url: &str) -> Result<(), CrawlError> {
        self.goto(url).await
    }

    async fn collect_links(&self, selector: &str) -> Result<Vec<String>, CrawlError> {
        let script = format!(
            "Array.from(document.querySelectorAll({})).map(a => a.href).filter(h => h)",
            serde_json::to_string(selector).unwrap_or_default()
        );
        let links: Vec<String> = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| CrawlError::Navigation(format!("link collection failed: {}", e)))?
            .into_value()
            .map_err(|e| CrawlError::MissingElement(format!("links not readable: {}", e)))?;

        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<String> = links.into_iter().filter(|l| seen.insert(l.clone())).collect();
        debug!("driver: {} link(s) for selector {:?}", deduped.len(), selector);
        Ok(deduped)
    }

    async fn extract_record(&self) -> Result<serde_json::Value, CrawlError> {
        // Prefer the embedded state blob SPA-style pages ship; fall back to a
        // minimal record so downstream fields stay populated either way.
        let script = r#"
            (() => {
                const el = document.querySelector('script#__NEXT_DATA__');
                if (el) { try { return JSON.parse(el.textContent); } catch (_) {} }
                if (!document.body) { return null; }
                return { title: document.title, url: location.href };
            })()
        "#;
        let value: serde_json::Value = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| CrawlError::MissingElement(format!("record script failed: {}", e)))?
            .into_value()
            .map_err(|e| CrawlError::MissingElement(format!("record not readable: {}", e)))?;

        if value.is_null() {
            return Err(CrawlError::MissingElement("page has no body".into()));
        }
        Ok(value)
    }

    async fn stall(&self) {
        let wait = {
            let mut rng = rand::rng();
            match Uniform::new(self.stall_ms.0, self.stall_ms.1) {
                Ok(dist) => dist.sample(&mut rng),
                Err(_) => self.stall_ms.0,
            }
        };
        debug!("driver: stalling {}ms", wait);
        tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
    }

    async fn close(&self) {
        if let Err(e) = self.page.clone().close().await {
            warn!("driver: tab close failed (ignored): {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_probe_is_case_insensitive() {
        let probe = build_marker_probe(&[
            "Activate and hold".to_string(),
            "you\u{2019}re human".to_string(),
        ])
        .unwrap();
        assert!(probe.is_match("Please ACTIVATE AND HOLD the button"));
        assert!(probe.is_match("confirm you\u{2019}re human to continue"));
        assert!(!probe.is_match("Rollback prices on electronics"));
    }

    #[test]
    fn empty_marker_list_matches_nothing() {
        let probe = build_marker_probe(&[]).unwrap();
        assert!(!probe.is_match("anything at all"));
    }

    #[test]
    fn missing_element_is_item_scoped() {
        assert!(CrawlError::MissingElement("x".into()).is_item_scoped());
        assert!(!CrawlError::Blocked { attempts: 3 }.is_item_scoped());
    }
}
