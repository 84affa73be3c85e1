//! Bounded recovery around navigate-and-extract steps.
//!
//! A detected challenge page triggers a recovery cycle: stall (bounded idle
//! wait), navigate to a neutral page, retry the action. The budget is a
//! decrementing counter per call site — once spent, the caller gets a
//! classified [`CrawlError::Blocked`], never an unbounded loop.

use crate::crawl::driver::{CrawlError, PageDriver};
use std::future::Future;
use tracing::{info, warn};

/// Run `action`, recovering from [`CrawlError::BlockDetected`] at most
/// `max_attempts` times. Every other outcome passes through untouched.
pub async fn with_block_recovery<T, F, Fut>(
    driver: &dyn PageDriver,
    recovery_page: &str,
    max_attempts: u32,
    mut action: F,
) -> Result<T, CrawlError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CrawlError>>,
{
    let mut cycles = 0u32;
    loop {
        match action().await {
            Err(CrawlError::BlockDetected { url }) if cycles < max_attempts => {
                cycles += 1;
                warn!(
                    "recovery: block at {} — cycle {}/{}",
                    url, cycles, max_attempts
                );
                driver.stall().await;
                // The neutral page is best-effort; a failure here only means
                // the next action attempt starts from wherever we are.
                if let Err(e) = driver.navigate_unchecked(recovery_page).await {
                    warn!("recovery: neutral navigation failed (ignored): {}", e);
                }
            }
            Err(CrawlError::BlockDetected { url }) => {
                warn!("recovery: budget spent at {} after {} cycle(s)", url, cycles);
                return Err(CrawlError::Blocked { attempts: cycles });
            }
            Ok(value) => {
                if cycles > 0 {
                    info!("recovery: succeeded after {} cycle(s)", cycles);
                }
                return Ok(value);
            }
            Err(other) => return Err(other),
        }
    }
}
