//! One traversal engine, parameterized by shape.
//!
//! The crawl variants differ only in whether the entry page fans out into
//! category pages, whether items expand into per-option records, and whether
//! listing pages are walked through a page range. That is three booleans, not
//! five loop bodies — [`TraversalShape`] names the supported combinations and
//! the engine composes the stages.
//!
//! Structural rules shared by every shape: the stop flag is re-checked before
//! each unit of work (page, item, option expansion), and item-scoped
//! extraction failures append a skipped-item event and continue.

use crate::crawl::driver::{CrawlError, PageDriver};
use crate::crawl::recovery::with_block_recovery;
use crate::core::types::CrawlEvent;
use crate::session::Session;
use serde_json::json;
use tracing::{info, warn};

/// Default selectors for the three link roles. Overridable per plan so a
/// target-site change is a config edit, not a code change.
pub const CATEGORY_LINK_SELECTOR: &str = "a[data-type='category'], nav a[href*='/browse/']";
pub const ITEM_LINK_SELECTOR: &str = "a[href*='/ip/']";
pub const OPTION_LINK_SELECTOR: &str = "[data-testid='variant-tile'] a";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalShape {
    /// Listing pages → items.
    Flat,
    /// Entry page → category links → listing pages → items.
    CategoryNested,
    /// Listing pages → items → option expansion per item.
    OptionExpanded,
    /// Categories and option expansion combined.
    CategoryOptionExpanded,
    /// One un-paged entry page → items → option expansion.
    SingleOptionExpanded,
}

impl TraversalShape {
    /// Accepts the legacy `option1`..`option5` job labels alongside the
    /// descriptive names.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "option1" | "flat" => Some(Self::Flat),
            "option2" | "category" | "category_nested" => Some(Self::CategoryNested),
            "option3" | "options" | "option_expanded" => Some(Self::OptionExpanded),
            "option4" | "category_options" | "category_option_expanded" => {
                Some(Self::CategoryOptionExpanded)
            }
            "option5" | "single_options" | "single_option_expanded" => {
                Some(Self::SingleOptionExpanded)
            }
            _ => None,
        }
    }

    fn has_categories(self) -> bool {
        matches!(self, Self::CategoryNested | Self::CategoryOptionExpanded)
    }

    fn has_options(self) -> bool {
        matches!(
            self,
            Self::OptionExpanded | Self::CategoryOptionExpanded | Self::SingleOptionExpanded
        )
    }

    fn is_paged(self) -> bool {
        !matches!(self, Self::SingleOptionExpanded)
    }
}

#[derive(Debug, Clone)]
pub struct TraversalPlan {
    pub shape: TraversalShape,
    pub entry_url: String,
    /// Inclusive listing-page range (ignored for un-paged shapes).
    pub start_page: u32,
    pub end_page: u32,
    pub category_selector: String,
    pub item_selector: String,
    pub option_selector: String,
    /// Recovery parameters applied around every navigate-and-extract step.
    pub recovery_page: String,
    pub recovery_attempts: u32,
}

impl TraversalPlan {
    pub fn new(shape: TraversalShape, entry_url: impl Into<String>) -> Self {
        Self {
            shape,
            entry_url: entry_url.into(),
            start_page: 1,
            end_page: 10,
            category_selector: CATEGORY_LINK_SELECTOR.to_string(),
            item_selector: ITEM_LINK_SELECTOR.to_string(),
            option_selector: OPTION_LINK_SELECTOR.to_string(),
            recovery_page: "https://www.google.com".to_string(),
            recovery_attempts: 3,
        }
    }
}

/// Append `page=N` to a listing URL. Page 1 is the bare URL.
pub fn page_url(base: &str, page: u32) -> String {
    if page <= 1 {
        return base.to_string();
    }
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}page={}", base, sep, page)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TraversalOutcome {
    pub items_extracted: usize,
    pub items_skipped: usize,
    /// The stop flag was observed; remaining work was never attempted.
    pub stopped: bool,
}

/// Walk the plan against an open session, appending one event per item to
/// `session`. Returns early (without error) when the stop flag is observed.
///
/// Unrecoverable errors (spent recovery budget, dead connection) propagate to
/// the orchestrator, which owns the completion sequence.
pub async fn run_traversal(
    driver: &dyn PageDriver,
    plan: &TraversalPlan,
    session: &Session,
) -> Result<TraversalOutcome, CrawlError> {
    let mut outcome = TraversalOutcome::default();

    let category_urls = if plan.shape.has_categories() {
        if session.stop_requested() {
            outcome.stopped = true;
            return Ok(outcome);
        }
        let urls = with_block_recovery(
            driver,
            &plan.recovery_page,
            plan.recovery_attempts,
            || async {
                driver.navigate(&plan.entry_url).await?;
                driver.collect_links(&plan.category_selector).await
            },
        )
        .await?;
        info!(
            "traversal: {} category page(s) under {}",
            urls.len(),
            plan.entry_url
        );
        urls
    } else {
        vec![plan.entry_url.clone()]
    };

    let (first_page, last_page) = if plan.shape.is_paged() {
        (plan.start_page.max(1), plan.end_page.max(plan.start_page))
    } else {
        (1, 1)
    };

    for category in &category_urls {
        for page in first_page..=last_page {
            if session.stop_requested() {
                outcome.stopped = true;
                return Ok(outcome);
            }
            let listing = page_url(category, page);
            let item_links = with_block_recovery(
                driver,
                &plan.recovery_page,
                plan.recovery_attempts,
                || async {
                    driver.navigate(&listing).await?;
                    driver.collect_links(&plan.item_selector).await
                },
            )
            .await?;

            if item_links.is_empty() {
                // Ran past the last populated page of this category.
                info!("traversal: no items at {} — next category", listing);
                break;
            }

            for item in item_links {
                if session.stop_requested() {
                    outcome.stopped = true;
                    return Ok(outcome);
                }
                match extract_one(driver, plan, &item).await {
                    Ok(record) => {
                        outcome.items_extracted += 1;
                        session.push_event(
                            CrawlEvent::new(Some(item), "extracted").with_payload(record),
                        );
                    }
                    Err(e) if e.is_item_scoped() => {
                        outcome.items_skipped += 1;
                        warn!("traversal: skipping {}: {}", item, e);
                        session.push_event(CrawlEvent::new(
                            Some(item),
                            format!("skipped: {}", e),
                        ));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    Ok(outcome)
}

/// Navigate to one item and build its record, expanding options when the
/// shape asks for them. The whole step sits inside one recovery scope.
async fn extract_one(
    driver: &dyn PageDriver,
    plan: &TraversalPlan,
    item_url: &str,
) -> Result<serde_json::Value, CrawlError> {
    with_block_recovery(
        driver,
        &plan.recovery_page,
        plan.recovery_attempts,
        || async {
            driver.navigate(item_url).await?;
            let mut record = driver.extract_record().await?;
            if plan.shape.has_options() {
                let options = driver.collect_links(&plan.option_selector).await?;
                if let Some(obj) = record.as_object_mut() {
                    obj.insert("options".to_string(), json!(options));
                } else {
                    record = json!({ "value": record, "options": options });
                }
            }
            Ok(record)
        },
    )
    .await
}
