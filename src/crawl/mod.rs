//! The crawl engine: page driving, block recovery, the parameterized
//! traversal, and the orchestrator that owns a run end to end.

pub mod driver;
pub mod orchestrator;
pub mod recovery;
pub mod traversal;

pub use driver::{CrawlError, PageDriver};
pub use orchestrator::{Orchestrator, StartError};
pub use traversal::{TraversalPlan, TraversalShape};
