//! crawlpilot — session orchestration for authenticated browser-automation
//! crawls: the resilient token cache, the quick-profile launcher, the crawl
//! state machine with cooperative cancellation, and the short-code generator.

pub mod auth;
pub mod core;
pub mod crawl;
pub mod idgen;
pub mod service;
pub mod session;
pub mod store;

pub use crate::core::AppState;
