//! Process-wide session map, shared by request handlers and crawl tasks.
//!
//! The registry lock covers only map access; per-session state has its own
//! lock inside [`Session`], so one long run never blocks another session's
//! status polls.

use crate::session::state::Session;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        match self.sessions.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fetch the session for `id`, creating an idle one on first access.
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        let mut map = self.lock();
        map.entry(id.to_string())
            .or_insert_with(|| {
                info!("registry: new session '{}'", id);
                Session::new(id)
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    /// Replace the session wholesale. A task still running against the old
    /// object keeps its own `Arc` and finishes against it; clients see the
    /// fresh one immediately.
    pub fn reset(&self, id: &str) -> Arc<Session> {
        let fresh = Session::new(id);
        self.lock().insert(id.to_string(), fresh.clone());
        info!("registry: session '{}' reset", id);
        fresh
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}
