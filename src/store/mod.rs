//! Document store — named JSON collections with atomic persistence.
//!
//! Each collection is one pretty-printed JSON object
//! (`{data_dir}/store/{collection}.json`) mapping a string key to an
//! arbitrary document. No schema is enforced beyond the operations here:
//! point lookup, upsert by key, insert-if-absent, and predicate purge.
//!
//! ## Thread safety
//!
//! One process-wide mutex guards the in-memory map, so a check-then-insert
//! (`insert_if_absent`) is atomic with respect to every other caller — the
//! property the identifier generator depends on. Writes go to a temp file
//! first, then rename, so concurrent processes never observe a partial file.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub struct DocStore {
    dir: PathBuf,
    collections: Mutex<HashMap<String, HashMap<String, Value>>>,
}

/// Build the composite key for records scoped to (workspace, principal).
pub fn composite_key(workspace_id: &str, email: &str) -> String {
    format!("{}|{}", workspace_id, email)
}

impl DocStore {
    /// Open a store rooted at `dir` (created on first write). Collections are
    /// loaded lazily on first touch.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            collections: Mutex::new(HashMap::new()),
        }
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", collection))
    }

    fn load_collection(path: &Path) -> HashMap<String, Value> {
        let content = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => return HashMap::new(), // not created yet
        };
        match serde_json::from_str(&content) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "store: failed to parse {}: {} — starting empty",
                    path.display(),
                    e
                );
                HashMap::new()
            }
        }
    }

    /// Persist one collection atomically (temp file + rename). Failures are
    /// logged, not surfaced: the in-memory map stays authoritative for this
    /// process and the next successful write repairs the file.
    fn save_collection(&self, collection: &str, map: &HashMap<String, Value>) {
        let path = self.collection_path(collection);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("store: failed to create {}: {}", parent.display(), e);
                return;
            }
        }
        let json = match serde_json::to_string_pretty(map) {
            Ok(s) => s,
            Err(e) => {
                warn!("store: serialization failed for '{}': {}", collection, e);
                return;
            }
        };
        let tmp = path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, &json) {
            warn!("store: failed to write {}: {}", tmp.display(), e);
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, &path) {
            warn!(
                "store: failed to rename {} → {}: {}",
                tmp.display(),
                path.display(),
                e
            );
        }
    }

    fn with_collection<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut HashMap<String, Value>) -> (R, bool),
    ) -> R {
        // A mutator that panicked under the lock must not take the store
        // down with it; the on-disk state is still coherent.
        let mut guard = match self.collections.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let path = self.collection_path(collection);
        let map = guard
            .entry(collection.to_string())
            .or_insert_with(|| Self::load_collection(&path));
        let (result, dirty) = f(map);
        if dirty {
            self.save_collection(collection, map);
        }
        result
    }

    /// Point lookup by key.
    pub fn get(&self, collection: &str, key: &str) -> Option<Value> {
        self.with_collection(collection, |map| (map.get(key).cloned(), false))
    }

    /// Insert or replace the document under `key`.
    pub fn upsert(&self, collection: &str, key: &str, doc: Value) {
        self.with_collection(collection, |map| {
            map.insert(key.to_string(), doc);
            ((), true)
        })
    }

    /// Insert only when `key` is absent. Returns `true` on insertion.
    ///
    /// The existence check and the insert happen under one lock, so two
    /// concurrent callers drawing the same candidate cannot both win.
    pub fn insert_if_absent(&self, collection: &str, key: &str, doc: Value) -> bool {
        self.with_collection(collection, |map| {
            if map.contains_key(key) {
                (false, false)
            } else {
                map.insert(key.to_string(), doc);
                (true, true)
            }
        })
    }

    /// Mutate the document under `key` in place. Returns `false` (and writes
    /// nothing) when the key is unknown.
    pub fn update(&self, collection: &str, key: &str, f: impl FnOnce(&mut Value)) -> bool {
        self.with_collection(collection, |map| match map.get_mut(key) {
            Some(doc) => {
                f(doc);
                (true, true)
            }
            None => (false, false),
        })
    }

    /// Delete the document under `key`. Returns `true` when something was removed.
    pub fn remove(&self, collection: &str, key: &str) -> bool {
        self.with_collection(collection, |map| {
            let removed = map.remove(key).is_some();
            (removed, removed)
        })
    }

    /// Delete every document matching `pred`; returns how many were removed.
    /// Used for the lazy expiry purge — there is no timer-driven GC.
    pub fn remove_where(&self, collection: &str, pred: impl Fn(&Value) -> bool) -> usize {
        self.with_collection(collection, |map| {
            let before = map.len();
            map.retain(|_, doc| !pred(doc));
            let removed = before - map.len();
            (removed, removed > 0)
        })
    }

    /// Number of documents in a collection (test/diagnostic helper).
    pub fn len(&self, collection: &str) -> usize {
        self.with_collection(collection, |map| (map.len(), false))
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}
