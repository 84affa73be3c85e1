//! Collision-resistant short-code generation (SKU and batch codes).
//!
//! Candidates come from the OS random source — uniqueness is the requirement,
//! not secrecy, but correlated PRNG streams across concurrent callers would
//! concentrate collisions, so a CSPRNG it is. The store's atomic
//! insert-if-absent is the existence check: two callers drawing the same
//! candidate cannot both win.

use crate::store::DocStore;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

pub const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
pub const UPPER_DIGITS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Error)]
pub enum IdGenError {
    #[error("os random source failed: {0}")]
    Rng(String),

    #[error("could not mint a unique {kind} code after the fallback budget")]
    Exhausted { kind: &'static str },
}

#[derive(Debug, Clone, Copy)]
pub struct CodeSpec {
    pub kind: &'static str,
    pub collection: &'static str,
    pub length: usize,
    pub alphabet: &'static [u8],
    pub max_attempts: u32,
}

/// Product SKU codes: 50 alphanumeric characters.
pub const SKU: CodeSpec = CodeSpec {
    kind: "sku",
    collection: "skus",
    length: 50,
    alphabet: ALNUM,
    max_attempts: 100,
};

/// Batch codes: 5 characters, uppercase and digits only.
pub const BATCH: CodeSpec = CodeSpec {
    kind: "batch",
    collection: "batches",
    length: 5,
    alphabet: UPPER_DIGITS,
    max_attempts: 50,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCode {
    pub value: String,
    /// The primary budget was exhausted and this code came from the
    /// prefix-plus-timestamp fallback path.
    pub fallback: bool,
}

fn random_code(alphabet: &[u8], length: usize) -> Result<String, IdGenError> {
    let n = alphabet.len() as u32;
    // Rejection sampling keeps the draw uniform across the alphabet.
    let limit = u32::MAX - (u32::MAX % n);
    let mut rng = OsRng;
    let mut out = String::with_capacity(length);
    while out.len() < length {
        let v = rng.try_next_u32().map_err(|e| IdGenError::Rng(e.to_string()))?;
        if v < limit {
            out.push(alphabet[(v % n) as usize] as char);
        }
    }
    Ok(out)
}

fn new_record(fallback: bool) -> serde_json::Value {
    json!({
        "used_count": 0,
        "created_at": Utc::now().to_rfc3339(),
        "last_used_at": null,
        "fallback": fallback,
    })
}

/// Mint a code per `spec`, guaranteed absent from the store before this call
/// returns it. Identifier records are never deleted, so uniqueness holds for
/// the lifetime of the store.
pub fn generate_unique(store: &DocStore, spec: &CodeSpec) -> Result<GeneratedCode, IdGenError> {
    for _ in 0..spec.max_attempts {
        let candidate = random_code(spec.alphabet, spec.length)?;
        if store.insert_if_absent(spec.collection, &candidate, new_record(false)) {
            return Ok(GeneratedCode {
                value: candidate,
                fallback: false,
            });
        }
    }

    // Pathological collision density. A short random prefix plus a millisecond
    // timestamp still gets the existence check; the record is flagged so the
    // fallback rate is observable.
    warn!(
        "idgen: {} budget of {} draws exhausted — taking the fallback path",
        spec.kind, spec.max_attempts
    );
    let prefix_len = (spec.length / 2).max(1);
    for _ in 0..spec.max_attempts {
        let prefix = random_code(spec.alphabet, prefix_len)?;
        let candidate = format!("{}{}", prefix, Utc::now().timestamp_millis());
        if store.insert_if_absent(spec.collection, &candidate, new_record(true)) {
            return Ok(GeneratedCode {
                value: candidate,
                fallback: true,
            });
        }
    }
    Err(IdGenError::Exhausted { kind: spec.kind })
}

/// Bump a code's usage count and timestamp. An unknown code is a warning,
/// never a failure — the caller's larger operation must not break on it.
pub fn mark_used(store: &DocStore, spec: &CodeSpec, value: &str, delta: u64) {
    let updated = store.update(spec.collection, value, |doc| {
        let count = doc.get("used_count").and_then(|v| v.as_u64()).unwrap_or(0);
        doc["used_count"] = json!(count + delta);
        doc["last_used_at"] = json!(Utc::now().to_rfc3339());
    });
    if !updated {
        warn!("idgen: mark_used on unknown {} '{}' — ignored", spec.kind, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn temp_store() -> (tempfile::TempDir, Arc<DocStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocStore::open(dir.path().join("store")));
        (dir, store)
    }

    #[test]
    fn codes_match_length_and_alphabet() {
        let (_dir, store) = temp_store();
        let sku = generate_unique(&store, &SKU).unwrap();
        assert_eq!(sku.value.len(), 50);
        assert!(!sku.fallback);
        assert!(sku.value.bytes().all(|b| ALNUM.contains(&b)));

        let batch = generate_unique(&store, &BATCH).unwrap();
        assert_eq!(batch.value.len(), 5);
        assert!(batch.value.bytes().all(|b| UPPER_DIGITS.contains(&b)));
    }

    #[test]
    fn concurrent_generation_yields_distinct_codes() {
        let (_dir, store) = temp_store();
        let spec = CodeSpec {
            kind: "test",
            collection: "codes",
            length: 8,
            alphabet: UPPER_DIGITS,
            max_attempts: 100,
        };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                (0..50)
                    .map(|_| generate_unique(&store, &spec).unwrap().value)
                    .collect::<Vec<_>>()
            }));
        }
        let all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let distinct: HashSet<&String> = all.iter().collect();
        assert_eq!(all.len(), 400);
        assert_eq!(distinct.len(), 400);
        assert_eq!(store.len("codes"), 400);
    }

    #[test]
    fn exhausted_primary_budget_takes_flagged_fallback() {
        let (_dir, store) = temp_store();
        // One-symbol alphabet, one-character codes: the second caller can
        // never win the primary path.
        let spec = CodeSpec {
            kind: "test",
            collection: "tiny",
            length: 1,
            alphabet: b"A",
            max_attempts: 3,
        };

        let first = generate_unique(&store, &spec).unwrap();
        assert_eq!(first.value, "A");
        assert!(!first.fallback);

        let second = generate_unique(&store, &spec).unwrap();
        assert!(second.fallback);
        assert!(second.value.starts_with('A'));
        assert!(second.value.len() > 1);
        let record = store.get("tiny", &second.value).unwrap();
        assert_eq!(record["fallback"], json!(true));
    }

    #[test]
    fn mark_used_increments_and_timestamps() {
        let (_dir, store) = temp_store();
        let code = generate_unique(&store, &BATCH).unwrap();

        mark_used(&store, &BATCH, &code.value, 1);
        mark_used(&store, &BATCH, &code.value, 2);

        let record = store.get("batches", &code.value).unwrap();
        assert_eq!(record["used_count"], json!(3));
        assert!(record["last_used_at"].is_string());
    }

    #[test]
    fn mark_used_on_unknown_code_is_a_noop() {
        let (_dir, store) = temp_store();
        mark_used(&store, &BATCH, "NOPE1", 1);
        assert!(store.get("batches", "NOPE1").is_none());
    }
}
