//! In-memory index backend for tests, demos, and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{IndexBackend, IndexRequest, IndexResponse, ItemFailure};
use crate::error::BackendError;

/// Backend that applies batches to an in-memory store and records every
/// request it receives, so tests can assert on both the operations sent
/// and the resulting state. Failures can be injected per id or for the
/// next whole request.
#[derive(Default)]
pub struct MemoryBackend {
    requests: Mutex<Vec<IndexRequest>>,
    store: Mutex<BTreeMap<String, Value>>,
    fail_ids: Mutex<HashSet<String>>,
    fail_next_request: AtomicBool,
}

impl MemoryBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the document with this id on every future request.
    pub fn fail_id(&self, id: impl Into<String>) {
        self.fail_ids.lock().insert(id.into());
    }

    /// Fail the next request at transport level.
    pub fn fail_next_request(&self) {
        self.fail_next_request.store(true, Ordering::SeqCst);
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<IndexRequest> {
        self.requests.lock().clone()
    }

    /// Current contents of the store.
    pub fn stored(&self) -> BTreeMap<String, Value> {
        self.store.lock().clone()
    }

    /// Ids currently present in the store.
    pub fn stored_ids(&self) -> Vec<String> {
        self.store.lock().keys().cloned().collect()
    }

    fn matches_term(body: &Value, field: &str, value: &str) -> bool {
        match body.get(field) {
            Some(Value::String(s)) => s == value,
            Some(Value::Array(items)) => items
                .iter()
                .any(|item| matches!(item, Value::String(s) if s == value)),
            Some(other) => other.to_string() == value,
            None => false,
        }
    }
}

#[async_trait]
impl IndexBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn validate_connection(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn send(&self, request: IndexRequest) -> Result<IndexResponse, BackendError> {
        if self.fail_next_request.swap(false, Ordering::SeqCst) {
            return Err(BackendError::transport("injected transport failure"));
        }

        let fail_ids = self.fail_ids.lock().clone();
        let mut failures = Vec::new();
        let mut store = self.store.lock();

        for doc in &request.upserts {
            if fail_ids.contains(&doc.id) {
                failures.push(ItemFailure {
                    id: doc.id.clone(),
                    reason: "injected item failure".to_string(),
                });
                continue;
            }
            store.insert(doc.id.clone(), doc.body.clone());
        }
        for id in &request.delete_ids {
            store.remove(id);
        }
        for term in &request.delete_terms {
            store.retain(|_, body| !Self::matches_term(body, &term.field, &term.value));
        }
        drop(store);

        self.requests.lock().push(request);
        Ok(IndexResponse { failures })
    }
}
