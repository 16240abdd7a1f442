//! The boundary between the indexer and a concrete search backend.
//!
//! A backend receives one [`IndexRequest`] per batch, already classified
//! into upserts, deletes by id, and deletes by field term, and reports
//! per-item failures in its [`IndexResponse`]. Wire formats of concrete
//! search engines live behind this trait.

mod memory;

pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BackendError;

/// One document ready for upserting.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDoc {
    /// Effective id used in the indexing call.
    pub id: String,
    /// Optional shard routing key.
    pub routing: Option<String>,
    /// Optional external version.
    pub version: Option<i64>,
    /// The JSON payload to index.
    pub body: Value,
}

/// A delete-by-query term: remove every document whose `field` holds
/// `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteByTerm {
    /// Field to match.
    pub field: String,
    /// Value to match.
    pub value: String,
}

/// One classified batch bound for a backend. Operations are applied in
/// order: upserts, then deletes by id, then deletes by term.
#[derive(Debug, Clone, Default)]
pub struct IndexRequest {
    /// Target index.
    pub index: String,
    /// Documents to create or replace.
    pub upserts: Vec<IndexDoc>,
    /// Ids to delete.
    pub delete_ids: Vec<String>,
    /// Field terms to delete by.
    pub delete_terms: Vec<DeleteByTerm>,
}

impl IndexRequest {
    /// Whether the request carries no operations.
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.delete_ids.is_empty() && self.delete_terms.is_empty()
    }
}

/// A per-item failure reported by the backend.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    /// Id of the failing document.
    pub id: String,
    /// Backend-supplied reason.
    pub reason: String,
}

/// Outcome of a batch that reached the backend.
#[derive(Debug, Clone, Default)]
pub struct IndexResponse {
    /// Items the backend rejected; everything else succeeded.
    pub failures: Vec<ItemFailure>,
}

/// A search/index backend.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Check that the backend is reachable.
    async fn validate_connection(&self) -> Result<(), BackendError>;

    /// Apply one classified batch. A transport-level `Err` fails the whole
    /// batch; individual rejections are reported in the response.
    async fn send(&self, request: IndexRequest) -> Result<IndexResponse, BackendError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
