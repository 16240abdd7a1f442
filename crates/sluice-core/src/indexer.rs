//! Batching consumer of the destination channel.
//!
//! Documents accumulate into a batch bounded by `indexer.batch_size` and
//! `indexer.batch_timeout_ms` (measured from the first entry). Each batch
//! is classified per document id, latest entry wins, into upserts, deletes
//! by id, and deletes by field term, then shipped to the backend in that
//! order: a delete arriving after an upsert removes the upsert, an upsert
//! arriving after a delete removes the delete, and the delete-by-term pass
//! never races an upsert of the same batch.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{IndexerConfig, VersionType};
use crate::document::{Document, CHILDREN_FIELD, ID_FIELD};
use crate::index::{DeleteByTerm, IndexBackend, IndexDoc, IndexRequest, IndexResponse};
use crate::messenger::Messenger;
use crate::metrics::PipelineMetrics;
use crate::event::Event;

/// Field under which one level of children is flattened into the indexed
/// payload.
pub const FLATTENED_CHILDREN_FIELD: &str = "_children_";

/// Resolved indexer settings.
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    /// Target index name.
    pub index: String,
    /// Flush when this many documents are batched.
    pub batch_size: usize,
    /// Flush when the oldest batched document is this old.
    pub batch_timeout: Duration,
    /// Field whose value replaces the document id in the indexing call.
    pub id_override_field: Option<String>,
    /// Field holding the shard routing key.
    pub routing_field: Option<String>,
    /// Versioning mode; external modes draw the version from the source
    /// offset.
    pub version_type: VersionType,
    /// Field marking a document for deletion.
    pub deletion_marker_field: Option<String>,
    /// Value of the marker field that means "delete".
    pub deletion_marker_field_value: Option<String>,
    /// Field naming the delete-by-query field.
    pub delete_by_field_field: Option<String>,
    /// Field naming the delete-by-query value.
    pub delete_by_field_value: Option<String>,
    /// Fields stripped from the indexed payload.
    pub ignore_fields: Vec<String>,
    /// Leave the id out of the payload entirely.
    pub omit_id_from_payload: bool,
}

impl IndexerSettings {
    /// Build settings from configuration.
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            index: config.index.clone(),
            batch_size: config.batch_size.max(1),
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
            id_override_field: config.id_override_field.clone(),
            routing_field: config.routing_field.clone(),
            version_type: config.version_type,
            deletion_marker_field: config.deletion_marker_field.clone(),
            deletion_marker_field_value: config.deletion_marker_field_value.clone(),
            delete_by_field_field: config.delete_by_field_field.clone(),
            delete_by_field_value: config.delete_by_field_value.clone(),
            ignore_fields: config.ignore_fields.clone(),
            omit_id_from_payload: config.omit_id_from_payload,
        }
    }

    fn is_marked_for_deletion(&self, doc: &Document) -> bool {
        match (&self.deletion_marker_field, &self.deletion_marker_field_value) {
            (Some(field), Some(value)) => {
                doc.has_non_null(field) && doc.get_string(field).as_deref() == Some(value.as_str())
            }
            _ => false,
        }
    }

    /// The delete-by-query term configured on this document, if any.
    fn delete_by_term(&self, doc: &Document) -> Option<DeleteByTerm> {
        let field_field = self.delete_by_field_field.as_deref()?;
        let value_field = self.delete_by_field_value.as_deref()?;
        let field = doc.get_string(field_field)?;
        let value = doc.get_string(value_field)?;
        Some(DeleteByTerm { field, value })
    }
}

/// A batch classified per document id, latest entry winning.
struct Classified {
    upserts: Vec<Document>,
    delete_ids: Vec<String>,
    delete_terms: Vec<DeleteByTerm>,
    /// Every consumed (document id, run id), in consumption order; each
    /// receives exactly one terminal event.
    accounted: Vec<(String, String)>,
}

fn classify(batch: Vec<Document>, settings: &IndexerSettings) -> Classified {
    let mut upserts: Vec<Option<Document>> = Vec::new();
    let mut upsert_pos: HashMap<String, usize> = HashMap::new();
    let mut deletes: Vec<Option<String>> = Vec::new();
    let mut delete_pos: HashMap<String, usize> = HashMap::new();
    let mut delete_terms = Vec::new();
    let mut accounted = Vec::new();

    for doc in batch {
        let Some(run_id) = doc.run_id().map(str::to_string) else {
            warn!(document = doc.id(), "dropping document without a run id");
            continue;
        };
        let id = doc.id().to_string();
        accounted.push((id.clone(), run_id));

        if settings.is_marked_for_deletion(&doc) {
            if let Some(position) = upsert_pos.remove(&id) {
                upserts[position] = None;
            }
            if let Some(term) = settings.delete_by_term(&doc) {
                delete_terms.push(term);
            } else if !delete_pos.contains_key(&id) {
                delete_pos.insert(id.clone(), deletes.len());
                deletes.push(Some(id));
            }
        } else {
            if let Some(position) = delete_pos.remove(&id) {
                deletes[position] = None;
            }
            match upsert_pos.get(&id) {
                Some(&position) => upserts[position] = Some(doc),
                None => {
                    upsert_pos.insert(id, upserts.len());
                    upserts.push(Some(doc));
                }
            }
        }
    }

    Classified {
        upserts: upserts.into_iter().flatten().collect(),
        delete_ids: deletes.into_iter().flatten().collect(),
        delete_terms,
        accounted,
    }
}

fn build_index_doc(doc: &Document, settings: &IndexerSettings) -> IndexDoc {
    let effective_id = settings
        .id_override_field
        .as_deref()
        .and_then(|field| doc.get_string(field))
        .unwrap_or_else(|| doc.id().to_string());

    let mut body = match doc.to_value() {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    body.remove(CHILDREN_FIELD);
    for field in &settings.ignore_fields {
        body.remove(field);
    }

    // The id is always part of the payload unless explicitly opted out.
    if settings.omit_id_from_payload {
        body.remove(ID_FIELD);
    } else {
        body.insert(ID_FIELD.to_string(), Value::String(effective_id.clone()));
    }

    if doc.has_children() {
        let children: Vec<Value> = doc
            .children()
            .iter()
            .map(|child| {
                let mut map = match child.to_value() {
                    Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                map.remove(CHILDREN_FIELD);
                Value::Object(map)
            })
            .collect();
        body.insert(FLATTENED_CHILDREN_FIELD.to_string(), Value::Array(children));
    }

    let routing = settings
        .routing_field
        .as_deref()
        .and_then(|field| doc.get_string(field));
    let version = match settings.version_type {
        VersionType::External | VersionType::ExternalGte => {
            doc.source_offset().map(|offset| offset.offset)
        }
        VersionType::Internal => None,
    };

    IndexDoc {
        id: effective_id,
        routing,
        version,
        body: Value::Object(body),
    }
}

/// The batching consumer between the destination channel and a backend.
pub struct Indexer {
    messenger: Arc<dyn Messenger>,
    backend: Arc<dyn IndexBackend>,
    settings: IndexerSettings,
}

impl Indexer {
    /// Create an indexer.
    pub fn new(
        messenger: Arc<dyn Messenger>,
        backend: Arc<dyn IndexBackend>,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            messenger,
            backend,
            settings,
        }
    }

    /// Spawn the indexer loop on its own task.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run the batching loop until shutdown. The final partial batch is
    /// flushed on the way out.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            backend = self.backend.name(),
            index = self.settings.index.as_str(),
            "indexer started"
        );
        let mut batch: Vec<Document> = Vec::with_capacity(self.settings.batch_size);
        let mut first_at: Option<Instant> = None;

        loop {
            if shutdown.try_recv().is_ok() {
                if !batch.is_empty() {
                    self.flush(std::mem::take(&mut batch)).await;
                }
                break;
            }

            let timed_out = first_at.is_some_and(|t| t.elapsed() >= self.settings.batch_timeout);
            if batch.len() >= self.settings.batch_size || (timed_out && !batch.is_empty()) {
                self.flush(std::mem::take(&mut batch)).await;
                first_at = None;
            }

            match self.messenger.poll_completed().await {
                Ok(Some(doc)) => {
                    if first_at.is_none() {
                        first_at = Some(Instant::now());
                    }
                    batch.push(doc);
                }
                Ok(None) => {}
                Err(e) => {
                    error!("messenger failed, stopping indexer: {e}");
                    break;
                }
            }
        }

        if let Err(e) = self.backend.close().await {
            warn!("backend close failed: {e}");
        }
        if let Err(e) = self.messenger.close().await {
            warn!("messenger close failed: {e}");
        }
        info!("indexer stopped");
    }

    async fn flush(&self, batch: Vec<Document>) {
        let consumed = batch.len();
        let classified = classify(batch, &self.settings);
        if classified.accounted.is_empty() {
            return;
        }

        // Per-item failures come back under the effective id; translate
        // them back to document ids for event accounting.
        let mut doc_id_by_effective: HashMap<String, String> = HashMap::new();
        let upserts: Vec<IndexDoc> = classified
            .upserts
            .iter()
            .map(|doc| {
                let indexed = build_index_doc(doc, &self.settings);
                doc_id_by_effective.insert(indexed.id.clone(), doc.id().to_string());
                indexed
            })
            .collect();

        let request = IndexRequest {
            index: self.settings.index.clone(),
            upserts,
            delete_ids: classified.delete_ids,
            delete_terms: classified.delete_terms,
        };
        debug!(
            consumed,
            upserts = request.upserts.len(),
            delete_ids = request.delete_ids.len(),
            delete_terms = request.delete_terms.len(),
            "flushing batch"
        );

        let outcome = if request.is_empty() {
            Ok(IndexResponse::default())
        } else {
            self.backend.send(request).await
        };

        match outcome {
            Ok(response) => {
                let mut failed: HashMap<String, String> = HashMap::new();
                for failure in response.failures {
                    let doc_id = doc_id_by_effective
                        .get(&failure.id)
                        .cloned()
                        .unwrap_or(failure.id);
                    failed.insert(doc_id, failure.reason);
                }

                let mut indexed = 0u64;
                for (doc_id, run_id) in classified.accounted {
                    let event = match failed.get(&doc_id) {
                        Some(reason) => {
                            Event::fail(doc_id, run_id, reason.clone())
                        }
                        None => {
                            indexed += 1;
                            Event::finish(doc_id, run_id)
                        }
                    };
                    if let Err(e) = self.messenger.send_event(event).await {
                        error!("could not emit indexing event: {e}");
                    }
                }
                PipelineMetrics::add_docs_indexed(indexed);
                PipelineMetrics::add_docs_index_failed(failed.len() as u64);
                PipelineMetrics::increment_batches_shipped();
                PipelineMetrics::record_batch_size(consumed as f64);
            }
            Err(e) => {
                // The batch is not retried; every consumed document fails.
                warn!(consumed, "batch failed: {e}");
                PipelineMetrics::add_docs_index_failed(classified.accounted.len() as u64);
                for (doc_id, run_id) in classified.accounted {
                    let event = Event::fail(doc_id, run_id, e.to_string());
                    if let Err(e) = self.messenger.send_event(event).await {
                        error!("could not emit indexing event: {e}");
                    }
                }
            }
        }

        if let Err(e) = self.messenger.commit_pending_offsets().await {
            warn!("offset commit failed: {e}");
        }
    }
}
