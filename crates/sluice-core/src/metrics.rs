//! Pipeline instrumentation on the `metrics` crate facade.
//!
//! Metric names follow `sluice_{component}_{name}_{unit}`. Recording is
//! backend-agnostic; installing an exporter is left to the embedding
//! application.

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};

/// Core pipeline metrics.
pub struct PipelineMetrics;

impl PipelineMetrics {
    // ---- Counters ----

    /// A document was handed to the source channel.
    pub fn increment_docs_published() {
        metrics::counter!("sluice_publisher_docs_published_total").increment(1);
    }

    /// A document made it through the pipeline.
    pub fn increment_docs_processed() {
        metrics::counter!("sluice_worker_docs_processed_total").increment(1);
    }

    /// A document failed in the pipeline.
    pub fn increment_docs_failed() {
        metrics::counter!("sluice_worker_docs_failed_total").increment(1);
    }

    /// A stage emitted a child document.
    pub fn increment_children_created() {
        metrics::counter!("sluice_worker_children_created_total").increment(1);
    }

    /// Documents delivered to the backend.
    pub fn add_docs_indexed(count: u64) {
        metrics::counter!("sluice_indexer_docs_indexed_total").increment(count);
    }

    /// Documents that failed at the backend.
    pub fn add_docs_index_failed(count: u64) {
        metrics::counter!("sluice_indexer_docs_failed_total").increment(count);
    }

    /// A batch was shipped to the backend.
    pub fn increment_batches_shipped() {
        metrics::counter!("sluice_indexer_batches_shipped_total").increment(1);
    }

    // ---- Histograms ----

    /// Documents consumed by one flushed batch.
    pub fn record_batch_size(size: f64) {
        metrics::histogram!("sluice_indexer_batch_size").record(size);
    }

    /// Wall time of a whole run.
    pub fn record_run_seconds(seconds: f64) {
        metrics::histogram!("sluice_runner_run_duration_seconds").record(seconds);
    }

    /// Wall time of one connector within a run.
    pub fn record_connector_seconds(seconds: f64) {
        metrics::histogram!("sluice_runner_connector_duration_seconds").record(seconds);
    }
}
