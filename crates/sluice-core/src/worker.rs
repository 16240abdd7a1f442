//! Workers: the loop between the source queue and the destination queue.
//!
//! A worker polls the source channel, runs each document through the
//! pipeline, and forwards the results. For every result that is not the
//! input document (a child), a CREATE event goes out on the event stream
//! *before* the child itself is forwarded; the indexer can only emit a
//! terminal event for a child it has received, so the publisher always
//! sees the CREATE first.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::document::Document;
use crate::error::MessengerError;
use crate::event::Event;
use crate::messenger::{Messenger, MessengerFactory};
use crate::metrics::PipelineMetrics;
use crate::pipeline::Pipeline;

const SEND_ATTEMPTS: u32 = 3;
const SEND_BACKOFF: Duration = Duration::from_millis(50);

/// A single worker task.
pub struct Worker {
    id: usize,
    pipeline: Arc<Pipeline>,
    messenger: Arc<dyn Messenger>,
    shutdown: broadcast::Receiver<()>,
}

impl Worker {
    /// Create a worker. Usually done through [`WorkerPool::start`].
    pub fn new(
        id: usize,
        pipeline: Arc<Pipeline>,
        messenger: Arc<dyn Messenger>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            pipeline,
            messenger,
            shutdown,
        }
    }

    /// Run the poll-process-forward loop until shutdown or a messenger
    /// failure. The in-flight document is always drained before the loop
    /// observes the stop signal.
    pub async fn run(mut self) {
        info!(
            worker = self.id,
            pipeline = self.pipeline.name(),
            "worker started"
        );
        loop {
            if self.shutdown.try_recv().is_ok() {
                break;
            }
            if let Err(e) = self.messenger.commit_pending_offsets().await {
                warn!(worker = self.id, "offset commit failed: {e}");
            }
            let doc = match self.messenger.poll_doc().await {
                Ok(Some(doc)) => doc,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker = self.id, "messenger failed, stopping worker: {e}");
                    break;
                }
            };
            self.handle(doc).await;
        }
        if let Err(e) = self.messenger.close().await {
            warn!(worker = self.id, "messenger close failed: {e}");
        }
        info!(worker = self.id, "worker stopped");
    }

    async fn handle(&self, doc: Document) {
        let parent_id = doc.id().to_string();
        let run_id = doc.run_id().unwrap_or_default().to_string();
        let offset = doc.source_offset().cloned();

        match self.pipeline.process(doc).await {
            Ok(results) => {
                PipelineMetrics::increment_docs_processed();
                for mut result in results {
                    // Results inherit the source record's provenance so
                    // offset accounting covers the whole fan-out.
                    if result.source_offset().is_none() {
                        if let Some(offset) = &offset {
                            result.set_source_offset(offset.clone());
                        }
                    }
                    if result.id() != parent_id {
                        let create = Event::create(result.id(), run_id.clone());
                        if let Err(e) = self.send_event_with_retry(create).await {
                            error!(
                                worker = self.id,
                                child = result.id(),
                                "could not announce child, dropping it: {e}"
                            );
                            let fail = Event::fail(
                                result.id(),
                                run_id.clone(),
                                "child creation could not be announced",
                            );
                            let _ = self.messenger.send_event(fail).await;
                            continue;
                        }
                        PipelineMetrics::increment_children_created();
                    }
                    let result_id = result.id().to_string();
                    if let Err(e) = self.send_completed_with_retry(result).await {
                        error!(
                            worker = self.id,
                            document = result_id.as_str(),
                            "could not forward processed document: {e}"
                        );
                        let fail = Event::fail(result_id, run_id.clone(), e.to_string());
                        if let Err(e) = self.messenger.send_event(fail).await {
                            error!(worker = self.id, "could not report failure: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                PipelineMetrics::increment_docs_failed();
                warn!(worker = self.id, document = parent_id.as_str(), "{e}");
                let fail = Event::fail(parent_id, run_id, e.reason());
                if let Err(e) = self.messenger.send_event(fail).await {
                    error!(worker = self.id, "could not report pipeline failure: {e}");
                }
            }
        }
    }

    async fn send_completed_with_retry(&self, doc: Document) -> Result<(), MessengerError> {
        let mut last = None;
        for attempt in 0..SEND_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(SEND_BACKOFF * attempt).await;
            }
            match self.messenger.send_completed(doc.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(worker = self.id, attempt, "retrying forward: {e}");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(MessengerError::Closed))
    }

    async fn send_event_with_retry(&self, event: Event) -> Result<(), MessengerError> {
        let mut last = None;
        for attempt in 0..SEND_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(SEND_BACKOFF * attempt).await;
            }
            match self.messenger.send_event(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(worker = self.id, attempt, "retrying event: {e}");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(MessengerError::Closed))
    }
}

/// A fixed-size set of workers sharing one pipeline.
pub struct WorkerPool {
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown: broadcast::Sender<()>,
}

impl WorkerPool {
    /// Start `workers` workers (at least one), each with a messenger from
    /// the factory.
    pub async fn start(
        pipeline: Arc<Pipeline>,
        factory: &dyn MessengerFactory,
        workers: usize,
    ) -> Result<Self, MessengerError> {
        let (shutdown, _) = broadcast::channel(1);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers.max(1) {
            let messenger = factory.create().await?;
            let worker = Worker::new(id, pipeline.clone(), messenger, shutdown.subscribe());
            handles.push(tokio::spawn(worker.run()));
        }
        info!(
            workers = handles.len(),
            pipeline = pipeline.name(),
            "worker pool started"
        );
        Ok(Self { handles, shutdown })
    }

    /// Number of workers in the pool.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker to stop and wait for them to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        join_all(self.handles).await;
        info!("worker pool stopped");
    }
}
