//! The per-run bookkeeper: injects documents and decides completion.
//!
//! The publisher stamps each published document with the run id and
//! records it in the outstanding ledger with one pending terminal event.
//! Draining the event stream, a CREATE raises the pending count of the
//! named child by one and a terminal event lowers it, removing the entry
//! at zero. The run is complete once the connector has finished, the
//! ledger is empty, and no events remain buffered. All three are needed:
//! events may still be in flight after the connector returns, and the
//! ledger can momentarily empty between a FINISH and the CREATE of an
//! orphaned child.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::document::Document;
use crate::error::{CompletionError, ConnectorError, MessengerError};
use crate::event::{Event, EventType};
use crate::messenger::Messenger;
use crate::metrics::PipelineMetrics;

struct PublisherInner {
    messenger: Arc<dyn Messenger>,
    run_id: String,
    pipeline: String,
    /// Outstanding document id → pending terminal events.
    ledger: Mutex<HashMap<String, usize>>,
    published: AtomicU64,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to the run's bookkeeping. Connectors publish
/// through a clone while the runner's task waits for completion.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    /// A publisher for one run of one pipeline.
    pub fn new(
        messenger: Arc<dyn Messenger>,
        run_id: impl Into<String>,
        pipeline: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                messenger,
                run_id: run_id.into(),
                pipeline: pipeline.into(),
                ledger: Mutex::new(HashMap::new()),
                published: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The run this publisher belongs to.
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// The pipeline documents are published to.
    pub fn pipeline(&self) -> &str {
        &self.inner.pipeline
    }

    /// Number of documents published so far.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Number of documents still awaiting terminal events.
    pub fn outstanding(&self) -> usize {
        self.inner.ledger.lock().len()
    }

    /// Attach the run id, open the document's ledger entry, and hand it to
    /// the source channel. Blocks while a bounded source queue is full.
    pub async fn publish(&self, mut doc: Document) -> Result<(), MessengerError> {
        if doc.run_id().is_none() {
            doc.initialize_run_id(self.inner.run_id.clone());
        }
        *self
            .inner
            .ledger
            .lock()
            .entry(doc.id().to_string())
            .or_insert(0) += 1;
        self.inner.messenger.send_for_processing(doc).await?;
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        PipelineMetrics::increment_docs_published();
        Ok(())
    }

    /// Apply one event to the ledger. Never errors; events for unknown
    /// documents are logged and dropped.
    fn handle_event(&self, event: &Event) {
        let mut ledger = self.inner.ledger.lock();
        match event.event_type {
            EventType::Create => {
                *ledger.entry(event.document_id.clone()).or_insert(0) += 1;
                debug!(child = event.document_id.as_str(), "child accounted");
            }
            EventType::Finish | EventType::Fail => match ledger.get_mut(&event.document_id) {
                Some(pending) => {
                    *pending -= 1;
                    if *pending == 0 {
                        ledger.remove(&event.document_id);
                    }
                }
                None => {
                    warn!(
                        document = event.document_id.as_str(),
                        "dropping event for unknown document: {event}"
                    );
                }
            },
        }
    }

    /// Drain the events currently buffered on the stream.
    async fn drain_events(&self) -> Result<(), MessengerError> {
        while let Some(event) = self.inner.messenger.poll_event().await? {
            self.handle_event(&event);
        }
        Ok(())
    }

    /// Block until the connector task has terminated, the ledger is empty,
    /// and no events remain buffered, or until `timeout` elapses. The
    /// connector task is aborted on timeout; in-flight workers finish their
    /// current document before observing the stop flag.
    pub async fn wait_for_completion(
        &self,
        mut connector: JoinHandle<Result<(), ConnectorError>>,
        timeout: Duration,
    ) -> Result<(), CompletionError> {
        let deadline = Instant::now() + timeout;
        let mut connector_done = false;

        loop {
            self.drain_events().await?;

            if !connector_done && connector.is_finished() {
                connector_done = true;
                match (&mut connector).await {
                    Ok(Ok(())) => {
                        debug!(pipeline = self.inner.pipeline.as_str(), "connector finished");
                    }
                    Ok(Err(e)) => return Err(CompletionError::ConnectorFailed(e.to_string())),
                    Err(join_error) => {
                        return Err(CompletionError::ConnectorAborted(join_error.to_string()))
                    }
                }
            }

            if connector_done
                && self.inner.ledger.lock().is_empty()
                && !self.inner.messenger.has_events().await?
            {
                info!(
                    run_id = self.inner.run_id.as_str(),
                    published = self.published(),
                    "run work fully accounted"
                );
                return Ok(());
            }

            if Instant::now() >= deadline {
                if !connector_done {
                    connector.abort();
                }
                warn!(
                    outstanding = self.outstanding(),
                    "completion wait timed out"
                );
                return Err(CompletionError::TimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Release broker resources. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.inner.messenger.close().await {
            warn!("messenger close failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::RecordingMessenger;

    fn publisher(messenger: Arc<RecordingMessenger>) -> Publisher {
        Publisher::new(messenger, "run-1", "pipeline-1")
    }

    #[tokio::test]
    async fn publish_stamps_run_id_and_opens_ledger_entry() {
        let messenger = Arc::new(RecordingMessenger::new());
        let publisher = publisher(messenger.clone());
        publisher
            .publish(Document::new("d1").unwrap())
            .await
            .unwrap();

        assert_eq!(publisher.outstanding(), 1);
        assert_eq!(publisher.published(), 1);
        let sent = messenger.documents_sent_for_processing();
        assert_eq!(sent[0].run_id(), Some("run-1"));
    }

    #[tokio::test]
    async fn publishing_the_same_id_twice_expects_two_terminal_events() {
        let messenger = Arc::new(RecordingMessenger::new());
        let publisher = publisher(messenger);
        publisher.publish(Document::new("x").unwrap()).await.unwrap();
        publisher.publish(Document::new("x").unwrap()).await.unwrap();
        assert_eq!(publisher.outstanding(), 1);

        publisher.handle_event(&Event::finish("x", "run-1"));
        assert_eq!(publisher.outstanding(), 1);
        publisher.handle_event(&Event::finish("x", "run-1"));
        assert_eq!(publisher.outstanding(), 0);
    }

    #[tokio::test]
    async fn fan_out_accounting_drains_to_empty() {
        let messenger = Arc::new(RecordingMessenger::new());
        let publisher = publisher(messenger);
        publisher
            .publish(Document::new("d1").unwrap())
            .await
            .unwrap();

        publisher.handle_event(&Event::create("d1-c1", "run-1"));
        publisher.handle_event(&Event::create("d1-c2", "run-1"));
        assert_eq!(publisher.outstanding(), 3);

        publisher.handle_event(&Event::finish("d1", "run-1"));
        publisher.handle_event(&Event::finish("d1-c1", "run-1"));
        assert_eq!(publisher.outstanding(), 1);
        publisher.handle_event(&Event::finish("d1-c2", "run-1"));
        assert_eq!(publisher.outstanding(), 0);
    }

    #[tokio::test]
    async fn unknown_terminal_events_are_dropped() {
        let messenger = Arc::new(RecordingMessenger::new());
        let publisher = publisher(messenger);
        publisher.handle_event(&Event::finish("stranger", "run-1"));
        assert_eq!(publisher.outstanding(), 0);
    }

    #[tokio::test]
    async fn completion_requires_connector_ledger_and_event_stream() {
        let messenger = Arc::new(RecordingMessenger::new());
        let publisher = publisher(messenger.clone());
        publisher
            .publish(Document::new("d1").unwrap())
            .await
            .unwrap();

        // Simulate the indexer finishing the document.
        messenger
            .send_event(Event::finish("d1", "run-1"))
            .await
            .unwrap();

        let connector: JoinHandle<Result<(), ConnectorError>> =
            tokio::spawn(async { Ok(()) });
        publisher
            .wait_for_completion(connector, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(publisher.outstanding(), 0);
    }

    #[tokio::test]
    async fn completion_times_out_when_work_is_outstanding() {
        let messenger = Arc::new(RecordingMessenger::new());
        let publisher = publisher(messenger);
        publisher
            .publish(Document::new("d1").unwrap())
            .await
            .unwrap();

        let connector: JoinHandle<Result<(), ConnectorError>> =
            tokio::spawn(async { Ok(()) });
        let result = publisher
            .wait_for_completion(connector, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(CompletionError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn connector_failure_aborts_the_wait() {
        let messenger = Arc::new(RecordingMessenger::new());
        let publisher = publisher(messenger);

        let connector: JoinHandle<Result<(), ConnectorError>> =
            tokio::spawn(async { Err(ConnectorError::source("feed unreachable")) });
        let result = publisher
            .wait_for_completion(connector, Duration::from_secs(5))
            .await;
        match result {
            Err(CompletionError::ConnectorFailed(message)) => {
                assert!(message.contains("feed unreachable"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let messenger = Arc::new(RecordingMessenger::new());
        let publisher = publisher(messenger);
        publisher.close().await;
        publisher.close().await;
    }
}
