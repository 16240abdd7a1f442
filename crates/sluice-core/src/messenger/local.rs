//! In-memory messenger for single-process runs.

use async_trait::async_trait;
use std::time::Duration;

use super::queue::PollQueue;
use super::Messenger;
use crate::config::WorkerConfig;
use crate::document::Document;
use crate::error::MessengerError;
use crate::event::Event;

/// Default time a poll waits before reporting an empty channel.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Messenger backed by in-memory queues, shared by publisher, workers, and
/// indexer of a single-process run.
///
/// The source queue may carry a capacity bound (`worker.queue_capacity`);
/// the destination and event queues are unbounded.
pub struct LocalMessenger {
    source: PollQueue<Document>,
    dest: PollQueue<Document>,
    events: PollQueue<Event>,
    poll_timeout: Duration,
}

impl LocalMessenger {
    /// A messenger with an unbounded source queue.
    pub fn new() -> Self {
        Self {
            source: PollQueue::unbounded(),
            dest: PollQueue::unbounded(),
            events: PollQueue::unbounded(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// A messenger whose source queue blocks publishers at `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            source: PollQueue::bounded(capacity),
            ..Self::new()
        }
    }

    /// Build a messenger from the worker configuration.
    pub fn from_config(config: &WorkerConfig) -> Self {
        match config.queue_capacity {
            Some(capacity) => Self::with_capacity(capacity),
            None => Self::new(),
        }
    }

    /// Override the poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

impl Default for LocalMessenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Messenger for LocalMessenger {
    async fn poll_doc(&self) -> Result<Option<Document>, MessengerError> {
        Ok(self.source.poll(self.poll_timeout).await)
    }

    async fn send_for_processing(&self, doc: Document) -> Result<(), MessengerError> {
        self.source.push(doc).await
    }

    async fn send_completed(&self, doc: Document) -> Result<(), MessengerError> {
        self.dest.push(doc).await
    }

    async fn poll_completed(&self) -> Result<Option<Document>, MessengerError> {
        Ok(self.dest.poll(self.poll_timeout).await)
    }

    async fn send_event(&self, event: Event) -> Result<(), MessengerError> {
        self.events.push(event).await
    }

    async fn poll_event(&self) -> Result<Option<Event>, MessengerError> {
        Ok(self.events.poll(self.poll_timeout).await)
    }

    async fn has_events(&self) -> Result<bool, MessengerError> {
        Ok(!self.events.is_empty())
    }

    async fn commit_pending_offsets(&self) -> Result<(), MessengerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), MessengerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn documents_flow_source_to_destination() {
        let messenger = LocalMessenger::new().with_poll_timeout(Duration::from_millis(10));
        let doc = Document::new("d1").unwrap();
        messenger.send_for_processing(doc.clone()).await.unwrap();

        let polled = messenger.poll_doc().await.unwrap().unwrap();
        assert_eq!(polled.id(), "d1");
        assert!(messenger.poll_doc().await.unwrap().is_none());

        messenger.send_completed(polled).await.unwrap();
        assert_eq!(
            messenger.poll_completed().await.unwrap().unwrap().id(),
            "d1"
        );
    }

    #[tokio::test]
    async fn has_events_reflects_buffered_events() {
        let messenger = LocalMessenger::new().with_poll_timeout(Duration::from_millis(10));
        assert!(!messenger.has_events().await.unwrap());

        messenger
            .send_event(Event::finish("d1", "run-1"))
            .await
            .unwrap();
        assert!(messenger.has_events().await.unwrap());

        let event = messenger.poll_event().await.unwrap().unwrap();
        assert_eq!(event.document_id, "d1");
        assert!(!messenger.has_events().await.unwrap());
    }
}
