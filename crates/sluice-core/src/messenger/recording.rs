//! Messenger wrapper that records all traffic, for tests and debugging.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

use super::local::LocalMessenger;
use super::Messenger;
use crate::document::Document;
use crate::error::MessengerError;
use crate::event::Event;

/// An in-memory messenger that additionally keeps a copy of every document
/// and event sent through it, so message traffic can be reviewed after the
/// simulated channels have been fully consumed.
///
/// The same instance must be shared by publisher, workers, and indexer so
/// each component sees the others' messages.
pub struct RecordingMessenger {
    inner: LocalMessenger,
    sent_for_processing: Mutex<Vec<Document>>,
    sent_completed: Mutex<Vec<Document>>,
    sent_events: Mutex<Vec<Event>>,
}

impl RecordingMessenger {
    /// A recording messenger with short poll timeouts suitable for tests.
    pub fn new() -> Self {
        Self {
            inner: LocalMessenger::new().with_poll_timeout(Duration::from_millis(10)),
            sent_for_processing: Mutex::new(Vec::new()),
            sent_completed: Mutex::new(Vec::new()),
            sent_events: Mutex::new(Vec::new()),
        }
    }

    /// Every document sent to the source channel, in order.
    pub fn documents_sent_for_processing(&self) -> Vec<Document> {
        self.sent_for_processing.lock().clone()
    }

    /// Every document sent to the destination channel, in order.
    pub fn documents_completed(&self) -> Vec<Document> {
        self.sent_completed.lock().clone()
    }

    /// Every event emitted, in order.
    pub fn events(&self) -> Vec<Event> {
        self.sent_events.lock().clone()
    }
}

impl Default for RecordingMessenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn poll_doc(&self) -> Result<Option<Document>, MessengerError> {
        self.inner.poll_doc().await
    }

    async fn send_for_processing(&self, doc: Document) -> Result<(), MessengerError> {
        self.sent_for_processing.lock().push(doc.clone());
        self.inner.send_for_processing(doc).await
    }

    async fn send_completed(&self, doc: Document) -> Result<(), MessengerError> {
        self.sent_completed.lock().push(doc.clone());
        self.inner.send_completed(doc).await
    }

    async fn poll_completed(&self) -> Result<Option<Document>, MessengerError> {
        self.inner.poll_completed().await
    }

    async fn send_event(&self, event: Event) -> Result<(), MessengerError> {
        self.sent_events.lock().push(event.clone());
        self.inner.send_event(event).await
    }

    async fn poll_event(&self) -> Result<Option<Event>, MessengerError> {
        self.inner.poll_event().await
    }

    async fn has_events(&self) -> Result<bool, MessengerError> {
        self.inner.has_events().await
    }

    async fn commit_pending_offsets(&self) -> Result<(), MessengerError> {
        self.inner.commit_pending_offsets().await
    }

    async fn close(&self) -> Result<(), MessengerError> {
        self.inner.close().await
    }
}
