//! The queue and event substrate connecting publisher, workers, and
//! indexer.
//!
//! Three logical channels exist per pipeline: **source** (documents
//! awaiting processing), **destination** (processed documents awaiting
//! indexing), and **events** (creation and terminal signals flowing back to
//! the publisher). Two deployments implement the same interface: the
//! in-memory [`LocalMessenger`] for single-process runs, and the
//! kafka-backed messenger (cargo feature `kafka`) for distributed runs.

mod dedup;
mod local;
mod offsets;
mod queue;
mod recording;

#[cfg(feature = "kafka")]
mod kafka;

pub use local::LocalMessenger;
pub use recording::RecordingMessenger;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaMessenger, KafkaMessengerFactory};

#[cfg(feature = "kafka")]
pub(crate) use dedup::DeduplicationQueue;
#[cfg(feature = "kafka")]
pub(crate) use offsets::OffsetLedger;

use async_trait::async_trait;
use std::sync::Arc;

use crate::document::Document;
use crate::error::MessengerError;
use crate::event::Event;

/// The messaging interface shared by the in-memory and broker-backed
/// substrates.
///
/// All poll operations honor a bounded timeout and return `Ok(None)` when
/// nothing arrived; no call blocks indefinitely.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Take the next document awaiting pipeline processing.
    async fn poll_doc(&self) -> Result<Option<Document>, MessengerError>;

    /// Hand a document to the source channel. Blocks while a bounded source
    /// queue is at capacity; this is the substrate's only backpressure
    /// point.
    async fn send_for_processing(&self, doc: Document) -> Result<(), MessengerError>;

    /// Hand a processed document to the destination channel.
    async fn send_completed(&self, doc: Document) -> Result<(), MessengerError>;

    /// Take the next processed document awaiting indexing.
    async fn poll_completed(&self) -> Result<Option<Document>, MessengerError>;

    /// Emit a lifecycle event.
    async fn send_event(&self, event: Event) -> Result<(), MessengerError>;

    /// Take the next buffered lifecycle event.
    async fn poll_event(&self) -> Result<Option<Event>, MessengerError>;

    /// Whether lifecycle events are still buffered for this run.
    async fn has_events(&self) -> Result<bool, MessengerError>;

    /// Commit source offsets whose documents (and all their children) have
    /// reached terminal states. A no-op for the in-memory substrate.
    async fn commit_pending_offsets(&self) -> Result<(), MessengerError>;

    /// Release transport resources. Idempotent.
    async fn close(&self) -> Result<(), MessengerError>;
}

/// Produces the messenger a component should use.
///
/// Workers in broker mode each need their own messenger (a dedicated
/// consumer with a unique client id); in-memory runs share one instance
/// between every component.
#[async_trait]
pub trait MessengerFactory: Send + Sync {
    /// Create a messenger for one component.
    async fn create(&self) -> Result<Arc<dyn Messenger>, MessengerError>;
}

/// A factory that hands out the same shared messenger to every caller.
pub struct SharedMessengerFactory {
    messenger: Arc<dyn Messenger>,
}

impl SharedMessengerFactory {
    /// Wrap an existing messenger.
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self { messenger }
    }
}

#[async_trait]
impl MessengerFactory for SharedMessengerFactory {
    async fn create(&self) -> Result<Arc<dyn Messenger>, MessengerError> {
        Ok(self.messenger.clone())
    }
}
