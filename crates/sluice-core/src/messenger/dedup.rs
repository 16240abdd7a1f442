//! Holding area that shields workers from broker redeliveries.
//!
//! A record redelivered during a consumer-group rebalance would otherwise
//! be processed twice. Newly polled documents wait here, keyed by their
//! source (topic, partition, offset); a duplicate arriving while the
//! original is held is dropped. Documents are released to the worker only
//! after the configured delay, giving a rebalance time to settle. The
//! window only covers held documents; scope is the owning messenger
//! instance, not the process.

#![cfg_attr(not(feature = "kafka"), allow(dead_code))]

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::document::{Document, SourceOffset};

struct HeldDocument {
    ready_at: Instant,
    doc: Document,
}

#[derive(Default)]
struct Holding {
    entries: VecDeque<HeldDocument>,
    keys: HashSet<SourceOffset>,
}

/// Expiring holding area for freshly polled broker documents.
pub(crate) struct DeduplicationQueue {
    delay: Duration,
    inner: Mutex<Holding>,
}

impl DeduplicationQueue {
    /// A queue that releases documents `delay` after they were offered.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: Mutex::new(Holding::default()),
        }
    }

    /// Offer a freshly polled document. A document whose source offset is
    /// already held is a redelivery and is dropped.
    pub fn offer(&self, doc: Document) {
        let mut holding = self.inner.lock();
        if let Some(key) = doc.source_offset() {
            if holding.keys.contains(key) {
                debug!(
                    document_id = doc.id(),
                    topic = key.topic.as_str(),
                    partition = key.partition,
                    offset = key.offset,
                    "dropping redelivered document"
                );
                return;
            }
            holding.keys.insert(key.clone());
        }
        holding.entries.push_back(HeldDocument {
            ready_at: Instant::now() + self.delay,
            doc,
        });
    }

    /// Release the next document whose delay has elapsed, if any.
    pub fn poll_ready(&self) -> Option<Document> {
        let mut holding = self.inner.lock();
        let ready = matches!(
            holding.entries.front(),
            Some(entry) if entry.ready_at <= Instant::now()
        );
        if !ready {
            return None;
        }
        let entry = holding.entries.pop_front()?;
        if let Some(key) = entry.doc.source_offset() {
            holding.keys.remove(key);
        }
        Some(entry.doc)
    }

    /// Number of documents currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
