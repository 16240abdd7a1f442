//! Source-offset bookkeeping for broker mode.
//!
//! A source offset may be committed only after the document read from it,
//! and every child that document fanned out into, has reached a terminal
//! state. The ledger counts outstanding terminal events per source offset
//! and surfaces offsets as committable once the count drains to zero.

#![cfg_attr(not(feature = "kafka"), allow(dead_code))]

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::document::{Document, SourceOffset};
use crate::event::Event;

#[derive(Default)]
struct LedgerInner {
    /// Document id → the source offset it is accounted against.
    offsets_by_doc: HashMap<String, SourceOffset>,
    /// Source offset → terminal events still outstanding.
    pending: HashMap<SourceOffset, usize>,
    /// Offsets whose documents have fully settled, awaiting commit.
    committable: Vec<SourceOffset>,
}

/// Tracks which source offsets are safe to commit.
#[derive(Default)]
pub(crate) struct OffsetLedger {
    inner: Mutex<LedgerInner>,
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account a freshly polled source document: one terminal event is now
    /// outstanding for its offset.
    pub fn track(&self, doc: &Document) {
        let Some(offset) = doc.source_offset() else {
            return;
        };
        let mut inner = self.inner.lock();
        inner
            .offsets_by_doc
            .insert(doc.id().to_string(), offset.clone());
        *inner.pending.entry(offset.clone()).or_insert(0) += 1;
    }

    /// Account a pipeline result. The source document itself is already
    /// tracked; a child adds one more outstanding terminal event to its
    /// parent's offset.
    pub fn track_result(&self, doc: &Document) {
        let Some(offset) = doc.source_offset() else {
            return;
        };
        let mut inner = self.inner.lock();
        if inner.offsets_by_doc.contains_key(doc.id()) {
            return;
        }
        inner
            .offsets_by_doc
            .insert(doc.id().to_string(), offset.clone());
        *inner.pending.entry(offset.clone()).or_insert(0) += 1;
    }

    /// Observe a lifecycle event. Terminal events drain the pending count
    /// of the document's offset; at zero the offset becomes committable.
    pub fn observe(&self, event: &Event) {
        if !event.is_terminal() {
            return;
        }
        let mut inner = self.inner.lock();
        let Some(offset) = inner.offsets_by_doc.remove(&event.document_id) else {
            return;
        };
        if let Some(count) = inner.pending.get_mut(&offset) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.pending.remove(&offset);
                inner.committable.push(offset);
            }
        }
    }

    /// Drain the offsets that are now safe to commit.
    pub fn take_committable(&self) -> Vec<SourceOffset> {
        std::mem::take(&mut self.inner.lock().committable)
    }

    /// Number of offsets with outstanding terminal events.
    pub fn pending_offsets(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_at(id: &str, offset: i64) -> Document {
        let mut doc = Document::new(id).unwrap();
        doc.set_source_offset(SourceOffset {
            topic: "sluice.source.test".to_string(),
            partition: 0,
            offset,
        });
        doc
    }

    #[test]
    fn offset_commits_only_after_parent_and_children_settle() {
        let ledger = OffsetLedger::new();
        let parent = doc_at("d1", 42);
        ledger.track(&parent);

        // The parent flows through the pipeline and emits two children,
        // all sharing source offset 42.
        ledger.track_result(&parent);
        ledger.track_result(&doc_at("d1-c1", 42));
        ledger.track_result(&doc_at("d1-c2", 42));

        ledger.observe(&Event::finish("d1", "run-1"));
        assert!(ledger.take_committable().is_empty());

        ledger.observe(&Event::finish("d1-c1", "run-1"));
        assert!(ledger.take_committable().is_empty());

        ledger.observe(&Event::finish("d1-c2", "run-1"));
        let committable = ledger.take_committable();
        assert_eq!(committable.len(), 1);
        assert_eq!(committable[0].offset, 42);
        assert_eq!(ledger.pending_offsets(), 0);
    }

    #[test]
    fn fail_events_settle_offsets_too() {
        let ledger = OffsetLedger::new();
        ledger.track(&doc_at("bad", 7));
        ledger.observe(&Event::fail("bad", "run-1", "stage failed"));
        assert_eq!(ledger.take_committable().len(), 1);
    }

    #[test]
    fn create_events_do_not_settle() {
        let ledger = OffsetLedger::new();
        ledger.track(&doc_at("d1", 7));
        ledger.observe(&Event::create("d1", "run-1"));
        assert!(ledger.take_committable().is_empty());
    }

    #[test]
    fn unknown_documents_are_ignored() {
        let ledger = OffsetLedger::new();
        ledger.observe(&Event::finish("nobody", "run-1"));
        assert!(ledger.take_committable().is_empty());
    }

    #[test]
    fn independent_offsets_settle_independently() {
        let ledger = OffsetLedger::new();
        ledger.track(&doc_at("a", 1));
        ledger.track(&doc_at("b", 2));

        ledger.observe(&Event::finish("b", "run-1"));
        let committable = ledger.take_committable();
        assert_eq!(committable.len(), 1);
        assert_eq!(committable[0].offset, 2);
        assert_eq!(ledger.pending_offsets(), 1);
    }
}
