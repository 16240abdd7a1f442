//! Bounded blocking queue used by the in-memory messenger.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::MessengerError;

/// A multi-producer multi-consumer queue with an optional capacity bound.
///
/// `push` suspends while a bounded queue is full; `poll` suspends up to a
/// timeout waiting for an item. Item availability and free capacity are
/// tracked with semaphores so producers and consumers never spin.
pub(crate) struct PollQueue<T> {
    inner: Mutex<VecDeque<T>>,
    items: Semaphore,
    slots: Option<Semaphore>,
}

impl<T> PollQueue<T> {
    /// A queue with no capacity bound.
    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            items: Semaphore::new(0),
            slots: None,
        }
    }

    /// A queue that blocks producers once `capacity` items are waiting.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            items: Semaphore::new(0),
            slots: Some(Semaphore::new(capacity)),
        }
    }

    /// Add an item, waiting for a free slot when bounded.
    pub async fn push(&self, item: T) -> Result<(), MessengerError> {
        if let Some(slots) = &self.slots {
            let permit = slots
                .acquire()
                .await
                .map_err(|_| MessengerError::Closed)?;
            permit.forget();
        }
        self.inner.lock().push_back(item);
        self.items.add_permits(1);
        Ok(())
    }

    /// Take the next item, waiting up to `timeout`. Returns `None` on
    /// timeout.
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        let permit = tokio::time::timeout(timeout, self.items.acquire())
            .await
            .ok()?
            .ok()?;
        permit.forget();
        let item = self.inner.lock().pop_front();
        if let Some(slots) = &self.slots {
            slots.add_permits(1);
        }
        item
    }

    /// Number of items currently waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
