//! Per-subscriber bounded fan-out.
//!
//! Each subscriber owns its own queue. Publishing never waits: when a queue
//! is full its oldest event is discarded and counted, so a stalled reader
//! costs at most `capacity` events of memory and never delays the others.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::types::ThreadEvent;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Slot {
    id: u64,
    capacity: usize,
    queue: Mutex<VecDeque<ThreadEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Slot {
    fn push(&self, event: ThreadEvent) {
        let mut queue = lock(&self.queue);
        if queue.len() >= self.capacity {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 {
                tracing::warn!(subscriber = self.id, "subscriber lagging; dropping oldest events");
            } else {
                tracing::debug!(subscriber = self.id, dropped, "subscriber dropped event");
            }
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Registry of live subscribers for one engine.
pub(crate) struct SubscriberHub {
    capacity: usize,
    next_id: AtomicU64,
    slots: Mutex<Vec<Arc<Slot>>>,
}

impl SubscriberHub {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            slots: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, cancel: Option<CancellationToken>) -> Subscription {
        let slot = Arc::new(Slot {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            capacity: self.capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        lock(&self.slots).push(slot.clone());
        Subscription { slot, cancel }
    }

    /// Deliver `event` to every open subscriber.
    pub(crate) fn publish(&self, event: &ThreadEvent) {
        let mut slots = lock(&self.slots);
        slots.retain(|slot| !slot.is_closed());
        for slot in slots.iter() {
            slot.push(event.clone());
        }
    }

    pub(crate) fn close_all(&self) {
        for slot in lock(&self.slots).drain(..) {
            slot.close();
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.slots).iter().filter(|s| !s.is_closed()).count()
    }
}

/// An independent view of a thread's live events.
///
/// Buffered events remain readable after the engine is disposed; `recv`
/// returns `None` once the buffer is drained and the subscription closed.
pub struct Subscription {
    slot: Arc<Slot>,
    cancel: Option<CancellationToken>,
}

impl Subscription {
    /// Next event, or `None` when closed or cancelled.
    pub async fn recv(&mut self) -> Option<ThreadEvent> {
        loop {
            if let Some(event) = lock(&self.slot.queue).pop_front() {
                return Some(event);
            }
            if self.slot.is_closed() {
                return None;
            }
            match &self.cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.slot.close();
                            return None;
                        }
                        _ = self.slot.notify.notified() => {}
                    }
                }
                None => self.slot.notify.notified().await,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ThreadEvent> {
        lock(&self.slot.queue).pop_front()
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    /// Events currently buffered.
    pub fn buffered(&self) -> usize {
        lock(&self.slot.queue).len()
    }

    pub fn into_stream(mut self) -> impl Stream<Item = ThreadEvent> + Send {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.close();
    }
}
