//! Bounded drop-oldest queues.
//!
//! When a finite-capacity queue is full, [`Queue::push`] evicts the oldest
//! items one at a time until the new item fits. A capacity of `0` means the
//! queue is unbounded and never drops.
//!
//! Two counters are kept:
//!
//! - **dropped** - items evicted to make room
//! - **delivered** - pushes that fit without evicting anything
//!
//! Neither counter is decremented by [`Queue::pop`]; `delivered` is a
//! lifetime count, not the current backlog.

use crate::context::{same_scheduler, Scheduler};
use crate::subscription::SubscriberId;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Shared<M> {
    items: Mutex<VecDeque<M>>,
    capacity: usize,
    dropped: AtomicU64,
    delivered: AtomicU64,
    id: RwLock<Option<SubscriberId>>,
    ready: Notify,
}

/// A shared FIFO with a drop-oldest overflow policy.
///
/// Clones share the same buffer, counters and subscriber id. The name, the
/// drop warning flag and the context binding belong to each handle: set
/// them with the builders before the handle is cloned or subscribed.
pub struct Queue<M> {
    shared: Arc<Shared<M>>,
    name: Option<Arc<str>>,
    warn: bool,
    context: Option<Arc<dyn Scheduler>>,
}

impl<M> Queue<M> {
    /// Create a queue holding at most `capacity` items (`0` = unbounded).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::new()),
                capacity,
                dropped: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                id: RwLock::new(None),
                ready: Notify::new(),
            }),
            name: None,
            warn: true,
            context: None,
        }
    }

    /// Create an unbounded queue.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Give the queue a name, used in drop warnings.
    #[must_use]
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Do not log a warning when pushes evict items.
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.warn = false;
        self
    }

    /// Bind the queue to an execution context.
    #[must_use]
    pub fn bound_to(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.context = Some(scheduler);
        self
    }

    /// Push an item, evicting the oldest items while the queue is full.
    ///
    /// Returns the number of evicted items.
    pub fn push(&self, item: M) -> u64 {
        let evicted = {
            let mut items = self.shared.items.lock();
            let mut evicted = 0;
            if self.shared.capacity > 0 {
                while items.len() >= self.shared.capacity && items.pop_front().is_some() {
                    evicted += 1;
                }
            }
            items.push_back(item);
            evicted
        };

        if evicted > 0 {
            self.shared.dropped.fetch_add(evicted, Ordering::Relaxed);
        } else {
            self.shared.delivered.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.ready.notify_one();
        evicted
    }

    /// Take the oldest item, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<M> {
        self.shared.items.lock().pop_front()
    }

    /// Wait for the next item.
    pub async fn recv(&self) -> M {
        loop {
            if let Some(item) = self.pop() {
                return item;
            }
            self.shared.ready.notified().await;
        }
    }

    /// Remove and return every queued item, oldest first.
    pub fn drain(&self) -> Vec<M> {
        self.shared.items.lock().drain(..).collect()
    }

    /// Discard every queued item. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut items = self.shared.items.lock();
        let count = items.len();
        items.clear();
        count
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.items.lock().len()
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.items.lock().is_empty()
    }

    /// Maximum number of items (`0` = unbounded).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Items evicted to make room since creation or the last reset.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Pushes that fit without evicting, since creation or the last reset.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Zero both counters.
    pub fn reset_counters(&self) {
        self.shared.dropped.store(0, Ordering::Relaxed);
        self.shared.delivered.store(0, Ordering::Relaxed);
    }

    /// Subscriber id assigned by the station, if any.
    #[must_use]
    pub fn id(&self) -> Option<SubscriberId> {
        self.shared.id.read().clone()
    }

    pub(crate) fn set_id(&self, id: SubscriberId) {
        *self.shared.id.write() = Some(id);
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether evictions are logged.
    #[must_use]
    pub fn warns(&self) -> bool {
        self.warn
    }

    /// Execution context the queue is bound to.
    #[must_use]
    pub fn context(&self) -> Option<&Arc<dyn Scheduler>> {
        self.context.as_ref()
    }

    /// Check if the queue is bound to `scheduler`.
    #[must_use]
    pub fn is_bound_to(&self, scheduler: &Arc<dyn Scheduler>) -> bool {
        self.context
            .as_ref()
            .is_some_and(|own| same_scheduler(own, scheduler))
    }

    /// Check if two handles share the same buffer.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<M> Clone for Queue<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            name: self.name.clone(),
            warn: self.warn,
            context: self.context.clone(),
        }
    }
}

impl<M> fmt::Debug for Queue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.shared.capacity)
            .field("dropped", &self.dropped())
            .field("delivered", &self.delivered())
            .finish()
    }
}
