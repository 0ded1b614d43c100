//! Per-channel fan-out.
//!
//! A [`Transmitter`] owns the ordered list of receptors (queues or signals)
//! attached to one channel and turns a single event into a [`Plan`]: one
//! ordered [`Batch`] of delivery actions per execution context. Plans from
//! several transmitters can be merged before dispatch, which is how the
//! station makes multi-channel broadcasts contiguous per context.

use crate::context::{dispatch, Action, Batch, ContextId, Scheduler};
use crate::error::DispatchError;
use crate::queue::Queue;
use crate::signal::{Signal, SignalOp};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Something a transmitter can deliver events to.
pub trait Receptor: Clone + Send + Sync + 'static {
    /// Event delivered by the transmitter.
    type Event: Clone + Send + 'static;

    /// Called once when the receptor is attached.
    fn prepare(&self) {}

    /// Apply one event. `transmitter` names the sender for diagnostics.
    fn deliver(&self, transmitter: &str, event: Self::Event);

    /// Identity comparison used by [`Transmitter::detach`].
    fn same(&self, other: &Self) -> bool;
}

impl<M> Receptor for Queue<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Event = M;

    fn prepare(&self) {
        self.reset_counters();
    }

    fn deliver(&self, transmitter: &str, item: M) {
        let dropped = self.push(item);
        if dropped > 0 && self.warns() {
            warn!(
                transmitter,
                dropped,
                queue = ?self.id(),
                name = self.name().unwrap_or(""),
                "Discarded queued items to make room"
            );
        }
    }

    fn same(&self, other: &Self) -> bool {
        Queue::same(self, other)
    }
}

impl Receptor for Signal {
    type Event = SignalOp;

    fn deliver(&self, _transmitter: &str, op: SignalOp) {
        self.apply(op);
    }

    fn same(&self, other: &Self) -> bool {
        Signal::same(self, other)
    }
}

/// Where a receptor's deliveries run.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Execution context the receptor is registered under.
    pub context: ContextId,
    /// Scheduler to submit to; `None` delivers inline on the caller.
    pub scheduler: Option<Arc<dyn Scheduler>>,
}

impl Binding {
    fn lane(&self) -> Option<ContextId> {
        self.scheduler.as_ref().map(|_| self.context.clone())
    }
}

struct Lane {
    scheduler: Option<Arc<dyn Scheduler>>,
    batch: Batch,
}

/// Delivery actions grouped by execution context.
///
/// Receptors without a scheduler share the inline lane.
#[derive(Default)]
pub struct Plan {
    lanes: HashMap<Option<ContextId>, Lane>,
}

impl Plan {
    /// Create an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action to the lane of `binding`.
    pub fn push(&mut self, binding: &Binding, action: Action) {
        self.lanes
            .entry(binding.lane())
            .or_insert_with(|| Lane {
                scheduler: binding.scheduler.clone(),
                batch: Batch::new(),
            })
            .batch
            .push(action);
    }

    /// Append every lane of `other` after this plan's actions.
    pub fn merge(&mut self, other: Plan) {
        for (key, lane) in other.lanes {
            match self.lanes.get_mut(&key) {
                Some(existing) => existing.batch.append(lane.batch),
                None => {
                    self.lanes.insert(key, lane);
                }
            }
        }
    }

    /// Number of execution contexts touched.
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Total number of actions.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.lanes.values().map(|lane| lane.batch.len()).sum()
    }

    /// Check if the plan has no actions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.action_count() == 0
    }

    /// Hand each lane to its scheduler as one unit of work.
    ///
    /// Every lane is attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first submission failure.
    pub fn dispatch(self) -> Result<(), DispatchError> {
        let mut failure = None;
        for (context, lane) in self.lanes {
            if let Err(e) = dispatch(lane.scheduler.as_ref(), lane.batch) {
                warn!(context = ?context, error = %e, "Dispatch failed");
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.lanes.iter().map(|(k, lane)| (k, lane.batch.len())))
            .finish()
    }
}

struct Entry<R> {
    receptor: R,
    binding: Binding,
}

/// Fan-out engine for one channel.
pub struct Transmitter<R: Receptor> {
    name: Arc<str>,
    entries: Vec<Entry<R>>,
}

/// Transmitter of queued messages.
pub type QueueTransmitter<M> = Transmitter<Queue<M>>;

/// Transmitter of signal operations.
pub type SignalTransmitter = Transmitter<Signal>;

impl<R: Receptor> Transmitter<R> {
    /// Create a transmitter with no receptors.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Get the transmitter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prepare `receptor` and append it.
    pub fn attach(&mut self, receptor: R, binding: Binding) {
        receptor.prepare();
        self.entries.push(Entry { receptor, binding });
    }

    /// Remove the first entry for `receptor` registered under `context`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn detach(&mut self, receptor: &R, context: &ContextId) -> bool {
        let position = self
            .entries
            .iter()
            .position(|e| e.receptor.same(receptor) && &e.binding.context == context);
        match position {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of attached receptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no receptor is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the delivery plan for `event` without running anything.
    #[must_use]
    pub fn plan(&self, event: &R::Event) -> Plan {
        let mut plan = Plan::new();
        for entry in &self.entries {
            let receptor = entry.receptor.clone();
            let event = event.clone();
            let name = Arc::clone(&self.name);
            plan.push(
                &entry.binding,
                Box::new(move || receptor.deliver(&name, event)),
            );
        }
        plan
    }

    /// Deliver `event` to every receptor, dispatching per context.
    ///
    /// # Errors
    ///
    /// Returns the first submission failure.
    pub fn fire(&self, event: R::Event) -> Result<(), DispatchError> {
        self.plan(&event).dispatch()
    }
}

impl<R: Receptor> fmt::Debug for Transmitter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmitter")
            .field("name", &self.name)
            .field("receptors", &self.entries.len())
            .finish()
    }
}
