//! Execution contexts and cross-thread dispatch.
//!
//! An execution context is an independent scheduler (usually one event loop
//! on its own thread) that subscribers belong to. Delivery actions destined
//! for a context are always handed to it through [`Scheduler::submit`], unless
//! the context is not running or the caller is already on it.

use crate::error::{DispatchError, StationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Identifier of an execution context within a station.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextId {
    /// Auto-assigned or caller-chosen integer.
    Index(u64),
    /// Caller-supplied key.
    Name(String),
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(n) => write!(f, "{n}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

impl From<u64> for ContextId {
    fn from(n: u64) -> Self {
        Self::Index(n)
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self::Name(s.to_string())
    }
}

impl From<String> for ContextId {
    fn from(s: String) -> Self {
        Self::Name(s)
    }
}

/// A single delivery action.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// An ordered run of actions submitted to a scheduler as one unit of work.
#[derive(Default)]
pub struct Batch {
    actions: Vec<Action>,
}

impl Batch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action.
    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Append every action of `other`, keeping its order.
    pub fn append(&mut self, other: Batch) {
        self.actions.extend(other.actions);
    }

    /// Number of actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Check if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run all actions back to back on the current thread.
    pub fn run(self) {
        for action in self.actions {
            action();
        }
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("actions", &self.actions.len())
            .finish()
    }
}

/// Scheduling capability every execution context provides.
///
/// The station only depends on this contract, never on scheduler internals.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Queue `batch` to run on this context's thread. Must be thread-safe and
    /// must run the batch's actions contiguously.
    ///
    /// # Errors
    ///
    /// Returns an error if the context no longer accepts work.
    fn submit(&self, batch: Batch) -> Result<(), DispatchError>;

    /// Whether the context is currently running independently.
    fn is_active(&self) -> bool;

    /// Whether the calling thread is this context's own thread.
    fn is_current(&self) -> bool {
        false
    }
}

/// Deliver `batch` to `scheduler`.
///
/// Fast path: the batch runs inline when there is no scheduler, when the
/// scheduler is not active, or when the caller is already on its thread.
/// This is only sound while no other thread can touch the context's state.
///
/// # Errors
///
/// Propagates submission failures from the scheduler.
pub fn dispatch(scheduler: Option<&Arc<dyn Scheduler>>, batch: Batch) -> Result<(), DispatchError> {
    if batch.is_empty() {
        return Ok(());
    }
    match scheduler {
        Some(scheduler) if scheduler.is_active() && !scheduler.is_current() => {
            trace!(actions = batch.len(), "Submitting batch");
            scheduler.submit(batch)
        }
        _ => {
            trace!(actions = batch.len(), "Running batch inline");
            batch.run();
            Ok(())
        }
    }
}

/// Pointer identity of two scheduler handles.
#[must_use]
pub fn same_scheduler(a: &Arc<dyn Scheduler>, b: &Arc<dyn Scheduler>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// A context that is never independently running: every batch runs on the
/// caller's thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Scheduler for Inline {
    fn submit(&self, batch: Batch) -> Result<(), DispatchError> {
        batch.run();
        Ok(())
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// Reference to an execution context, either by id or by handle.
#[derive(Debug, Clone)]
pub enum ContextRef {
    /// A registered identifier.
    Id(ContextId),
    /// A scheduler handle, compared by pointer identity.
    Handle(Arc<dyn Scheduler>),
}

impl From<ContextId> for ContextRef {
    fn from(id: ContextId) -> Self {
        Self::Id(id)
    }
}

impl From<u64> for ContextRef {
    fn from(n: u64) -> Self {
        Self::Id(ContextId::Index(n))
    }
}

impl From<&str> for ContextRef {
    fn from(s: &str) -> Self {
        Self::Id(ContextId::from(s))
    }
}

impl<S: Scheduler + 'static> From<Arc<S>> for ContextRef {
    fn from(scheduler: Arc<S>) -> Self {
        Self::Handle(scheduler)
    }
}

impl From<Arc<dyn Scheduler>> for ContextRef {
    fn from(scheduler: Arc<dyn Scheduler>) -> Self {
        Self::Handle(scheduler)
    }
}

/// Bidirectional mapping between scheduler handles and context ids.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    entries: Vec<(ContextId, Arc<dyn Scheduler>)>,
    next_index: u64,
}

impl ContextRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `scheduler` under `id`, or under the running maximum integer
    /// id plus one when `id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::AlreadyExists`] if the id is taken, or
    /// [`StationError::InvalidArgument`] when no integer id is left.
    pub fn register(
        &mut self,
        scheduler: Arc<dyn Scheduler>,
        id: Option<ContextId>,
    ) -> Result<ContextId, StationError> {
        let id = match id {
            Some(id) if self.contains(&id) => {
                return Err(StationError::AlreadyExists(format!("execution context {id}")));
            }
            Some(id) => id,
            None => {
                self.ensure_room(1)?;
                ContextId::Index(self.next_index)
            }
        };
        if let ContextId::Index(n) = id {
            self.next_index = self.next_index.max(n.saturating_add(1));
        }
        debug!(context = %id, "Registered execution context");
        self.entries.push((id.clone(), scheduler));
        Ok(id)
    }

    /// Resolve a reference to a registered id without creating anything.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::UnknownContext`] for unknown ids and handles.
    pub fn lookup(&self, context: &ContextRef) -> Result<ContextId, StationError> {
        match context {
            ContextRef::Id(id) if self.contains(id) => Ok(id.clone()),
            ContextRef::Id(id) => Err(StationError::UnknownContext(id.to_string())),
            ContextRef::Handle(scheduler) => self
                .id_of(scheduler)
                .ok_or_else(|| StationError::UnknownContext(format!("{scheduler:?}"))),
        }
    }

    /// Resolve a reference, registering unknown handles when `allow_create`.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::UnknownContext`] if the reference is unknown
    /// and cannot be created. This is the "not found" case for contexts;
    /// [`StationError::NotFound`] is kept for subscription lookups.
    pub fn resolve(
        &mut self,
        context: &ContextRef,
        allow_create: bool,
    ) -> Result<ContextId, StationError> {
        match (self.lookup(context), context) {
            (Ok(id), _) => Ok(id),
            (Err(_), ContextRef::Handle(scheduler)) if allow_create => {
                self.register(Arc::clone(scheduler), None)
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Check that `count` more handles can get auto-assigned integer ids.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::InvalidArgument`] once the integer id space is
    /// used up.
    pub fn ensure_room(&self, count: usize) -> Result<(), StationError> {
        if count == 0 {
            return Ok(());
        }
        let fits = (count as u64 - 1).checked_add(self.next_index).is_some()
            && !self.contains(&ContextId::Index(self.next_index));
        if fits {
            Ok(())
        } else {
            Err(StationError::InvalidArgument(
                "no integer execution context ids left".into(),
            ))
        }
    }

    /// Find the id a handle is registered under.
    #[must_use]
    pub fn id_of(&self, scheduler: &Arc<dyn Scheduler>) -> Option<ContextId> {
        self.entries
            .iter()
            .find(|(_, s)| same_scheduler(s, scheduler))
            .map(|(id, _)| id.clone())
    }

    /// Get the scheduler registered under `id`.
    #[must_use]
    pub fn scheduler(&self, id: &ContextId) -> Option<&Arc<dyn Scheduler>> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == id)
            .map(|(_, s)| s)
    }

    /// Check if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &ContextId) -> bool {
        self.entries.iter().any(|(entry, _)| entry == id)
    }

    /// All ids, in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<ContextId> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Number of registered contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no context is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
