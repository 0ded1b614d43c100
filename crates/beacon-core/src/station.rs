//! The station: channel registry and broadcast entry point.
//!
//! A [`Station`] owns every channel, the execution context registry and the
//! (channel, context, id) subscription table. Each channel has one queue
//! transmitter and one signal transmitter.
//!
//! ## Locking
//!
//! Subscription mutation and the merge step of [`Station::broadcast_batch`]
//! run under one coarse lock. The registry lock and channel guards are never
//! held at the same time, and no lock is held while dispatching.

use crate::config::StationConfig;
use crate::context::{same_scheduler, ContextId, ContextRef, ContextRegistry, Scheduler};
use crate::error::{Result, StationError};
use crate::message::Message;
use crate::queue::Queue;
use crate::signal::{Signal, SignalOp};
use crate::subscription::{BatchInstruction, Provision, SubscribeOptions, SubscriberId, Subscription};
use crate::transmitter::{Binding, Plan, QueueTransmitter, SignalTransmitter};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// A channel identifier.
pub type ChannelId = String;

/// Transmitters and subscription table of one channel.
struct ChannelEntry<M>
where
    M: Clone + Send + Sync + 'static,
{
    queues: QueueTransmitter<M>,
    signals: SignalTransmitter,
    default_capacity: Option<usize>,
    subscriptions: HashMap<ContextId, BTreeMap<SubscriberId, Subscription<M>>>,
}

impl<M> ChannelEntry<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn new(station: &str, default_capacity: Option<usize>) -> Self {
        Self {
            queues: QueueTransmitter::new(format!("{station}[QT]")),
            signals: SignalTransmitter::new(format!("{station}[ST]")),
            default_capacity,
            subscriptions: HashMap::new(),
        }
    }

    fn contains(&self, context: &ContextId, id: &SubscriberId) -> bool {
        self.subscriptions
            .get(context)
            .is_some_and(|subs| subs.contains_key(id))
    }

    /// One id for all `targets`: the largest integer id among them plus one.
    fn next_id(&self, targets: &[ContextId]) -> Result<SubscriberId> {
        let largest = targets
            .iter()
            .filter_map(|context| self.subscriptions.get(context))
            .flat_map(BTreeMap::keys)
            .filter_map(SubscriberId::as_index)
            .max();
        match largest {
            None => Ok(SubscriberId::Index(0)),
            Some(n) => n.checked_add(1).map(SubscriberId::Index).ok_or_else(|| {
                StationError::InvalidArgument("no integer subscriber ids left".into())
            }),
        }
    }

    fn subscription_count(&self) -> usize {
        self.subscriptions.values().map(BTreeMap::len).sum()
    }
}

/// The broadcast registry.
///
/// Shared by reference (typically in an `Arc`) between producers and every
/// execution context's thread.
pub struct Station<M = Message>
where
    M: Clone + Send + Sync + 'static,
{
    name: String,
    default_capacity: usize,
    channels: DashMap<ChannelId, ChannelEntry<M>>,
    contexts: RwLock<ContextRegistry>,
    lock: Mutex<()>,
}

impl<M> Station<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// Create a station whose default queues are unbounded.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_default_capacity(name, 0)
    }

    /// Create a station with a default queue capacity (`0` = unbounded).
    #[must_use]
    pub fn with_default_capacity(name: impl Into<String>, default_capacity: usize) -> Self {
        let name = name.into();
        info!(station = %name, default_capacity, "Creating station");
        Self {
            name,
            default_capacity,
            channels: DashMap::new(),
            contexts: RwLock::new(ContextRegistry::new()),
            lock: Mutex::new(()),
        }
    }

    /// Build a station from a seed configuration.
    ///
    /// `contexts` are registered first, under `config.contexts` ids when
    /// given, then channels are declared and subscriptions created in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the ids do not match the contexts or any
    /// declaration or subscription fails.
    pub fn from_config(config: &StationConfig, contexts: &[Arc<dyn Scheduler>]) -> Result<Self> {
        if !config.contexts.is_empty() && config.contexts.len() != contexts.len() {
            return Err(StationError::InvalidArgument(format!(
                "{} context ids configured for {} execution contexts",
                config.contexts.len(),
                contexts.len()
            )));
        }

        let station = Self::with_default_capacity(&config.name, config.default_queue_capacity);
        for (index, scheduler) in contexts.iter().enumerate() {
            station.add_context(Arc::clone(scheduler), config.contexts.get(index).cloned())?;
        }
        for channel in &config.channels {
            station.declare_channel(&channel.name, channel.default_queue_capacity)?;
            for subscriber in &channel.subscribers {
                station.subscribe(&channel.name, subscriber.to_options())?;
            }
        }
        Ok(station)
    }

    /// Get the station name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the station-wide default queue capacity.
    #[must_use]
    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    // ---- execution contexts ----

    /// Register an execution context.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::AlreadyExists`] if `id` is taken.
    pub fn add_context(
        &self,
        scheduler: Arc<dyn Scheduler>,
        id: Option<ContextId>,
    ) -> Result<ContextId> {
        self.contexts.write().register(scheduler, id)
    }

    /// Resolve a context reference, registering unknown handles when
    /// `allow_create`.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::UnknownContext`] if it cannot be resolved.
    pub fn resolve_context(
        &self,
        context: impl Into<ContextRef>,
        allow_create: bool,
    ) -> Result<ContextId> {
        self.contexts.write().resolve(&context.into(), allow_create)
    }

    /// All registered context ids, in registration order.
    #[must_use]
    pub fn context_ids(&self) -> Vec<ContextId> {
        self.contexts.read().ids()
    }

    /// Scheduler registered under `id`.
    #[must_use]
    pub fn scheduler(&self, id: &ContextId) -> Option<Arc<dyn Scheduler>> {
        self.contexts.read().scheduler(id).cloned()
    }

    // ---- channels ----

    /// Declare a channel.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::AlreadyExists`] if the name is taken.
    pub fn declare_channel(&self, name: &str, default_capacity: Option<usize>) -> Result<()> {
        let _guard = self.lock.lock();
        match self.channels.entry(name.to_string()) {
            Entry::Occupied(_) => Err(StationError::AlreadyExists(format!("channel {name:?}"))),
            Entry::Vacant(slot) => {
                slot.insert(ChannelEntry::new(&self.name, default_capacity));
                debug!(station = %self.name, channel = %name, "Declared channel");
                Ok(())
            }
        }
    }

    /// Check if a channel was declared.
    #[must_use]
    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Get all channel names.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of subscriptions on a channel across all contexts.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|e| e.subscription_count())
            .unwrap_or(0)
    }

    // ---- subscriptions ----

    /// Subscribe to a channel on one or more execution contexts.
    ///
    /// Targets are `options.contexts` when given; otherwise the context a
    /// supplied queue or signal is bound to; otherwise every registered
    /// context. Unknown handles are registered on the fly.
    ///
    /// The call is all-or-nothing: every check runs before anything is
    /// attached.
    ///
    /// # Errors
    ///
    /// - [`StationError::UnknownChannel`] if the channel was never declared
    /// - [`StationError::ContextMismatch`] if a supplied queue or signal is
    ///   bound to another context
    /// - [`StationError::AlreadyExists`] if the key is taken on any target
    /// - [`StationError::InvalidArgument`] if both kinds are suppressed or no
    ///   integer id is left
    pub fn subscribe(
        &self,
        channel: &str,
        options: SubscribeOptions<M>,
    ) -> Result<HashMap<ContextId, Subscription<M>>> {
        let SubscribeOptions {
            id,
            queue,
            signal,
            capacity,
            contexts,
        } = options;

        if queue.is_suppressed() && signal.is_suppressed() {
            return Err(StationError::InvalidArgument(
                "subscription needs a queue or a signal".into(),
            ));
        }

        let queue_context = queue.provided().and_then(|q| q.context().cloned());
        let signal_context = signal.provided().and_then(|s| s.context().cloned());
        if let (Some(q), Some(s)) = (&queue_context, &signal_context) {
            if !same_scheduler(q, s) {
                return Err(StationError::ContextMismatch(
                    "queue and signal are bound to different execution contexts".into(),
                ));
            }
        }

        let _guard = self.lock.lock();
        if !self.channels.contains_key(channel) {
            return Err(StationError::UnknownChannel(channel.to_string()));
        }

        let targets = self.resolve_targets(contexts, queue_context.or(signal_context))?;
        if targets.is_empty() {
            warn!(station = %self.name, channel = %channel, "No execution context to subscribe on");
            return Ok(HashMap::new());
        }

        let (id, capacity) = {
            let entry = self
                .channels
                .get(channel)
                .ok_or_else(|| StationError::UnknownChannel(channel.to_string()))?;

            let known: Vec<ContextId> = targets.iter().filter_map(|(c, _)| c.clone()).collect();
            let id = match id {
                Some(id) => id,
                None => entry.next_id(&known)?,
            };

            for (context, scheduler) in &targets {
                let label = context
                    .as_ref()
                    .map_or_else(|| format!("{scheduler:?}"), ToString::to_string);
                if queue.provided().is_some_and(|q| q.context().is_some() && !q.is_bound_to(scheduler)) {
                    return Err(StationError::ContextMismatch(format!(
                        "supplied queue is not bound to execution context {label}"
                    )));
                }
                if signal.provided().is_some_and(|s| s.context().is_some() && !s.is_bound_to(scheduler)) {
                    return Err(StationError::ContextMismatch(format!(
                        "supplied signal is not bound to execution context {label}"
                    )));
                }
                if context.as_ref().is_some_and(|c| entry.contains(c, &id)) {
                    return Err(StationError::AlreadyExists(format!(
                        "subscription {id} on channel {channel:?} (context {label})"
                    )));
                }
            }

            let capacity = capacity
                .or(entry.default_capacity)
                .unwrap_or(self.default_capacity);
            (id, capacity)
        };

        // Every check passed: register new handles, then attach.
        let targets: Vec<(ContextId, Arc<dyn Scheduler>)> = {
            let mut registry = self.contexts.write();
            targets
                .into_iter()
                .map(|(context, scheduler)| match context {
                    Some(context) => Ok((context, scheduler)),
                    None => registry
                        .resolve(&ContextRef::Handle(Arc::clone(&scheduler)), true)
                        .map(|context| (context, scheduler)),
                })
                .collect::<Result<_>>()?
        };

        let mut entry = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| StationError::UnknownChannel(channel.to_string()))?;
        let entry = &mut *entry;

        let mut created = HashMap::with_capacity(targets.len());
        for (context, scheduler) in targets {
            let queue = match &queue {
                Provision::Suppress => None,
                Provision::Default => Some(Queue::new(capacity).bound_to(Arc::clone(&scheduler))),
                Provision::Provided(q) => Some(q.clone()),
            };
            let signal = match &signal {
                Provision::Suppress => None,
                Provision::Default => Some(Signal::new().bound_to(Arc::clone(&scheduler))),
                Provision::Provided(s) => Some(s.clone()),
            };

            if let Some(q) = &queue {
                q.set_id(id.clone());
                entry.queues.attach(
                    q.clone(),
                    Binding {
                        context: context.clone(),
                        scheduler: Some(Arc::clone(&scheduler)),
                    },
                );
            }
            if let Some(s) = &signal {
                s.set_id(id.clone());
                entry.signals.attach(
                    s.clone(),
                    Binding {
                        context: context.clone(),
                        scheduler: Some(Arc::clone(&scheduler)),
                    },
                );
            }

            let subscription = Subscription {
                channel: channel.to_string(),
                context: context.clone(),
                id: id.clone(),
                queue,
                signal,
            };
            entry
                .subscriptions
                .entry(context.clone())
                .or_default()
                .insert(id.clone(), subscription.clone());

            debug!(
                station = %self.name,
                channel = %channel,
                context = %context,
                id = %id,
                queue = subscription.queue.is_some(),
                signal = subscription.signal.is_some(),
                "Subscribed"
            );
            created.insert(context, subscription);
        }

        Ok(created)
    }

    /// Targets of a subscribe call, deduplicated by handle. Unknown handles
    /// come back without an id and are not registered yet.
    fn resolve_targets(
        &self,
        contexts: Option<Vec<ContextRef>>,
        bound: Option<Arc<dyn Scheduler>>,
    ) -> Result<Vec<(Option<ContextId>, Arc<dyn Scheduler>)>> {
        let registry = self.contexts.read();
        let refs = match (contexts, bound) {
            (Some(refs), _) => refs,
            (None, Some(bound)) => vec![ContextRef::Handle(bound)],
            (None, None) => registry.ids().into_iter().map(ContextRef::Id).collect(),
        };

        let mut targets: Vec<(Option<ContextId>, Arc<dyn Scheduler>)> =
            Vec::with_capacity(refs.len());
        for context in refs {
            let (id, scheduler) = match context {
                ContextRef::Id(id) => {
                    let scheduler = registry
                        .scheduler(&id)
                        .cloned()
                        .ok_or_else(|| StationError::UnknownContext(id.to_string()))?;
                    (Some(id), scheduler)
                }
                ContextRef::Handle(scheduler) => (registry.id_of(&scheduler), scheduler),
            };
            if !targets.iter().any(|(_, s)| same_scheduler(s, &scheduler)) {
                targets.push((id, scheduler));
            }
        }

        registry.ensure_room(targets.iter().filter(|(id, _)| id.is_none()).count())?;
        Ok(targets)
    }

    /// Subscribe with a queue only. Returns the queue per context.
    ///
    /// # Errors
    ///
    /// Same as [`Station::subscribe`].
    pub fn subscribe_queue(
        &self,
        channel: &str,
        options: SubscribeOptions<M>,
    ) -> Result<HashMap<ContextId, Queue<M>>> {
        let options = SubscribeOptions {
            signal: Provision::Suppress,
            ..options
        };
        Ok(self
            .subscribe(channel, options)?
            .into_iter()
            .filter_map(|(context, sub)| sub.queue.map(|q| (context, q)))
            .collect())
    }

    /// Subscribe with a signal only. Returns the signal per context.
    ///
    /// # Errors
    ///
    /// Same as [`Station::subscribe`].
    pub fn subscribe_signal(
        &self,
        channel: &str,
        options: SubscribeOptions<M>,
    ) -> Result<HashMap<ContextId, Signal>> {
        let options = SubscribeOptions {
            queue: Provision::Suppress,
            ..options
        };
        Ok(self
            .subscribe(channel, options)?
            .into_iter()
            .filter_map(|(context, sub)| sub.signal.map(|s| (context, s)))
            .collect())
    }

    /// Remove the subscription `id` on the given contexts (all contexts when
    /// `None`). Missing keys are ignored.
    ///
    /// Returns the number of subscriptions removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel or a context is unknown.
    pub fn unsubscribe(
        &self,
        channel: &str,
        id: &SubscriberId,
        contexts: Option<&[ContextRef]>,
    ) -> Result<usize> {
        let _guard = self.lock.lock();
        if !self.channels.contains_key(channel) {
            return Err(StationError::UnknownChannel(channel.to_string()));
        }

        let targets = {
            let registry = self.contexts.read();
            match contexts {
                Some(refs) => refs
                    .iter()
                    .map(|r| registry.lookup(r))
                    .collect::<Result<Vec<_>>>()?,
                None => registry.ids(),
            }
        };

        let mut entry = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| StationError::UnknownChannel(channel.to_string()))?;
        let entry = &mut *entry;

        let mut removed = 0;
        for context in &targets {
            let Some(subscription) = entry
                .subscriptions
                .get_mut(context)
                .and_then(|subs| subs.remove(id))
            else {
                continue;
            };
            if let Some(queue) = &subscription.queue {
                entry.queues.detach(queue, context);
            }
            if let Some(signal) = &subscription.signal {
                entry.signals.detach(signal, context);
            }
            removed += 1;
            debug!(station = %self.name, channel = %channel, context = %context, id = %id, "Unsubscribed");
        }
        entry.subscriptions.retain(|_, subs| !subs.is_empty());

        Ok(removed)
    }

    /// Look up subscriptions on one context: all of them when `ids` is
    /// `None`, otherwise exactly the requested ones, in order.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::NotFound`] if a requested id is missing.
    pub fn get(
        &self,
        channel: &str,
        context: impl Into<ContextRef>,
        ids: Option<&[SubscriberId]>,
    ) -> Result<Vec<Subscription<M>>> {
        let context = self.contexts.read().lookup(&context.into())?;
        let entry = self
            .channels
            .get(channel)
            .ok_or_else(|| StationError::UnknownChannel(channel.to_string()))?;
        let subs = entry.subscriptions.get(&context);

        match ids {
            None => Ok(subs
                .map(|s| s.values().cloned().collect())
                .unwrap_or_default()),
            Some(ids) => ids
                .iter()
                .map(|id| {
                    subs.and_then(|s| s.get(id)).cloned().ok_or_else(|| {
                        StationError::NotFound(format!(
                            "subscription {id} on channel {channel:?} (context {context})"
                        ))
                    })
                })
                .collect(),
        }
    }

    /// Get the queue of one subscription.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::NotFound`] if the subscription is missing or
    /// has no queue.
    pub fn get_queue(
        &self,
        channel: &str,
        context: impl Into<ContextRef>,
        id: impl Into<SubscriberId>,
    ) -> Result<Queue<M>> {
        let id = id.into();
        self.get_one(channel, context, &id)?
            .queue
            .ok_or_else(|| StationError::NotFound(format!("queue of subscription {id}")))
    }

    /// Get the signal of one subscription.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::NotFound`] if the subscription is missing or
    /// has no signal.
    pub fn get_signal(
        &self,
        channel: &str,
        context: impl Into<ContextRef>,
        id: impl Into<SubscriberId>,
    ) -> Result<Signal> {
        let id = id.into();
        self.get_one(channel, context, &id)?
            .signal
            .ok_or_else(|| StationError::NotFound(format!("signal of subscription {id}")))
    }

    fn get_one(
        &self,
        channel: &str,
        context: impl Into<ContextRef>,
        id: &SubscriberId,
    ) -> Result<Subscription<M>> {
        let mut found = self.get(channel, context, Some(std::slice::from_ref(id)))?;
        found
            .pop()
            .ok_or_else(|| StationError::NotFound(format!("subscription {id}")))
    }

    // ---- broadcasting ----

    /// Push `message` (if any) to the channel's queues, then apply `op` to
    /// its signals. Each part is dispatched immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::UnknownChannel`] or a dispatch failure.
    pub fn broadcast(&self, channel: &str, message: Option<M>, op: SignalOp) -> Result<()> {
        let (queue_plan, signal_plan) = {
            let entry = self
                .channels
                .get(channel)
                .ok_or_else(|| StationError::UnknownChannel(channel.to_string()))?;
            (
                message.map(|m| entry.queues.plan(&m)),
                entry.signals.plan(&op),
            )
        };

        trace!(
            channel = %channel,
            queue_actions = queue_plan.as_ref().map_or(0, Plan::action_count),
            signal_actions = signal_plan.action_count(),
            "Broadcast"
        );
        if let Some(plan) = queue_plan {
            plan.dispatch()?;
        }
        signal_plan.dispatch()?;
        Ok(())
    }

    /// Broadcast a message and set the channel's signals.
    ///
    /// # Errors
    ///
    /// Same as [`Station::broadcast`].
    pub fn publish(&self, channel: &str, message: M) -> Result<()> {
        self.broadcast(channel, Some(message), SignalOp::Set)
    }

    /// Apply `op` to the channel's signals without a message.
    ///
    /// # Errors
    ///
    /// Same as [`Station::broadcast`].
    pub fn signal(&self, channel: &str, op: impl Into<SignalOp>) -> Result<()> {
        self.broadcast(channel, None, op.into())
    }

    /// Broadcast several instructions as one unit per execution context.
    ///
    /// All delivery actions are collected first and merged by context in
    /// instruction order; then each context receives exactly one batch. Any
    /// single context therefore observes the whole call as one contiguous
    /// run. Nothing is dispatched if a channel is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::UnknownChannel`] or the first dispatch failure.
    pub fn broadcast_batch<I>(&self, instructions: I) -> Result<()>
    where
        I: IntoIterator<Item = BatchInstruction<M>>,
    {
        let master = {
            let _guard = self.lock.lock();
            let mut master = Plan::new();
            for instruction in instructions {
                let entry = self.channels.get(&instruction.channel).ok_or_else(|| {
                    StationError::UnknownChannel(instruction.channel.clone())
                })?;
                if let Some(message) = &instruction.message {
                    master.merge(entry.queues.plan(message));
                }
                if let Some(op) = &instruction.op {
                    master.merge(entry.signals.plan(op));
                }
            }
            master
        };

        trace!(
            contexts = master.lane_count(),
            actions = master.action_count(),
            "Batch broadcast"
        );
        master.dispatch()?;
        Ok(())
    }

    /// Get station statistics.
    #[must_use]
    pub fn stats(&self) -> StationStats {
        StationStats {
            channel_count: self.channels.len(),
            context_count: self.contexts.read().len(),
            subscription_count: self.channels.iter().map(|e| e.subscription_count()).sum(),
        }
    }
}

/// Station statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationStats {
    /// Number of declared channels.
    pub channel_count: usize,
    /// Number of registered execution contexts.
    pub context_count: usize,
    /// Total number of subscriptions.
    pub subscription_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Batch, Inline};
    use crate::error::DispatchError;
    use crate::event_loop::EventLoop;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Active scheduler that keeps submitted batches until `run_all`.
    ///
    /// `pending` reports the size of every batch submitted so far.
    #[derive(Debug, Default)]
    struct Deferred {
        batches: Mutex<Vec<Batch>>,
    }

    impl Deferred {
        fn pending(&self) -> Vec<usize> {
            self.batches.lock().iter().map(Batch::len).collect()
        }

        fn run_all(&self) {
            let batches: Vec<Batch> = self.batches.lock().drain(..).collect();
            for batch in batches {
                batch.run();
            }
        }
    }

    impl Scheduler for Deferred {
        fn submit(&self, batch: Batch) -> std::result::Result<(), DispatchError> {
            self.batches.lock().push(batch);
            Ok(())
        }

        fn is_active(&self) -> bool {
            true
        }
    }

    #[derive(Debug)]
    struct Closed;

    impl Scheduler for Closed {
        fn submit(&self, _batch: Batch) -> std::result::Result<(), DispatchError> {
            Err(DispatchError::Closed("test".into()))
        }

        fn is_active(&self) -> bool {
            true
        }
    }

    fn station_with_inline() -> (Station<String>, ContextId) {
        let station = Station::new("test");
        let context = station.add_context(Arc::new(Inline), None).unwrap();
        (station, context)
    }

    #[test]
    fn test_declare_channel() {
        let station: Station = Station::new("test");
        station.declare_channel("status", None).unwrap();
        assert!(station.has_channel("status"));
        assert!(matches!(
            station.declare_channel("status", Some(3)),
            Err(StationError::AlreadyExists(_))
        ));
        assert_eq!(station.channels(), vec!["status".to_string()]);
    }

    #[test]
    fn test_unknown_channel_then_declare() {
        let station: Station<String> = Station::new("test");
        assert!(matches!(
            station.broadcast("nope", None, SignalOp::Set),
            Err(StationError::UnknownChannel(_))
        ));

        station.declare_channel("nope", None).unwrap();
        station.broadcast("nope", Some("x".into()), SignalOp::Set).unwrap();
        assert!(matches!(
            station.subscribe("other", SubscribeOptions::new()),
            Err(StationError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_subscribe_and_broadcast() {
        let (station, context) = station_with_inline();
        station.declare_channel("status", None).unwrap();

        let subs = station.subscribe("status", SubscribeOptions::new()).unwrap();
        let sub = &subs[&context];
        assert_eq!(sub.id, SubscriberId::Index(0));
        let queue = sub.queue.clone().unwrap();
        let signal = sub.signal.clone().unwrap();

        station.publish("status", "online".to_string()).unwrap();
        assert_eq!(queue.pop().as_deref(), Some("online"));
        assert!(signal.is_set());

        station.signal("status", false).unwrap();
        assert!(!signal.is_set());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_auto_ids_are_monotonic() {
        let (station, context) = station_with_inline();
        station.declare_channel("c", None).unwrap();

        let ids: Vec<SubscriberId> = (0..3)
            .map(|_| {
                let subs = station
                    .subscribe("c", SubscribeOptions::new().context(context.clone()))
                    .unwrap();
                subs[&context].id.clone()
            })
            .collect();
        assert_eq!(
            ids,
            vec![SubscriberId::Index(0), SubscriberId::Index(1), SubscriberId::Index(2)]
        );

        // Named ids do not affect numbering
        station
            .subscribe("c", SubscribeOptions::new().id("named"))
            .unwrap();
        let subs = station.subscribe("c", SubscribeOptions::new()).unwrap();
        assert_eq!(subs[&context].id, SubscriberId::Index(3));
    }

    #[test]
    fn test_duplicate_subscription() {
        let (station, context) = station_with_inline();
        station.declare_channel("c", None).unwrap();

        let options = || SubscribeOptions::new().id(1u64).context(context.clone());
        station.subscribe("c", options()).unwrap();
        assert!(matches!(
            station.subscribe("c", options()),
            Err(StationError::AlreadyExists(_))
        ));
        assert_eq!(station.subscriber_count("c"), 1);
    }

    #[test]
    fn test_resubscribe_after_unsubscribe() {
        let (station, context) = station_with_inline();
        station.declare_channel("c", Some(2)).unwrap();

        let first = station
            .subscribe("c", SubscribeOptions::new().id(1u64))
            .unwrap();
        let old_queue = first[&context].queue.clone().unwrap();
        for i in 0..5 {
            station.publish("c", i.to_string()).unwrap();
        }
        assert_eq!(old_queue.dropped(), 3);

        assert_eq!(station.unsubscribe("c", &SubscriberId::Index(1), None).unwrap(), 1);
        // Idempotent
        assert_eq!(station.unsubscribe("c", &SubscriberId::Index(1), None).unwrap(), 0);

        let second = station
            .subscribe("c", SubscribeOptions::new().id(1u64))
            .unwrap();
        let new_queue = second[&context].queue.clone().unwrap();
        assert!(!new_queue.same(&old_queue));
        assert_eq!(new_queue.dropped(), 0);
        assert_eq!(new_queue.delivered(), 0);
        assert_eq!(new_queue.capacity(), 2);

        // The detached queue no longer receives anything
        station.publish("c", "fresh".to_string()).unwrap();
        assert_eq!(old_queue.len(), 2);
        assert_eq!(new_queue.pop().as_deref(), Some("fresh"));
    }

    #[test]
    fn test_capacity_precedence() {
        let station: Station<u32> = Station::with_default_capacity("test", 8);
        let context = station.add_context(Arc::new(Inline), None).unwrap();
        station.declare_channel("plain", None).unwrap();
        station.declare_channel("sized", Some(4)).unwrap();

        let plain = station.subscribe_queue("plain", SubscribeOptions::new()).unwrap();
        let sized = station.subscribe_queue("sized", SubscribeOptions::new()).unwrap();
        let explicit = station
            .subscribe_queue("sized", SubscribeOptions::new().capacity(1))
            .unwrap();

        assert_eq!(plain[&context].capacity(), 8);
        assert_eq!(sized[&context].capacity(), 4);
        assert_eq!(explicit[&context].capacity(), 1);
    }

    #[test]
    fn test_subscribe_queue_and_signal_only() {
        let (station, context) = station_with_inline();
        station.declare_channel("c", None).unwrap();

        let queues = station.subscribe_queue("c", SubscribeOptions::new()).unwrap();
        let signals = station.subscribe_signal("c", SubscribeOptions::new()).unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(signals.len(), 1);

        let subs = station.get("c", context.clone(), None).unwrap();
        assert_eq!(subs.len(), 2);
        assert!(subs[0].signal.is_none());
        assert!(subs[1].queue.is_none());

        assert!(matches!(
            station.subscribe("c", SubscribeOptions::new().no_queue().no_signal()),
            Err(StationError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_provided_queue_context_mismatch() {
        let station: Station<String> = Station::new("test");
        let x: Arc<dyn Scheduler> = Arc::new(Inline);
        let y: Arc<dyn Scheduler> = Arc::new(Inline);
        station.add_context(Arc::clone(&x), Some("x".into())).unwrap();
        station.add_context(Arc::clone(&y), Some("y".into())).unwrap();
        station.declare_channel("c", None).unwrap();

        let queue = Queue::new(0).bound_to(Arc::clone(&x));
        assert!(matches!(
            station.subscribe("c", SubscribeOptions::new().queue(queue.clone()).context("y")),
            Err(StationError::ContextMismatch(_))
        ));
        assert_eq!(station.subscriber_count("c"), 0);

        let signal = Signal::new().bound_to(Arc::clone(&y));
        assert!(matches!(
            station.subscribe("c", SubscribeOptions::new().queue(queue.clone()).signal(signal)),
            Err(StationError::ContextMismatch(_))
        ));

        // Without explicit contexts the queue's own context is used
        let subs = station
            .subscribe("c", SubscribeOptions::new().queue(queue.clone()))
            .unwrap();
        let context = ContextId::Name("x".into());
        assert_eq!(subs.len(), 1);
        assert!(subs[&context].queue.as_ref().unwrap().same(&queue));
        assert!(subs[&context].signal.as_ref().unwrap().is_bound_to(&x));
    }

    #[test]
    fn test_provided_handle_registers_context() {
        let station: Station<String> = Station::new("test");
        station.declare_channel("c", None).unwrap();
        let scheduler: Arc<dyn Scheduler> = Arc::new(Inline);

        let signal = Signal::new().bound_to(Arc::clone(&scheduler));
        let subs = station
            .subscribe("c", SubscribeOptions::new().signal(signal))
            .unwrap();
        assert_eq!(subs.keys().cloned().collect::<Vec<_>>(), vec![ContextId::Index(0)]);
        assert_eq!(station.context_ids(), vec![ContextId::Index(0)]);
    }

    #[test]
    fn test_subscribe_all_contexts() {
        let station: Station<String> = Station::new("test");
        for _ in 0..3 {
            station.add_context(Arc::new(Inline), None).unwrap();
        }
        station.declare_channel("c", None).unwrap();

        let subs = station.subscribe("c", SubscribeOptions::new()).unwrap();
        assert_eq!(subs.len(), 3);
        assert!(subs.values().all(|s| s.id == SubscriberId::Index(0)));

        // Unsubscribe on one context only
        let removed = station
            .unsubscribe("c", &SubscriberId::Index(0), Some(&[ContextRef::from(1u64)][..]))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(station.subscriber_count("c"), 2);

        assert!(matches!(
            station.unsubscribe("c", &SubscriberId::Index(0), Some(&[ContextRef::from(9u64)][..])),
            Err(StationError::UnknownContext(_))
        ));
    }

    #[test]
    fn test_subscribe_without_contexts() {
        let station: Station<String> = Station::new("test");
        station.declare_channel("c", None).unwrap();
        assert!(station.subscribe("c", SubscribeOptions::new()).unwrap().is_empty());
    }

    #[test]
    fn test_get() {
        let (station, context) = station_with_inline();
        station.declare_channel("c", None).unwrap();
        station.subscribe("c", SubscribeOptions::new().id("a")).unwrap();
        station.subscribe("c", SubscribeOptions::new().id("b").no_signal()).unwrap();

        let found = station
            .get("c", context.clone(), Some(&[SubscriberId::from("b"), SubscriberId::from("a")][..]))
            .unwrap();
        assert_eq!(found[0].id, SubscriberId::from("b"));
        assert_eq!(found[1].id, SubscriberId::from("a"));

        assert!(matches!(
            station.get("c", context.clone(), Some(&[SubscriberId::from("missing")][..])),
            Err(StationError::NotFound(_))
        ));
        assert!(station.get_queue("c", context.clone(), "a").is_ok());
        assert!(matches!(
            station.get_signal("c", context.clone(), "b"),
            Err(StationError::NotFound(_))
        ));
        assert!(matches!(
            station.get("c", 42u64, None),
            Err(StationError::UnknownContext(_))
        ));
    }

    #[test]
    fn test_broadcast_batch_is_one_unit_per_context() {
        let deferred = Arc::new(Deferred::default());
        let station: Station<String> = Station::new("test");
        let context = station.add_context(deferred.clone(), None).unwrap();
        station.declare_channel("A", None).unwrap();
        station.declare_channel("B", None).unwrap();

        let a = station.subscribe("A", SubscribeOptions::new().no_queue()).unwrap();
        let b = station.subscribe("B", SubscribeOptions::new().no_signal()).unwrap();
        let signal = a[&context].signal.clone().unwrap();
        let queue = b[&context].queue.clone().unwrap();

        station
            .broadcast_batch([
                BatchInstruction::new("A").op(SignalOp::Set),
                BatchInstruction::new("B").message("x".to_string()),
            ])
            .unwrap();

        // A third-party broadcast submitted afterwards lands in its own batch
        station.publish("B", "third".to_string()).unwrap();
        assert_eq!(deferred.pending(), vec![2, 1]);

        // Nothing ran on the producer thread
        assert!(!signal.is_set());
        assert!(queue.is_empty());

        deferred.run_all();
        assert!(signal.is_set());
        assert_eq!(queue.drain(), vec!["x".to_string(), "third".to_string()]);
    }

    #[test]
    fn test_broadcast_batch_includes_supplied_unbound_queue() {
        let deferred = Arc::new(Deferred::default());
        let station: Station<String> = Station::new("test");
        let context = station.add_context(deferred.clone(), None).unwrap();
        station.declare_channel("A", None).unwrap();
        station.declare_channel("B", None).unwrap();

        let a = station.subscribe("A", SubscribeOptions::new().no_queue()).unwrap();
        let signal = a[&context].signal.clone().unwrap();
        let queue = Queue::unbounded();
        station
            .subscribe(
                "B",
                SubscribeOptions::new()
                    .queue(queue.clone())
                    .no_signal()
                    .context(context.clone()),
            )
            .unwrap();

        station
            .broadcast_batch([
                BatchInstruction::new("A").op(SignalOp::Set),
                BatchInstruction::new("B").message("x".to_string()),
            ])
            .unwrap();

        // The unbound queue is delivered with its context's batch
        assert_eq!(deferred.pending(), vec![2]);
        assert!(queue.is_empty());
        assert!(!signal.is_set());

        deferred.run_all();
        assert!(signal.is_set());
        assert_eq!(queue.pop().as_deref(), Some("x"));
    }

    #[test]
    fn test_concurrent_batches_stay_contiguous() {
        const BATCHES: u32 = 50;
        const PUBLISHES: u32 = 200;
        const PUBLISHER: u32 = u32::MAX;

        let event_loop = EventLoop::start("station-contiguous").unwrap();
        let scheduler: Arc<dyn Scheduler> = event_loop.clone();
        let station = Arc::new(Station::<(u32, u32)>::new("test"));
        station.declare_channel("A", None).unwrap();
        station.declare_channel("B", None).unwrap();

        // One queue receives from both channels, so its contents are the
        // delivery order on the loop.
        let log = Queue::unbounded().bound_to(Arc::clone(&scheduler));
        for channel in ["A", "B"] {
            station
                .subscribe(channel, SubscribeOptions::new().queue(log.clone()).no_signal())
                .unwrap();
        }

        let batcher = {
            let station = Arc::clone(&station);
            std::thread::spawn(move || {
                for tag in 0..BATCHES {
                    station
                        .broadcast_batch((0..4).map(|idx| {
                            let channel = if idx % 2 == 0 { "A" } else { "B" };
                            BatchInstruction::new(channel).message((tag, idx))
                        }))
                        .unwrap();
                }
            })
        };
        let publisher = {
            let station = Arc::clone(&station);
            std::thread::spawn(move || {
                for i in 0..PUBLISHES {
                    station.publish("A", (PUBLISHER, i)).unwrap();
                }
            })
        };
        batcher.join().unwrap();
        publisher.join().unwrap();

        // Everything submitted before this marker has run
        let (tx, rx) = mpsc::channel();
        event_loop.call(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let delivered = log.drain();
        assert_eq!(delivered.len(), (BATCHES * 4 + PUBLISHES) as usize);
        for tag in 0..BATCHES {
            let start = delivered
                .iter()
                .position(|(t, _)| *t == tag)
                .unwrap();
            let run: Vec<(u32, u32)> = (0..4).map(|idx| (tag, idx)).collect();
            assert_eq!(&delivered[start..start + 4], run.as_slice(), "batch {tag} was split");
        }
        event_loop.shutdown();
    }

    #[test]
    fn test_publish_after_loop_shutdown_fails() {
        let event_loop = EventLoop::start("station-stopped").unwrap();
        let station: Station<String> = Station::new("test");
        let context = station.add_context(event_loop.clone(), None).unwrap();
        station.declare_channel("c", None).unwrap();
        let subs = station.subscribe("c", SubscribeOptions::new()).unwrap();
        let queue = subs[&context].queue.clone().unwrap();

        event_loop.shutdown();
        assert!(matches!(
            station.publish("c", "late".to_string()),
            Err(StationError::Dispatch(DispatchError::Closed(_)))
        ));
        assert!(queue.is_empty());
        assert!(!subs[&context].signal.as_ref().unwrap().is_set());
    }

    #[test]
    fn test_auto_id_after_max_index() {
        let (station, context) = station_with_inline();
        station.declare_channel("c", None).unwrap();
        station
            .subscribe("c", SubscribeOptions::new().id(u64::MAX))
            .unwrap();

        assert!(matches!(
            station.subscribe("c", SubscribeOptions::new()),
            Err(StationError::InvalidArgument(_))
        ));
        // Explicit ids are still accepted
        let subs = station.subscribe("c", SubscribeOptions::new().id("named")).unwrap();
        assert_eq!(subs[&context].id, SubscriberId::from("named"));
        assert_eq!(station.subscriber_count("c"), 2);
    }

    #[test]
    fn test_failed_subscribe_registers_no_context() {
        let station: Station<String> = Station::new("test");
        let x: Arc<dyn Scheduler> = Arc::new(Inline);
        let fresh: Arc<dyn Scheduler> = Arc::new(Inline);
        station.add_context(Arc::clone(&x), None).unwrap();
        station.declare_channel("c", None).unwrap();

        let queue = Queue::new(0).bound_to(Arc::clone(&x));
        assert!(matches!(
            station.subscribe(
                "c",
                SubscribeOptions::new().queue(queue).context(Arc::clone(&fresh))
            ),
            Err(StationError::ContextMismatch(_))
        ));
        assert_eq!(station.context_ids(), vec![ContextId::Index(0)]);

        // Duplicate key on a known context alongside a fresh handle
        station
            .subscribe("c", SubscribeOptions::new().id(7u64).context(Arc::clone(&x)))
            .unwrap();
        let options = SubscribeOptions::new()
            .id(7u64)
            .context(Arc::clone(&fresh))
            .context(Arc::clone(&x));
        assert!(matches!(
            station.subscribe("c", options),
            Err(StationError::AlreadyExists(_))
        ));
        assert_eq!(station.context_ids(), vec![ContextId::Index(0)]);

        // A valid call registers the handle
        let subs = station
            .subscribe("c", SubscribeOptions::new().context(Arc::clone(&fresh)))
            .unwrap();
        assert_eq!(subs.keys().cloned().collect::<Vec<_>>(), vec![ContextId::Index(1)]);
        assert_eq!(station.context_ids().len(), 2);
    }

    #[test]
    fn test_broadcast_batch_unknown_channel_dispatches_nothing() {
        let (station, context) = station_with_inline();
        station.declare_channel("A", None).unwrap();
        let subs = station.subscribe("A", SubscribeOptions::new()).unwrap();

        assert!(matches!(
            station.broadcast_batch([
                BatchInstruction::new("A").message("x".to_string()).op(true),
                BatchInstruction::new("missing").op(true),
            ]),
            Err(StationError::UnknownChannel(_))
        ));
        assert!(subs[&context].queue.as_ref().unwrap().is_empty());
        assert!(!subs[&context].signal.as_ref().unwrap().is_set());
    }

    #[test]
    fn test_dispatch_failure_propagates() {
        let station: Station<String> = Station::new("test");
        station.add_context(Arc::new(Closed), None).unwrap();
        station.declare_channel("c", None).unwrap();
        station.subscribe("c", SubscribeOptions::new()).unwrap();

        assert!(matches!(
            station.publish("c", "x".to_string()),
            Err(StationError::Dispatch(DispatchError::Closed(_)))
        ));
    }

    #[test]
    fn test_broadcast_across_event_loops() {
        let loops: Vec<Arc<EventLoop>> = (0..2)
            .map(|i| EventLoop::start(format!("station-loop-{i}")).unwrap())
            .collect();
        let station = Arc::new(Station::<u32>::new("test"));
        for event_loop in &loops {
            station.add_context(event_loop.clone(), None).unwrap();
        }
        station.declare_channel("numbers", None).unwrap();
        let subs = station.subscribe("numbers", SubscribeOptions::new()).unwrap();

        let (tx, rx) = mpsc::channel();
        for (context, sub) in subs {
            let queue = sub.queue.unwrap();
            let signal = sub.signal.unwrap();
            let tx = tx.clone();
            let event_loop = &loops[context.to_string().parse::<usize>().unwrap()];
            event_loop
                .spawn(async move {
                    let mut received = Vec::new();
                    while received.len() < 10 {
                        signal.wait().await;
                        signal.clear();
                        received.extend(queue.drain());
                    }
                    tx.send(received).unwrap();
                })
                .unwrap();
        }

        let producer = {
            let station = Arc::clone(&station);
            std::thread::spawn(move || {
                for i in 0..10 {
                    station.publish("numbers", i).unwrap();
                }
            })
        };
        producer.join().unwrap();

        for _ in 0..2 {
            let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(received, (0..10).collect::<Vec<_>>());
        }
        for event_loop in loops {
            event_loop.shutdown();
        }
    }

    #[test]
    fn test_from_config() {
        let config: StationConfig = toml::from_str(
            r#"
            name = "seeded"
            default_queue_capacity = 5
            contexts = ["main"]

            [[channels]]
            name = "status"
            default_queue_capacity = 1

            [[channels.subscribers]]
            id = "ui"

            [[channels.subscribers]]
            signal = false
            "#,
        )
        .unwrap();

        let scheduler: Arc<dyn Scheduler> = Arc::new(Inline);
        let station: Station = Station::from_config(&config, &[scheduler]).unwrap();
        assert_eq!(station.name(), "seeded");
        assert_eq!(station.subscriber_count("status"), 2);
        let queue = station.get_queue("status", "main", "ui").unwrap();
        assert_eq!(queue.capacity(), 1);
        assert!(station.get_signal("status", "main", 0u64).is_err());

        assert!(matches!(
            Station::<Message>::from_config(&config, &[]),
            Err(StationError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_station_stats() {
        let (station, _) = station_with_inline();
        station.declare_channel("a", None).unwrap();
        station.declare_channel("b", None).unwrap();
        station.subscribe("a", SubscribeOptions::new()).unwrap();
        station.subscribe("a", SubscribeOptions::new()).unwrap();
        station.subscribe("b", SubscribeOptions::new()).unwrap();

        assert_eq!(
            station.stats(),
            StationStats {
                channel_count: 2,
                context_count: 1,
                subscription_count: 3,
            }
        );
    }
}
