//! Subscription records and request options.

use crate::context::{ContextId, ContextRef};
use crate::queue::Queue;
use crate::signal::{Signal, SignalOp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a subscriber within a (channel, execution context) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriberId {
    /// Integer id, auto-assigned when omitted.
    Index(u64),
    /// Caller-supplied key.
    Name(String),
}

impl SubscriberId {
    /// The integer value, if this is an integer id.
    #[must_use]
    pub fn as_index(&self) -> Option<u64> {
        match self {
            Self::Index(n) => Some(*n),
            Self::Name(_) => None,
        }
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(n) => write!(f, "{n}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

impl From<u64> for SubscriberId {
    fn from(n: u64) -> Self {
        Self::Index(n)
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        Self::Name(s.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(s: String) -> Self {
        Self::Name(s)
    }
}

/// How an optional queue or signal is provisioned for a subscription.
#[derive(Debug, Clone)]
pub enum Provision<T> {
    /// Create a default instance bound to the target execution context.
    Default,
    /// Do not attach one.
    Suppress,
    /// Attach this caller-owned instance.
    Provided(T),
}

impl<T> Default for Provision<T> {
    fn default() -> Self {
        Self::Default
    }
}

impl<T> Provision<T> {
    /// The provided instance, if any.
    #[must_use]
    pub fn provided(&self) -> Option<&T> {
        match self {
            Self::Provided(value) => Some(value),
            _ => None,
        }
    }

    /// Check if this provision is suppressed.
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::Suppress)
    }
}

/// A registered (channel, execution context, id) subscription.
pub struct Subscription<M> {
    /// Channel name.
    pub channel: String,
    /// Execution context id.
    pub context: ContextId,
    /// Subscriber id.
    pub id: SubscriberId,
    /// Attached queue.
    pub queue: Option<Queue<M>>,
    /// Attached signal.
    pub signal: Option<Signal>,
}

impl<M> Clone for Subscription<M> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            context: self.context.clone(),
            id: self.id.clone(),
            queue: self.queue.clone(),
            signal: self.signal.clone(),
        }
    }
}

impl<M> fmt::Debug for Subscription<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("context", &self.context)
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("signal", &self.signal)
            .finish()
    }
}

/// Options for [`Station::subscribe`](crate::Station::subscribe).
pub struct SubscribeOptions<M> {
    /// Subscriber id; auto-assigned when `None`.
    pub id: Option<SubscriberId>,
    /// Queue provisioning.
    pub queue: Provision<Queue<M>>,
    /// Signal provisioning.
    pub signal: Provision<Signal>,
    /// Capacity of default-created queues.
    pub capacity: Option<usize>,
    /// Target execution contexts.
    pub contexts: Option<Vec<ContextRef>>,
}

impl<M> Default for SubscribeOptions<M> {
    fn default() -> Self {
        Self {
            id: None,
            queue: Provision::Default,
            signal: Provision::Default,
            capacity: None,
            contexts: None,
        }
    }
}

impl<M> SubscribeOptions<M> {
    /// Default options: a new queue and a new signal on every resolved context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the subscriber id.
    #[must_use]
    pub fn id(mut self, id: impl Into<SubscriberId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a caller-owned queue.
    #[must_use]
    pub fn queue(mut self, queue: Queue<M>) -> Self {
        self.queue = Provision::Provided(queue);
        self
    }

    /// Attach a caller-owned signal.
    #[must_use]
    pub fn signal(mut self, signal: Signal) -> Self {
        self.signal = Provision::Provided(signal);
        self
    }

    /// Do not attach a queue.
    #[must_use]
    pub fn no_queue(mut self) -> Self {
        self.queue = Provision::Suppress;
        self
    }

    /// Do not attach a signal.
    #[must_use]
    pub fn no_signal(mut self) -> Self {
        self.signal = Provision::Suppress;
        self
    }

    /// Capacity of default-created queues.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Add a target execution context.
    #[must_use]
    pub fn context(mut self, context: impl Into<ContextRef>) -> Self {
        self.contexts.get_or_insert_with(Vec::new).push(context.into());
        self
    }
}

/// One entry of an atomic multi-channel broadcast.
#[derive(Debug, Clone)]
pub struct BatchInstruction<M> {
    /// Target channel.
    pub channel: String,
    /// Message pushed to the channel's queues.
    pub message: Option<M>,
    /// Operation applied to the channel's signals.
    pub op: Option<SignalOp>,
}

impl<M> BatchInstruction<M> {
    /// An instruction that does nothing until a message or op is added.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: None,
            op: None,
        }
    }

    /// Push `message` to the channel's queues.
    #[must_use]
    pub fn message(mut self, message: M) -> Self {
        self.message = Some(message);
        self
    }

    /// Apply `op` to the channel's signals.
    #[must_use]
    pub fn op(mut self, op: impl Into<SignalOp>) -> Self {
        self.op = Some(op.into());
        self
    }
}
