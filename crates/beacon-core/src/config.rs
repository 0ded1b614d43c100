//! Declarative station seeding.
//!
//! A [`StationConfig`] lists the channels to declare and the subscriptions to
//! create when a station is built with
//! [`Station::from_config`](crate::Station::from_config).

use crate::context::ContextId;
use crate::subscription::{Provision, SubscribeOptions, SubscriberId};
use serde::{Deserialize, Serialize};

/// Station seed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Station name, used to name its transmitters.
    #[serde(default = "default_name")]
    pub name: String,

    /// Queue capacity when neither the subscription nor the channel sets one.
    /// `0` means unbounded.
    #[serde(default)]
    pub default_queue_capacity: usize,

    /// Ids for the execution contexts handed to `from_config`, in order.
    /// Contexts get auto-assigned integer ids when empty.
    #[serde(default)]
    pub contexts: Vec<ContextId>,

    /// Channels to declare.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// A channel to declare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name.
    pub name: String,

    /// Default capacity for queues created on this channel.
    #[serde(default)]
    pub default_queue_capacity: Option<usize>,

    /// Subscriptions to create on this channel.
    #[serde(default)]
    pub subscribers: Vec<SubscriberConfig>,
}

/// A subscription to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Subscriber id; auto-assigned when omitted.
    #[serde(default)]
    pub id: Option<SubscriberId>,

    /// Create a queue.
    #[serde(default = "default_true")]
    pub queue: bool,

    /// Create a signal.
    #[serde(default = "default_true")]
    pub signal: bool,

    /// Queue capacity override.
    #[serde(default)]
    pub capacity: Option<usize>,

    /// Target contexts; all registered contexts when omitted.
    #[serde(default)]
    pub contexts: Option<Vec<ContextId>>,
}

fn default_name() -> String {
    "Station".to_string()
}

fn default_true() -> bool {
    true
}

fn provision<T>(enabled: bool) -> Provision<T> {
    if enabled {
        Provision::Default
    } else {
        Provision::Suppress
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            default_queue_capacity: 0,
            contexts: Vec::new(),
            channels: Vec::new(),
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            id: None,
            queue: true,
            signal: true,
            capacity: None,
            contexts: None,
        }
    }
}

impl SubscriberConfig {
    /// Convert into subscribe options.
    #[must_use]
    pub fn to_options<M>(&self) -> SubscribeOptions<M> {
        SubscribeOptions {
            id: self.id.clone(),
            queue: provision(self.queue),
            signal: provision(self.signal),
            capacity: self.capacity,
            contexts: self
                .contexts
                .as_ref()
                .map(|ids| ids.iter().cloned().map(Into::into).collect()),
        }
    }
}
