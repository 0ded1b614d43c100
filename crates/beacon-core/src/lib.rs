//! # beacon-core
//!
//! In-process broadcast of messages and wake-up signals across event loops.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Station** - Channel registry and broadcast entry point
//! - **Transmitter** - Per-channel fan-out into per-context delivery batches
//! - **Queue** - Bounded drop-oldest FIFO with diagnostic counters
//! - **Signal** - Boolean wake-up flag
//! - **Context** - Execution context registry and the `Scheduler` contract
//! - **EventLoop** - Thread-bound scheduler implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Producer   │────▶│   Station   │────▶│ Transmitters │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!                                                │  plan per context
//!                                                ▼
//!                      ┌───────────┐      ┌──────────────┐
//!                      │ EventLoop │◀─────│   dispatch   │
//!                      └───────────┘      └──────────────┘
//!                            │
//!                            ▼
//!                     Queue / Signal
//! ```
//!
//! ## Example
//!
//! ```rust
//! use beacon_core::{Inline, SignalOp, Station, SubscribeOptions};
//! use std::sync::Arc;
//!
//! let station: Station<String> = Station::new("example");
//! let context = station.add_context(Arc::new(Inline), None).unwrap();
//! station.declare_channel("status", Some(1)).unwrap();
//!
//! let subs = station.subscribe("status", SubscribeOptions::new()).unwrap();
//! station.publish("status", "online".to_string()).unwrap();
//!
//! let sub = &subs[&context];
//! assert!(sub.signal.as_ref().unwrap().is_set());
//! assert_eq!(sub.queue.as_ref().unwrap().pop().as_deref(), Some("online"));
//! # station.signal("status", SignalOp::Clear).unwrap();
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod event_loop;
pub mod message;
pub mod queue;
pub mod signal;
pub mod station;
pub mod subscription;
pub mod transmitter;

pub use config::{ChannelConfig, StationConfig, SubscriberConfig};
pub use context::{Batch, ContextId, ContextRef, ContextRegistry, Inline, Scheduler};
pub use error::{DispatchError, StationError};
pub use event_loop::EventLoop;
pub use message::Message;
pub use queue::Queue;
pub use signal::{Signal, SignalOp};
pub use station::{ChannelId, Station, StationStats};
pub use subscription::{BatchInstruction, Provision, SubscribeOptions, SubscriberId, Subscription};
pub use transmitter::{Plan, QueueTransmitter, Receptor, SignalTransmitter, Transmitter};
