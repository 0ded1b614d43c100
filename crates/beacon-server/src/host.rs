//! Station host.
//!
//! Runs a station across a set of event-loop threads: one consumer task per
//! subscription on its own loop, and a producer ticking on the main runtime.

use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use beacon_core::{
    BatchInstruction, ContextId, EventLoop, Message, Queue, Scheduler, Signal, SignalOp, Station,
    Subscription,
};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A running station and the loops it delivers into.
pub struct Host {
    station: Arc<Station<Message>>,
    loops: Vec<(ContextId, Arc<EventLoop>)>,
    config: Config,
}

impl Host {
    /// Start the event loops and build the station.
    ///
    /// # Errors
    ///
    /// Returns an error if a loop thread cannot be started or the station
    /// seed is invalid.
    pub fn start(config: Config) -> Result<Self> {
        let loops = (0..config.loops.max(1))
            .map(|i| EventLoop::start(format!("beacon-loop-{i}")))
            .collect::<std::io::Result<Vec<_>>>()
            .context("Failed to start event loop")?;

        let schedulers: Vec<Arc<dyn Scheduler>> = loops
            .iter()
            .map(|l| Arc::clone(l) as Arc<dyn Scheduler>)
            .collect();
        let station = match Station::from_config(&config.station_seed(), &schedulers) {
            Ok(station) => station,
            Err(e) => {
                loops.iter().for_each(|l| l.shutdown());
                return Err(e).context("Failed to build station");
            }
        };

        let loops = station.context_ids().into_iter().zip(loops).collect();
        let host = Self {
            station: Arc::new(station),
            loops,
            config,
        };

        let stats = host.station.stats();
        metrics::set_active_subscriptions(stats.subscription_count);
        info!(
            station = %host.station.name(),
            channels = stats.channel_count,
            contexts = stats.context_count,
            subscriptions = stats.subscription_count,
            "Station ready"
        );
        Ok(host)
    }

    /// Get the station.
    #[must_use]
    pub fn station(&self) -> &Arc<Station<Message>> {
        &self.station
    }

    /// Spawn one consumer per subscription onto the loop of its context.
    ///
    /// Returns the number of consumers started.
    ///
    /// # Errors
    ///
    /// Returns an error if a loop has already stopped.
    pub fn spawn_consumers(&self) -> Result<usize> {
        let mut started = 0;
        for channel in self.station.channels() {
            for (context, event_loop) in &self.loops {
                for sub in self.station.get(&channel, context.clone(), None)? {
                    event_loop
                        .spawn(consume(sub))
                        .with_context(|| format!("Failed to spawn consumer on {context}"))?;
                    started += 1;
                }
            }
        }
        debug!(consumers = started, "Consumers started");
        Ok(started)
    }

    /// Run the producer until a shutdown signal or the configured deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed.
    pub async fn run(&self) -> Result<()> {
        let deadline = async {
            match self.config.run_for() {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            res = crate::shutdown::wait_for_shutdown_signal() => {
                res.context("Failed to install signal handlers")?;
                info!("Shutdown signal received");
            }
            () = deadline => info!("Run duration elapsed"),
            () = self.produce() => {}
        }
        Ok(())
    }

    /// Stop every loop.
    pub fn shutdown(&self) {
        for (context, event_loop) in &self.loops {
            event_loop.shutdown();
            debug!(context = %context, "Loop stopped");
        }
        info!("Host stopped");
    }

    async fn produce(&self) {
        let mut ticker = interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut seq: u64 = 0;

        loop {
            ticker.tick().await;
            seq += 1;

            let batch = self.station.channels().into_iter().map(|channel| {
                let message = Message::new(seq.to_be_bytes().to_vec())
                    .with_kind("tick")
                    .with_source(self.station.name());
                BatchInstruction::new(channel)
                    .message(message)
                    .op(SignalOp::Set)
            });

            match self.station.broadcast_batch(batch) {
                Ok(()) => metrics::record_broadcast(),
                Err(e) => {
                    metrics::record_dispatch_error();
                    error!(seq, error = %e, "Broadcast failed");
                }
            }
            self.record_queue_counters();
        }
    }

    fn record_queue_counters(&self) {
        let (mut dropped, mut delivered) = (0, 0);
        for channel in self.station.channels() {
            for (context, _) in &self.loops {
                let Ok(subs) = self.station.get(&channel, context.clone(), None) else {
                    continue;
                };
                for queue in subs.iter().filter_map(|s| s.queue.as_ref()) {
                    dropped += queue.dropped();
                    delivered += queue.delivered();
                }
            }
        }
        metrics::set_queue_counters(dropped, delivered);
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        for (_, event_loop) in &self.loops {
            event_loop.shutdown();
        }
    }
}

async fn consume(sub: Subscription<Message>) {
    let Subscription {
        channel,
        context,
        id,
        queue,
        signal,
    } = sub;

    match (signal, queue) {
        (Some(signal), Some(queue)) => loop {
            wake(&signal).await;
            log_messages(&channel, &context, &queue, queue.drain());
        },
        (None, Some(queue)) => loop {
            let first = queue.recv().await;
            let mut messages = vec![first];
            messages.extend(queue.drain());
            log_messages(&channel, &context, &queue, messages);
        },
        (Some(signal), None) => loop {
            wake(&signal).await;
            debug!(channel = %channel, context = %context, subscriber = %id, "Signalled");
        },
        (None, None) => warn!(subscriber = %id, "Subscription has nothing to consume"),
    }
}

async fn wake(signal: &Signal) {
    signal.wait().await;
    signal.clear();
}

fn log_messages(channel: &str, context: &ContextId, queue: &Queue<Message>, messages: Vec<Message>) {
    if let Some(last) = messages.last() {
        debug!(
            channel = %channel,
            context = %context,
            received = messages.len(),
            last_id = last.id,
            dropped = queue.dropped(),
            "Consumed messages"
        );
    }
}
