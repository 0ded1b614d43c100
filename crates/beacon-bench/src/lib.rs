//! Shared fixtures for Beacon benchmarks.

use beacon_core::{Inline, Message, Station, SubscribeOptions};
use std::sync::Arc;

/// Build a station with `contexts` inline contexts and `channels` channels
/// named `channel:N`, each with one subscription on every context.
///
/// # Panics
///
/// Panics if the station cannot be seeded.
#[must_use]
pub fn station_with(contexts: usize, channels: usize, capacity: usize) -> Station<Message> {
    let station = Station::with_default_capacity("bench", capacity);
    for _ in 0..contexts {
        station.add_context(Arc::new(Inline), None).unwrap();
    }
    for c in 0..channels {
        let name = format!("channel:{}", c);
        station.declare_channel(&name, None).unwrap();
        station.subscribe(&name, SubscribeOptions::new()).unwrap();
    }
    station
}
