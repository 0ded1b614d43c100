//! Default message envelope for Beacon.
//!
//! Stations are generic over their message type; [`Message`] is the default,
//! a small timestamped envelope around an opaque payload.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide message sequence number.
pub type MessageId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Next message sequence number. Strictly increasing within the process.
#[must_use]
pub fn next_message_id() -> MessageId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// A broadcastable message.
///
/// Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Optional message kind, e.g. `"status"`.
    pub kind: Option<String>,
    /// Optional producer name.
    pub source: Option<String>,
    /// Message payload.
    pub payload: Bytes,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: next_message_id(),
            kind: None,
            source: None,
            payload: payload.into(),
            timestamp: epoch_millis(),
        }
    }

    /// Set the message kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the producer name.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
