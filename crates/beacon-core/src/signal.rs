//! Boolean wake-up signals.
//!
//! A [`Signal`] is a flag with idempotent set/clear. Waiting happens on the
//! consumer's own scheduler through [`Signal::wait`]; the broadcast path only
//! ever mutates the flag.

use crate::context::{same_scheduler, Scheduler};
use crate::error::StationError;
use crate::subscription::SubscriberId;
use parking_lot::RwLock;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

/// Operation applied to signals by a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SignalOp {
    /// Raise the flag.
    #[default]
    Set,
    /// Lower the flag.
    Clear,
}

impl From<bool> for SignalOp {
    fn from(set: bool) -> Self {
        if set {
            Self::Set
        } else {
            Self::Clear
        }
    }
}

impl FromStr for SignalOp {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(Self::Set),
            "clear" => Ok(Self::Clear),
            other => Err(StationError::InvalidArgument(format!(
                "unknown signal operation: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for SignalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => f.write_str("set"),
            Self::Clear => f.write_str("clear"),
        }
    }
}

/// A shared boolean flag.
///
/// Clones share the same flag.
#[derive(Clone)]
pub struct Signal {
    state: Arc<watch::Sender<bool>>,
    id: Arc<RwLock<Option<SubscriberId>>>,
    name: Option<Arc<str>>,
    context: Option<Arc<dyn Scheduler>>,
}

impl Signal {
    /// Create a cleared signal not bound to any execution context.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            id: Arc::new(RwLock::new(None)),
            name: None,
            context: None,
        }
    }

    /// Give the signal a name.
    #[must_use]
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bind the signal to an execution context.
    #[must_use]
    pub fn bound_to(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.context = Some(scheduler);
        self
    }

    /// Raise the flag. Returns `true` if it was lowered before.
    pub fn set(&self) -> bool {
        self.state.send_if_modified(|set| !std::mem::replace(set, true))
    }

    /// Lower the flag. Returns `true` if it was raised before.
    pub fn clear(&self) -> bool {
        self.state.send_if_modified(|set| std::mem::replace(set, false))
    }

    /// Apply a broadcast operation.
    pub fn apply(&self, op: SignalOp) -> bool {
        match op {
            SignalOp::Set => self.set(),
            SignalOp::Clear => self.clear(),
        }
    }

    /// Check if the flag is raised.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the flag is raised. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as `self`, so this never fails.
        let _ = receiver.wait_for(|set| *set).await;
    }

    /// Subscriber id assigned by the station, if any.
    #[must_use]
    pub fn id(&self) -> Option<SubscriberId> {
        self.id.read().clone()
    }

    pub(crate) fn set_id(&self, id: SubscriberId) {
        *self.id.write() = Some(id);
    }

    /// Signal name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Execution context the signal is bound to.
    #[must_use]
    pub fn context(&self) -> Option<&Arc<dyn Scheduler>> {
        self.context.as_ref()
    }

    /// Check if the signal is bound to `scheduler`.
    #[must_use]
    pub fn is_bound_to(&self, scheduler: &Arc<dyn Scheduler>) -> bool {
        self.context
            .as_ref()
            .is_some_and(|own| same_scheduler(own, scheduler))
    }

    /// Check if two handles share the same flag.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("set", &self.is_set())
            .field("bound", &self.context.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Inline;
    use std::time::Duration;

    #[test]
    fn test_signal_set_clear_idempotent() {
        let signal = Signal::new();
        assert!(!signal.is_set());

        assert!(signal.set());
        assert!(!signal.set());
        assert!(signal.is_set());

        assert!(signal.clear());
        assert!(!signal.clear());
        assert!(!signal.is_set());
    }

    #[test]
    fn test_signal_clones_share_state() {
        let signal = Signal::new();
        let other = signal.clone();
        other.apply(SignalOp::Set);
        assert!(signal.is_set());
        assert!(signal.same(&other));
        assert!(!signal.same(&Signal::new()));
    }

    #[test]
    fn test_signal_op_parsing() {
        assert_eq!("set".parse::<SignalOp>().unwrap(), SignalOp::Set);
        assert_eq!("clear".parse::<SignalOp>().unwrap(), SignalOp::Clear);
        assert!(matches!(
            "toggle".parse::<SignalOp>(),
            Err(StationError::InvalidArgument(_))
        ));
        assert_eq!(SignalOp::from(true), SignalOp::Set);
        assert_eq!(SignalOp::from(false), SignalOp::Clear);
        assert_eq!(SignalOp::default(), SignalOp::Set);
    }

    #[test]
    fn test_signal_binding() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(Inline);
        let other: Arc<dyn Scheduler> = Arc::new(Inline);
        let signal = Signal::new().bound_to(Arc::clone(&scheduler));
        assert!(signal.is_bound_to(&scheduler));
        assert!(!signal.is_bound_to(&other));
        assert!(!Signal::new().is_bound_to(&scheduler));
    }

    #[tokio::test]
    async fn test_signal_wait() {
        let signal = Signal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::task::yield_now().await;
        signal.set();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already set: returns immediately
        signal.wait().await;
    }
}
