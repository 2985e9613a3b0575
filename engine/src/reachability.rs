//! Network reachability collaborator.
//!
//! Subscribers receive a `watch::Receiver<bool>`; dropping the receiver
//! unsubscribes.

use tokio::sync::watch;

pub trait Reachability: Send + Sync {
    fn is_reachable(&self) -> bool;

    /// Receiver that observes every change of the reachability flag.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A reachability flag that can be flipped by a probe or by tests.
#[derive(Debug)]
pub struct ReachabilitySignal {
    tx: watch::Sender<bool>,
}

impl ReachabilitySignal {
    pub fn new(reachable: bool) -> Self {
        let (tx, _rx) = watch::channel(reachable);
        Self { tx }
    }

    /// Update the flag. Returns whether it changed.
    pub fn set(&self, reachable: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
        if changed {
            tracing::info!(reachable, "Reachability changed");
        }
        changed
    }
}

impl Default for ReachabilitySignal {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Reachability for ReachabilitySignal {
    fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
