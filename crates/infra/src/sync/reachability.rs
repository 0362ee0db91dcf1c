//! Network reachability state
//!
//! The monitor only records and emits transitions. Platform probes call
//! [`ReachabilityMonitor::set_online`]; the engine listens on
//! [`ReachabilityMonitor::subscribe`] and decides what a transition means.

use calsync_domain::ConnectivityState;
use tokio::sync::watch;
use tracing::info;

/// Current connectivity, observable through a watch channel
#[derive(Debug)]
pub struct ReachabilityMonitor {
    state: watch::Sender<ConnectivityState>,
}

impl ReachabilityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Record the latest probe result.
    ///
    /// Returns `true` when the state changed; repeated reports of the same
    /// state are not emitted.
    pub fn set_online(&self, online: bool) -> bool {
        let next = if online { ConnectivityState::Online } else { ConnectivityState::Offline };
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(state = ?next, "connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}
