//! # Node Lifecycle
//!
//! Tracks the node state and the requests currently in flight.
//!
//! - The state lives on a `tokio::sync::watch` channel; readers take a cheap
//!   snapshot with [`NodeLifecycle::state`] or wait for changes
//! - Every request holds a [`RequestGuard`] for its whole lifetime
//! - [`NodeLifecycle::stop`] moves the node to `Stopping`, waits for in-flight
//!   requests up to the drain timeout and then marks it `Stopped`

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Process-wide node state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Initialized,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Initialized => "INITIALIZED",
            NodeState::Starting => "STARTING",
            NodeState::Started => "STARTED",
            NodeState::Stopping => "STOPPING",
            NodeState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Lifecycle of this gateway node
#[derive(Debug, Clone)]
pub struct NodeLifecycle {
    state: Arc<watch::Sender<NodeState>>,
    in_flight: Arc<AtomicU64>,
}

impl Default for NodeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeLifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(NodeState::Initialized);
        Self {
            state: Arc::new(state),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, state: NodeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Node state changed");
        }
    }

    /// Move through `Starting` to `Started`
    pub fn start(&self) {
        self.set_state(NodeState::Starting);
        self.set_state(NodeState::Started);
    }

    /// Stop the node, draining in-flight requests for at most `drain_timeout`
    ///
    /// Returns `true` when every request finished in time.
    pub async fn stop(&self, drain_timeout: Duration) -> bool {
        match self.state() {
            NodeState::Stopping | NodeState::Stopped => return true,
            _ => {}
        }
        self.set_state(NodeState::Stopping);

        let drained = timeout(drain_timeout, self.wait_for_requests()).await.is_ok();
        if !drained {
            warn!(
                in_flight = self.in_flight(),
                timeout = ?drain_timeout,
                "Drain timeout reached with requests still in flight"
            );
        }
        self.set_state(NodeState::Stopped);
        drained
    }

    /// Resolves once the node has left `Started` for `Stopping` or `Stopped`
    pub async fn stopping(&self) {
        let mut states = self.subscribe();
        let _ = states
            .wait_for(|state| matches!(state, NodeState::Stopping | NodeState::Stopped))
            .await;
    }

    /// Register a request; the count drops when the guard does
    pub fn track_request(&self) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("gateway_in_flight_requests").increment(1.0);
        RequestGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    async fn wait_for_requests(&self) {
        let check_interval = Duration::from_millis(100);
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                break;
            }
            debug!("Waiting for {} in-flight requests to complete", in_flight);
            sleep(check_interval).await;
        }
    }
}

/// Held for the lifetime of one request
#[derive(Debug)]
pub struct RequestGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("gateway_in_flight_requests").decrement(1.0);
    }
}
