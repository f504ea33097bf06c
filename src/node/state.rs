//! Shared connection state
//!
//! Holds the single live [`ConnectionStatus`] of the process. Consumers read
//! snapshots; only the connection manager moves it, through
//! [`NodeState::transition`], which enforces the allowed edges and publishes
//! each accepted change in order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::events::{EventBus, WalletEvent};

/// Externally observable connection status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Starting,
    WaitingForDaemon,
    #[serde(rename_all = "camelCase")]
    Syncing {
        current_height: u64,
        target_height: u64,
        connections: u32,
    },
    Connected {
        height: u64,
        connections: u32,
    },
    Error {
        message: String,
    },
}

impl ConnectionStatus {
    /// Position along the attempt's progression
    fn rank(&self) -> u8 {
        match self {
            ConnectionStatus::Disconnected => 0,
            ConnectionStatus::Starting => 1,
            ConnectionStatus::WaitingForDaemon => 2,
            ConnectionStatus::Syncing { .. } => 3,
            ConnectionStatus::Connected { .. } => 4,
            ConnectionStatus::Error { .. } => 5,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionStatus::Error { .. })
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Within one attempt the status only moves forward: Syncing and
    /// Connected may refresh their counters but never fall back. Error is
    /// reachable from any active status and only left through Disconnected,
    /// which in turn only leads to Starting.
    pub fn can_transition_to(&self, next: &ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (Disconnected, Starting) => true,
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Error { .. }, _) => false,
            (_, Error { .. }) => true,
            (_, Starting) => false,
            (current, next) => {
                let (from, to) = (current.rank(), next.rank());
                to > from || (to == from && matches!(next, Syncing { .. } | Connected { .. }))
            }
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Starting => write!(f, "starting"),
            ConnectionStatus::WaitingForDaemon => write!(f, "waiting for daemon"),
            ConnectionStatus::Syncing {
                current_height,
                target_height,
                connections,
            } => write!(
                f,
                "syncing {}/{} ({} peers)",
                current_height, target_height, connections
            ),
            ConnectionStatus::Connected { height, connections } => {
                write!(f, "connected at {} ({} peers)", height, connections)
            }
            ConnectionStatus::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Process-wide connection state
#[derive(Debug)]
pub struct NodeState {
    status: Mutex<ConnectionStatus>,
    events: EventBus,
}

impl NodeState {
    pub fn new(events: EventBus) -> Self {
        Self {
            status: Mutex::new(ConnectionStatus::Disconnected),
            events,
        }
    }

    /// Snapshot of the current status
    pub fn status(&self) -> ConnectionStatus {
        self.status.lock().clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Move to `next` if the edge is allowed. Returns whether the status
    /// changed. Repeating the current status is a no-op.
    pub fn transition(&self, next: ConnectionStatus) -> bool {
        let mut status = self.status.lock();
        if *status == next {
            return false;
        }
        if !status.can_transition_to(&next) {
            log::debug!("Ignoring connection transition {} -> {}", *status, next);
            return false;
        }

        if status.rank() != next.rank() {
            log::info!("Connection status: {} -> {}", *status, next);
        }
        *status = next.clone();
        // Published under the lock so observers see changes in order
        self.events.emit(WalletEvent::ConnectionChanged(next));
        true
    }
}

/// Type alias for shared node state
pub type SharedNodeState = Arc<NodeState>;

/// Create a new shared node state
pub fn create_node_state(events: EventBus) -> SharedNodeState {
    Arc::new(NodeState::new(events))
}
