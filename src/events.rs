//! Consumer-facing event stream
//!
//! Every status change the wallet core produces is published here as a
//! [`WalletEvent`]. Each subscriber owns an unbounded queue, so a slow
//! consumer never causes another subscriber to miss an event and events are
//! delivered in the order they were emitted.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::migration::plan::MigrationPlan;
use crate::node::state::ConnectionStatus;
use crate::wallet::job::TxJob;

/// Events sent to the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum WalletEvent {
    /// The connection state machine moved to a new status
    ConnectionChanged(ConnectionStatus),
    /// Connected to a node that reports no peers
    NoPeers,
    /// The daemon config contains `daemon=1`, which breaks embedded supervision
    #[serde(rename_all = "camelCase")]
    DaemonConfigConflict { conf_path: String },
    /// The embedded daemon ignored the graceful shutdown and was killed
    #[serde(rename_all = "camelCase")]
    DaemonForcedKill { pid: u32 },
    /// A transaction job changed state
    TxJobUpdated(TxJob),
    /// A migration plan was persisted in a new state
    MigrationProgress(MigrationPlan),
    /// A single migration run failed; the plan stays scheduled
    #[serde(rename_all = "camelCase")]
    MigrationRunFailed { plan_id: String, reason: String },
    /// Forwarded warn/error log line
    Log { level: String, message: String },
}

/// Ordered fan-out of [`WalletEvent`]s to any number of subscribers
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<WalletEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Events emitted before this call are not replayed.
    pub fn subscribe(&self) -> UnboundedReceiver<WalletEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event to every live subscriber, dropping closed ones
    pub fn emit(&self, event: WalletEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
