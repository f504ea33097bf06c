//! Connection state machine
//!
//! Ties the supervisor and the RPC client into the single observable
//! [`ConnectionStatus`]:
//!
//! ```text
//! Disconnected ─connect─► Starting ─unreachable─► WaitingForDaemon ─first RPC─► Syncing ─► Connected
//!       ▲                    │                           │                        │           │
//!       │                    └──────────────────────┴──────── Error ◄────────┴───────────┘
//!       └──────────────── disconnect (always stops the daemon) ◄───────────────────────────
//! ```
//!
//! A single poller task per attempt drives every transition after
//! `Starting`. A daemon that answers its first probe goes straight to
//! `Syncing`. Leaving `Error` needs an explicit reconnect.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::config::NodeConfig;
use super::rpc::{BlockchainInfo, DaemonApi, RpcError};
use super::state::{ConnectionStatus, SharedNodeState};
use super::supervisor::{DaemonProcessHandle, DaemonSupervisor, SupervisorError};
use crate::events::WalletEvent;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("a connection attempt is already active ({0})")]
    AlreadyActive(ConnectionStatus),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Retry and polling cadence
#[derive(Debug, Clone)]
pub struct ConnectionTiming {
    /// Delay between probes while the daemon is not answering yet
    pub startup_retry_interval: Duration,
    /// Probes allowed before a silent daemon is declared an error
    pub max_startup_attempts: u32,
    /// Status refresh period once the daemon answers
    pub poll_interval: Duration,
    /// Consecutive unreachable polls tolerated after the daemon answered
    pub max_poll_failures: u32,
}

impl Default for ConnectionTiming {
    fn default() -> Self {
        Self {
            startup_retry_interval: Duration::from_secs(2),
            // The daemon can spend minutes loading its block index
            max_startup_attempts: 300,
            poll_interval: Duration::from_secs(5),
            max_poll_failures: 3,
        }
    }
}

type SharedHandle = Arc<Mutex<Option<DaemonProcessHandle>>>;

struct Session {
    handle: SharedHandle,
    poller: JoinHandle<()>,
}

/// Owns the connection config and the daemon handle for one process
pub struct ConnectionManager {
    config: NodeConfig,
    api: DaemonApi,
    supervisor: DaemonSupervisor,
    state: SharedNodeState,
    timing: ConnectionTiming,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(
        config: NodeConfig,
        api: DaemonApi,
        supervisor: DaemonSupervisor,
        state: SharedNodeState,
        timing: ConnectionTiming,
    ) -> Self {
        Self {
            config,
            api,
            supervisor,
            state,
            timing,
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Snapshot of the current status
    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// Subscribe to the wallet event stream carrying status changes
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<WalletEvent> {
        self.state.events().subscribe()
    }

    /// Start a connection attempt. Returns once the daemon is launched (or
    /// the external node is selected); progress continues in the background.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut session = self.session.lock().await;
        let current = self.state.status();
        if session.is_some() || current != ConnectionStatus::Disconnected {
            return Err(ConnectionError::AlreadyActive(current));
        }

        self.state.transition(ConnectionStatus::Starting);

        let handle = match self.supervisor.start(&self.config).await {
            Ok(handle) => handle,
            Err(e) => {
                if let SupervisorError::DaemonModeConflict { conf_path } = &e {
                    self.state.events().emit(WalletEvent::DaemonConfigConflict {
                        conf_path: conf_path.display().to_string(),
                    });
                }
                log::error!("Failed to start node: {}", e);
                self.state.transition(ConnectionStatus::Error {
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let external = handle.is_external();
        let handle: SharedHandle = Arc::new(Mutex::new(Some(handle)));

        let poller = tokio::spawn(poll_connection(
            self.state.clone(),
            self.api.clone(),
            self.supervisor.clone(),
            handle.clone(),
            self.timing.clone(),
            external,
        ));
        *session = Some(Session { handle, poller });
        Ok(())
    }

    /// Tear the connection down from any state: cancels polling, stops an
    /// embedded daemon and ends in `Disconnected`.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();

        if let Some(session) = session {
            session.poller.abort();
            let _ = session.poller.await;

            let handle = session.handle.lock().take();
            if let Some(handle) = handle {
                let timeout = handle.shutdown_timeout();
                match self.supervisor.stop(handle, timeout).await {
                    Ok(()) => {}
                    Err(SupervisorError::ForcedKill { pid }) => {
                        log::warn!("Daemon (pid {}) had to be killed", pid);
                        self.state
                            .events()
                            .emit(WalletEvent::DaemonForcedKill { pid });
                    }
                    Err(e) => log::error!("Failed to stop daemon: {}", e),
                }
            }
        }

        self.state.transition(ConnectionStatus::Disconnected);
    }

    /// Explicit recovery: full teardown followed by a fresh attempt
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        log::info!("Reconnecting to node...");
        self.disconnect().await;
        self.connect().await
    }
}

async fn probe(api: &DaemonApi) -> Result<(BlockchainInfo, u32), RpcError> {
    let info = api.get_blockchain_info().await?;
    let peers = api.get_peer_count().await?;
    Ok((info, peers))
}

/// Whether the embedded process behind `handle` has exited
fn daemon_exited(supervisor: &DaemonSupervisor, handle: &SharedHandle) -> bool {
    match handle.lock().as_mut() {
        Some(handle) => !supervisor.is_running(handle),
        None => false,
    }
}

fn fail(state: &SharedNodeState, message: String) {
    log::error!("Node connection failed: {}", message);
    state.transition(ConnectionStatus::Error { message });
}

async fn poll_connection(
    state: SharedNodeState,
    api: DaemonApi,
    supervisor: DaemonSupervisor,
    handle: SharedHandle,
    timing: ConnectionTiming,
    external: bool,
) {
    let mut attempts = 0u32;
    let mut latest = loop {
        match probe(&api).await {
            Ok(status) => break status,
            Err(RpcError::Unauthorized) => {
                fail(&state, RpcError::Unauthorized.to_string());
                return;
            }
            Err(e) if e.is_retryable() => {
                if daemon_exited(&supervisor, &handle) {
                    fail(&state, "daemon exited before accepting RPC connections".to_string());
                    return;
                }
                state.transition(ConnectionStatus::WaitingForDaemon);
                attempts += 1;
                if attempts >= timing.max_startup_attempts {
                    fail(
                        &state,
                        format!("daemon did not respond after {} attempts: {}", attempts, e),
                    );
                    return;
                }
                log::debug!("Waiting for daemon ({}): {}", attempts, e);
                tokio::time::sleep(timing.startup_retry_interval).await;
            }
            Err(e) => {
                fail(&state, e.to_string());
                return;
            }
        }
    };

    // The first answer always passes through Syncing
    let (info, peers) = &latest;
    state.transition(ConnectionStatus::Syncing {
        current_height: info.blocks,
        target_height: info.headers,
        connections: *peers,
    });

    let mut failures = 0u32;
    let mut warned_no_peers = false;
    loop {
        let (info, peers) = latest;
        let synced = info.blocks >= info.headers;

        if state.status().is_connected() || (synced && (peers > 0 || external)) {
            if peers == 0 && !warned_no_peers {
                warned_no_peers = true;
                log::warn!("Node at height {} reports no peer connections", info.blocks);
                state.events().emit(WalletEvent::NoPeers);
            }
            state.transition(ConnectionStatus::Connected {
                height: info.blocks,
                connections: peers,
            });
        } else {
            state.transition(ConnectionStatus::Syncing {
                current_height: info.blocks,
                target_height: info.headers,
                connections: peers,
            });
        }

        latest = loop {
            tokio::time::sleep(timing.poll_interval).await;
            match probe(&api).await {
                Ok(status) => {
                    failures = 0;
                    break status;
                }
                Err(RpcError::Unauthorized) => {
                    fail(&state, RpcError::Unauthorized.to_string());
                    return;
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if daemon_exited(&supervisor, &handle) {
                        fail(&state, "daemon exited unexpectedly".to_string());
                        return;
                    }
                    if failures > timing.max_poll_failures {
                        fail(&state, format!("lost connection to daemon: {}", e));
                        return;
                    }
                    log::warn!("Status poll failed ({}/{}): {}", failures, timing.max_poll_failures, e);
                }
                Err(e) => {
                    fail(&state, e.to_string());
                    return;
                }
            }
        };
    }
}
