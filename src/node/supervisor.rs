//! Daemon process supervision
//!
//! Launches the embedded daemon, checks it survives startup, and shuts it
//! down with escalation. An externally managed node gets a placeholder
//! handle: it is never launched and never terminated.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::{Child, Command};

use super::config::{NodeConfig, DAEMON_BINARY_NAME};
use super::rpc;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch daemon: {detail}")]
    LaunchFailed { detail: String },
    /// The daemon's own config forks it into the background; the user has
    /// to remove `daemon=1` once before embedded mode can work.
    #[error("{} sets daemon=1, which prevents the wallet from supervising the node", .conf_path.display())]
    DaemonModeConflict { conf_path: PathBuf },
    /// Graceful shutdown timed out and the process was killed
    #[error("daemon (pid {pid}) ignored shutdown and was killed")]
    ForcedKill { pid: u32 },
}

enum HandleKind {
    External,
    Embedded { pid: u32, child: Child },
}

/// Ownership of a launched daemon, or a marker for an external one.
///
/// Dropping a handle whose process is still alive kills the process.
pub struct DaemonProcessHandle {
    kind: HandleKind,
    shutdown_timeout: Duration,
    config: NodeConfig,
}

impl DaemonProcessHandle {
    fn external(config: &NodeConfig) -> Self {
        Self {
            kind: HandleKind::External,
            shutdown_timeout: config.shutdown_timeout(),
            config: config.clone(),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.kind, HandleKind::External)
    }

    /// PID of the embedded process
    pub fn pid(&self) -> Option<u32> {
        match &self.kind {
            HandleKind::External => None,
            HandleKind::Embedded { pid, .. } => Some(*pid),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        match &mut self.kind {
            HandleKind::External => None,
            HandleKind::Embedded { child, .. } => child.try_wait().ok().flatten(),
        }
    }
}

impl std::fmt::Debug for DaemonProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonProcessHandle")
            .field("pid", &self.pid())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl Drop for DaemonProcessHandle {
    fn drop(&mut self) {
        if let HandleKind::Embedded { pid, child } = &mut self.kind {
            if matches!(child.try_wait(), Ok(None)) {
                log::warn!("Daemon handle dropped while pid {} still running, killing it", pid);
                let _ = child.start_kill();
            }
        }
    }
}

/// Launches and stops the embedded daemon
#[derive(Debug, Clone)]
pub struct DaemonSupervisor {
    /// How long a fresh process must stay alive to count as launched
    pub launch_grace: Duration,
}

impl Default for DaemonSupervisor {
    fn default() -> Self {
        Self {
            launch_grace: Duration::from_millis(500),
        }
    }
}

impl DaemonSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch the daemon described by `config`, or return an external
    /// handle when the node is not embedded. Launch failures are reported,
    /// never retried.
    pub async fn start(&self, config: &NodeConfig) -> Result<DaemonProcessHandle, SupervisorError> {
        if !config.use_embedded_daemon() {
            log::info!(
                "Using external node at {}:{}",
                config.rpc_host,
                config.effective_rpc_port()
            );
            return Ok(DaemonProcessHandle::external(config));
        }

        if let Some(conf_path) = config.detect_daemon_mode_conflict() {
            log::error!("{} sets daemon=1, refusing to launch", conf_path.display());
            return Err(SupervisorError::DaemonModeConflict { conf_path });
        }

        let binary = config.daemon_binary_path();
        if !binary.exists() {
            return Err(SupervisorError::LaunchFailed {
                detail: format!("daemon binary not found at {}", binary.display()),
            });
        }

        let port = config.effective_rpc_port();
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_err() {
            let detail = match find_daemon_pid() {
                Some(pid) => format!(
                    "RPC port {} already in use, another daemon is running (pid {})",
                    port, pid
                ),
                None => format!("RPC port {} already in use", port),
            };
            return Err(SupervisorError::LaunchFailed { detail });
        }

        config
            .ensure_daemon_conf()
            .map_err(|e| SupervisorError::LaunchFailed {
                detail: e.to_string(),
            })?;

        let mut cmd = Command::new(&binary);
        cmd.args(config.daemon_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // On Windows, prevent console window from appearing
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        log::info!("Starting daemon: {:?}", cmd);
        let child = cmd.spawn().map_err(|e| SupervisorError::LaunchFailed {
            detail: format!("failed to spawn {}: {}", binary.display(), e),
        })?;
        let pid = child.id().unwrap_or_default();

        let mut handle = DaemonProcessHandle {
            kind: HandleKind::Embedded { pid, child },
            shutdown_timeout: config.shutdown_timeout(),
            config: config.clone(),
        };

        tokio::time::sleep(self.launch_grace).await;
        if let Some(status) = handle.exit_status() {
            return Err(SupervisorError::LaunchFailed {
                detail: format!("daemon exited during startup ({})", status),
            });
        }

        log::info!("Daemon started with PID {}", pid);
        Ok(handle)
    }

    /// Whether the handle's process is alive. External nodes are presumed
    /// running; reachability is the RPC layer's concern.
    pub fn is_running(&self, handle: &mut DaemonProcessHandle) -> bool {
        handle.is_external() || handle.exit_status().is_none()
    }

    /// Shut the daemon down: RPC `stop` (SIGTERM on Unix if that cannot be
    /// delivered), then wait up to `timeout` before killing it.
    ///
    /// A no-op for external nodes. `ForcedKill` means the process is gone
    /// but did not exit on its own.
    pub async fn stop(
        &self,
        mut handle: DaemonProcessHandle,
        timeout: Duration,
    ) -> Result<(), SupervisorError> {
        let Some(pid) = handle.pid() else {
            log::debug!("External node, nothing to stop");
            return Ok(());
        };
        if !self.is_running(&mut handle) {
            log::info!("Daemon (pid {}) already exited", pid);
            return Ok(());
        }

        log::info!("Stopping daemon (pid {})...", pid);
        if let Err(e) = rpc::stop_node_gracefully(&handle.config).await {
            log::warn!("RPC stop failed ({}), signalling pid {}", e, pid);
            terminate(pid);
        }

        let HandleKind::Embedded { child, .. } = &mut handle.kind else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(_) => {
                log::info!("Daemon (pid {}) stopped", pid);
                Ok(())
            }
            Err(_) => {
                log::warn!("Daemon (pid {}) still running after {:?}, killing it", pid, timeout);
                if let Err(e) = child.kill().await {
                    log::error!("Failed to kill daemon (pid {}): {}", pid, e);
                }
                Err(SupervisorError::ForcedKill { pid })
            }
        }
    }
}

/// Send SIGTERM on Unix. Elsewhere the stop timeout escalates to a kill.
fn terminate(pid: u32) {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            log::warn!(
                "Failed to signal pid {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    {
        log::debug!("No graceful signal available for pid {}", pid);
    }
}

/// Find the PID of a running daemon process
pub fn find_daemon_pid() -> Option<u32> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());

    sys.processes()
        .iter()
        .find(|(_, process)| {
            process.name().to_string_lossy().to_lowercase() == DAEMON_BINARY_NAME.to_lowercase()
        })
        .map(|(pid, _)| pid.as_u32())
}
