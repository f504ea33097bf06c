//! Shielded wallet core
//!
//! Node connection, transaction orchestration and fund migration for a
//! shielded-pool wallet. The presentation layer drives a [`WalletRuntime`]
//! and listens to its [`events::EventBus`].

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod events;
pub mod logging;
pub mod migration;
pub mod node;
pub mod wallet;

#[cfg(test)]
mod test_support;

use events::EventBus;
use migration::{MigrationPolicy, MigrationScheduler, PlanStore, SystemClock};
use node::{
    create_node_state, ConnectionManager, ConnectionTiming, DaemonApi, DaemonSupervisor,
    NodeConfig, RpcClient,
};
use wallet::{PipelineConfig, TxPipeline};

/// Expand environment variables and ~ in paths
/// Windows: %VAR% style
/// Unix: ~ expands to HOME
pub fn expand_path(path: &str) -> String {
    let mut result = path.to_string();

    #[cfg(windows)]
    {
        while let Some(start) = result.find('%') {
            let Some(end) = result[start + 1..].find('%') else {
                break;
            };
            let var_name = &result[start + 1..start + 1 + end];
            match std::env::var(var_name) {
                Ok(value) => {
                    result = format!("{}{}{}", &result[..start], value, &result[start + 2 + end..])
                }
                Err(_) => break,
            }
        }
    }

    #[cfg(not(windows))]
    {
        if let Some(rest) = result.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                result = home.join(rest).to_string_lossy().to_string();
            }
        } else if result == "~" {
            if let Some(home) = dirs::home_dir() {
                result = home.to_string_lossy().to_string();
            }
        }
    }

    result
}

/// Directory holding the wallet's own config, plans and logs
pub fn app_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ShieldedWallet")
    }

    #[cfg(target_os = "macos")]
    {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ShieldedWallet")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shielded-wallet")
    }
}

/// Every long-lived component, wired to one event bus
pub struct WalletRuntime {
    events: EventBus,
    connection: ConnectionManager,
    pipeline: TxPipeline,
    scheduler: MigrationScheduler,
}

impl WalletRuntime {
    /// Build the runtime. Persisted migration plans under `data_dir` are
    /// loaded but not resumed until [`WalletRuntime::start`].
    pub fn init(config: NodeConfig, policy: MigrationPolicy, data_dir: &Path) -> anyhow::Result<Self> {
        let client = RpcClient::from_config(&config).context("failed to create RPC client")?;
        log::info!("RPC endpoint {}", client.url());
        let api = DaemonApi::new(Arc::new(client));
        Self::with_api(config, policy, data_dir, api, ConnectionTiming::default())
    }

    fn with_api(
        config: NodeConfig,
        policy: MigrationPolicy,
        data_dir: &Path,
        api: DaemonApi,
        timing: ConnectionTiming,
    ) -> anyhow::Result<Self> {
        let events = EventBus::new();

        let pipeline = TxPipeline::new(
            api.clone(),
            PipelineConfig {
                network: config.network,
                min_confirmations: policy.min_confirmations,
                ..Default::default()
            },
            events.clone(),
        );

        let store = PlanStore::open(data_dir.join("migrations"))
            .context("failed to open migration plan store")?;
        let scheduler = MigrationScheduler::new(
            api.clone(),
            pipeline.clone(),
            store,
            policy,
            events.clone(),
            Arc::new(SystemClock),
        )
        .context("failed to load migration plans")?;

        let connection = ConnectionManager::new(
            config,
            api,
            DaemonSupervisor::new(),
            create_node_state(events.clone()),
            timing,
        );

        Ok(Self {
            events,
            connection,
            pipeline,
            scheduler,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn pipeline(&self) -> &TxPipeline {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &MigrationScheduler {
        &self.scheduler
    }

    /// Connect to the node and resume persisted migrations
    pub async fn start(&self) -> anyhow::Result<()> {
        self.connection
            .connect()
            .await
            .context("failed to start node connection")?;
        self.scheduler.resume_all();
        Ok(())
    }

    /// Stop migration workers and tear the connection down. An embedded
    /// daemon is always stopped.
    pub async fn teardown(&self) {
        self.scheduler.shutdown();
        self.connection.disconnect().await;
        log::info!("Wallet runtime stopped");
    }
}

/// Headless entry point: run until Ctrl-C
pub fn run() -> anyhow::Result<()> {
    let data_dir = app_data_dir();
    let _logger = logging::init_logger(&data_dir.join("logs"))?;

    let config = NodeConfig::load();
    let policy = MigrationPolicy::load();
    log::info!(
        "Starting wallet ({:?} node on {})",
        config.mode,
        config.network.as_str()
    );

    let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    runtime.block_on(async {
        let wallet = WalletRuntime::init(config, policy, &data_dir)?;
        logging::set_event_bus(wallet.events().clone());

        if let Err(e) = wallet.start().await {
            log::error!("{:#}", e);
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        log::info!("Shutdown requested");
        wallet.teardown().await;
        Ok::<(), anyhow::Error>(())
    })
}
