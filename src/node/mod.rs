//! Node connection module
//!
//! Launches or locates the blockchain daemon, talks to it over JSON-RPC and
//! exposes one observable connection status.
//!
//! ## Modes
//!
//! - **Embedded**: the wallet launches the daemon, supervises it and stops it
//!   on teardown
//! - **External**: the user runs the daemon; the wallet only uses RPC and never
//!   terminates it
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    node module                           │
//! ├─────────────────────────────────────────────────────────┤
//! │  config.rs     - Connection config and daemon conf file  │
//! │  supervisor.rs - Daemon process lifecycle (start/stop)   │
//! │  rpc.rs        - JSON-RPC transport and typed calls      │
//! │  state.rs      - Shared connection status                │
//! │  connection.rs - Connection state machine and poller     │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod rpc;
pub mod state;
pub mod supervisor;

// Re-export key types for convenience
pub use config::{NodeConfig, NodeMode, Network};
pub use connection::{ConnectionError, ConnectionManager, ConnectionTiming};
pub use rpc::{DaemonApi, DaemonRpc, RpcClient, RpcError};
pub use state::{create_node_state, ConnectionStatus, NodeState, SharedNodeState};
pub use supervisor::{DaemonProcessHandle, DaemonSupervisor, SupervisorError};
