//! JSON-RPC client for the node daemon
//!
//! [`RpcClient`] is the HTTP transport; [`DaemonApi`] wraps any
//! [`DaemonRpc`] implementation with the typed calls the wallet needs.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use super::config::{AuthMethod, NodeConfig};
use crate::wallet::amount::Amount;
use crate::wallet::job::Recipient;

/// Default timeout for status-style calls
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon error code reported while the node is still loading
pub const RPC_IN_WARMUP: i64 = -28;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// Credentials rejected; retrying without a config change is pointless
    #[error("RPC credentials rejected by the daemon")]
    Unauthorized,
    /// Connection refused, reset or timed out
    #[error("daemon unreachable: {0}")]
    Unreachable(String),
    /// Structured error returned by the daemon itself
    #[error("daemon error {code}: {message}")]
    DaemonError { code: i64, message: String },
    /// Response was not valid JSON-RPC
    #[error("malformed RPC response: {0}")]
    Protocol(String),
    #[error("failed to set up RPC transport: {0}")]
    Setup(String),
}

impl RpcError {
    /// Whether a later call may succeed without any change on our side
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Unreachable(_) => true,
            RpcError::DaemonError { code, .. } => *code == RPC_IN_WARMUP,
            _ => false,
        }
    }
}

/// Raw request/response channel to the daemon
#[async_trait]
pub trait DaemonRpc: Send + Sync {
    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError>;
}

/// RPC request structure
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: Vec<Value>,
}

/// RPC response structure
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// HTTP JSON-RPC client built from a [`NodeConfig`]
///
/// Holds no per-call state, so one instance can be shared by every poller.
pub struct RpcClient {
    url: String,
    config: NodeConfig,
    http: reqwest::Client,
}

impl RpcClient {
    pub fn from_config(config: &NodeConfig) -> Result<Self, RpcError> {
        let url = url::Url::parse(&format!(
            "http://{}:{}/",
            config.rpc_host,
            config.effective_rpc_port()
        ))
        .map_err(|e| RpcError::Setup(format!("invalid RPC endpoint: {}", e)))?;

        let mut builder = reqwest::Client::builder();
        if config.proxy_rpc() {
            let proxy = reqwest::Proxy::all(format!("socks5h://{}", config.tor_proxy))
                .map_err(|e| RpcError::Setup(format!("invalid Tor proxy: {}", e)))?;
            builder = builder.proxy(proxy);
            log::info!("RPC traffic routed through SOCKS proxy {}", config.tor_proxy);
        }
        let http = builder
            .build()
            .map_err(|e| RpcError::Setup(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: url.to_string(),
            config: config.clone(),
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolve credentials for this call. The cookie is re-read every time
    /// because the daemon rewrites it on each start.
    fn credentials(&self) -> Option<(String, String)> {
        match self.config.auth_method {
            AuthMethod::Userpass => Some((
                self.config.rpc_user.clone().unwrap_or_default(),
                self.config.rpc_password.clone().unwrap_or_default(),
            )),
            AuthMethod::Cookie => {
                let content = fs::read_to_string(self.config.cookie_path()).ok()?;
                let (user, password) = content.trim().split_once(':')?;
                Some((user.to_string(), password.to_string()))
            }
        }
    }
}

#[async_trait]
impl DaemonRpc for RpcClient {
    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: 1,
            method,
            params,
        };

        let mut req = self.http.post(&self.url).timeout(timeout).json(&request);
        if let Some((user, password)) = self.credentials() {
            req = req.basic_auth(user, Some(password));
        }

        let response = req
            .send()
            .await
            .map_err(|e| RpcError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RpcError::Unauthorized);
        }

        let body = response
            .text()
            .await
            .map_err(|e| RpcError::Unreachable(e.to_string()))?;

        // The daemon reports errors with a non-2xx status and a JSON body
        let parsed: RpcResponse = serde_json::from_str(&body)
            .map_err(|e| RpcError::Protocol(format!("HTTP {}: {}", status, e)))?;

        if let Some(error) = parsed.error {
            return Err(RpcError::DaemonError {
                code: error.code,
                message: error.message,
            });
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

/// Subset of `getblockchaininfo`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BlockchainInfo {
    #[serde(default)]
    pub chain: String,
    pub blocks: u64,
    pub headers: u64,
    #[serde(default)]
    pub verificationprogress: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OperationResult {
    pub txid: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OperationErrorBody {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

/// Entry of `z_getoperationstatus`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OperationStatus {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<OperationResult>,
    #[serde(default)]
    pub error: Option<OperationErrorBody>,
}

/// Interpreted progress of an asynchronous daemon operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationState {
    Pending,
    Success { txid: String },
    Failed { message: String },
}

impl OperationStatus {
    pub fn state(&self) -> OperationState {
        match self.status.as_str() {
            "success" => match &self.result {
                Some(result) => OperationState::Success {
                    txid: result.txid.clone(),
                },
                None => OperationState::Failed {
                    message: "operation succeeded without a txid".to_string(),
                },
            },
            "failed" => OperationState::Failed {
                message: self
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "operation failed".to_string()),
            },
            "cancelled" => OperationState::Failed {
                message: "operation cancelled by daemon".to_string(),
            },
            _ => OperationState::Pending,
        }
    }
}

/// Typed daemon calls over any [`DaemonRpc`]
#[derive(Clone)]
pub struct DaemonApi {
    rpc: Arc<dyn DaemonRpc>,
    timeout: Duration,
}

impl DaemonApi {
    pub fn new(rpc: Arc<dyn DaemonRpc>) -> Self {
        Self {
            rpc,
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.rpc.call(method, params, self.timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("{}: {}", method, e)))
    }

    pub async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.call_as("getblockchaininfo", vec![]).await
    }

    pub async fn get_peer_count(&self) -> Result<u32, RpcError> {
        let peers: Vec<Value> = self.call_as("getpeerinfo", vec![]).await?;
        Ok(peers.len() as u32)
    }

    /// Balance of one address counting outputs with at least `minconf` confirmations
    pub async fn get_balance(&self, address: &str, minconf: u32) -> Result<Amount, RpcError> {
        let coins: f64 = self
            .call_as("z_getbalance", vec![json!(address), json!(minconf)])
            .await?;
        Amount::from_coins(coins)
            .ok_or_else(|| RpcError::Protocol(format!("invalid balance {}", coins)))
    }

    /// Submit an asynchronous send; returns the daemon's operation id
    pub async fn send_many(
        &self,
        from: &str,
        recipients: &[Recipient],
        minconf: u32,
        fee: Amount,
    ) -> Result<String, RpcError> {
        let outputs: Vec<Value> = recipients
            .iter()
            .map(|r| {
                let mut output = json!({
                    "address": r.address,
                    "amount": r.amount.to_coins(),
                });
                if let Some(memo) = &r.memo {
                    output["memo"] = json!(hex::encode(memo.as_bytes()));
                }
                output
            })
            .collect();

        self.call_as(
            "z_sendmany",
            vec![json!(from), json!(outputs), json!(minconf), json!(fee.to_coins())],
        )
        .await
    }

    /// Status of one operation, `None` when the daemon does not know it
    pub async fn get_operation_status(
        &self,
        operation_id: &str,
    ) -> Result<Option<OperationStatus>, RpcError> {
        let statuses: Vec<OperationStatus> = self
            .call_as("z_getoperationstatus", vec![json!([operation_id])])
            .await?;
        Ok(statuses.into_iter().find(|s| s.id == operation_id))
    }

    pub async fn new_shielded_address(&self) -> Result<String, RpcError> {
        self.call_as("z_getnewaddress", vec![json!("sapling")]).await
    }

    /// Ask the daemon to shut down gracefully
    pub async fn stop(&self) -> Result<(), RpcError> {
        self.rpc.call("stop", vec![], self.timeout).await.map(|_| ())
    }
}

/// Send the RPC `stop` command to the daemon described by `config`
pub async fn stop_node_gracefully(config: &NodeConfig) -> Result<(), RpcError> {
    let client = RpcClient::from_config(config)?;
    log::info!("Sending RPC stop command to {}", client.url());
    DaemonApi::new(Arc::new(client)).stop().await
}
