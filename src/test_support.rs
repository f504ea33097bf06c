//! Scripted in-memory daemon for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::node::rpc::{DaemonApi, DaemonRpc, RpcError};
use crate::wallet::amount::Amount;

#[derive(Debug, Clone)]
struct MockOperation {
    from: String,
    total: Amount,
    status: &'static str,
    txid: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    blocks: u64,
    headers: u64,
    peers: u32,
    confirmed: HashMap<String, Amount>,
    unconfirmed: HashMap<String, Amount>,
    operations: HashMap<String, MockOperation>,
    next_id: u32,
    hold_operations: bool,
    call_errors: VecDeque<RpcError>,
    send_errors: VecDeque<RpcError>,
    operation_failures: VecDeque<String>,
    status_errors: VecDeque<RpcError>,
    unreachable_calls: u32,
    unauthorized: bool,
    calls: Vec<String>,
}

/// Daemon double: balances, async operations and failure injection
#[derive(Debug, Default)]
pub struct MockDaemon {
    state: Mutex<MockState>,
}

impl MockDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn api(self: &Arc<Self>) -> DaemonApi {
        DaemonApi::new(self.clone())
    }

    pub fn set_chain(&self, blocks: u64, headers: u64, peers: u32) {
        let mut state = self.state.lock();
        state.blocks = blocks;
        state.headers = headers;
        state.peers = peers;
    }

    pub fn set_balance(&self, address: &str, confirmed: &str) {
        let amount = confirmed.parse().expect("valid amount");
        self.state.lock().confirmed.insert(address.to_string(), amount);
    }

    pub fn set_unconfirmed(&self, address: &str, unconfirmed: &str) {
        let amount = unconfirmed.parse().expect("valid amount");
        self.state.lock().unconfirmed.insert(address.to_string(), amount);
    }

    pub fn balance(&self, address: &str) -> Amount {
        self.state.lock().confirmed.get(address).copied().unwrap_or_default()
    }

    /// Keep new operations in "executing" until [`MockDaemon::release_operations`]
    pub fn hold_operations(&self, hold: bool) {
        self.state.lock().hold_operations = hold;
    }

    pub fn release_operations(&self) {
        let mut state = self.state.lock();
        state.hold_operations = false;
    }

    /// Forget every operation, as a restarted daemon would
    pub fn forget_operations(&self) {
        self.state.lock().operations.clear();
    }

    /// Fail the next call of any method
    pub fn fail_next_call(&self, error: RpcError) {
        self.state.lock().call_errors.push_back(error);
    }

    pub fn fail_next_send(&self, error: RpcError) {
        self.state.lock().send_errors.push_back(error);
    }

    pub fn fail_next_operation(&self, message: &str) {
        self.state.lock().operation_failures.push_back(message.to_string());
    }

    pub fn fail_next_status(&self, error: RpcError) {
        self.state.lock().status_errors.push_back(error);
    }

    pub fn set_unreachable_calls(&self, count: u32) {
        self.state.lock().unreachable_calls = count;
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.state.lock().unauthorized = unauthorized;
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.iter().filter(|m| *m == method).count()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    fn send_many(state: &mut MockState, params: &[Value]) -> Result<Value, RpcError> {
        if let Some(error) = state.send_errors.pop_front() {
            return Err(error);
        }

        let from = params[0].as_str().unwrap_or_default().to_string();
        let outputs = params[1].as_array().cloned().unwrap_or_default();
        let fee = Amount::from_coins(params[3].as_f64().unwrap_or_default()).unwrap_or_default();
        let total: Amount = outputs
            .iter()
            .map(|o| Amount::from_coins(o["amount"].as_f64().unwrap_or_default()).unwrap_or_default())
            .chain(std::iter::once(fee))
            .sum();

        state.next_id += 1;
        let opid = format!("opid-{}", state.next_id);
        let error = state.operation_failures.pop_front();
        state.operations.insert(
            opid.clone(),
            MockOperation {
                from,
                total,
                status: if error.is_some() { "failed" } else { "queued" },
                txid: None,
                error,
            },
        );
        Ok(json!(opid))
    }

    fn operation_status(state: &mut MockState, params: &[Value]) -> Value {
        let ids: Vec<String> = params[0]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let hold = state.hold_operations;
        let mut out = Vec::new();

        for id in ids {
            let Some(mut op) = state.operations.get(&id).cloned() else {
                continue;
            };
            if op.status != "failed" && op.status != "success" {
                if hold {
                    op.status = "executing";
                } else {
                    let txid = format!("txid-{}", id.trim_start_matches("opid-"));
                    let balance = state.confirmed.entry(op.from.clone()).or_default();
                    *balance = balance.saturating_sub(op.total);
                    op.status = "success";
                    op.txid = Some(txid);
                }
                state.operations.insert(id.clone(), op.clone());
            }

            let mut entry = json!({"id": id, "status": op.status});
            if let Some(txid) = &op.txid {
                entry["result"] = json!({"txid": txid});
            }
            if let Some(error) = &op.error {
                entry["error"] = json!({"code": -6, "message": error});
            }
            out.push(entry);
        }
        json!(out)
    }
}

#[async_trait]
impl DaemonRpc for MockDaemon {
    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        _timeout: Duration,
    ) -> Result<Value, RpcError> {
        let mut state = self.state.lock();
        state.calls.push(method.to_string());

        if state.unauthorized {
            return Err(RpcError::Unauthorized);
        }
        if let Some(error) = state.call_errors.pop_front() {
            return Err(error);
        }
        if state.unreachable_calls > 0 {
            state.unreachable_calls -= 1;
            return Err(RpcError::Unreachable("connection refused".to_string()));
        }

        match method {
            "getblockchaininfo" => Ok(json!({
                "chain": "test",
                "blocks": state.blocks,
                "headers": state.headers,
                "verificationprogress": 1.0
            })),
            "getpeerinfo" => Ok(json!((0..state.peers).map(|i| json!({"id": i})).collect::<Vec<_>>())),
            "z_getbalance" => {
                let address = params[0].as_str().unwrap_or_default();
                let minconf = params[1].as_u64().unwrap_or(1);
                let confirmed = state.confirmed.get(address).copied().unwrap_or_default();
                let unconfirmed = state.unconfirmed.get(address).copied().unwrap_or_default();
                let balance = if minconf == 0 {
                    confirmed.checked_add(unconfirmed).unwrap_or(confirmed)
                } else {
                    confirmed
                };
                Ok(json!(balance.to_coins()))
            }
            "z_sendmany" => Self::send_many(&mut state, &params),
            "z_getoperationstatus" => {
                if let Some(error) = state.status_errors.pop_front() {
                    return Err(error);
                }
                Ok(Self::operation_status(&mut state, &params))
            }
            "z_getnewaddress" => Ok(json!(crate::wallet::address::fixtures::TEST_SAPLING_D)),
            "stop" => Ok(json!("stopping")),
            other => Err(RpcError::DaemonError {
                code: -32601,
                message: format!("Method not found: {}", other),
            }),
        }
    }
}

/// Poll `check` until it returns true or two seconds pass
pub async fn wait_until<F: FnMut() -> bool>(mut check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
