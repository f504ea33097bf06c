//! Transaction pipeline
//!
//! Validates send requests against a balance snapshot, hands them to the
//! daemon's asynchronous builder and tracks each resulting operation until
//! it is broadcast or fails.
//!
//! ```text
//! submit ──► Queued ──(permit)──► Computing ──► Broadcast{txid}
//!              │                      │
//!              └─ cancel ─► Failed    └──────► Failed{daemon reason}
//! ```
//!
//! Jobs are keyed by their request fingerprint. Each job has one runner task
//! and a `watch` channel carrying its latest snapshot; every state change is
//! also published on the [`EventBus`] as [`WalletEvent::TxJobUpdated`].

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};

use super::address::{parse_address, AddressError};
use super::amount::Amount;
use super::job::{JobId, TxJob, TxRequest, TxState};
use crate::events::{EventBus, WalletEvent};
use crate::node::config::Network;
use crate::node::rpc::{DaemonApi, OperationState, RpcError};

/// Memo field capacity in bytes
pub const MAX_MEMO_BYTES: usize = 512;

/// Failure reason recorded on jobs cancelled before reaching the daemon
pub const CANCELLED_REASON: &str = "cancelled before submission";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    // Validation
    #[error("transaction has no recipients")]
    NoRecipients,
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: AddressError },
    #[error("memo not supported for transparent recipient {0}")]
    MemoNotSupported(String),
    #[error("memo for {address} is {len} bytes (max 512)")]
    MemoTooLong { address: String, len: usize },
    #[error("amount for {0} must be positive")]
    NonPositiveAmount(String),
    #[error("transaction total overflows")]
    AmountOverflow,
    #[error("insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: Amount, available: Amount },
    #[error("balance of {address} unavailable: {source}")]
    BalanceUnavailable { address: String, source: RpcError },

    // Concurrency
    #[error("an identical transaction is already in flight ({0})")]
    DuplicateInFlight(JobId),
    #[error("job {0} was already broadcast")]
    AlreadyBroadcast(JobId),
    #[error("job {0} was already accepted by the daemon")]
    AlreadyAccepted(JobId),

    #[error("unknown job {0}")]
    UnknownJob(JobId),
}

impl PipelineError {
    /// Malformed input or not enough funds
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipelineError::NoRecipients
                | PipelineError::InvalidAddress { .. }
                | PipelineError::MemoNotSupported(_)
                | PipelineError::MemoTooLong { .. }
                | PipelineError::NonPositiveAmount(_)
                | PipelineError::AmountOverflow
                | PipelineError::InsufficientFunds { .. }
        )
    }

    /// Conflicts with a job that already exists
    pub fn is_concurrency(&self) -> bool {
        matches!(
            self,
            PipelineError::DuplicateInFlight(_)
                | PipelineError::AlreadyBroadcast(_)
                | PipelineError::AlreadyAccepted(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub network: Network,
    /// Delay between `z_getoperationstatus` polls
    pub poll_interval: Duration,
    /// Jobs allowed in Computing at once
    pub max_concurrent: usize,
    /// Confirmations required for a balance to count as available
    pub min_confirmations: u32,
    /// Consecutive unreachable polls tolerated before a job is failed
    pub max_poll_failures: u32,
    /// Age after which a balance snapshot is re-read from the daemon
    pub balance_max_age: Duration,
    /// Finished jobs kept for polling once nobody watches them
    pub finished_job_history: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            poll_interval: Duration::from_secs(1),
            max_concurrent: 4,
            min_confirmations: 1,
            max_poll_failures: 30,
            balance_max_age: Duration::from_secs(30),
            finished_job_history: 256,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BalanceSnapshot {
    amount: Amount,
    read_at: Instant,
}

struct PipelineInner {
    api: DaemonApi,
    config: PipelineConfig,
    jobs: Mutex<HashMap<JobId, watch::Sender<TxJob>>>,
    balances: Mutex<HashMap<String, BalanceSnapshot>>,
    permits: Arc<Semaphore>,
    events: EventBus,
}

/// Handle to the transaction pipeline; clones share the same jobs
#[derive(Clone)]
pub struct TxPipeline {
    inner: Arc<PipelineInner>,
}

impl TxPipeline {
    pub fn new(api: DaemonApi, config: PipelineConfig, events: EventBus) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(PipelineInner {
                api,
                config,
                jobs: Mutex::new(HashMap::new()),
                balances: Mutex::new(HashMap::new()),
                permits,
                events,
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Validate and enqueue a request. Returns as soon as the job is queued;
    /// progress is observed through [`TxPipeline::poll`] or [`TxPipeline::watch`].
    pub async fn submit(&self, request: TxRequest) -> Result<JobId, PipelineError> {
        let request = request.normalized();
        self.validate(&request)?;
        self.ensure_not_in_flight(&request.fingerprint())?;

        let needed = request.total_spend().ok_or(PipelineError::AmountOverflow)?;
        let available = self.available_balance(&request.from_address).await?;
        if needed > available {
            return Err(PipelineError::InsufficientFunds { needed, available });
        }

        let id = self.insert(TxJob::new(&request, TxState::Queued))?;
        log::info!(
            "Queued transaction {} from {} ({} outputs, total {})",
            id,
            request.from_address,
            request.recipients.len(),
            needed
        );

        tokio::spawn(run_job(self.inner.clone(), id.clone(), request, None));
        Ok(id)
    }

    /// Re-attach to an operation the daemon accepted before a restart.
    ///
    /// An already tracked in-flight job with the same fingerprint is reused.
    /// If the daemon no longer knows `operation_id`, the request is submitted
    /// once more.
    pub fn resume(&self, request: TxRequest, operation_id: String) -> JobId {
        let request = request.normalized();
        let mut job = TxJob::new(&request, TxState::Computing);
        job.operation_id = Some(operation_id.clone());

        match self.insert(job) {
            Ok(id) => {
                log::info!("Resuming transaction {} (operation {})", id, operation_id);
                tokio::spawn(run_job(self.inner.clone(), id.clone(), request, Some(operation_id)));
                id
            }
            Err(PipelineError::DuplicateInFlight(id)) => id,
            Err(_) => request.fingerprint(),
        }
    }

    /// Snapshot of one job
    pub fn poll(&self, id: &JobId) -> Result<TxJob, PipelineError> {
        self.inner
            .jobs
            .lock()
            .get(id)
            .map(|tx| tx.borrow().clone())
            .ok_or_else(|| PipelineError::UnknownJob(id.clone()))
    }

    /// Live progress of one job
    pub fn watch(&self, id: &JobId) -> Option<watch::Receiver<TxJob>> {
        self.inner.jobs.lock().get(id).map(|tx| tx.subscribe())
    }

    /// Snapshots of every known job, oldest first
    pub fn jobs(&self) -> Vec<TxJob> {
        let mut jobs: Vec<TxJob> = self
            .inner
            .jobs
            .lock()
            .values()
            .map(|tx| tx.borrow().clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Cancel a job that has not reached the daemon yet.
    ///
    /// Cancelling an already failed job is a no-op.
    pub fn cancel(&self, id: &JobId) -> Result<(), PipelineError> {
        let mut result = Ok(());
        let found = self.inner.update(id, |job| match job.state {
            TxState::Queued => {
                job.state = TxState::Failed {
                    reason: CANCELLED_REASON.to_string(),
                };
                true
            }
            TxState::Computing => {
                result = Err(PipelineError::AlreadyAccepted(id.clone()));
                false
            }
            TxState::Broadcast { .. } => {
                result = Err(PipelineError::AlreadyBroadcast(id.clone()));
                false
            }
            TxState::Failed { .. } => false,
        });

        if !found {
            return Err(PipelineError::UnknownJob(id.clone()));
        }
        if result.is_ok() {
            log::info!("Cancelled transaction {}", id);
        }
        result
    }

    /// Record a freshly read balance for `address`
    pub fn set_balance(&self, address: &str, balance: Amount) {
        self.inner.balances.lock().insert(
            address.to_string(),
            BalanceSnapshot {
                amount: balance,
                read_at: Instant::now(),
            },
        );
    }

    /// Latest known balance of `address`, however old
    pub fn balance(&self, address: &str) -> Option<Amount> {
        self.inner.balances.lock().get(address).map(|b| b.amount)
    }

    /// Snapshot still young enough to validate against
    fn fresh_balance(&self, address: &str) -> Option<Amount> {
        let max_age = self.inner.config.balance_max_age;
        self.inner
            .balances
            .lock()
            .get(address)
            .filter(|b| b.read_at.elapsed() < max_age)
            .map(|b| b.amount)
    }

    /// Re-read balances of `addresses` from the daemon
    pub async fn refresh_balances(&self, addresses: &[String]) -> Result<(), RpcError> {
        let min_conf = self.inner.config.min_confirmations;
        let results = futures_util::future::join_all(
            addresses
                .iter()
                .map(|address| self.inner.api.get_balance(address, min_conf)),
        )
        .await;

        for (address, result) in addresses.iter().zip(results) {
            self.set_balance(address, result?);
        }
        Ok(())
    }

    fn validate(&self, request: &TxRequest) -> Result<(), PipelineError> {
        let network = self.inner.config.network;

        if request.recipients.is_empty() {
            return Err(PipelineError::NoRecipients);
        }
        parse_address(&request.from_address, network).map_err(|reason| {
            PipelineError::InvalidAddress {
                address: request.from_address.clone(),
                reason,
            }
        })?;

        for recipient in &request.recipients {
            let kind = parse_address(&recipient.address, network).map_err(|reason| {
                PipelineError::InvalidAddress {
                    address: recipient.address.clone(),
                    reason,
                }
            })?;
            if recipient.amount.is_zero() {
                return Err(PipelineError::NonPositiveAmount(recipient.address.clone()));
            }
            if let Some(memo) = &recipient.memo {
                if !kind.is_shielded() {
                    return Err(PipelineError::MemoNotSupported(recipient.address.clone()));
                }
                if memo.len() > MAX_MEMO_BYTES {
                    return Err(PipelineError::MemoTooLong {
                        address: recipient.address.clone(),
                        len: memo.len(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn available_balance(&self, address: &str) -> Result<Amount, PipelineError> {
        if let Some(balance) = self.fresh_balance(address) {
            return Ok(balance);
        }

        let balance = self
            .inner
            .api
            .get_balance(address, self.inner.config.min_confirmations)
            .await
            .map_err(|source| PipelineError::BalanceUnavailable {
                address: address.to_string(),
                source,
            })?;
        self.set_balance(address, balance);
        Ok(balance)
    }

    fn ensure_not_in_flight(&self, id: &JobId) -> Result<(), PipelineError> {
        match self.inner.jobs.lock().get(id) {
            Some(existing) if existing.borrow().state.is_in_flight() => {
                Err(PipelineError::DuplicateInFlight(id.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Register a new job unless an identical one is still in flight
    fn insert(&self, job: TxJob) -> Result<JobId, PipelineError> {
        let id = job.id.clone();
        let mut jobs = self.inner.jobs.lock();

        if let Some(existing) = jobs.get(&id) {
            if existing.borrow().state.is_in_flight() {
                return Err(PipelineError::DuplicateInFlight(id));
            }
        }
        prune_finished(&mut jobs, self.inner.config.finished_job_history);

        self.inner.events.emit(WalletEvent::TxJobUpdated(job.clone()));
        let (tx, _) = watch::channel(job);
        jobs.insert(id.clone(), tx);
        Ok(id)
    }
}

impl PipelineInner {
    /// Apply `f` to a job; publishes the result when `f` reports a change.
    /// Returns false when the job is unknown.
    fn update<F: FnOnce(&mut TxJob) -> bool>(&self, id: &JobId, f: F) -> bool {
        let jobs = self.jobs.lock();
        let Some(tx) = jobs.get(id) else {
            return false;
        };

        let changed = tx.send_if_modified(|job| {
            let changed = f(job);
            if changed {
                job.updated_at = Utc::now();
            }
            changed
        });
        if changed {
            self.events.emit(WalletEvent::TxJobUpdated(tx.borrow().clone()));
        }
        true
    }

    fn set_operation(&self, id: &JobId, operation_id: &str) {
        self.update(id, |job| {
            job.operation_id = Some(operation_id.to_string());
            true
        });
    }

    fn fail(&self, id: &JobId, reason: String) {
        log::warn!("Transaction {} failed: {}", id, reason);
        self.update(id, |job| {
            job.state = TxState::Failed { reason };
            true
        });
    }

    fn broadcast(&self, id: &JobId, request: &TxRequest, txid: String) {
        log::info!("Transaction {} broadcast as {}", id, txid);
        // The daemon's view is authoritative again once the spend is out
        self.balances.lock().remove(&request.from_address);
        self.update(id, |job| {
            job.state = TxState::Broadcast { txid };
            true
        });
    }

    async fn send(&self, request: &TxRequest) -> Result<String, String> {
        self.api
            .send_many(
                &request.from_address,
                &request.recipients,
                self.config.min_confirmations,
                request.fee,
            )
            .await
            .map_err(failure_reason)
    }
}

/// Drop the oldest unwatched finished jobs beyond `keep`
fn prune_finished(jobs: &mut HashMap<JobId, watch::Sender<TxJob>>, keep: usize) {
    let mut finished: Vec<_> = jobs
        .iter()
        .filter(|(_, tx)| tx.receiver_count() == 0 && tx.borrow().state.is_terminal())
        .map(|(id, tx)| (tx.borrow().updated_at, id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }

    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
    log::debug!("Pruned {} finished transaction jobs", excess);
}

/// Daemon errors are reported verbatim; anything else with its context
fn failure_reason(error: RpcError) -> String {
    match error {
        RpcError::DaemonError { message, .. } => message,
        other => other.to_string(),
    }
}

async fn run_job(
    inner: Arc<PipelineInner>,
    id: JobId,
    request: TxRequest,
    resumed_operation: Option<String>,
) {
    let Ok(_permit) = inner.permits.clone().acquire_owned().await else {
        inner.fail(&id, "transaction pipeline closed".to_string());
        return;
    };

    let mut resubmit_allowed = resumed_operation.is_some();
    let mut operation_id = match resumed_operation {
        Some(operation_id) => operation_id,
        None => {
            let mut started = false;
            inner.update(&id, |job| {
                if job.state == TxState::Queued {
                    job.state = TxState::Computing;
                    started = true;
                }
                started
            });
            if !started {
                // Cancelled while waiting for a permit
                return;
            }

            match inner.send(&request).await {
                Ok(operation_id) => operation_id,
                Err(reason) => {
                    inner.fail(&id, reason);
                    return;
                }
            }
        }
    };
    inner.set_operation(&id, &operation_id);

    let mut poll_failures = 0u32;
    loop {
        tokio::time::sleep(inner.config.poll_interval).await;

        match inner.api.get_operation_status(&operation_id).await {
            Ok(Some(status)) => {
                poll_failures = 0;
                match status.state() {
                    OperationState::Pending => {}
                    OperationState::Success { txid } => {
                        inner.broadcast(&id, &request, txid);
                        return;
                    }
                    OperationState::Failed { message } => {
                        inner.fail(&id, message);
                        return;
                    }
                }
            }
            Ok(None) if resubmit_allowed => {
                resubmit_allowed = false;
                log::warn!(
                    "Daemon has no record of operation {}, resubmitting transaction {}",
                    operation_id,
                    id
                );
                match inner.send(&request).await {
                    Ok(new_operation) => {
                        operation_id = new_operation;
                        inner.set_operation(&id, &operation_id);
                    }
                    Err(reason) => {
                        inner.fail(&id, reason);
                        return;
                    }
                }
            }
            Ok(None) => {
                inner.fail(&id, format!("operation {} unknown to daemon", operation_id));
                return;
            }
            Err(e) if e.is_retryable() => {
                poll_failures += 1;
                log::debug!("Status poll for {} failed ({}): {}", id, poll_failures, e);
                if poll_failures > inner.config.max_poll_failures {
                    inner.fail(&id, format!("lost contact with daemon: {}", e));
                    return;
                }
            }
            Err(e) => {
                inner.fail(&id, failure_reason(e));
                return;
            }
        }
    }
}
