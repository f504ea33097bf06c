//! Migration scheduler
//!
//! Drives [`MigrationPlan`]s through `Idle -> Armed -> Running -> {Completed | Aborted}`.
//!
//! ```text
//! worker (one per active plan)
//!   loop { tick(); sleep(tick_interval) }
//!
//! tick (holds the plan's run lock)
//!   pending run?   ── yes ──► re-attach (operation id) or resubmit, wait
//!   not due?       ── NotDue
//!   check balances ──► nothing movable ──► Completed / WaitingForConfirmations
//!   persist PendingRun ──► submit via TxPipeline ──► persist operation id
//!   wait for terminal job ──► Broadcast: record txid, schedule next run
//!                         └─► Failed: record reason, keep next_run_at
//! ```
//!
//! Every transition is written to the [`PlanStore`] before it becomes
//! visible in memory or on the event stream, and before any RPC call that
//! depends on it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::backup::{BackupAcknowledgment, BackupError};
use super::plan::{AbortReason, MigrationKind, MigrationPlan, PendingRun, PlanStatus};
use super::policy::MigrationPolicy;
use super::store::{PlanStore, StoreError};
use crate::events::{EventBus, WalletEvent};
use crate::node::rpc::{DaemonApi, RpcError};
use crate::wallet::address::parse_address;
use crate::wallet::amount::Amount;
use crate::wallet::job::{Recipient, TxRequest, TxState};
use crate::wallet::pipeline::{PipelineError, TxPipeline};

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("unknown migration plan {0}")]
    UnknownPlan(Uuid),
    #[error("migration plan {id} is {status:?}, expected {expected}")]
    InvalidState {
        id: Uuid,
        status: PlanStatus,
        expected: &'static str,
    },
    #[error("invalid migration plan: {0}")]
    InvalidPlan(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Backup(#[from] BackupError),
}

/// Result of one scheduler step for a plan
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Plan is idle, finished or being aborted
    Inactive,
    NotDue,
    /// Remaining funds exist but none are confirmed yet
    WaitingForConfirmations,
    Broadcast { txid: String },
    RunFailed { reason: String },
    Completed,
}

/// Time source for scheduling decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct PlanSlot {
    /// Serialises runs, arming and aborting of one plan
    run_lock: tokio::sync::Mutex<()>,
    plan: Mutex<MigrationPlan>,
    aborting: AtomicBool,
}

impl PlanSlot {
    fn new(plan: MigrationPlan) -> Arc<Self> {
        Arc::new(Self {
            run_lock: tokio::sync::Mutex::new(()),
            plan: Mutex::new(plan),
            aborting: AtomicBool::new(false),
        })
    }

    fn snapshot(&self) -> MigrationPlan {
        self.plan.lock().clone()
    }
}

struct SourceFunds {
    address: String,
    confirmed: Amount,
    unconfirmed: Amount,
}

struct SchedulerInner {
    api: DaemonApi,
    pipeline: TxPipeline,
    store: PlanStore,
    policy: MigrationPolicy,
    clock: Arc<dyn Clock>,
    events: EventBus,
    plans: Mutex<HashMap<Uuid, Arc<PlanSlot>>>,
    workers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

/// Handle to the migration scheduler; clones share the same plans
#[derive(Clone)]
pub struct MigrationScheduler {
    inner: Arc<SchedulerInner>,
}

impl MigrationScheduler {
    /// Load every persisted plan from `store`. Workers are not started
    /// until [`MigrationScheduler::resume_all`] or [`MigrationScheduler::start`].
    pub fn new(
        api: DaemonApi,
        pipeline: TxPipeline,
        store: PlanStore,
        policy: MigrationPolicy,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MigrationError> {
        let plans = store
            .load_all()?
            .into_iter()
            .map(|plan| (plan.id, PlanSlot::new(plan)))
            .collect::<HashMap<_, _>>();
        log::info!("Loaded {} migration plan(s) from {}", plans.len(), store.dir().display());

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                api,
                pipeline,
                store,
                policy,
                clock,
                events,
                plans: Mutex::new(plans),
                workers: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn policy(&self) -> &MigrationPolicy {
        &self.inner.policy
    }

    pub fn plan(&self, id: &Uuid) -> Option<MigrationPlan> {
        self.inner.plans.lock().get(id).map(|slot| slot.snapshot())
    }

    /// Snapshots of all plans, oldest first
    pub fn plans(&self) -> Vec<MigrationPlan> {
        let mut plans: Vec<MigrationPlan> = self
            .inner
            .plans
            .lock()
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        plans.sort_by_key(|plan| plan.created_at);
        plans
    }

    /// Create a consolidation plan. Without `destination` a fresh shielded
    /// address is generated by the daemon.
    pub async fn create_nullifier_reset(
        &self,
        sources: BTreeSet<String>,
        destination: Option<String>,
    ) -> Result<MigrationPlan, MigrationError> {
        let destination = match destination {
            Some(address) => address,
            None => {
                let address = self.inner.api.new_shielded_address().await?;
                log::info!("Generated nullifier reset destination {}", address);
                address
            }
        };
        self.create(MigrationKind::NullifierReset, sources, destination, None)
    }

    pub fn create_turnstile(
        &self,
        sources: BTreeSet<String>,
        destination: String,
        interval_hours: u32,
    ) -> Result<MigrationPlan, MigrationError> {
        if interval_hours == 0 {
            return Err(MigrationError::InvalidPlan(
                "turnstile interval must be at least one hour".to_string(),
            ));
        }
        self.create(MigrationKind::Turnstile, sources, destination, Some(interval_hours))
    }

    fn create(
        &self,
        kind: MigrationKind,
        sources: BTreeSet<String>,
        destination: String,
        interval_hours: Option<u32>,
    ) -> Result<MigrationPlan, MigrationError> {
        let network = self.inner.pipeline.config().network;
        let sources: BTreeSet<String> = sources.iter().map(|s| s.trim().to_string()).collect();
        let destination = destination.trim().to_string();

        if sources.is_empty() {
            return Err(MigrationError::InvalidPlan("no source addresses".to_string()));
        }
        for address in sources.iter().chain(std::iter::once(&destination)) {
            parse_address(address, network).map_err(|e| {
                MigrationError::InvalidPlan(format!("invalid address '{}': {}", address, e))
            })?;
        }
        if sources.contains(&destination) {
            return Err(MigrationError::InvalidPlan(
                "destination is also a source".to_string(),
            ));
        }

        let plan = MigrationPlan::new(kind, sources, destination, interval_hours, self.inner.clock.now());
        self.inner.store.save(&plan)?;
        self.inner
            .plans
            .lock()
            .insert(plan.id, PlanSlot::new(plan.clone()));
        self.inner
            .events
            .emit(WalletEvent::MigrationProgress(plan.clone()));

        log::info!(
            "Created {:?} migration plan {} ({} sources)",
            plan.kind,
            plan.id,
            plan.source_addresses.len()
        );
        Ok(plan)
    }

    /// Arm an idle plan after the user acknowledged a backup.
    ///
    /// A plan whose funds are not viable is aborted instead and returned in
    /// that state; no transaction is made.
    pub async fn arm(
        &self,
        id: &Uuid,
        backup: BackupAcknowledgment,
    ) -> Result<MigrationPlan, MigrationError> {
        let slot = self.slot(id)?;
        let _run = slot.run_lock.lock().await;
        let plan = slot.snapshot();

        if plan.status != PlanStatus::Idle {
            return Err(MigrationError::InvalidState {
                id: *id,
                status: plan.status,
                expected: "idle",
            });
        }
        backup.verify()?;

        let funds = self.source_funds(&plan).await?;
        let confirmed: Amount = funds.iter().map(|f| f.confirmed).sum();
        let unconfirmed: Amount = funds.iter().map(|f| f.unconfirmed).sum();
        let total = confirmed.checked_add(unconfirmed).unwrap_or(confirmed);
        let min_viable = self.inner.policy.min_viable_amount;

        let (viable, planned) = match plan.kind {
            MigrationKind::NullifierReset => {
                (unconfirmed.is_zero() && confirmed >= min_viable, confirmed)
            }
            MigrationKind::Turnstile => (total >= min_viable, total),
        };

        if !viable {
            log::warn!(
                "Not arming migration plan {}: confirmed {}, unconfirmed {}, minimum {}",
                id,
                confirmed,
                unconfirmed,
                min_viable
            );
            return self.commit(&slot, |p| {
                p.backup = Some(backup);
                p.status = PlanStatus::Aborted {
                    reason: AbortReason::InsufficientOrUnconfirmedFunds,
                };
            });
        }

        let now = self.inner.clock.now();
        let plan = self.commit(&slot, |p| {
            p.backup = Some(backup);
            p.total_amount_planned = planned;
            p.next_run_at = now;
            p.status = PlanStatus::Armed;
        })?;
        log::info!("Armed migration plan {} to move {}", id, planned);
        Ok(plan)
    }

    /// Start the background worker of an armed or running plan
    pub fn start(&self, id: &Uuid) -> Result<(), MigrationError> {
        let plan = self.slot(id)?.snapshot();
        if !plan.status.is_active() {
            return Err(MigrationError::InvalidState {
                id: *id,
                status: plan.status,
                expected: "armed or running",
            });
        }
        self.spawn_worker(*id);
        Ok(())
    }

    /// Start workers for every active plan, e.g. after a restart
    pub fn resume_all(&self) -> usize {
        let active: Vec<Uuid> = self
            .plans()
            .into_iter()
            .filter(|plan| plan.status.is_active())
            .map(|plan| plan.id)
            .collect();

        for id in &active {
            self.spawn_worker(*id);
        }
        if !active.is_empty() {
            log::info!("Resumed {} migration plan(s)", active.len());
        }
        active.len()
    }

    /// Stop a plan on user request. A job not yet accepted by the daemon is
    /// cancelled; one already accepted is waited for and its txid recorded.
    pub async fn abort(&self, id: &Uuid) -> Result<MigrationPlan, MigrationError> {
        let slot = self.slot(id)?;
        slot.aborting.store(true, Ordering::SeqCst);

        if let Some(run) = slot.snapshot().pending_run {
            if let Err(e) = self.inner.pipeline.cancel(&run.job_id) {
                log::info!("Waiting for migration run of plan {} to settle: {}", id, e);
            }
        }

        let _run = slot.run_lock.lock().await;
        let had_worker = match self.inner.workers.lock().remove(id) {
            Some(worker) => {
                worker.abort();
                true
            }
            None => false,
        };

        let plan = slot.snapshot();
        if plan.status.is_finished() {
            return Ok(plan);
        }

        let committed = self.commit(&slot, |p| {
            p.pending_run = None;
            p.status = PlanStatus::Aborted {
                reason: AbortReason::UserRequested,
            };
        });
        let plan = match committed {
            Ok(plan) => plan,
            Err(e) => {
                // Not aborted after all: the plan keeps running
                log::error!("Failed to abort migration plan {}: {}", id, e);
                slot.aborting.store(false, Ordering::SeqCst);
                if had_worker {
                    self.spawn_worker(*id);
                }
                return Err(e);
            }
        };
        log::info!(
            "Migration plan {} aborted after {} transaction(s)",
            id,
            plan.completed_txids.len()
        );
        Ok(plan)
    }

    /// Advance a plan by at most one run. Waits for the run's job to reach a
    /// terminal state before returning.
    pub async fn tick(&self, id: &Uuid) -> Result<TickOutcome, MigrationError> {
        let slot = self.slot(id)?;
        let _run = slot.run_lock.lock().await;
        let plan = slot.snapshot();

        if !plan.status.is_active() || slot.aborting.load(Ordering::SeqCst) {
            return Ok(TickOutcome::Inactive);
        }

        if let Some(pending) = plan.pending_run.clone() {
            log::info!("Resuming run {} of migration plan {}", pending.cycle, id);
            return self.execute(&slot, pending).await;
        }

        let now = self.inner.clock.now();
        if !plan.is_due(now) {
            return Ok(TickOutcome::NotDue);
        }

        let policy = &self.inner.policy;
        let funds = self.source_funds(&plan).await?;
        let Some(source) = funds.iter().find(|f| f.confirmed > policy.fee) else {
            if funds.iter().any(|f| !f.unconfirmed.is_zero()) {
                log::debug!("Migration plan {} waiting for confirmations", id);
                return Ok(TickOutcome::WaitingForConfirmations);
            }
            let plan = self.commit(&slot, |p| p.status = PlanStatus::Completed)?;
            log::info!(
                "Migration plan {} completed after {} transaction(s)",
                id,
                plan.completed_txids.len()
            );
            return Ok(TickOutcome::Completed);
        };

        let mut amount = source.confirmed.saturating_sub(policy.fee);
        let mut memo = None;
        match plan.kind {
            MigrationKind::Turnstile => {
                if let Some(cap) = policy.max_amount_per_run {
                    amount = amount.min(cap);
                }
            }
            MigrationKind::NullifierReset => {
                let network = self.inner.pipeline.config().network;
                if parse_address(&plan.destination_address, network)
                    .map(|kind| kind.is_shielded())
                    .unwrap_or(false)
                {
                    memo = Some(format!("Nullifier reset transaction from {}", source.address));
                }
            }
        }

        let request = TxRequest {
            from_address: source.address.clone(),
            recipients: vec![Recipient {
                address: plan.destination_address.clone(),
                amount,
                memo,
            }],
            fee: policy.fee,
        }
        .normalized();
        let pending = PendingRun {
            cycle: plan.next_cycle(),
            job_id: request.fingerprint(),
            request,
            operation_id: None,
            started_at: now,
        };

        self.inner
            .pipeline
            .set_balance(&source.address, source.confirmed);
        self.commit(&slot, |p| {
            p.status = PlanStatus::Running;
            p.pending_run = Some(pending.clone());
        })?;
        log::info!(
            "Migration plan {} run {}: moving {} from {}",
            id,
            pending.cycle,
            amount,
            source.address
        );

        self.execute(&slot, pending).await
    }

    /// Abort every worker task; plans stay persisted as they are
    pub fn shutdown(&self) {
        let workers: Vec<(Uuid, JoinHandle<()>)> = self.inner.workers.lock().drain().collect();
        for (id, worker) in workers {
            log::debug!("Stopping migration worker for plan {}", id);
            worker.abort();
        }
    }

    fn slot(&self, id: &Uuid) -> Result<Arc<PlanSlot>, MigrationError> {
        self.inner
            .plans
            .lock()
            .get(id)
            .cloned()
            .ok_or(MigrationError::UnknownPlan(*id))
    }

    /// Persist a modified copy of the plan, then publish it
    fn commit<F: FnOnce(&mut MigrationPlan)>(
        &self,
        slot: &PlanSlot,
        f: F,
    ) -> Result<MigrationPlan, MigrationError> {
        let mut next = slot.snapshot();
        f(&mut next);
        next.updated_at = self.inner.clock.now();

        self.inner.store.save(&next)?;

        let mut plan = slot.plan.lock();
        *plan = next.clone();
        self.inner
            .events
            .emit(WalletEvent::MigrationProgress(next.clone()));
        Ok(next)
    }

    async fn source_funds(&self, plan: &MigrationPlan) -> Result<Vec<SourceFunds>, RpcError> {
        let min_conf = self.inner.policy.min_confirmations;
        let mut funds = Vec::with_capacity(plan.source_addresses.len());

        for address in &plan.source_addresses {
            let confirmed = self.inner.api.get_balance(address, min_conf).await?;
            let total = self.inner.api.get_balance(address, 0).await?;
            funds.push(SourceFunds {
                address: address.clone(),
                confirmed,
                unconfirmed: total.saturating_sub(confirmed),
            });
        }
        Ok(funds)
    }

    /// Submit (or re-attach to) the pending run and wait for its outcome
    async fn execute(
        &self,
        slot: &PlanSlot,
        pending: PendingRun,
    ) -> Result<TickOutcome, MigrationError> {
        let pipeline = &self.inner.pipeline;

        let job_id = match &pending.operation_id {
            Some(operation_id) => pipeline.resume(pending.request.clone(), operation_id.clone()),
            None => match pipeline.submit(pending.request.clone()).await {
                Ok(job_id) => job_id,
                Err(PipelineError::DuplicateInFlight(job_id)) => job_id,
                Err(e) => return self.record_failure(slot, e.to_string()),
            },
        };

        let Some(mut progress) = pipeline.watch(&job_id) else {
            return self.record_failure(slot, format!("transaction job {} not found", job_id));
        };

        let mut recorded = pending.operation_id.clone();
        loop {
            let job = progress.borrow_and_update().clone();

            if job.operation_id.is_some() && job.operation_id != recorded {
                recorded = job.operation_id.clone();
                self.commit(slot, |p| {
                    if let Some(run) = p.pending_run.as_mut() {
                        run.operation_id = recorded.clone();
                    }
                })?;
            }

            match job.state {
                TxState::Broadcast { txid } => return self.record_success(slot, txid),
                TxState::Failed { reason } => return self.record_failure(slot, reason),
                TxState::Queued | TxState::Computing => {}
            }

            if progress.changed().await.is_err() {
                return self.record_failure(slot, format!("lost track of transaction job {}", job_id));
            }
        }
    }

    fn record_success(&self, slot: &PlanSlot, txid: String) -> Result<TickOutcome, MigrationError> {
        let now = self.inner.clock.now();
        let plan = self.commit(slot, |p| {
            p.completed_txids.push(txid.clone());
            p.pending_run = None;
            p.last_error = None;
            p.next_run_at = now + p.interval();
        })?;

        log::info!(
            "Migration plan {} run {} broadcast as {}, next run at {}",
            plan.id,
            plan.completed_txids.len(),
            txid,
            plan.next_run_at
        );
        Ok(TickOutcome::Broadcast { txid })
    }

    /// Record a failed run; the plan stays scheduled at its current time
    fn record_failure(&self, slot: &PlanSlot, reason: String) -> Result<TickOutcome, MigrationError> {
        let plan = self.commit(slot, |p| {
            p.pending_run = None;
            p.last_error = Some(reason.clone());
        })?;

        log::warn!("Migration run for plan {} failed: {}", plan.id, reason);
        self.inner.events.emit(WalletEvent::MigrationRunFailed {
            plan_id: plan.id.to_string(),
            reason: reason.clone(),
        });
        Ok(TickOutcome::RunFailed { reason })
    }

    fn spawn_worker(&self, id: Uuid) {
        let mut workers = self.inner.workers.lock();
        if workers.get(&id).is_some_and(|worker| !worker.is_finished()) {
            return;
        }

        let scheduler = self.clone();
        let interval = self.inner.policy.tick_interval();
        let worker = tokio::spawn(async move {
            loop {
                match scheduler.tick(&id).await {
                    Ok(TickOutcome::Inactive) | Ok(TickOutcome::Completed) => break,
                    // A nullifier reset is due again at once
                    Ok(TickOutcome::Broadcast { .. }) => continue,
                    Ok(outcome) => log::debug!("Migration plan {} tick: {:?}", id, outcome),
                    Err(e) => log::error!("Migration plan {} tick failed: {}", id, e),
                }
                tokio::time::sleep(interval).await;
            }
            log::debug!("Migration worker for plan {} finished", id);
        });
        workers.insert(id, worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::config::Network;
    use crate::test_support::{wait_until, MockDaemon};
    use crate::wallet::address::fixtures::*;
    use crate::wallet::pipeline::PipelineConfig;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tempfile::TempDir;

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        fn advance(&self, by: ChronoDuration) {
            *self.0.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    fn amount(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn sources(addresses: &[&str]) -> BTreeSet<String> {
        addresses.iter().map(|a| a.to_string()).collect()
    }

    fn scheduler_with(
        daemon: &Arc<MockDaemon>,
        dir: &TempDir,
        policy: MigrationPolicy,
        clock: Arc<ManualClock>,
        events: EventBus,
    ) -> MigrationScheduler {
        let config = PipelineConfig {
            network: Network::Testnet,
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let pipeline = TxPipeline::new(daemon.api(), config, events.clone());
        MigrationScheduler::new(
            daemon.api(),
            pipeline,
            PlanStore::open(dir.path()).unwrap(),
            policy,
            events,
            clock,
        )
        .unwrap()
    }

    fn scheduler(daemon: &Arc<MockDaemon>, dir: &TempDir, clock: Arc<ManualClock>) -> MigrationScheduler {
        scheduler_with(daemon, dir, MigrationPolicy::default(), clock, EventBus::new())
    }

    fn stored(dir: &TempDir, id: &Uuid) -> MigrationPlan {
        PlanStore::open(dir.path()).unwrap().load(id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_turnstile_runs_to_completion() {
        let daemon = MockDaemon::new();
        daemon.set_balance(TEST_SAPLING_A, "3.0");
        daemon.set_balance(TEST_SAPLING_B, "1.0");
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let policy = MigrationPolicy {
            max_amount_per_run: Some(amount("2.0")),
            ..Default::default()
        };
        let scheduler = scheduler_with(&daemon, &dir, policy, clock.clone(), EventBus::new());

        let plan = scheduler
            .create_turnstile(sources(&[TEST_SAPLING_A, TEST_SAPLING_B]), TEST_SAPLING_C.to_string(), 4)
            .unwrap();
        let plan = scheduler
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Armed);
        assert_eq!(plan.total_amount_planned, amount("4.0"));
        let id = plan.id;

        let mut broadcasts = 0;
        for _ in 0..10 {
            match scheduler.tick(&id).await.unwrap() {
                TickOutcome::Broadcast { .. } => {
                    broadcasts += 1;
                    let plan = scheduler.plan(&id).unwrap();
                    assert_eq!(plan.status, PlanStatus::Running);
                    assert_eq!(plan.next_run_at, clock.now() + ChronoDuration::hours(4));

                    // Never two runs inside one interval
                    assert_eq!(scheduler.tick(&id).await.unwrap(), TickOutcome::NotDue);
                    clock.advance(ChronoDuration::hours(4));
                }
                TickOutcome::Completed => break,
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        let plan = scheduler.plan(&id).unwrap();
        assert_eq!(broadcasts, 3);
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(plan.completed_txids, vec!["txid-1", "txid-2", "txid-3"]);
        assert_eq!(daemon.balance(TEST_SAPLING_A), Amount::ZERO);
        assert_eq!(daemon.balance(TEST_SAPLING_B), Amount::ZERO);
        assert_eq!(stored(&dir, &id), plan);
        assert_eq!(scheduler.tick(&id).await.unwrap(), TickOutcome::Inactive);
    }

    #[tokio::test]
    async fn test_failed_run_keeps_schedule_and_retries() {
        let daemon = MockDaemon::new();
        daemon.set_balance(TEST_SAPLING_A, "1.0");
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let scheduler = scheduler_with(&daemon, &dir, MigrationPolicy::default(), clock.clone(), events);

        let plan = scheduler
            .create_turnstile(sources(&[TEST_SAPLING_A]), TEST_SAPLING_C.to_string(), 4)
            .unwrap();
        let plan = scheduler
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();
        let scheduled = plan.next_run_at;

        daemon.fail_next_operation("tx unpaid action limit exceeded");
        let outcome = scheduler.tick(&plan.id).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::RunFailed {
                reason: "tx unpaid action limit exceeded".to_string()
            }
        );

        let failed = stored(&dir, &plan.id);
        assert_eq!(failed.status, PlanStatus::Running);
        assert_eq!(failed.next_run_at, scheduled);
        assert!(failed.pending_run.is_none());
        assert!(failed.completed_txids.is_empty());
        assert_eq!(failed.last_error.as_deref(), Some("tx unpaid action limit exceeded"));

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            saw_failure |= matches!(event, WalletEvent::MigrationRunFailed { .. });
        }
        assert!(saw_failure);

        // Still due, so the next tick retries
        assert!(matches!(
            scheduler.tick(&plan.id).await.unwrap(),
            TickOutcome::Broadcast { .. }
        ));
        assert!(scheduler.plan(&plan.id).unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_nullifier_reset_aborts_on_unconfirmed_funds() {
        let daemon = MockDaemon::new();
        daemon.set_balance(TEST_SAPLING_A, "2.0");
        daemon.set_unconfirmed(TEST_SAPLING_A, "0.5");
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&daemon, &dir, ManualClock::new());

        let plan = scheduler
            .create_nullifier_reset(sources(&[TEST_SAPLING_A]), Some(TEST_SAPLING_C.to_string()))
            .await
            .unwrap();
        let plan = scheduler
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();

        assert_eq!(
            plan.status,
            PlanStatus::Aborted {
                reason: AbortReason::InsufficientOrUnconfirmedFunds
            }
        );
        assert_eq!(stored(&dir, &plan.id).status, plan.status);
        assert_eq!(scheduler.tick(&plan.id).await.unwrap(), TickOutcome::Inactive);
        assert_eq!(daemon.calls("z_sendmany"), 0);
    }

    #[tokio::test]
    async fn test_nullifier_reset_aborts_below_minimum() {
        let daemon = MockDaemon::new();
        daemon.set_balance(TEST_SAPLING_A, "0.0005");
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&daemon, &dir, ManualClock::new());

        let plan = scheduler
            .create_nullifier_reset(sources(&[TEST_SAPLING_A]), Some(TEST_SAPLING_C.to_string()))
            .await
            .unwrap();
        let plan = scheduler
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();

        assert!(matches!(plan.status, PlanStatus::Aborted { .. }));
        assert_eq!(daemon.calls("z_sendmany"), 0);
    }

    #[tokio::test]
    async fn test_nullifier_reset_moves_each_source_to_fresh_address() {
        let daemon = MockDaemon::new();
        daemon.set_balance(TEST_SAPLING_A, "1.0");
        daemon.set_balance(TEST_SAPLING_B, "0.5");
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&daemon, &dir, ManualClock::new());

        let plan = scheduler
            .create_nullifier_reset(sources(&[TEST_SAPLING_A, TEST_SAPLING_B]), None)
            .await
            .unwrap();
        assert_eq!(plan.destination_address, TEST_SAPLING_D);
        assert!(plan.interval_hours.is_none());

        scheduler
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();

        let first = scheduler.tick(&plan.id).await.unwrap();
        assert!(matches!(first, TickOutcome::Broadcast { .. }));
        let second = scheduler.tick(&plan.id).await.unwrap();
        assert!(matches!(second, TickOutcome::Broadcast { .. }));
        assert_eq!(scheduler.tick(&plan.id).await.unwrap(), TickOutcome::Completed);

        let plan = scheduler.plan(&plan.id).unwrap();
        assert_eq!(plan.completed_txids.len(), 2);
        assert_eq!(plan.total_amount_planned, amount("1.5"));
        assert_eq!(daemon.calls("z_sendmany"), 2);
    }

    #[tokio::test]
    async fn test_turnstile_waits_for_confirmations() {
        let daemon = MockDaemon::new();
        daemon.set_unconfirmed(TEST_SAPLING_A, "1.0");
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&daemon, &dir, ManualClock::new());

        let plan = scheduler
            .create_turnstile(sources(&[TEST_SAPLING_A]), TEST_SAPLING_C.to_string(), 2)
            .unwrap();
        let plan = scheduler
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Armed);

        assert_eq!(
            scheduler.tick(&plan.id).await.unwrap(),
            TickOutcome::WaitingForConfirmations
        );
        assert_eq!(scheduler.plan(&plan.id).unwrap().next_run_at, plan.next_run_at);
        assert_eq!(daemon.calls("z_sendmany"), 0);
    }

    #[tokio::test]
    async fn test_arming_rules() {
        let daemon = MockDaemon::new();
        daemon.set_balance(TEST_SAPLING_A, "1.0");
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&daemon, &dir, ManualClock::new());

        let plan = scheduler
            .create_turnstile(sources(&[TEST_SAPLING_A]), TEST_SAPLING_C.to_string(), 4)
            .unwrap();

        // Not yet armed
        assert_eq!(scheduler.tick(&plan.id).await.unwrap(), TickOutcome::Inactive);
        assert!(matches!(
            scheduler.start(&plan.id),
            Err(MigrationError::InvalidState { .. })
        ));

        let missing = BackupAcknowledgment {
            backup_path: Some(dir.path().join("gone.dat")),
            ..BackupAcknowledgment::user_confirmed()
        };
        assert!(matches!(
            scheduler.arm(&plan.id, missing).await,
            Err(MigrationError::Backup(BackupError::Missing(_)))
        ));

        scheduler
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();
        assert!(matches!(
            scheduler
                .arm(&plan.id, BackupAcknowledgment::user_confirmed())
                .await,
            Err(MigrationError::InvalidState { .. })
        ));
        assert!(stored(&dir, &plan.id).backup.is_some());
    }

    #[tokio::test]
    async fn test_plan_validation() {
        let daemon = MockDaemon::new();
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&daemon, &dir, ManualClock::new());

        assert!(scheduler
            .create_turnstile(BTreeSet::new(), TEST_SAPLING_C.to_string(), 4)
            .is_err());
        assert!(scheduler
            .create_turnstile(sources(&[TEST_SAPLING_A]), TEST_SAPLING_C.to_string(), 0)
            .is_err());
        assert!(scheduler
            .create_turnstile(sources(&[TEST_SAPLING_A]), TEST_SAPLING_A.to_string(), 4)
            .is_err());
        assert!(scheduler
            .create_turnstile(sources(&[MAIN_SAPLING]), TEST_SAPLING_C.to_string(), 4)
            .is_err());
        assert!(scheduler.plans().is_empty());
    }

    #[tokio::test]
    async fn test_restart_replays_pending_run_exactly_once() {
        let daemon = MockDaemon::new();
        daemon.set_balance(TEST_SAPLING_A, "1.0");
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();

        let first = scheduler(&daemon, &dir, clock.clone());
        let plan = first
            .create_turnstile(sources(&[TEST_SAPLING_A]), TEST_SAPLING_C.to_string(), 4)
            .unwrap();
        first
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();
        let id = plan.id;

        // Crash right after the run was persisted, before the daemon saw it
        let request = TxRequest {
            from_address: TEST_SAPLING_A.to_string(),
            recipients: vec![Recipient {
                address: TEST_SAPLING_C.to_string(),
                amount: amount("0.9999"),
                memo: None,
            }],
            fee: amount("0.0001"),
        };
        let mut crashed = stored(&dir, &id);
        crashed.status = PlanStatus::Running;
        crashed.pending_run = Some(PendingRun {
            cycle: 1,
            job_id: request.fingerprint(),
            request,
            operation_id: None,
            started_at: clock.now(),
        });
        PlanStore::open(dir.path()).unwrap().save(&crashed).unwrap();
        drop(first);

        daemon.hold_operations(true);

        // First restart submits and dies while the daemon is computing
        let second = scheduler(&daemon, &dir, clock.clone());
        let task = tokio::spawn({
            let second = second.clone();
            async move { second.tick(&id).await }
        });
        wait_until(|| {
            stored(&dir, &id)
                .pending_run
                .and_then(|run| run.operation_id)
                .is_some()
        })
        .await;
        task.abort();
        drop(second);

        // Second restart re-attaches and dies too
        let third = scheduler(&daemon, &dir, clock.clone());
        let task = tokio::spawn({
            let third = third.clone();
            async move { third.tick(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        task.abort();
        drop(third);

        daemon.release_operations();
        let fourth = scheduler(&daemon, &dir, clock.clone());
        assert_eq!(
            fourth.tick(&id).await.unwrap(),
            TickOutcome::Broadcast {
                txid: "txid-1".to_string()
            }
        );

        assert_eq!(daemon.calls("z_sendmany"), 1);
        let plan = stored(&dir, &id);
        assert_eq!(plan.completed_txids, vec!["txid-1"]);
        assert!(plan.pending_run.is_none());
    }

    #[tokio::test]
    async fn test_abort_waits_for_accepted_run() {
        let daemon = MockDaemon::new();
        daemon.set_balance(TEST_SAPLING_A, "1.0");
        daemon.hold_operations(true);
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&daemon, &dir, ManualClock::new());

        let plan = scheduler
            .create_turnstile(sources(&[TEST_SAPLING_A]), TEST_SAPLING_C.to_string(), 4)
            .unwrap();
        scheduler
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();
        let id = plan.id;

        let run = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.tick(&id).await }
        });
        wait_until(|| {
            scheduler
                .plan(&id)
                .and_then(|p| p.pending_run)
                .and_then(|run| run.operation_id)
                .is_some()
        })
        .await;

        let abort = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.abort(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!abort.is_finished());

        daemon.release_operations();
        assert!(matches!(
            run.await.unwrap().unwrap(),
            TickOutcome::Broadcast { .. }
        ));
        let plan = abort.await.unwrap().unwrap();

        assert_eq!(
            plan.status,
            PlanStatus::Aborted {
                reason: AbortReason::UserRequested
            }
        );
        assert_eq!(plan.completed_txids.len(), 1);
        assert_eq!(stored(&dir, &id), plan);
        assert_eq!(scheduler.tick(&id).await.unwrap(), TickOutcome::Inactive);
    }

    #[tokio::test]
    async fn test_abort_that_cannot_persist_leaves_plan_running() {
        let daemon = MockDaemon::new();
        daemon.set_balance(TEST_SAPLING_A, "1.0");
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&daemon, &dir, ManualClock::new());

        let plan = scheduler
            .create_turnstile(sources(&[TEST_SAPLING_A]), TEST_SAPLING_C.to_string(), 4)
            .unwrap();
        scheduler
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();
        let id = plan.id;

        // A directory in place of the temp file makes every save fail
        let blocker = dir.path().join(format!("{}.json.tmp", id));
        std::fs::create_dir(&blocker).unwrap();
        assert!(matches!(
            scheduler.abort(&id).await.unwrap_err(),
            MigrationError::Store(_)
        ));
        assert_eq!(scheduler.plan(&id).unwrap().status, PlanStatus::Armed);
        assert_eq!(stored(&dir, &id).status, PlanStatus::Armed);

        std::fs::remove_dir(&blocker).unwrap();
        assert!(matches!(
            scheduler.tick(&id).await.unwrap(),
            TickOutcome::Broadcast { .. }
        ));
        let plan = scheduler.abort(&id).await.unwrap();
        assert_eq!(
            plan.status,
            PlanStatus::Aborted {
                reason: AbortReason::UserRequested
            }
        );
    }

    #[tokio::test]
    async fn test_worker_drives_plan_and_resume_all() {
        let daemon = MockDaemon::new();
        daemon.set_balance(TEST_SAPLING_A, "1.0");
        let dir = TempDir::new().unwrap();
        let policy = MigrationPolicy {
            tick_interval_secs: 1,
            ..Default::default()
        };
        let scheduler = scheduler_with(&daemon, &dir, policy, ManualClock::new(), EventBus::new());

        let plan = scheduler
            .create_nullifier_reset(sources(&[TEST_SAPLING_A]), Some(TEST_SAPLING_C.to_string()))
            .await
            .unwrap();
        scheduler
            .arm(&plan.id, BackupAcknowledgment::user_confirmed())
            .await
            .unwrap();

        assert_eq!(scheduler.resume_all(), 1);
        // Second call does not spawn a duplicate worker
        scheduler.start(&plan.id).unwrap();

        for _ in 0..100 {
            if scheduler.plan(&plan.id).unwrap().status == PlanStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let plan = scheduler.plan(&plan.id).unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(plan.completed_txids.len(), 1);
        assert_eq!(daemon.calls("z_sendmany"), 1);
        scheduler.shutdown();
    }
}
