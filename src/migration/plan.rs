//! Migration plan records
//!
//! A [`MigrationPlan`] is the durable record of one migration. It is written
//! to the plan store on every transition and is the only thing a restarted
//! scheduler needs to pick up where it left off.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::backup::BackupAcknowledgment;
use crate::wallet::amount::Amount;
use crate::wallet::job::{JobId, TxRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationKind {
    /// One-shot consolidation into a fresh address
    NullifierReset,
    /// Recurring interval-spaced transfers between pools
    Turnstile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AbortReason {
    /// Funds were unconfirmed or below the viable minimum when arming
    InsufficientOrUnconfirmedFunds,
    UserRequested,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::InsufficientOrUnconfirmedFunds => {
                write!(f, "insufficient or unconfirmed funds")
            }
            AbortReason::UserRequested => write!(f, "aborted by user"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PlanStatus {
    Idle,
    Armed,
    Running,
    Completed,
    Aborted { reason: AbortReason },
}

impl PlanStatus {
    /// Armed or Running
    pub fn is_active(&self) -> bool {
        matches!(self, PlanStatus::Armed | PlanStatus::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Aborted { .. })
    }
}

/// A run that was decided on but has not reached a terminal job state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRun {
    /// 1-based run number
    pub cycle: u32,
    pub request: TxRequest,
    pub job_id: JobId,
    /// Daemon operation handle, recorded as soon as the daemon accepts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub id: Uuid,
    pub kind: MigrationKind,
    pub source_addresses: BTreeSet<String>,
    pub destination_address: String,
    /// Turnstile only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_hours: Option<u32>,
    /// Movable funds measured when the plan was armed
    pub total_amount_planned: Amount,
    pub completed_txids: Vec<String>,
    pub next_run_at: DateTime<Utc>,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupAcknowledgment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_run: Option<PendingRun>,
    /// Reason of the most recent failed run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationPlan {
    pub fn new(
        kind: MigrationKind,
        source_addresses: BTreeSet<String>,
        destination_address: String,
        interval_hours: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source_addresses,
            destination_address,
            interval_hours,
            total_amount_planned: Amount::ZERO,
            completed_txids: Vec::new(),
            next_run_at: now,
            status: PlanStatus::Idle,
            backup: None,
            pending_run: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Spacing between runs; nullifier reset runs back to back
    pub fn interval(&self) -> ChronoDuration {
        match (self.kind, self.interval_hours) {
            (MigrationKind::Turnstile, Some(hours)) => ChronoDuration::hours(i64::from(hours)),
            _ => ChronoDuration::zero(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_run_at
    }

    /// Number of the next run to start
    pub fn next_cycle(&self) -> u32 {
        self.completed_txids.len() as u32 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(kind: MigrationKind, hours: Option<u32>) -> MigrationPlan {
        MigrationPlan::new(
            kind,
            ["zs1a".to_string()].into_iter().collect(),
            "zs1dest".to_string(),
            hours,
            Utc::now(),
        )
    }

    #[test]
    fn test_interval() {
        assert_eq!(
            plan(MigrationKind::Turnstile, Some(4)).interval(),
            ChronoDuration::hours(4)
        );
        assert_eq!(
            plan(MigrationKind::NullifierReset, Some(4)).interval(),
            ChronoDuration::zero()
        );
    }

    #[test]
    fn test_status_predicates() {
        assert!(PlanStatus::Armed.is_active());
        assert!(PlanStatus::Running.is_active());
        assert!(!PlanStatus::Idle.is_active());
        assert!(PlanStatus::Completed.is_finished());
        assert!(PlanStatus::Aborted {
            reason: AbortReason::UserRequested
        }
        .is_finished());
    }

    #[test]
    fn test_serialized_shape() {
        let mut plan = plan(MigrationKind::Turnstile, Some(4));
        plan.status = PlanStatus::Aborted {
            reason: AbortReason::InsufficientOrUnconfirmedFunds,
        };

        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["kind"], "turnstile");
        assert_eq!(json["intervalHours"], 4);
        assert_eq!(json["status"]["state"], "aborted");
        assert_eq!(json["status"]["reason"], "insufficientOrUnconfirmedFunds");
        assert!(json.get("pendingRun").is_none());

        let back: MigrationPlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }
}
