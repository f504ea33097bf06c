//! Transaction job model
//!
//! A [`TxRequest`] describes what to send; a [`TxJob`] tracks one submission
//! of it through the pipeline. Jobs are keyed by the request fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::amount::Amount;

/// One output of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub address: String,
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// A request to build and broadcast a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    pub from_address: String,
    pub recipients: Vec<Recipient>,
    pub fee: Amount,
}

impl TxRequest {
    /// Trimmed copy; empty memos are dropped
    pub fn normalized(&self) -> TxRequest {
        TxRequest {
            from_address: self.from_address.trim().to_string(),
            recipients: self
                .recipients
                .iter()
                .map(|r| Recipient {
                    address: r.address.trim().to_string(),
                    amount: r.amount,
                    memo: r.memo.clone().filter(|m| !m.is_empty()),
                })
                .collect(),
            fee: self.fee,
        }
    }

    /// Deterministic identifier of the normalized request. Used for
    /// in-flight deduplication only.
    pub fn fingerprint(&self) -> JobId {
        let normalized = self.normalized();
        let mut hasher = Sha256::new();

        hasher.update(normalized.from_address.as_bytes());
        for recipient in &normalized.recipients {
            hasher.update([0u8]);
            hasher.update(recipient.address.as_bytes());
            hasher.update(recipient.amount.units().to_be_bytes());
            match &recipient.memo {
                Some(memo) => {
                    hasher.update([1u8]);
                    hasher.update((memo.len() as u64).to_be_bytes());
                    hasher.update(memo.as_bytes());
                }
                None => hasher.update([2u8]),
            }
        }
        hasher.update([3u8]);
        hasher.update(normalized.fee.units().to_be_bytes());

        JobId(hex::encode(hasher.finalize()))
    }

    /// Sum of outputs plus fee
    pub fn total_spend(&self) -> Option<Amount> {
        self.recipients
            .iter()
            .try_fold(self.fee, |acc, r| acc.checked_add(r.amount))
    }
}

/// Job identifier (request fingerprint, lowercase hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TxState {
    Queued,
    Computing,
    Broadcast { txid: String },
    Failed { reason: String },
}

impl TxState {
    /// Queued or Computing
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TxState::Queued | TxState::Computing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }
}

/// Snapshot of a submitted transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxJob {
    pub id: JobId,
    pub from_address: String,
    pub recipients: Vec<Recipient>,
    pub fee: Amount,
    pub state: TxState,
    /// Daemon operation handle once the build request was accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TxJob {
    pub fn new(request: &TxRequest, state: TxState) -> Self {
        let now = Utc::now();
        Self {
            id: request.fingerprint(),
            from_address: request.from_address.clone(),
            recipients: request.recipients.clone(),
            fee: request.fee,
            state,
            operation_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn request(&self) -> TxRequest {
        TxRequest {
            from_address: self.from_address.clone(),
            recipients: self.recipients.clone(),
            fee: self.fee,
        }
    }
}
