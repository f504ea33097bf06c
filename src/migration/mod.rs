//! Fund migration
//!
//! Long-running plans that move funds out of source addresses in a series
//! of transactions:
//!
//! - **Nullifier reset**: one transaction per source into a fresh shielded
//!   address, back to back, until nothing movable is left
//! - **Turnstile**: capped transfers spaced by a fixed interval, typically
//!   from an older shielded pool into a newer one
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  migration module                        │
//! ├─────────────────────────────────────────────────────────┤
//! │  plan.rs      - Plan record and status                   │
//! │  policy.rs    - Thresholds (min viable, confirmations)   │
//! │  store.rs     - Durable one-file-per-plan storage        │
//! │  backup.rs    - Wallet backup and acknowledgment         │
//! │  scheduler.rs - Arming, per-plan workers, crash resume   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod backup;
pub mod plan;
pub mod policy;
pub mod scheduler;
pub mod store;

pub use backup::{backup_wallet, BackupAcknowledgment, BackupError};
pub use plan::{AbortReason, MigrationKind, MigrationPlan, PendingRun, PlanStatus};
pub use policy::MigrationPolicy;
pub use scheduler::{Clock, MigrationError, MigrationScheduler, SystemClock, TickOutcome};
pub use store::{PlanStore, StoreError};
