//! Wallet transaction layer
//!
//! ```text
//! TxRequest ──► TxPipeline::submit ──► validate (address, memo, balance)
//!                     │
//!                     ▼
//!              run_job task ──► z_sendmany ──► poll z_getoperationstatus
//!                     │
//!                     ▼
//!         watch<TxJob> + WalletEvent::TxJobUpdated
//! ```

pub mod address;
pub mod amount;
pub mod job;
pub mod pipeline;

pub use amount::{Amount, COIN, DEFAULT_FEE};
pub use job::{JobId, Recipient, TxJob, TxRequest, TxState};
pub use pipeline::{PipelineConfig, PipelineError, TxPipeline};
