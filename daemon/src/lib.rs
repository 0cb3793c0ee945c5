//! Verification engine: operation table, pool state, sweep scheduler,
//! history and counters.

pub mod collaborators;
pub mod config;
pub mod context;
pub mod counters;
pub mod db;
pub mod error;
pub mod history;
pub mod manager;
pub mod pool_info;
pub mod pool_status;
pub mod store;
pub mod verifier;

mod task;

pub use collaborators::{ActionError, ActionExecutor, ActionRequest, FailureKind, Namespace, NamespaceError};
pub use config::{ConfigError, VerifierConfig};
pub use context::VerifierContext;
pub use counters::{CountersError, QoSVerifierCounters, SweepStatistics};
pub use error::{BatchSummary, ItemFailure, StoreError, VerifyError};
pub use history::{HistoryEntry, QoSHistory};
pub use manager::{CancelFilter, CancelReport, ManagerInfo, SweepReport, VerifyOperationManager};
pub use pool_info::{PoolInfoMap, StorageUnitConstraints};
pub use pool_status::{PoolEvent, PoolEventReport, PoolStatusHandler};
pub use store::{MergeKind, MergeOutcome, VerifyOperationStore};
pub use verifier::{FileStatusVerifier, Plan, Verdict};
