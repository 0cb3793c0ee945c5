//! Data model shared by the verifier engine and its admin surface.

pub mod error;
pub mod filter;
pub mod operation;
pub mod pnfsid;
pub mod pool;
pub mod update;

pub use error::ParseError;
pub use filter::{parse_timestamp, FieldFilter, PoolInfoFilter, SortOrder, VerifyOperationFilter, TIMESTAMP_FORMAT};
pub use operation::{QoSAction, QoSMessageType, VerifyOperation, VerifyOperationState};
pub use pnfsid::PnfsId;
pub use pool::{PoolInfo, PoolStatus};
pub use update::{AccessLatency, FileAttributes, FileQoSUpdate, QoSRequirements, RetentionPolicy};
