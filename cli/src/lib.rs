//! The `qos` admin shell: a verifier driven by typed admin commands against
//! a simulated cluster.

pub mod cluster;
pub mod commands;
pub mod error;
pub mod inventory;
pub mod shell;

pub use cluster::SimulatedCluster;
pub use commands::{Admin, AdminCommand, CommandRegistry};
pub use error::{CommandError, InventoryError};
pub use inventory::Inventory;
