use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
	operation::{named_enum, QoSMessageType},
	pnfsid::PnfsId,
};

/// An inbound trigger for verification of one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileQoSUpdate {
	pub pnfsid: PnfsId,
	/// The pool the message concerns: a replica location, or the scanned pool.
	pub pool: Option<String>,
	pub message_type: QoSMessageType,
	pub storage_unit: Option<String>,
	pub pool_group: Option<String>,
}

impl FileQoSUpdate {
	pub fn new(pnfsid: PnfsId, pool: Option<String>, message_type: QoSMessageType) -> Self {
		FileQoSUpdate { pnfsid, pool, message_type, storage_unit: None, pool_group: None }
	}

	pub fn with_storage_unit(mut self, storage_unit: impl Into<String>) -> Self {
		self.storage_unit = Some(storage_unit.into());
		self
	}

	pub fn with_pool_group(mut self, pool_group: impl Into<String>) -> Self {
		self.pool_group = Some(pool_group.into());
		self
	}
}

named_enum! {
	AccessLatency, "access latency" {
		Online => "ONLINE",
		Nearline => "NEARLINE",
	}
}

named_enum! {
	RetentionPolicy, "retention policy" {
		Replica => "REPLICA",
		Custodial => "CUSTODIAL",
	}
}

/// File attributes as reported by the namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileAttributes {
	pub pnfsid: PnfsId,
	/// Pools the namespace believes hold a replica.
	#[serde(default)]
	pub locations: BTreeSet<String>,
	/// The subset of `locations` whose replica is pinned (sticky).
	#[serde(default)]
	pub persistent: BTreeSet<String>,
	/// Tape copies, as URIs.
	#[serde(default)]
	pub tape_locations: BTreeSet<String>,
	pub storage_unit: Option<String>,
	pub access_latency: AccessLatency,
	pub retention_policy: RetentionPolicy,
}

impl FileAttributes {
	pub fn is_on_tape(&self) -> bool {
		!self.tape_locations.is_empty()
	}
}

/// How many disk and tape copies a file should have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QoSRequirements {
	pub required_disk: usize,
	pub required_tape: usize,
}

impl QoSRequirements {
	/// Derives requirements from file attributes, with the per-storage-unit
	/// disk copy count (defaulting to one).
	pub fn from_attributes(attributes: &FileAttributes, unit_required: Option<usize>) -> Self {
		let required_disk = match attributes.access_latency {
			AccessLatency::Online => unit_required.unwrap_or(1),
			AccessLatency::Nearline => 0,
		};
		let required_tape = match attributes.retention_policy {
			RetentionPolicy::Custodial => 1,
			RetentionPolicy::Replica => 0,
		};
		QoSRequirements { required_disk, required_tape }
	}
}
