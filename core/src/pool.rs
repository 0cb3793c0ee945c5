use std::{
	collections::{BTreeMap, BTreeSet},
	fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::operation::named_enum;

named_enum! {
	PoolStatus, "pool status" {
		Down => "DOWN",
		ReadOnly => "READ_ONLY",
		Enabled => "ENABLED",
		Uninitialized => "UNINITIALIZED",
	}
}

impl PoolStatus {
	pub fn can_read(&self) -> bool {
		matches!(self, PoolStatus::Enabled | PoolStatus::ReadOnly)
	}

	pub fn can_write(&self) -> bool {
		matches!(self, PoolStatus::Enabled)
	}
}

/// What the verifier knows about one pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolInfo {
	pub name: String,
	pub status: PoolStatus,
	#[serde(default)]
	pub tags: BTreeMap<String, String>,
	#[serde(default)]
	pub groups: BTreeSet<String>,
	/// Tape backends attached to this pool; non-empty means it can flush.
	#[serde(default)]
	pub hsms: BTreeSet<String>,
	pub last_update: DateTime<Utc>,
}

impl PoolInfo {
	pub fn new(name: impl Into<String>, status: PoolStatus, now: DateTime<Utc>) -> Self {
		PoolInfo {
			name: name.into(),
			status,
			tags: BTreeMap::new(),
			groups: BTreeSet::new(),
			hsms: BTreeSet::new(),
			last_update: now,
		}
	}

	/// Readable, and writable too if `writable` is requested.
	pub fn is_viable(&self, writable: bool) -> bool {
		if writable {
			self.status.can_write()
		} else {
			self.status.can_read()
		}
	}
}

impl fmt::Display for PoolInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let tags = self
			.tags
			.iter()
			.map(|(k, v)| format!("{k}={v}"))
			.collect::<Vec<_>>()
			.join(",");
		let groups = self.groups.iter().cloned().collect::<Vec<_>>().join(",");
		write!(
			f,
			"{}\t(status {})\t(groups {})\t(tags {{{}}})\t(last update {})",
			self.name,
			self.status,
			groups,
			tags,
			self.last_update.format("%Y/%m/%d-%H:%M:%S"),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn viability_follows_status() {
		let now = Utc::now();
		let enabled = PoolInfo::new("p1", PoolStatus::Enabled, now);
		let read_only = PoolInfo::new("p2", PoolStatus::ReadOnly, now);
		let down = PoolInfo::new("p3", PoolStatus::Down, now);
		let uninit = PoolInfo::new("p4", PoolStatus::Uninitialized, now);

		assert!(enabled.is_viable(true));
		assert!(read_only.is_viable(false));
		assert!(!read_only.is_viable(true));
		assert!(!down.is_viable(false));
		assert!(!uninit.is_viable(false));
	}

	#[test]
	fn status_names() {
		assert_eq!("read_only".parse::<PoolStatus>().unwrap(), PoolStatus::ReadOnly);
		assert_eq!(PoolStatus::Uninitialized.to_string(), "UNINITIALIZED");
	}
}
