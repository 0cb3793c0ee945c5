use std::{
	collections::{BTreeMap, BTreeSet},
	path::Path,
};

use chrono::Utc;
use qos_core::{AccessLatency, FileAttributes, PnfsId, PoolStatus, RetentionPolicy};
use qos_daemon::{PoolInfoMap, StorageUnitConstraints};
use serde::Deserialize;

use crate::error::InventoryError;

/// A cluster description: pools, groups, storage units and files.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Inventory {
	/// Milliseconds each simulated action takes.
	pub action_delay_ms: u64,
	pub pools: Vec<PoolSpec>,
	pub groups: Vec<GroupSpec>,
	pub units: Vec<UnitSpec>,
	pub files: Vec<FileSpec>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PoolSpec {
	pub name: String,
	#[serde(default = "enabled")]
	pub status: PoolStatus,
	#[serde(default)]
	pub tags: BTreeMap<String, String>,
	#[serde(default)]
	pub hsms: BTreeSet<String>,
	#[serde(default)]
	pub groups: Vec<String>,
}

fn enabled() -> PoolStatus {
	PoolStatus::Enabled
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GroupSpec {
	pub name: String,
	#[serde(default)]
	pub primary: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UnitSpec {
	pub name: String,
	pub required: usize,
	#[serde(default)]
	pub one_copy_per: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileSpec {
	pub pnfsid: PnfsId,
	pub storage_unit: Option<String>,
	#[serde(default = "online")]
	pub access_latency: AccessLatency,
	#[serde(default = "replica")]
	pub retention_policy: RetentionPolicy,
	#[serde(default)]
	pub locations: BTreeSet<String>,
	/// Pinned subset of `locations`.
	#[serde(default)]
	pub persistent: BTreeSet<String>,
	#[serde(default)]
	pub tape: BTreeSet<String>,
}

fn online() -> AccessLatency {
	AccessLatency::Online
}

fn replica() -> RetentionPolicy {
	RetentionPolicy::Replica
}

impl FileSpec {
	pub fn attributes(&self) -> FileAttributes {
		FileAttributes {
			pnfsid: self.pnfsid.clone(),
			locations: self.locations.clone(),
			persistent: self.persistent.clone(),
			tape_locations: self.tape.clone(),
			storage_unit: self.storage_unit.clone(),
			access_latency: self.access_latency,
			retention_policy: self.retention_policy,
		}
	}
}

impl Inventory {
	pub fn load(path: &Path) -> Result<Self, InventoryError> {
		let contents = std::fs::read_to_string(path)
			.map_err(|e| InventoryError::Read { path: path.to_path_buf(), message: e.to_string() })?;
		Self::parse(&contents)
	}

	pub fn parse(contents: &str) -> Result<Self, InventoryError> {
		let inventory: Inventory = toml::from_str(contents).map_err(|e| InventoryError::Parse(e.to_string()))?;
		inventory.validate()?;
		Ok(inventory)
	}

	fn validate(&self) -> Result<(), InventoryError> {
		let pools: BTreeSet<&str> = self.pools.iter().map(|p| p.name.as_str()).collect();
		if pools.len() != self.pools.len() {
			return Err(InventoryError::Invalid("duplicate pool names".into()));
		}
		let groups: BTreeSet<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();
		for pool in &self.pools {
			if let Some(group) = pool.groups.iter().find(|g| !groups.contains(g.as_str())) {
				return Err(InventoryError::Invalid(format!("pool {} names unknown group {group}", pool.name)));
			}
		}
		for file in &self.files {
			if let Some(pool) = file.locations.iter().find(|p| !pools.contains(p.as_str())) {
				return Err(InventoryError::Invalid(format!("file {} is on unknown pool {pool}", file.pnfsid)));
			}
			if !file.persistent.is_subset(&file.locations) {
				return Err(InventoryError::Invalid(format!(
					"file {} pins replicas it does not have",
					file.pnfsid
				)));
			}
		}
		Ok(())
	}

	/// Loads pools, groups and storage-unit constraints into the map.
	pub fn apply(&self, map: &PoolInfoMap) {
		let now = Utc::now();
		for group in &self.groups {
			map.add_group(&group.name, group.primary);
		}
		for pool in &self.pools {
			map.update_status(&pool.name, pool.status, now);
			map.set_tags(&pool.name, pool.tags.clone());
			map.set_hsms(&pool.name, pool.hsms.clone());
			for group in &pool.groups {
				map.add_to_group(&pool.name, group);
			}
		}
		for unit in &self.units {
			map.set_constraints(
				&unit.name,
				StorageUnitConstraints { required: unit.required, one_copy_per: unit.one_copy_per.clone() },
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
action_delay_ms = 5

[[groups]]
name = "default"
primary = true

[[pools]]
name = "p1"
tags = { rack = "r1" }
groups = ["default"]

[[pools]]
name = "p2"
status = "READ_ONLY"
hsms = ["osm"]
groups = ["default"]

[[units]]
name = "test:default@osm"
required = 2
one_copy_per = ["rack"]

[[files]]
pnfsid = "000000000000000000000001"
storage_unit = "test:default@osm"
locations = ["p1"]
persistent = ["p1"]
"#;

	#[test]
	fn parses_and_applies() {
		let inventory = Inventory::parse(SAMPLE).unwrap();
		assert_eq!(inventory.action_delay_ms, 5);
		assert_eq!(inventory.pools[0].status, PoolStatus::Enabled);
		assert_eq!(inventory.pools[1].status, PoolStatus::ReadOnly);
		assert_eq!(inventory.files[0].access_latency, AccessLatency::Online);

		let map = PoolInfoMap::new();
		inventory.apply(&map);
		assert_eq!(map.len(), 2);
		assert!(map.has_hsm("p2"));
		assert_eq!(map.tags("p1").get("rack").map(String::as_str), Some("r1"));
		assert_eq!(map.constraints("test:default@osm").unwrap().required, 2);
		assert!(map.is_viable("p1", true));
		assert!(!map.is_viable("p2", true));
	}

	#[test]
	fn rejects_unknown_pool_location() {
		let text = SAMPLE.replace("locations = [\"p1\"]", "locations = [\"p9\"]");
		assert!(matches!(Inventory::parse(&text), Err(InventoryError::Invalid(_))));
	}

	#[test]
	fn rejects_bad_pnfsid() {
		let text = SAMPLE.replace("000000000000000000000001", "xyz");
		assert!(matches!(Inventory::parse(&text), Err(InventoryError::Parse(_))));
	}
}
