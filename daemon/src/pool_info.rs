use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use qos_core::{PoolInfo, PoolInfoFilter, PoolStatus};

/// Per storage unit: how many disk copies, and the pool tags across which
/// copies should be spread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageUnitConstraints {
	pub required: usize,
	pub one_copy_per: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct PoolGroup {
	primary: bool,
	pools: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
	pools: BTreeMap<String, PoolInfo>,
	groups: BTreeMap<String, PoolGroup>,
	units: BTreeMap<String, StorageUnitConstraints>,
}

/// Current state of every known pool, and the pool group and storage unit
/// topology used to pick copy targets.
///
/// Safe for concurrent readers and writers.
#[derive(Default)]
pub struct PoolInfoMap {
	inner: RwLock<Inner>,
}

impl PoolInfoMap {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records a status, creating the pool if it is not yet known.
	pub fn update_status(&self, pool: &str, status: PoolStatus, now: DateTime<Utc>) -> PoolInfo {
		let mut inner = self.inner.write();
		let info = inner
			.pools
			.entry(pool.to_string())
			.or_insert_with(|| PoolInfo::new(pool, status, now));
		info.status = status;
		info.last_update = now;
		info.clone()
	}

	/// Installs a pool record as-is (used when reloading persisted state).
	pub fn insert(&self, info: PoolInfo) {
		let mut inner = self.inner.write();
		for group in &info.groups {
			inner.groups.entry(group.clone()).or_default().pools.insert(info.name.clone());
		}
		inner.pools.insert(info.name.clone(), info);
	}

	pub fn set_tags(&self, pool: &str, tags: BTreeMap<String, String>) {
		if let Some(info) = self.inner.write().pools.get_mut(pool) {
			info.tags = tags;
		}
	}

	pub fn set_hsms(&self, pool: &str, hsms: BTreeSet<String>) {
		if let Some(info) = self.inner.write().pools.get_mut(pool) {
			info.hsms = hsms;
		}
	}

	pub fn add_group(&self, group: &str, primary: bool) {
		self.inner.write().groups.entry(group.to_string()).or_default().primary = primary;
	}

	pub fn add_to_group(&self, pool: &str, group: &str) {
		let mut inner = self.inner.write();
		inner.groups.entry(group.to_string()).or_default().pools.insert(pool.to_string());
		if let Some(info) = inner.pools.get_mut(pool) {
			info.groups.insert(group.to_string());
		}
	}

	pub fn set_constraints(&self, unit: &str, constraints: StorageUnitConstraints) {
		self.inner.write().units.insert(unit.to_string(), constraints);
	}

	pub fn constraints(&self, unit: &str) -> Option<StorageUnitConstraints> {
		self.inner.read().units.get(unit).cloned()
	}

	pub fn get(&self, pool: &str) -> Option<PoolInfo> {
		self.inner.read().pools.get(pool).cloned()
	}

	/// Unknown pools are never viable.
	pub fn is_viable(&self, pool: &str, writable: bool) -> bool {
		self.inner
			.read()
			.pools
			.get(pool)
			.is_some_and(|info| info.is_viable(writable))
	}

	pub fn has_hsm(&self, pool: &str) -> bool {
		self.inner.read().pools.get(pool).is_some_and(|info| !info.hsms.is_empty())
	}

	pub fn tags(&self, pool: &str) -> BTreeMap<String, String> {
		self.inner
			.read()
			.pools
			.get(pool)
			.map(|info| info.tags.clone())
			.unwrap_or_default()
	}

	/// The readable subset of `locations`.
	pub fn readable_locations(&self, locations: &BTreeSet<String>) -> BTreeSet<String> {
		let inner = self.inner.read();
		locations
			.iter()
			.filter(|pool| inner.pools.get(*pool).is_some_and(|info| info.is_viable(false)))
			.cloned()
			.collect()
	}

	/// The members of `group` among `locations`; every location when no group is given.
	pub fn member_locations(&self, group: Option<&str>, locations: &BTreeSet<String>) -> BTreeSet<String> {
		let Some(group) = group else {
			return locations.clone();
		};
		let inner = self.inner.read();
		match inner.groups.get(group) {
			Some(g) => locations.intersection(&g.pools).cloned().collect(),
			None => BTreeSet::new(),
		}
	}

	/// Members of `group` (all known pools when none) that are currently viable.
	pub fn viable_members(&self, group: Option<&str>, writable: bool) -> BTreeSet<String> {
		let inner = self.inner.read();
		let viable = |name: &String| inner.pools.get(name).is_some_and(|info| info.is_viable(writable));
		match group {
			Some(group) => inner
				.groups
				.get(group)
				.map(|g| g.pools.iter().filter(|p| viable(p)).cloned().collect())
				.unwrap_or_default(),
			None => inner.pools.keys().filter(|p| viable(p)).cloned().collect(),
		}
	}

	/// The primary group of any of `locations`, if one exists.
	pub fn effective_pool_group(&self, locations: &BTreeSet<String>) -> Option<String> {
		let inner = self.inner.read();
		inner
			.groups
			.iter()
			.filter(|(_, g)| g.primary)
			.find(|(_, g)| locations.iter().any(|pool| g.pools.contains(pool)))
			.map(|(name, _)| name.clone())
	}

	pub fn list(&self, filter: &PoolInfoFilter) -> Vec<PoolInfo> {
		self.inner
			.read()
			.pools
			.values()
			.filter(|info| filter.matches(info))
			.cloned()
			.collect()
	}

	pub fn len(&self) -> usize {
		self.inner.read().pools.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn set(items: &[&str]) -> BTreeSet<String> {
		items.iter().map(|s| s.to_string()).collect()
	}

	fn map() -> PoolInfoMap {
		let now = Utc::now();
		let map = PoolInfoMap::new();
		map.update_status("p1", PoolStatus::Enabled, now);
		map.update_status("p2", PoolStatus::ReadOnly, now);
		map.update_status("p3", PoolStatus::Down, now);
		map.update_status("p4", PoolStatus::Enabled, now);
		map.add_group("resilient", true);
		for pool in ["p1", "p2", "p3"] {
			map.add_to_group(pool, "resilient");
		}
		map.add_group("other", false);
		map.add_to_group("p4", "other");
		map
	}

	#[test]
	fn viability_and_unknown_pools() {
		let map = map();
		assert!(map.is_viable("p1", true));
		assert!(map.is_viable("p2", false));
		assert!(!map.is_viable("p2", true));
		assert!(!map.is_viable("p3", false));
		assert!(!map.is_viable("nope", false));
	}

	#[test]
	fn readable_and_member_locations() {
		let map = map();
		let locations = set(&["p1", "p2", "p3", "p4"]);
		assert_eq!(map.readable_locations(&locations), set(&["p1", "p2", "p4"]));
		assert_eq!(map.member_locations(Some("resilient"), &locations), set(&["p1", "p2", "p3"]));
		assert_eq!(map.member_locations(None, &locations), locations);
		assert!(map.member_locations(Some("missing"), &locations).is_empty());
	}

	#[test]
	fn writable_members_and_primary_group() {
		let map = map();
		assert_eq!(map.viable_members(Some("resilient"), true), set(&["p1"]));
		assert_eq!(map.viable_members(None, true), set(&["p1", "p4"]));
		assert_eq!(map.effective_pool_group(&set(&["p4", "p2"])), Some("resilient".to_string()));
		assert_eq!(map.effective_pool_group(&set(&["p4"])), None);
	}

	#[test]
	fn status_updates_touch_timestamp() {
		let map = map();
		let later = Utc::now() + chrono::Duration::seconds(5);
		let info = map.update_status("p3", PoolStatus::Enabled, later);
		assert_eq!(info.last_update, later);
		assert!(info.groups.contains("resilient"));
		assert!(map.is_viable("p3", true));
		assert_eq!(map.get("p3"), Some(info));
		assert_eq!(map.get("p9"), None);
	}

	#[test]
	fn list_applies_filter() {
		let map = map();
		let filter = PoolInfoFilter::new().statuses([PoolStatus::Enabled]);
		let names: Vec<String> = map.list(&filter).into_iter().map(|p| p.name).collect();
		assert_eq!(names, vec!["p1".to_string(), "p4".to_string()]);
	}
}
