//! Decides what, if anything, must be done for a file to meet its
//! requirements, given the namespace's view of it and the pool state.

use std::collections::BTreeSet;

use qos_core::{FileAttributes, QoSAction, QoSRequirements, VerifyOperation};
use tracing::{debug, warn};

use crate::pool_info::{PoolInfoMap, StorageUnitConstraints};

/// An action with the pools it involves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
	pub action: QoSAction,
	pub source: Option<String>,
	pub target: Option<String>,
	/// Adjustments outstanding, this one included.
	pub needed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
	Act(Plan),
	/// The file already meets its requirements.
	Satisfied,
	/// No replica on disk and none on tape.
	Missing,
	/// Replicas exist but none is readable, and none is on tape.
	Inaccessible,
	/// A copy is required but no pool can take it.
	NoTarget(String),
}

/// Replica locations of one file, classified against the pool state.
struct Locations {
	current: BTreeSet<String>,
	readable: BTreeSet<String>,
	/// Readable and pinned.
	persistent: BTreeSet<String>,
	/// Readable and not pinned.
	cached: BTreeSet<String>,
	/// Locations inside the pool group in effect.
	members: BTreeSet<String>,
}

pub struct FileStatusVerifier<'a> {
	pools: &'a PoolInfoMap,
}

impl<'a> FileStatusVerifier<'a> {
	pub fn new(pools: &'a PoolInfoMap) -> Self {
		FileStatusVerifier { pools }
	}

	pub fn verify(&self, attributes: &FileAttributes, op: &VerifyOperation) -> Verdict {
		let unit = attributes.storage_unit.as_deref().or(op.storage_unit.as_deref());
		let constraints = unit.and_then(|u| self.pools.constraints(u)).unwrap_or_default();
		let unit_required = (constraints.required > 0).then_some(constraints.required);
		let requirements = QoSRequirements::from_attributes(attributes, unit_required);

		let group = op
			.pool_group
			.clone()
			.or_else(|| self.pools.effective_pool_group(&attributes.locations));
		let locations = self.classify(attributes, group.as_deref());

		debug!(
			pnfsid = %op.pnfsid,
			disk = requirements.required_disk,
			tape = requirements.required_tape,
			current = locations.current.len(),
			readable = locations.readable.len(),
			persistent = locations.persistent.len(),
			"verifying"
		);

		if requirements.required_disk > 0 {
			if locations.current.is_empty() {
				return if attributes.is_on_tape() { stage() } else { Verdict::Missing };
			}
			if locations.readable.is_empty() {
				return if attributes.is_on_tape() { stage() } else { Verdict::Inaccessible };
			}
		}

		if !op.message_type.skips_hsm_check() {
			if let Some(verdict) = self.check_for_flush(&requirements, attributes, &locations) {
				return verdict;
			}
		}

		if locations.current.is_empty() {
			return if requirements.required_tape == 0 { Verdict::Missing } else { Verdict::Satisfied };
		}

		if requirements.required_disk == 0 {
			return match locations.persistent.iter().next() {
				Some(target) => cache(target.clone(), 1),
				None => Verdict::Satisfied,
			};
		}

		if op.pool_group.is_some() {
			if locations.members.is_empty() {
				return Verdict::Satisfied;
			}
			if let Some(outside) = locations.persistent.difference(&locations.members).next() {
				return cache(outside.clone(), 1);
			}
		}

		self.adjust(requirements.required_disk, &constraints, group.as_deref(), &locations, op)
	}

	fn classify(&self, attributes: &FileAttributes, group: Option<&str>) -> Locations {
		let current = attributes.locations.clone();
		let readable = self.pools.readable_locations(&current);
		let persistent: BTreeSet<String> = readable.intersection(&attributes.persistent).cloned().collect();
		let cached = readable.difference(&persistent).cloned().collect();
		let members = self.pools.member_locations(group, &current);
		Locations { current, readable, persistent, cached, members }
	}

	fn check_for_flush(
		&self,
		requirements: &QoSRequirements,
		attributes: &FileAttributes,
		locations: &Locations,
	) -> Option<Verdict> {
		if requirements.required_tape <= attributes.tape_locations.len() {
			return None;
		}
		if locations.readable.is_empty() {
			return Some(if attributes.tape_locations.is_empty() { Verdict::Missing } else { stage() });
		}
		let Some(hsm_pool) = locations.readable.iter().find(|pool| self.pools.has_hsm(pool)) else {
			warn!(pnfsid = %attributes.pnfsid, "should be flushed but no HSM-backed location is available");
			return None;
		};
		Some(Verdict::Act(Plan {
			action: QoSAction::Flush,
			source: Some(hsm_pool.clone()),
			target: Some(hsm_pool.clone()),
			needed: 1,
		}))
	}

	fn adjust(
		&self,
		required: usize,
		constraints: &StorageUnitConstraints,
		group: Option<&str>,
		locations: &Locations,
		op: &VerifyOperation,
	) -> Verdict {
		let have = locations.persistent.len();
		if have > required {
			let retained = op
				.target
				.clone()
				.filter(|t| locations.persistent.contains(t) && self.pools.is_viable(t, true));
			let target = retained.or_else(|| self.select_excess(&locations.persistent, &constraints.one_copy_per));
			return match target {
				Some(target) => cache(target, (have - required) as u32),
				None => Verdict::Satisfied,
			};
		}
		if have == required {
			return Verdict::Satisfied;
		}
		let needed = (required - have) as u32;

		let viable_source = op
			.source
			.clone()
			.filter(|s| locations.readable.contains(s));

		let retained_target = op
			.target
			.clone()
			.filter(|t| !locations.current.contains(t) && self.pools.is_viable(t, true));

		if retained_target.is_none() {
			if let Some(target) = self.select_persist_target(viable_source.as_deref(), locations, op) {
				return Verdict::Act(Plan {
					action: QoSAction::PersistReplica,
					source: None,
					target: Some(target),
					needed,
				});
			}
		}

		let target = match retained_target {
			Some(target) => target,
			None => match self.select_copy_target(group, locations, op, &constraints.one_copy_per) {
				Some(target) => target,
				None => {
					return Verdict::NoTarget(format!(
						"no pool in {} can take a copy",
						group.map_or_else(|| "any group".to_string(), |g| format!("group {g}"))
					))
				}
			},
		};

		let source = viable_source.or_else(|| {
			locations
				.persistent
				.iter()
				.chain(locations.cached.iter())
				.find(|pool| !op.tried.contains(*pool))
				.or_else(|| locations.readable.iter().next())
				.cloned()
		});

		Verdict::Act(Plan { action: QoSAction::CopyReplica, source, target: Some(target), needed })
	}

	/// A cached replica that can simply be pinned, preferring the source the
	/// message came from.
	fn select_persist_target(&self, source: Option<&str>, locations: &Locations, op: &VerifyOperation) -> Option<String> {
		let usable = |pool: &String| !op.tried.contains(pool) && self.pools.is_viable(pool, true);
		if let Some(source) = source {
			let source = source.to_string();
			if locations.cached.contains(&source) && usable(&source) {
				return Some(source);
			}
		}
		locations
			.cached
			.intersection(&locations.members)
			.find(|pool| usable(*pool))
			.cloned()
	}

	/// A writable pool of the group holding no replica and not yet tried,
	/// preferring a partition no pinned replica is in.
	fn select_copy_target(
		&self,
		group: Option<&str>,
		locations: &Locations,
		op: &VerifyOperation,
		partition_keys: &[String],
	) -> Option<String> {
		let candidates: Vec<String> = self
			.pools
			.viable_members(group, true)
			.into_iter()
			.filter(|pool| !locations.current.contains(pool) && !op.tried.contains(pool))
			.collect();

		if !partition_keys.is_empty() {
			let used: BTreeSet<Vec<Option<String>>> = locations
				.persistent
				.iter()
				.map(|pool| self.partition(pool, partition_keys))
				.collect();
			if let Some(fresh) = candidates
				.iter()
				.find(|pool| !used.contains(&self.partition(pool, partition_keys)))
			{
				return Some(fresh.clone());
			}
		}
		candidates.into_iter().next()
	}

	/// The replica to unpin: one sharing a partition with another if any,
	/// otherwise the last by name.
	fn select_excess(&self, persistent: &BTreeSet<String>, partition_keys: &[String]) -> Option<String> {
		if !partition_keys.is_empty() {
			let mut seen = BTreeSet::new();
			let duplicate = persistent
				.iter()
				.filter(|pool| !seen.insert(self.partition(pool, partition_keys)))
				.last();
			if let Some(pool) = duplicate {
				return Some(pool.clone());
			}
		}
		persistent.iter().next_back().cloned()
	}

	fn partition(&self, pool: &str, keys: &[String]) -> Vec<Option<String>> {
		let tags = self.pools.tags(pool);
		keys.iter().map(|key| tags.get(key).cloned()).collect()
	}
}

fn stage() -> Verdict {
	Verdict::Act(Plan { action: QoSAction::WaitForStage, source: None, target: None, needed: 1 })
}

fn cache(target: String, needed: u32) -> Verdict {
	Verdict::Act(Plan { action: QoSAction::CacheReplica, source: None, target: Some(target), needed })
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use chrono::Utc;
	use qos_core::{AccessLatency, FileQoSUpdate, PnfsId, PoolStatus, QoSMessageType, RetentionPolicy};

	use super::*;

	fn set(items: &[&str]) -> BTreeSet<String> {
		items.iter().map(|s| s.to_string()).collect()
	}

	fn pools() -> PoolInfoMap {
		let now = Utc::now();
		let map = PoolInfoMap::new();
		map.add_group("resilient", true);
		for (name, rack) in [("p1", "r1"), ("p2", "r1"), ("p3", "r2"), ("p4", "r2")] {
			map.update_status(name, PoolStatus::Enabled, now);
			map.set_tags(name, BTreeMap::from([("rack".to_string(), rack.to_string())]));
			map.add_to_group(name, "resilient");
		}
		map.set_constraints("test:resilient@osm", StorageUnitConstraints { required: 2, one_copy_per: vec!["rack".into()] });
		map.set_constraints("test:single@osm", StorageUnitConstraints { required: 1, one_copy_per: vec![] });
		map
	}

	fn attributes(unit: &str, locations: &[&str], persistent: &[&str]) -> FileAttributes {
		FileAttributes {
			pnfsid: PnfsId::new("000000000000000000000001").unwrap(),
			locations: set(locations),
			persistent: set(persistent),
			tape_locations: BTreeSet::new(),
			storage_unit: Some(unit.to_string()),
			access_latency: AccessLatency::Online,
			retention_policy: RetentionPolicy::Replica,
		}
	}

	fn op(message_type: QoSMessageType, pool: Option<&str>) -> VerifyOperation {
		let update = FileQoSUpdate::new(
			PnfsId::new("000000000000000000000001").unwrap(),
			pool.map(String::from),
			message_type,
		);
		VerifyOperation::from_update(&update, Utc::now())
	}

	#[test]
	fn copies_to_another_rack() {
		let pools = pools();
		let verifier = FileStatusVerifier::new(&pools);
		let attrs = attributes("test:resilient@osm", &["p1"], &["p1"]);

		let verdict = verifier.verify(&attrs, &op(QoSMessageType::AddCacheLocation, Some("p1")));
		assert_eq!(
			verdict,
			Verdict::Act(Plan {
				action: QoSAction::CopyReplica,
				source: Some("p1".into()),
				target: Some("p3".into()),
				needed: 1,
			})
		);
	}

	#[test]
	fn satisfied_file_needs_nothing() {
		let pools = pools();
		let verifier = FileStatusVerifier::new(&pools);
		let attrs = attributes("test:resilient@osm", &["p1", "p3"], &["p1", "p3"]);
		assert_eq!(verifier.verify(&attrs, &op(QoSMessageType::ValidateOnly, None)), Verdict::Satisfied);
	}

	#[test]
	fn pins_a_cached_replica_before_copying() {
		let pools = pools();
		let verifier = FileStatusVerifier::new(&pools);
		let attrs = attributes("test:resilient@osm", &["p1", "p2"], &["p1"]);

		match verifier.verify(&attrs, &op(QoSMessageType::ValidateOnly, None)) {
			Verdict::Act(plan) => {
				assert_eq!(plan.action, QoSAction::PersistReplica);
				assert_eq!(plan.target.as_deref(), Some("p2"));
			}
			other => panic!("unexpected verdict {other:?}"),
		}
	}

	#[test]
	fn unpins_excess_replica_sharing_a_rack() {
		let pools = pools();
		let verifier = FileStatusVerifier::new(&pools);
		let attrs = attributes("test:resilient@osm", &["p1", "p2", "p3"], &["p1", "p2", "p3"]);

		match verifier.verify(&attrs, &op(QoSMessageType::ValidateOnly, None)) {
			Verdict::Act(plan) => {
				assert_eq!(plan.action, QoSAction::CacheReplica);
				assert_eq!(plan.target.as_deref(), Some("p2"));
				assert_eq!(plan.needed, 1);
			}
			other => panic!("unexpected verdict {other:?}"),
		}
	}

	#[test]
	fn missing_and_inaccessible() {
		let pools = pools();
		let verifier = FileStatusVerifier::new(&pools);
		let none = attributes("test:single@osm", &[], &[]);
		assert_eq!(verifier.verify(&none, &op(QoSMessageType::ValidateOnly, None)), Verdict::Missing);

		pools.update_status("p1", PoolStatus::Down, Utc::now());
		let down = attributes("test:single@osm", &["p1"], &["p1"]);
		assert_eq!(verifier.verify(&down, &op(QoSMessageType::ValidateOnly, None)), Verdict::Inaccessible);

		let mut on_tape = down.clone();
		on_tape.tape_locations.insert("osm://tape/1".into());
		match verifier.verify(&on_tape, &op(QoSMessageType::ValidateOnly, None)) {
			Verdict::Act(plan) => assert_eq!(plan.action, QoSAction::WaitForStage),
			other => panic!("unexpected verdict {other:?}"),
		}
	}

	#[test]
	fn flushes_custodial_file_from_hsm_pool() {
		let pools = pools();
		pools.set_hsms("p2", set(&["osm"]));
		let verifier = FileStatusVerifier::new(&pools);
		let mut attrs = attributes("test:single@osm", &["p2"], &["p2"]);
		attrs.retention_policy = RetentionPolicy::Custodial;

		match verifier.verify(&attrs, &op(QoSMessageType::ValidateOnly, None)) {
			Verdict::Act(plan) => {
				assert_eq!(plan.action, QoSAction::Flush);
				assert_eq!(plan.target.as_deref(), Some("p2"));
			}
			other => panic!("unexpected verdict {other:?}"),
		}
		// A corrupt-file message does not look at tape state.
		assert_eq!(verifier.verify(&attrs, &op(QoSMessageType::CorruptFile, Some("p2"))), Verdict::Satisfied);
	}

	#[test]
	fn nearline_file_releases_pins() {
		let pools = pools();
		let verifier = FileStatusVerifier::new(&pools);
		let mut attrs = attributes("test:single@osm", &["p1"], &["p1"]);
		attrs.access_latency = AccessLatency::Nearline;
		assert_eq!(verifier.verify(&attrs, &op(QoSMessageType::QosModified, None)), cache("p1".into(), 1));
	}

	#[test]
	fn tried_pools_and_no_target() {
		let pools = pools();
		let verifier = FileStatusVerifier::new(&pools);
		let attrs = attributes("test:resilient@osm", &["p1"], &["p1"]);
		let mut operation = op(QoSMessageType::ValidateOnly, None);
		operation.tried = set(&["p3"]);

		match verifier.verify(&attrs, &operation) {
			Verdict::Act(plan) => assert_eq!(plan.target.as_deref(), Some("p4")),
			other => panic!("unexpected verdict {other:?}"),
		}

		operation.tried = set(&["p2", "p3", "p4"]);
		assert!(matches!(verifier.verify(&attrs, &operation), Verdict::NoTarget(_)));
	}

	#[test]
	fn retains_viable_target() {
		let pools = pools();
		let verifier = FileStatusVerifier::new(&pools);
		let attrs = attributes("test:resilient@osm", &["p1"], &["p1"]);
		let mut operation = op(QoSMessageType::ValidateOnly, None);
		operation.target = Some("p2".into());

		match verifier.verify(&attrs, &operation) {
			Verdict::Act(plan) => assert_eq!(plan.target.as_deref(), Some("p2")),
			other => panic!("unexpected verdict {other:?}"),
		}
	}
}
