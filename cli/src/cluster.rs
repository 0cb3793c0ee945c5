//! An in-process stand-in for the namespace and the pools.
//!
//! Actions mutate the replica table directly, so verification converges the
//! same way it would against real pools, only faster.

use std::{
	collections::{BTreeMap, BTreeSet},
	time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use qos_core::{FileAttributes, PnfsId, PoolStatus, QoSAction};
use qos_daemon::{ActionError, ActionExecutor, ActionRequest, Namespace, NamespaceError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::inventory::Inventory;

#[derive(Default)]
struct ClusterState {
	files: BTreeMap<PnfsId, FileAttributes>,
	statuses: BTreeMap<String, PoolStatus>,
	hsms: BTreeMap<String, BTreeSet<String>>,
}

impl ClusterState {
	fn status(&self, pool: &str) -> PoolStatus {
		self.statuses.get(pool).copied().unwrap_or(PoolStatus::Down)
	}
}

pub struct SimulatedCluster {
	state: Mutex<ClusterState>,
	action_delay: Duration,
}

impl SimulatedCluster {
	pub fn new(inventory: &Inventory) -> Self {
		let mut state = ClusterState::default();
		for pool in &inventory.pools {
			state.statuses.insert(pool.name.clone(), pool.status);
			state.hsms.insert(pool.name.clone(), pool.hsms.clone());
		}
		for file in &inventory.files {
			state.files.insert(file.pnfsid.clone(), file.attributes());
		}
		SimulatedCluster { state: Mutex::new(state), action_delay: Duration::from_millis(inventory.action_delay_ms) }
	}

	pub fn file(&self, pnfsid: &PnfsId) -> Option<FileAttributes> {
		self.state.lock().files.get(pnfsid).cloned()
	}

	/// Files with a replica on `pool`.
	pub fn files_on(&self, pool: &str) -> Vec<PnfsId> {
		self.state
			.lock()
			.files
			.values()
			.filter(|attrs| attrs.locations.contains(pool))
			.map(|attrs| attrs.pnfsid.clone())
			.collect()
	}

	pub fn set_status(&self, pool: &str, status: PoolStatus) {
		self.state.lock().statuses.insert(pool.to_string(), status);
	}

	fn apply(&self, request: &ActionRequest) -> Result<(), ActionError> {
		let mut state = self.state.lock();
		let pnfsid = &request.pnfsid;

		let writable_pools: Vec<String> = state
			.statuses
			.iter()
			.filter(|(_, status)| status.can_write())
			.map(|(pool, _)| pool.clone())
			.collect();
		let source = request.source.as_deref();
		let target = request.target.as_deref();
		let source_status = source.map(|pool| state.status(pool));
		let target_status = target.map(|pool| state.status(pool));
		let hsm = source
			.and_then(|pool| state.hsms.get(pool))
			.and_then(|hsms| hsms.iter().next().cloned());

		let Some(file) = state.files.get_mut(pnfsid) else {
			return Err(ActionError::fatal(format!("{pnfsid} no longer exists")));
		};

		match request.action {
			QoSAction::CopyReplica => {
				let (Some(source), Some(target)) = (source, target) else {
					return Err(ActionError::fatal("copy needs a source and a target"));
				};
				if !source_status.is_some_and(|s| s.can_read()) || !file.locations.contains(source) {
					return Err(ActionError::new_source(format!("{source} cannot serve {pnfsid}")));
				}
				if !target_status.is_some_and(|s| s.can_write()) {
					return Err(ActionError::new_target(format!("{target} is not writable")));
				}
				file.locations.insert(target.to_string());
				file.persistent.insert(target.to_string());
			}
			QoSAction::PersistReplica => {
				let Some(target) = target else {
					return Err(ActionError::fatal("persist needs a target"));
				};
				if !target_status.is_some_and(|s| s.can_read()) || !file.locations.contains(target) {
					return Err(ActionError::new_target(format!("{target} cannot pin {pnfsid}")));
				}
				file.persistent.insert(target.to_string());
			}
			QoSAction::CacheReplica => {
				let Some(target) = target else {
					return Err(ActionError::fatal("cache needs a target"));
				};
				if !target_status.is_some_and(|s| s.can_read()) {
					return Err(ActionError::retryable(format!("{target} is offline")));
				}
				file.persistent.remove(target);
			}
			QoSAction::Flush => {
				let Some(source) = source else {
					return Err(ActionError::fatal("flush needs a source"));
				};
				if !source_status.is_some_and(|s| s.can_read()) {
					return Err(ActionError::new_source(format!("{source} is offline")));
				}
				file.tape_locations.insert(hsm.unwrap_or_else(|| "hsm".to_string()));
			}
			QoSAction::WaitForStage => {
				if file.tape_locations.is_empty() {
					return Err(ActionError::fatal(format!("{pnfsid} has no tape copy")));
				}
				let Some(pool) = writable_pools.into_iter().find(|pool| !file.locations.contains(pool)) else {
					return Err(ActionError::retryable("no pool to stage to"));
				};
				file.locations.insert(pool);
			}
		}
		Ok(())
	}
}

#[async_trait]
impl Namespace for SimulatedCluster {
	async fn file_attributes(&self, pnfsid: &PnfsId) -> Result<FileAttributes, NamespaceError> {
		self.file(pnfsid).ok_or_else(|| NamespaceError::NotFound(pnfsid.clone()))
	}
}

#[async_trait]
impl ActionExecutor for SimulatedCluster {
	async fn execute(&self, request: ActionRequest, cancel: CancellationToken) -> Result<(), ActionError> {
		debug!(%request, "simulating");
		tokio::select! {
			biased;
			_ = cancel.cancelled() => return Err(ActionError::retryable("interrupted")),
			_ = tokio::time::sleep(self.action_delay) => {}
		}
		self.apply(&request)?;
		info!(%request, "completed");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cluster() -> SimulatedCluster {
		let inventory = Inventory::parse(
			r#"
[[groups]]
name = "g"
primary = true

[[pools]]
name = "p1"
groups = ["g"]
hsms = ["osm"]

[[pools]]
name = "p2"
groups = ["g"]

[[pools]]
name = "p3"
status = "DOWN"
groups = ["g"]

[[files]]
pnfsid = "000000000000000000000001"
locations = ["p1"]
persistent = ["p1"]
"#,
		)
		.unwrap();
		SimulatedCluster::new(&inventory)
	}

	fn id() -> PnfsId {
		PnfsId::new("000000000000000000000001").unwrap()
	}

	fn request(action: QoSAction, source: Option<&str>, target: Option<&str>) -> ActionRequest {
		ActionRequest { pnfsid: id(), action, source: source.map(Into::into), target: target.map(Into::into) }
	}

	#[tokio::test]
	async fn copy_adds_a_pinned_replica() {
		let cluster = cluster();
		let cancel = CancellationToken::new();
		cluster
			.execute(request(QoSAction::CopyReplica, Some("p1"), Some("p2")), cancel)
			.await
			.unwrap();
		let attrs = cluster.file_attributes(&id()).await.unwrap();
		assert!(attrs.persistent.contains("p2"));
		assert_eq!(cluster.files_on("p2"), vec![id()]);
	}

	#[tokio::test]
	async fn copy_to_down_pool_asks_for_another_target() {
		let cluster = cluster();
		let err = cluster
			.execute(request(QoSAction::CopyReplica, Some("p1"), Some("p3")), CancellationToken::new())
			.await
			.unwrap_err();
		assert_eq!(err.kind, qos_daemon::FailureKind::NewTarget);

		let err = cluster
			.execute(request(QoSAction::CopyReplica, Some("p2"), Some("p1")), CancellationToken::new())
			.await
			.unwrap_err();
		assert_eq!(err.kind, qos_daemon::FailureKind::NewSource);
	}

	#[tokio::test]
	async fn cache_unpins_and_flush_writes_tape() {
		let cluster = cluster();
		cluster
			.execute(request(QoSAction::Flush, Some("p1"), Some("p1")), CancellationToken::new())
			.await
			.unwrap();
		cluster
			.execute(request(QoSAction::CacheReplica, None, Some("p1")), CancellationToken::new())
			.await
			.unwrap();
		let attrs = cluster.file(&id()).unwrap();
		assert!(attrs.persistent.is_empty());
		assert!(attrs.tape_locations.contains("osm"));
	}

	#[tokio::test]
	async fn unknown_file_is_not_found() {
		let cluster = cluster();
		let other = PnfsId::new("000000000000000000000002").unwrap();
		assert!(matches!(cluster.file_attributes(&other).await, Err(NamespaceError::NotFound(_))));
	}

	#[tokio::test]
	async fn canceled_action_changes_nothing() {
		let cluster = cluster();
		let cancel = CancellationToken::new();
		cancel.cancel();
		let err = cluster
			.execute(request(QoSAction::CopyReplica, Some("p1"), Some("p2")), cancel)
			.await
			.unwrap_err();
		assert!(err.is_retryable());
		assert!(!cluster.file(&id()).unwrap().locations.contains("p2"));
	}
}
