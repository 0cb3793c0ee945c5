#![allow(dead_code)]

use std::{
	collections::{BTreeSet, HashMap},
	sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use qos_core::{AccessLatency, FileAttributes, PnfsId, PoolStatus, RetentionPolicy};
use qos_daemon::{
	config::SchedulerConfig, ActionError, ActionExecutor, ActionRequest, Namespace, NamespaceError,
	PoolInfoMap, QoSHistory, QoSVerifierCounters, StorageUnitConstraints, VerifyOperationManager,
	VerifyOperationStore,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const UNIT: &str = "test:default@osm";

pub fn id(n: u32) -> PnfsId {
	PnfsId::new(&format!("{n:024X}")).unwrap()
}

#[derive(Default)]
pub struct StubNamespace {
	files: Mutex<HashMap<PnfsId, FileAttributes>>,
}

impl StubNamespace {
	/// An online file with one pinned replica on each of `pools`.
	pub fn add_file(&self, pnfsid: &PnfsId, pools: &[&str]) {
		let locations: BTreeSet<String> = pools.iter().map(|p| p.to_string()).collect();
		self.files.lock().insert(
			pnfsid.clone(),
			FileAttributes {
				pnfsid: pnfsid.clone(),
				persistent: locations.clone(),
				locations,
				tape_locations: BTreeSet::new(),
				storage_unit: Some(UNIT.to_string()),
				access_latency: AccessLatency::Online,
				retention_policy: RetentionPolicy::Replica,
			},
		);
	}

	pub fn remove_file(&self, pnfsid: &PnfsId) {
		self.files.lock().remove(pnfsid);
	}
}

#[async_trait]
impl Namespace for StubNamespace {
	async fn file_attributes(&self, pnfsid: &PnfsId) -> Result<FileAttributes, NamespaceError> {
		self.files
			.lock()
			.get(pnfsid)
			.cloned()
			.ok_or_else(|| NamespaceError::NotFound(pnfsid.clone()))
	}
}

#[derive(Debug, Clone)]
pub enum Behavior {
	Succeed,
	Fail(ActionError),
	/// Hold until canceled.
	Block,
}

pub struct StubExecutor {
	behavior: Mutex<Behavior>,
	pub calls: Mutex<Vec<ActionRequest>>,
	pub started: Notify,
	pub cancel_seen: Arc<Notify>,
}

impl StubExecutor {
	pub fn new(behavior: Behavior) -> Self {
		StubExecutor {
			behavior: Mutex::new(behavior),
			calls: Mutex::new(Vec::new()),
			started: Notify::new(),
			cancel_seen: Arc::new(Notify::new()),
		}
	}

	pub fn set_behavior(&self, behavior: Behavior) {
		*self.behavior.lock() = behavior;
	}

	pub fn calls(&self) -> Vec<ActionRequest> {
		self.calls.lock().clone()
	}
}

#[async_trait]
impl ActionExecutor for StubExecutor {
	async fn execute(&self, request: ActionRequest, cancel: CancellationToken) -> Result<(), ActionError> {
		self.calls.lock().push(request);
		let seen = Arc::clone(&self.cancel_seen);
		let watched = cancel.clone();
		tokio::spawn(async move {
			watched.cancelled().await;
			seen.notify_one();
		});
		self.started.notify_one();

		let behavior = self.behavior.lock().clone();
		match behavior {
			Behavior::Succeed => Ok(()),
			Behavior::Fail(error) => Err(error),
			Behavior::Block => {
				cancel.cancelled().await;
				Err(ActionError::retryable("canceled"))
			}
		}
	}
}

pub struct Harness {
	pub manager: Arc<VerifyOperationManager>,
	pub namespace: Arc<StubNamespace>,
	pub executor: Arc<StubExecutor>,
}

/// Three enabled pools in one primary group; files need two copies.
pub fn harness(max_running: usize, max_retries: u32, behavior: Behavior) -> Harness {
	let pools = Arc::new(PoolInfoMap::new());
	let now = Utc::now();
	pools.add_group("default", true);
	for pool in ["p1", "p2", "p3"] {
		pools.update_status(pool, PoolStatus::Enabled, now);
		pools.add_to_group(pool, "default");
	}
	pools.set_constraints(UNIT, StorageUnitConstraints { required: 2, one_copy_per: Vec::new() });

	let settings = SchedulerConfig { max_running, max_retries, ..SchedulerConfig::default() };
	let namespace = Arc::new(StubNamespace::default());
	let executor = Arc::new(StubExecutor::new(behavior));
	let manager = VerifyOperationManager::new(
		settings,
		Arc::new(VerifyOperationStore::in_memory(1000)),
		pools,
		Arc::new(QoSHistory::new(100)),
		Arc::new(QoSVerifierCounters::new(None, false)),
		namespace.clone(),
		executor.clone(),
	);
	Harness { manager, namespace, executor }
}
