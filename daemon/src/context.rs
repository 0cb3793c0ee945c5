use std::sync::Arc;

use tracing::info;

use crate::{
	collaborators::{ActionExecutor, Namespace},
	config::VerifierConfig,
	counters::QoSVerifierCounters,
	db::{self, DbHandle},
	error::VerifyError,
	history::QoSHistory,
	manager::VerifyOperationManager,
	pool_info::PoolInfoMap,
	pool_status::PoolStatusHandler,
	store::VerifyOperationStore,
};

/// Everything one verifier process owns, wired together. Built by
/// [`init`](Self::init) and torn down by [`shutdown`](Self::shutdown).
pub struct VerifierContext {
	pub config: VerifierConfig,
	pub db: Option<DbHandle>,
	pub manager: Arc<VerifyOperationManager>,
	pub pool_status: PoolStatusHandler,
}

impl VerifierContext {
	/// Opens storage if configured, reloads what a previous run left behind
	/// and assembles the manager. The sweeper is not started.
	pub async fn init(
		config: VerifierConfig,
		namespace: Arc<dyn Namespace>,
		executor: Arc<dyn ActionExecutor>,
	) -> Result<Self, VerifyError> {
		let db = match &config.store.database {
			Some(path) => Some(db::open(path).await?),
			None => None,
		};

		let pools = Arc::new(PoolInfoMap::new());
		if let Some(db) = &db {
			for info in db::load_pools(db).await? {
				pools.insert(info);
			}
		}

		let store = Arc::new(VerifyOperationStore::new(config.store.ls_threshold, db.clone()));
		let history = Arc::new(QoSHistory::new(config.history.capacity));
		let counters = Arc::new(QoSVerifierCounters::new(
			config.counters.statistics_file.clone(),
			config.counters.record_to_file,
		));

		let manager = VerifyOperationManager::new(
			config.scheduler.clone(),
			store,
			pools,
			history,
			counters,
			namespace,
			executor,
		);
		manager.reload().await?;

		let pool_status = PoolStatusHandler::new(Arc::clone(&manager), db.clone());
		info!(durable = db.is_some(), operations = manager.size(), "verifier initialized");

		Ok(VerifierContext { config, db, manager, pool_status })
	}

	pub fn start(&self) {
		self.manager.start();
	}

	pub async fn shutdown(&self) {
		self.manager.shutdown().await;
		info!("verifier stopped");
	}
}
