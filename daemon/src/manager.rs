use std::{
	collections::{BTreeMap, HashMap, HashSet},
	fmt,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use qos_core::{
	FieldFilter, FileQoSUpdate, PnfsId, QoSAction, QoSMessageType, VerifyOperation, VerifyOperationFilter,
	VerifyOperationState,
};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
	collaborators::{ActionExecutor, FailureKind, Namespace},
	config::SchedulerConfig,
	counters::QoSVerifierCounters,
	error::{BatchSummary, VerifyError},
	history::QoSHistory,
	pool_info::PoolInfoMap,
	store::{MergeKind, MergeOutcome, VerifyOperationStore},
	task::{TaskOutcome, VerificationTask},
};

/// Which operations to cancel, and whether WAITING ones leave the table.
#[derive(Debug, Clone, Default)]
pub struct CancelFilter {
	pub filter: VerifyOperationFilter,
	pub force_removal: bool,
}

impl CancelFilter {
	pub fn new(filter: VerifyOperationFilter) -> Self {
		CancelFilter { filter, force_removal: false }
	}

	pub fn force_removal(mut self, force: bool) -> Self {
		self.force_removal = force;
		self
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelReport {
	pub canceled: usize,
	pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
	pub requeued: usize,
	pub admitted: usize,
	pub demoted: usize,
	pub promoted: usize,
	pub running: usize,
}

/// Scheduler settings and a census of the table.
#[derive(Debug, Clone)]
pub struct ManagerInfo {
	pub settings: SchedulerConfig,
	pub in_flight: usize,
	pub total: usize,
	pub by_state: BTreeMap<VerifyOperationState, usize>,
	pub by_message_type: BTreeMap<QoSMessageType, usize>,
}

impl fmt::Display for ManagerInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "maximum concurrent operations {}.", self.settings.max_running)?;
		writeln!(f, "maximum retries on failure {}.", self.settings.max_retries)?;
		writeln!(f, "sweep interval {} seconds.", self.settings.sweep_interval)?;
		writeln!(f, "in flight {}.", self.in_flight)?;
		writeln!(f, "\nOPERATIONS BY STATE ({} total):", self.total)?;
		for (state, count) in &self.by_state {
			writeln!(f, "    {:<26}{count}", state.as_str())?;
		}
		writeln!(f, "\nOPERATIONS BY MESSAGE TYPE:")?;
		for (message_type, count) in &self.by_message_type {
			writeln!(f, "    {:<26}{count}", message_type.as_str())?;
		}
		Ok(())
	}
}

struct InFlight {
	run_id: u64,
	cancel: CancellationToken,
}

/// Moves operations through their lifecycle: admission under the
/// concurrency bound, completion, retry, cancellation.
pub struct VerifyOperationManager {
	store: Arc<VerifyOperationStore>,
	pools: Arc<PoolInfoMap>,
	history: Arc<QoSHistory>,
	counters: Arc<QoSVerifierCounters>,
	namespace: Arc<dyn Namespace>,
	executor: Arc<dyn ActionExecutor>,
	settings: RwLock<SchedulerConfig>,
	in_flight: Mutex<HashMap<PnfsId, InFlight>>,
	next_run_id: AtomicU64,
	// Failed runs already counted and put into history.
	surfaced: Mutex<HashSet<(PnfsId, u64)>>,
	// A sweep never overlaps another.
	sweep_gate: tokio::sync::Mutex<()>,
	wake: Notify,
	idle: Notify,
	shutdown: CancellationToken,
	sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl VerifyOperationManager {
	pub fn new(
		settings: SchedulerConfig,
		store: Arc<VerifyOperationStore>,
		pools: Arc<PoolInfoMap>,
		history: Arc<QoSHistory>,
		counters: Arc<QoSVerifierCounters>,
		namespace: Arc<dyn Namespace>,
		executor: Arc<dyn ActionExecutor>,
	) -> Arc<Self> {
		Arc::new(VerifyOperationManager {
			store,
			pools,
			history,
			counters,
			namespace,
			executor,
			settings: RwLock::new(settings),
			in_flight: Mutex::new(HashMap::new()),
			next_run_id: AtomicU64::new(1),
			surfaced: Mutex::new(HashSet::new()),
			sweep_gate: tokio::sync::Mutex::new(()),
			wake: Notify::new(),
			idle: Notify::new(),
			shutdown: CancellationToken::new(),
			sweeper: Mutex::new(None),
		})
	}

	pub fn store(&self) -> &Arc<VerifyOperationStore> {
		&self.store
	}

	pub fn pools(&self) -> &Arc<PoolInfoMap> {
		&self.pools
	}

	pub fn history(&self) -> &Arc<QoSHistory> {
		&self.history
	}

	pub fn counters(&self) -> &Arc<QoSVerifierCounters> {
		&self.counters
	}

	pub fn settings(&self) -> SchedulerConfig {
		self.settings.read().clone()
	}

	pub fn set_max_running(&self, max_running: usize) -> Result<(), VerifyError> {
		if max_running == 0 {
			return Err(VerifyError::InvalidSetting("maxRunning must be at least 1".into()));
		}
		self.settings.write().max_running = max_running;
		self.wake.notify_one();
		Ok(())
	}

	pub fn set_max_retries(&self, max_retries: u32) {
		self.settings.write().max_retries = max_retries;
	}

	pub fn set_sweep_interval(&self, interval: Duration) -> Result<(), VerifyError> {
		if interval.as_secs() == 0 {
			return Err(VerifyError::InvalidSetting("sweep interval must be at least 1 second".into()));
		}
		self.settings.write().sweep_interval = interval.as_secs();
		self.wake.notify_one();
		Ok(())
	}

	/// Records a trigger for a file. Returns once the operation is in the
	/// table; it runs on a later sweep.
	pub async fn create_or_update_operation(&self, update: FileQoSUpdate) -> Result<MergeOutcome, VerifyError> {
		if update.message_type.is_parent_scan() && update.pool.is_none() {
			return Err(VerifyError::InvalidInput(format!(
				"{} for {} does not name a pool",
				update.message_type, update.pnfsid
			)));
		}
		let update = self.resolve(update).await?;
		let outcome = self.store.insert_or_merge(&update, Utc::now()).await?;
		if outcome.kind != MergeKind::Merged {
			debug!(pnfsid = %update.pnfsid, message_type = %update.message_type, "operation queued");
			self.wake.notify_one();
		}
		Ok(outcome)
	}

	/// Fills in the storage unit, and for a plain verification the pool,
	/// from the namespace. Files that no longer exist are refused; when the
	/// namespace is merely unreachable the update goes in as is.
	async fn resolve(&self, mut update: FileQoSUpdate) -> Result<FileQoSUpdate, VerifyError> {
		let wants_pool = update.pool.is_none() && update.message_type == QoSMessageType::ValidateOnly;
		if update.storage_unit.is_some() && !wants_pool {
			return Ok(update);
		}

		let timeout = self.settings().namespace_timeout();
		let attributes = match tokio::time::timeout(timeout, self.namespace.file_attributes(&update.pnfsid)).await {
			Ok(Ok(attributes)) => attributes,
			Ok(Err(e)) if e.is_retryable() => {
				warn!(pnfsid = %update.pnfsid, error = %e, "attributes unavailable, queueing unresolved");
				return Ok(update);
			}
			Ok(Err(e)) => return Err(e.into()),
			Err(_) => {
				warn!(pnfsid = %update.pnfsid, "attribute lookup timed out, queueing unresolved");
				return Ok(update);
			}
		};

		if update.storage_unit.is_none() {
			update.storage_unit = attributes.storage_unit;
		}
		if wants_pool {
			update.pool = attributes.locations.into_iter().next();
		}
		Ok(update)
	}

	/// Submits several updates; each failure is reported against its pnfsid.
	pub async fn submit(&self, updates: Vec<FileQoSUpdate>) -> BatchSummary {
		let mut summary = BatchSummary::default();
		for update in updates {
			let pnfsid = update.pnfsid.to_string();
			match self.create_or_update_operation(update).await {
				Ok(_) => summary.accepted += 1,
				Err(e) => summary.fail(pnfsid, e),
			}
		}
		summary
	}

	/// Queues a check of each file against its requirements.
	pub async fn verify(&self, pnfsids: impl IntoIterator<Item = PnfsId>) -> BatchSummary {
		let updates = pnfsids
			.into_iter()
			.map(|pnfsid| FileQoSUpdate::new(pnfsid, None, QoSMessageType::ValidateOnly))
			.collect();
		self.submit(updates).await
	}

	/// Re-verifies every file that most recently ended in error.
	pub async fn retry_failed(&self) -> BatchSummary {
		let pnfsids = self.history.take_error_pnfsids();
		info!(count = pnfsids.len(), "retrying failed files");
		self.verify(pnfsids).await
	}

	/// Marks matching live operations CANCELED and signals the running ones.
	/// Does not wait for the running tasks to stop.
	pub async fn cancel(&self, cancel: CancelFilter) -> Result<CancelReport, VerifyError> {
		if cancel.filter.is_empty() {
			return Err(VerifyError::EmptyCancelFilter);
		}

		let now = Utc::now();
		let mut prior: HashMap<PnfsId, VerifyOperationState> = HashMap::new();
		let canceled = self
			.store
			.update_matching(&cancel.filter, |op| {
				if op.is_terminal() {
					return false;
				}
				prior.insert(op.pnfsid.clone(), op.state);
				op.set_state(VerifyOperationState::Canceled, now);
				true
			})
			.await?;

		let mut removable = Vec::new();
		for op in &canceled {
			match prior.get(&op.pnfsid) {
				Some(VerifyOperationState::Running) => {
					if let Some(in_flight) = self.in_flight.lock().get(&op.pnfsid) {
						in_flight.cancel.cancel();
					}
				}
				Some(VerifyOperationState::Waiting) if cancel.force_removal => removable.push(op.pnfsid.clone()),
				_ => {}
			}
			self.history.record(op);
		}

		let mut removed = 0;
		for pnfsid in &removable {
			if self.store.remove(pnfsid).await?.is_some() {
				removed += 1;
			}
		}

		info!(canceled = canceled.len(), removed, "canceled operations");
		Ok(CancelReport { canceled: canceled.len(), removed })
	}

	/// Cancels, with removal, the operations a pool is responsible for: those
	/// with it as parent and, unless `only_parent`, as source or target.
	pub async fn cancel_file_ops_for_pool(&self, pool: &str, only_parent: bool) -> Result<CancelReport, VerifyError> {
		let by = |filter: VerifyOperationFilter| CancelFilter::new(filter).force_removal(true);
		let exact = || FieldFilter::Exactly(pool.to_string());

		let mut report = self.cancel(by(VerifyOperationFilter::new().parent(exact()))).await?;
		if !only_parent {
			for filter in [VerifyOperationFilter::new().source(exact()), VerifyOperationFilter::new().target(exact())] {
				let next = self.cancel(by(filter)).await?;
				report.canceled += next.canceled;
				report.removed += next.removed;
			}
		}
		Ok(report)
	}

	/// Removes finished operations matching `filter` from the table.
	pub async fn clear(&self, filter: VerifyOperationFilter) -> Result<usize, VerifyError> {
		let terminal = VerifyOperationState::ALL.iter().copied().filter(|s| s.is_terminal());
		let states = match &filter.states {
			Some(states) => states.iter().copied().filter(|s| s.is_terminal()).collect::<Vec<_>>(),
			None => terminal.collect(),
		};
		let removed = self.store.remove_all(&filter.states(states)).await?;
		Ok(removed.len())
	}

	pub fn list(&self, filter: &VerifyOperationFilter, limit: Option<usize>) -> Result<Vec<VerifyOperation>, VerifyError> {
		Ok(self.store.find(filter, limit)?)
	}

	pub fn count(&self, filter: &VerifyOperationFilter) -> usize {
		self.store.count(filter)
	}

	pub fn size(&self) -> usize {
		self.store.size()
	}

	pub fn in_flight(&self) -> usize {
		self.in_flight.lock().len()
	}

	pub fn info(&self) -> ManagerInfo {
		ManagerInfo {
			settings: self.settings(),
			in_flight: self.in_flight(),
			total: self.store.size(),
			by_state: self.store.counts_by_state(),
			by_message_type: self.store.counts_by_message_type(),
		}
	}

	/// Reloads persisted operations; interrupted ones are re-admitted.
	pub async fn reload(&self) -> Result<usize, VerifyError> {
		let loaded = self.store.reload(Utc::now()).await?;
		if loaded > 0 {
			info!(loaded, "reloaded operations");
			self.wake.notify_one();
		}
		Ok(loaded)
	}

	/// One pass over the table: requeue retryable failures, admit READY
	/// operations oldest first, then release WAITING ones whose pools are
	/// usable again.
	pub async fn sweep(self: &Arc<Self>) -> Result<SweepReport, VerifyError> {
		let _gate = self.sweep_gate.lock().await;
		let started = Instant::now();
		let settings = self.settings();
		let now = Utc::now();
		let mut report = SweepReport::default();

		let max_retries = settings.max_retries;
		self.surface_exhausted(max_retries)?;
		let requeued = self
			.store
			.update_matching(&VerifyOperationFilter::new().states([VerifyOperationState::Failed]), |op| {
				if op.retried >= max_retries {
					return false;
				}
				op.retried += 1;
				op.set_state(VerifyOperationState::Ready, now);
				true
			})
			.await?;
		report.requeued = requeued.len();

		let ready = self
			.store
			.find(&VerifyOperationFilter::new().states([VerifyOperationState::Ready]), Some(usize::MAX))?;
		let mut slots = settings
			.max_running
			.saturating_sub(self.store.count_in_state(VerifyOperationState::Running));

		for op in ready {
			if !self.pools_usable(&op) {
				let demoted = self
					.store
					.update(&op.pnfsid, |o| {
						if o.state != VerifyOperationState::Ready {
							return false;
						}
						o.set_state(VerifyOperationState::Waiting, now);
						true
					})
					.await?;
				if demoted.is_some() {
					debug!(pnfsid = %op.pnfsid, "pools unusable, waiting");
					report.demoted += 1;
				}
				continue;
			}
			if slots == 0 {
				continue;
			}
			if self.admit(&op.pnfsid, &settings).await {
				slots -= 1;
				report.admitted += 1;
			}
		}

		let waiting = self
			.store
			.find(&VerifyOperationFilter::new().states([VerifyOperationState::Waiting]), Some(usize::MAX))?;
		for op in waiting.iter().filter(|op| self.pools_usable(op)) {
			let promoted = self
				.store
				.update(&op.pnfsid, |o| {
					if o.state != VerifyOperationState::Waiting {
						return false;
					}
					o.set_state(VerifyOperationState::Ready, now);
					true
				})
				.await?;
			if promoted.is_some() {
				report.promoted += 1;
			}
		}

		report.running = self.store.count_in_state(VerifyOperationState::Running);
		if let Err(e) = self.counters.record_sweep(started.elapsed(), report.admitted, report.running) {
			warn!(error = %e, "could not record sweep statistics");
		}
		debug!(
			requeued = report.requeued,
			admitted = report.admitted,
			demoted = report.demoted,
			promoted = report.promoted,
			running = report.running,
			"sweep finished"
		);
		Ok(report)
	}

	fn pools_usable(&self, op: &VerifyOperation) -> bool {
		op.required_pools()
			.into_iter()
			.all(|(pool, writable)| self.pools.is_viable(pool, writable))
	}

	/// READY → RUNNING and hand the operation to a worker. A failure to
	/// record the transition leaves the operation READY.
	async fn admit(self: &Arc<Self>, pnfsid: &PnfsId, settings: &SchedulerConfig) -> bool {
		let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
		let now = Utc::now();
		let admitted = self
			.store
			.update(pnfsid, |op| {
				if op.state != VerifyOperationState::Ready {
					return false;
				}
				op.run_id = run_id;
				op.set_state(VerifyOperationState::Running, now);
				true
			})
			.await;

		match admitted {
			Ok(Some(op)) => {
				self.launch(op, run_id, settings);
				true
			}
			Ok(None) => false,
			Err(e) => {
				error!(%pnfsid, error = %e, "could not admit operation");
				let rollback = self
					.store
					.update(pnfsid, |op| {
						if op.run_id != run_id || op.state != VerifyOperationState::Running {
							return false;
						}
						op.set_state(VerifyOperationState::Ready, now);
						true
					})
					.await;
				if let Err(e) = rollback {
					error!(%pnfsid, error = %e, "could not return operation to READY");
				}
				false
			}
		}
	}

	fn launch(self: &Arc<Self>, op: VerifyOperation, run_id: u64, settings: &SchedulerConfig) {
		let cancel = self.shutdown.child_token();
		self.in_flight
			.lock()
			.insert(op.pnfsid.clone(), InFlight { run_id, cancel: cancel.clone() });

		let pnfsid = op.pnfsid.clone();
		let task = VerificationTask {
			op,
			run_id,
			store: Arc::clone(&self.store),
			pools: Arc::clone(&self.pools),
			namespace: Arc::clone(&self.namespace),
			executor: Arc::clone(&self.executor),
			namespace_timeout: settings.namespace_timeout(),
			action_timeout: settings.action_timeout(),
			cancel,
		};

		let manager = Arc::clone(self);
		tokio::spawn(async move {
			// The inner spawn turns a panic in the task into a failed outcome.
			let outcome = match tokio::spawn(task.run()).await {
				Ok(outcome) => outcome,
				Err(e) => TaskOutcome::retryable(format!("task join error: {e}")),
			};
			if let Err(e) = manager.complete(&pnfsid, run_id, outcome).await {
				error!(%pnfsid, error = %e, "could not record completion");
			}
		});
	}

	/// Applies a task's outcome if it is still the current run of a RUNNING
	/// operation; reports from canceled or replaced runs are dropped.
	async fn complete(&self, pnfsid: &PnfsId, run_id: u64, outcome: TaskOutcome) -> Result<(), VerifyError> {
		let now = Utc::now();
		let updated = self
			.store
			.update(pnfsid, |op| {
				if op.run_id != run_id || op.state != VerifyOperationState::Running {
					return false;
				}
				apply_outcome(op, &outcome, now)
			})
			.await;

		let result = match updated {
			Ok(Some(op)) => self.settle(&op).await,
			Ok(None) => {
				debug!(%pnfsid, ?outcome, "outcome of stale run ignored");
				Ok(())
			}
			Err(e) => Err(e.into()),
		};
		self.release(pnfsid, run_id);
		self.wake.notify_one();
		result
	}

	/// Bookkeeping for an operation that just left RUNNING.
	async fn settle(&self, op: &VerifyOperation) -> Result<(), VerifyError> {
		let pnfsid = &op.pnfsid;
		let max_retries = self.settings().max_retries;
		match op.state {
			VerifyOperationState::Done => {
				debug!(%pnfsid, action = ?op.action, "done");
				// A satisfied file moved nothing, so no pool gets credit.
				let (source, target) = match op.action {
					Some(_) => (op.source.as_deref(), op.target.as_deref()),
					None => (None, None),
				};
				self.counters.increment_completed(op.action, source, target);
				self.history.record(op);
				if op.needed > 1 || op.action == Some(QoSAction::WaitForStage) {
					self.follow_up(op).await?;
				}
			}
			VerifyOperationState::Failed if op.retried >= max_retries => {
				self.surface_exhausted(max_retries)?;
			}
			VerifyOperationState::Failed => {
				debug!(%pnfsid, retried = op.retried, error = ?op.error, "failed, will retry");
			}
			VerifyOperationState::Aborted => {
				warn!(%pnfsid, error = ?op.error, "aborted");
				self.counters.increment_failed(op.action, op.principal_pool());
				self.history.record(op);
			}
			_ => {}
		}
		Ok(())
	}

	/// Counts and records every FAILED operation that has run out of
	/// retries, once per failed run. This also catches operations stranded
	/// when the retry limit is lowered below their `retried`.
	fn surface_exhausted(&self, max_retries: u32) -> Result<usize, VerifyError> {
		let filter = VerifyOperationFilter::new()
			.states([VerifyOperationState::Failed])
			.retried_at_least(max_retries);
		let mut surfaced = self.surfaced.lock();
		let exhausted = self.store.find(&filter, Some(usize::MAX))?;

		let mut recorded = 0;
		for op in &exhausted {
			if surfaced.contains(&(op.pnfsid.clone(), op.run_id)) {
				continue;
			}
			warn!(pnfsid = %op.pnfsid, retried = op.retried, error = ?op.error, "failed, retries exhausted");
			self.counters.increment_failed(op.action, op.principal_pool());
			self.history.record(op);
			recorded += 1;
		}
		// Only runs still parked in FAILED need remembering.
		*surfaced = exhausted.into_iter().map(|op| (op.pnfsid, op.run_id)).collect();
		Ok(recorded)
	}

	/// Adjustments are still outstanding: verify the file again from scratch.
	async fn follow_up(&self, op: &VerifyOperation) -> Result<(), VerifyError> {
		let pool = if op.message_type.is_parent_scan() { op.parent.clone() } else { None };
		let mut update = FileQoSUpdate::new(op.pnfsid.clone(), pool, op.message_type);
		update.storage_unit = op.storage_unit.clone();
		update.pool_group = op.pool_group.clone();
		self.store.insert_or_merge(&update, Utc::now()).await?;
		debug!(pnfsid = %op.pnfsid, needed = op.needed, "requeued for further adjustment");
		self.wake.notify_one();
		Ok(())
	}

	fn release(&self, pnfsid: &PnfsId, run_id: u64) {
		let mut in_flight = self.in_flight.lock();
		if in_flight.get(pnfsid).is_some_and(|f| f.run_id == run_id) {
			in_flight.remove(pnfsid);
		}
		drop(in_flight);
		self.idle.notify_waiters();
	}

	/// Resolves once no task is in flight.
	pub async fn wait_idle(&self) {
		loop {
			let notified = self.idle.notified();
			if self.in_flight.lock().is_empty() {
				return;
			}
			notified.await;
		}
	}

	/// Runs sweeps until shutdown: every sweep interval, and sooner when
	/// operations are queued or finish.
	pub fn start(self: &Arc<Self>) {
		let manager = Arc::clone(self);
		let handle = tokio::spawn(async move {
			info!("sweeper started");
			loop {
				if let Err(e) = manager.sweep().await {
					error!(error = %e, "sweep failed");
				}
				let interval = manager.settings().sweep_interval();
				tokio::select! {
					_ = manager.shutdown.cancelled() => break,
					_ = manager.wake.notified() => {}
					_ = tokio::time::sleep(interval) => {}
				}
			}
			info!("sweeper stopped");
		});
		if let Some(previous) = self.sweeper.lock().replace(handle) {
			previous.abort();
		}
	}

	/// Stops the sweeper and signals every running task. Operations still
	/// RUNNING stay so and are re-admitted after a reload.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		let sweeper = self.sweeper.lock().take();
		if let Some(handle) = sweeper {
			let _ = handle.await;
		}
		self.wait_idle().await;
	}
}

/// Folds an outcome into the operation. False when nothing changes.
fn apply_outcome(op: &mut VerifyOperation, outcome: &TaskOutcome, now: chrono::DateTime<Utc>) -> bool {
	match outcome {
		TaskOutcome::Done => {
			op.previous_action = op.action;
			op.error = None;
			op.set_state(VerifyOperationState::Done, now);
		}
		TaskOutcome::Satisfied => {
			op.action = None;
			op.needed = 0;
			op.error = None;
			op.set_state(VerifyOperationState::Done, now);
		}
		TaskOutcome::Failed { kind, message } => {
			op.error = Some(message.clone());
			match kind {
				FailureKind::Retryable => op.set_state(VerifyOperationState::Failed, now),
				FailureKind::NewSource | FailureKind::NewTarget => {
					let culprit = if *kind == FailureKind::NewSource { op.source.clone() } else { op.target.clone() };
					if let Some(pool) = culprit {
						op.tried.insert(pool);
					}
					op.reset_source_and_target();
					op.set_state(VerifyOperationState::Failed, now);
				}
				FailureKind::Fatal => op.set_state(VerifyOperationState::Aborted, now),
			}
		}
		TaskOutcome::Aborted(message) => {
			op.error = Some(message.clone());
			op.set_state(VerifyOperationState::Aborted, now);
		}
		TaskOutcome::Canceled => return false,
	}
	true
}

#[cfg(test)]
mod tests {
	use super::*;

	fn running_op() -> VerifyOperation {
		let update = FileQoSUpdate::new(
			PnfsId::new("000000000000000000000001").unwrap(),
			Some("p1".into()),
			QoSMessageType::ValidateOnly,
		);
		let mut op = VerifyOperation::from_update(&update, Utc::now());
		op.state = VerifyOperationState::Running;
		op.action = Some(QoSAction::CopyReplica);
		op.target = Some("p2".into());
		op
	}

	#[test]
	fn new_target_failure_excludes_the_target() {
		let mut op = running_op();
		let outcome = TaskOutcome::Failed { kind: FailureKind::NewTarget, message: "full".into() };
		assert!(apply_outcome(&mut op, &outcome, Utc::now()));
		assert_eq!(op.state, VerifyOperationState::Failed);
		assert!(op.tried.contains("p2"));
		assert_eq!(op.source, None);
		assert_eq!(op.target, None);
	}

	#[test]
	fn retryable_failure_keeps_pools() {
		let mut op = running_op();
		let outcome = TaskOutcome::retryable("busy");
		assert!(apply_outcome(&mut op, &outcome, Utc::now()));
		assert_eq!(op.target.as_deref(), Some("p2"));
		assert_eq!(op.error.as_deref(), Some("busy"));
	}

	#[test]
	fn fatal_failure_aborts_and_cancel_changes_nothing() {
		let mut op = running_op();
		let outcome = TaskOutcome::Failed { kind: FailureKind::Fatal, message: "gone".into() };
		assert!(apply_outcome(&mut op, &outcome, Utc::now()));
		assert_eq!(op.state, VerifyOperationState::Aborted);

		let mut op = running_op();
		assert!(!apply_outcome(&mut op, &TaskOutcome::Canceled, Utc::now()));
		assert_eq!(op.state, VerifyOperationState::Running);
	}

	#[test]
	fn done_remembers_the_action() {
		let mut op = running_op();
		op.error = Some("earlier".into());
		assert!(apply_outcome(&mut op, &TaskOutcome::Done, Utc::now()));
		assert_eq!(op.state, VerifyOperationState::Done);
		assert_eq!(op.previous_action, Some(QoSAction::CopyReplica));
		assert_eq!(op.error, None);
	}

	#[test]
	fn satisfied_clears_a_stale_plan() {
		let mut op = running_op();
		op.needed = 2;
		assert!(apply_outcome(&mut op, &TaskOutcome::Satisfied, Utc::now()));
		assert_eq!(op.state, VerifyOperationState::Done);
		assert_eq!(op.action, None);
		assert_eq!(op.needed, 0);
	}
}
