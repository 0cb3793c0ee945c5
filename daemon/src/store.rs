use std::{
	collections::{BTreeMap, HashMap},
	sync::atomic::{AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use qos_core::{
	FileQoSUpdate, PnfsId, QoSMessageType, SortOrder, VerifyOperation, VerifyOperationFilter,
	VerifyOperationState,
};
use tracing::{debug, trace};

use crate::{
	db::{self, DbHandle},
	error::StoreError,
};

/// Position in the last-update index; the sequence number breaks ties.
type OrderKey = (DateTime<Utc>, u64);

struct Entry {
	op: VerifyOperation,
	key: OrderKey,
}

#[derive(Default)]
struct Inner {
	entries: HashMap<PnfsId, Entry>,
	order: BTreeMap<OrderKey, PnfsId>,
	next_seq: u64,
}

impl Inner {
	fn insert(&mut self, op: VerifyOperation) {
		let key = (op.last_update, self.next_seq);
		self.next_seq += 1;
		self.order.insert(key, op.pnfsid.clone());
		if let Some(old) = self.entries.insert(op.pnfsid.clone(), Entry { op, key }) {
			self.order.remove(&old.key);
		}
	}

	fn remove(&mut self, pnfsid: &PnfsId) -> Option<VerifyOperation> {
		let entry = self.entries.remove(pnfsid)?;
		self.order.remove(&entry.key);
		Some(entry.op)
	}

	/// Re-indexes an entry after its last update time changed.
	fn reindex(&mut self, pnfsid: &PnfsId) {
		let seq = self.next_seq;
		let Some(entry) = self.entries.get_mut(pnfsid) else {
			return;
		};
		if entry.key.0 == entry.op.last_update {
			return;
		}
		self.order.remove(&entry.key);
		entry.key = (entry.op.last_update, seq);
		self.order.insert(entry.key, pnfsid.clone());
		self.next_seq += 1;
	}

	/// Matching operations in the filter's order.
	fn matching<'a>(&'a self, filter: &'a VerifyOperationFilter) -> Box<dyn Iterator<Item = &'a VerifyOperation> + 'a> {
		if let Some(ids) = filter.single_keys() {
			let mut hits: Vec<&Entry> = ids.iter().filter_map(|id| self.entries.get(id)).collect();
			hits.sort_by_key(|e| e.key);
			if filter.order == SortOrder::Desc {
				hits.reverse();
			}
			return Box::new(hits.into_iter().map(|e| &e.op).filter(move |op| filter.matches(op)));
		}

		let lookup = move |id: &PnfsId| self.entries.get(id).map(|e| &e.op);
		let ordered: Box<dyn Iterator<Item = &'a PnfsId> + 'a> = match filter.order {
			SortOrder::Asc => Box::new(self.order.values()),
			SortOrder::Desc => Box::new(self.order.values().rev()),
		};
		Box::new(ordered.filter_map(lookup).filter(move |op| filter.matches(op)))
	}
}

/// How an update was folded into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
	/// No operation existed for the file.
	Created,
	/// Folded into a live operation without changing its state.
	Merged,
	/// A terminal operation was replaced by a fresh one.
	Reset,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
	pub operation: VerifyOperation,
	pub kind: MergeKind,
}

/// The authoritative table of verify operations, keyed by pnfsid.
///
/// Reads are served from memory. When a database handle is present every
/// mutation is written through before the call returns.
pub struct VerifyOperationStore {
	inner: RwLock<Inner>,
	ls_threshold: AtomicUsize,
	db: Option<DbHandle>,
	// Serializes mutations so rows reach the database in table order.
	write_gate: tokio::sync::Mutex<()>,
}

impl VerifyOperationStore {
	pub fn new(ls_threshold: usize, db: Option<DbHandle>) -> Self {
		VerifyOperationStore {
			inner: RwLock::new(Inner::default()),
			ls_threshold: AtomicUsize::new(ls_threshold),
			db,
			write_gate: tokio::sync::Mutex::new(()),
		}
	}

	pub fn in_memory(ls_threshold: usize) -> Self {
		Self::new(ls_threshold, None)
	}

	pub fn ls_threshold(&self) -> usize {
		self.ls_threshold.load(Ordering::Relaxed)
	}

	pub fn set_ls_threshold(&self, threshold: usize) {
		self.ls_threshold.store(threshold, Ordering::Relaxed);
	}

	pub fn is_durable(&self) -> bool {
		self.db.is_some()
	}

	async fn persist(&self, ops: &[VerifyOperation]) -> Result<(), StoreError> {
		match &self.db {
			Some(db) if !ops.is_empty() => db::save_operations(db, ops).await,
			_ => Ok(()),
		}
	}

	async fn forget(&self, pnfsids: &[PnfsId]) -> Result<(), StoreError> {
		match &self.db {
			Some(db) => db::delete_operations(db, pnfsids).await,
			None => Ok(()),
		}
	}

	/// Creates an operation for the update, or folds the update into the
	/// existing one. At most one operation exists per pnfsid.
	pub async fn insert_or_merge(&self, update: &FileQoSUpdate, now: DateTime<Utc>) -> Result<MergeOutcome, StoreError> {
		let _gate = self.write_gate.lock().await;
		let outcome = {
			let mut inner = self.inner.write();
			let live = inner
				.entries
				.get_mut(&update.pnfsid)
				.filter(|entry| !entry.op.is_terminal());
			if let Some(entry) = live {
				merge_live(&mut entry.op, update);
				MergeOutcome { operation: entry.op.clone(), kind: MergeKind::Merged }
			} else {
				let kind = if inner.entries.contains_key(&update.pnfsid) { MergeKind::Reset } else { MergeKind::Created };
				let op = VerifyOperation::from_update(update, now);
				inner.insert(op.clone());
				MergeOutcome { operation: op, kind }
			}
		};
		trace!(pnfsid = %update.pnfsid, kind = ?outcome.kind, "merged update");
		self.persist(std::slice::from_ref(&outcome.operation)).await?;
		Ok(outcome)
	}

	pub fn get(&self, pnfsid: &PnfsId) -> Option<VerifyOperation> {
		self.inner.read().entries.get(pnfsid).map(|e| e.op.clone())
	}

	/// Operations matching `filter`, ordered by last update.
	///
	/// Without a `limit`, refuses with [`StoreError::LimitRequired`] when more
	/// rows match than the listing threshold allows.
	pub fn find(&self, filter: &VerifyOperationFilter, limit: Option<usize>) -> Result<Vec<VerifyOperation>, StoreError> {
		let inner = self.inner.read();
		let limit = match limit {
			Some(limit) => limit,
			None => {
				let threshold = self.ls_threshold();
				let matched = inner.matching(filter).count();
				if matched > threshold {
					return Err(StoreError::LimitRequired { matched, threshold });
				}
				matched
			}
		};
		Ok(inner.matching(filter).take(limit).cloned().collect())
	}

	pub fn count(&self, filter: &VerifyOperationFilter) -> usize {
		self.inner.read().matching(filter).count()
	}

	pub fn size(&self) -> usize {
		self.inner.read().entries.len()
	}

	pub fn count_in_state(&self, state: VerifyOperationState) -> usize {
		self.inner.read().entries.values().filter(|e| e.op.state == state).count()
	}

	pub fn counts_by_state(&self) -> BTreeMap<VerifyOperationState, usize> {
		let inner = self.inner.read();
		let mut counts = BTreeMap::new();
		for entry in inner.entries.values() {
			*counts.entry(entry.op.state).or_insert(0) += 1;
		}
		counts
	}

	pub fn counts_by_message_type(&self) -> BTreeMap<QoSMessageType, usize> {
		let inner = self.inner.read();
		let mut counts = BTreeMap::new();
		for entry in inner.entries.values() {
			*counts.entry(entry.op.message_type).or_insert(0) += 1;
		}
		counts
	}

	/// Applies `f` to the operation atomically. `f` returns whether it changed
	/// anything; the updated operation is returned only in that case.
	pub async fn update<F>(&self, pnfsid: &PnfsId, f: F) -> Result<Option<VerifyOperation>, StoreError>
	where
		F: FnOnce(&mut VerifyOperation) -> bool,
	{
		let _gate = self.write_gate.lock().await;
		let updated = {
			let mut inner = self.inner.write();
			let changed = match inner.entries.get_mut(pnfsid) {
				Some(entry) => f(&mut entry.op),
				None => false,
			};
			if changed {
				inner.reindex(pnfsid);
				inner.entries.get(pnfsid).map(|e| e.op.clone())
			} else {
				None
			}
		};
		if let Some(op) = &updated {
			self.persist(std::slice::from_ref(op)).await?;
		}
		Ok(updated)
	}

	/// Like [`update`](Self::update) for every operation matching `filter`,
	/// visited in filter order. Returns the changed operations.
	pub async fn update_matching<F>(&self, filter: &VerifyOperationFilter, mut f: F) -> Result<Vec<VerifyOperation>, StoreError>
	where
		F: FnMut(&mut VerifyOperation) -> bool,
	{
		let _gate = self.write_gate.lock().await;
		let updated = {
			let mut inner = self.inner.write();
			let ids: Vec<PnfsId> = inner.matching(filter).map(|op| op.pnfsid.clone()).collect();
			let mut updated = Vec::new();
			for id in ids {
				let changed = inner.entries.get_mut(&id).is_some_and(|entry| f(&mut entry.op));
				if changed {
					inner.reindex(&id);
					if let Some(entry) = inner.entries.get(&id) {
						updated.push(entry.op.clone());
					}
				}
			}
			updated
		};
		self.persist(&updated).await?;
		Ok(updated)
	}

	pub async fn remove(&self, pnfsid: &PnfsId) -> Result<Option<VerifyOperation>, StoreError> {
		let _gate = self.write_gate.lock().await;
		let removed = self.inner.write().remove(pnfsid);
		if removed.is_some() {
			self.forget(std::slice::from_ref(pnfsid)).await?;
		}
		Ok(removed)
	}

	pub async fn remove_all(&self, filter: &VerifyOperationFilter) -> Result<Vec<VerifyOperation>, StoreError> {
		let _gate = self.write_gate.lock().await;
		let removed: Vec<VerifyOperation> = {
			let mut inner = self.inner.write();
			let ids: Vec<PnfsId> = inner.matching(filter).map(|op| op.pnfsid.clone()).collect();
			ids.iter().filter_map(|id| inner.remove(id)).collect()
		};
		let ids: Vec<PnfsId> = removed.iter().map(|op| op.pnfsid.clone()).collect();
		self.forget(&ids).await?;
		debug!(count = removed.len(), "removed operations");
		Ok(removed)
	}

	/// Replaces the in-memory table with the persisted rows. Operations that
	/// were RUNNING or WAITING when the previous process stopped become READY.
	pub async fn reload(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
		let Some(db) = &self.db else {
			return Ok(0);
		};
		let _gate = self.write_gate.lock().await;
		let mut ops = db::load_operations(db).await?;
		let mut reset = Vec::new();
		for op in &mut ops {
			if matches!(op.state, VerifyOperationState::Running | VerifyOperationState::Waiting) {
				op.set_state(VerifyOperationState::Ready, now);
				reset.push(op.clone());
			}
		}
		let loaded = ops.len();
		{
			let mut inner = self.inner.write();
			*inner = Inner::default();
			for op in ops {
				inner.insert(op);
			}
		}
		self.persist(&reset).await?;
		debug!(loaded, reset = reset.len(), "reloaded operations");
		Ok(loaded)
	}
}

/// Folds an update into a live operation: the state, retry count and last
/// update time are left alone.
fn merge_live(op: &mut VerifyOperation, update: &FileQoSUpdate) {
	if op.message_type == QoSMessageType::SystemScan
		&& matches!(update.message_type, QoSMessageType::PoolStatusDown | QoSMessageType::PoolStatusUp)
	{
		op.message_type = update.message_type;
		op.parent = update.pool.clone();
	}
	if op.storage_unit.is_none() {
		op.storage_unit = update.storage_unit.clone();
	}
	if op.pool_group.is_none() {
		op.pool_group = update.pool_group.clone();
	}
}
