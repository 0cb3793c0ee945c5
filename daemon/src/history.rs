use std::{
	collections::{BTreeSet, VecDeque},
	fmt,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qos_core::{PnfsId, VerifyOperation, VerifyOperationState};

/// A record of one operation reaching a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
	pub pnfsid: PnfsId,
	pub outcome: VerifyOperationState,
	pub timestamp: DateTime<Utc>,
	/// The operation as it was when it finished.
	pub archive: String,
	pub error: Option<String>,
}

impl HistoryEntry {
	pub fn from_operation(op: &VerifyOperation) -> Self {
		HistoryEntry {
			pnfsid: op.pnfsid.clone(),
			outcome: op.state,
			timestamp: op.last_update,
			archive: op.to_string(),
			error: op.error.clone(),
		}
	}

	pub fn is_error(&self) -> bool {
		matches!(self.outcome, VerifyOperationState::Failed | VerifyOperationState::Aborted)
	}
}

impl fmt::Display for HistoryEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.archive)
	}
}

struct Inner {
	capacity: usize,
	all: VecDeque<HistoryEntry>,
	errors: VecDeque<HistoryEntry>,
}

fn push_bounded(queue: &mut VecDeque<HistoryEntry>, entry: HistoryEntry, capacity: usize) {
	while queue.len() >= capacity {
		queue.pop_front();
	}
	queue.push_back(entry);
}

/// Bounded record of finished operations, with a separate buffer for errors.
pub struct QoSHistory {
	inner: Mutex<Inner>,
}

impl QoSHistory {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		QoSHistory {
			inner: Mutex::new(Inner {
				capacity,
				all: VecDeque::with_capacity(capacity),
				errors: VecDeque::new(),
			}),
		}
	}

	pub fn add(&self, entry: HistoryEntry) {
		let mut inner = self.inner.lock();
		let capacity = inner.capacity;
		if entry.is_error() {
			push_bounded(&mut inner.errors, entry.clone(), capacity);
		}
		push_bounded(&mut inner.all, entry, capacity);
	}

	pub fn record(&self, op: &VerifyOperation) {
		self.add(HistoryEntry::from_operation(op));
	}

	/// The most recent `limit` entries (all when `None`), oldest first.
	pub fn ascending(&self, errors_only: bool, limit: Option<usize>) -> Vec<HistoryEntry> {
		let inner = self.inner.lock();
		let queue = if errors_only { &inner.errors } else { &inner.all };
		let skip = limit.map_or(0, |n| queue.len().saturating_sub(n));
		queue.iter().skip(skip).cloned().collect()
	}

	/// The most recent `limit` entries (all when `None`), newest first.
	pub fn descending(&self, errors_only: bool, limit: Option<usize>) -> Vec<HistoryEntry> {
		let mut entries = self.ascending(errors_only, limit);
		entries.reverse();
		entries
	}

	/// Drains the error buffer, returning the distinct files in it.
	pub fn take_error_pnfsids(&self) -> BTreeSet<PnfsId> {
		let mut inner = self.inner.lock();
		inner.errors.drain(..).map(|entry| entry.pnfsid).collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().all.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
