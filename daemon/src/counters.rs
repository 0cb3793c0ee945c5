use std::{
	collections::BTreeMap,
	fmt,
	fs::{File, OpenOptions},
	io::{BufRead, BufReader, Write},
	path::{Path, PathBuf},
	sync::atomic::{AtomicBool, Ordering},
	time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qos_core::QoSAction;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CountersError {
	#[error("no statistics file configured")]
	NoStatisticsFile,

	#[error("statistics file {path}: {message}")]
	Io { path: PathBuf, message: String },

	#[error("malformed statistics line {line}: {message}")]
	Malformed { line: usize, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionCounts {
	pub completed: u64,
	pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
	pub completed_as_source: u64,
	pub completed_as_target: u64,
	pub failed: u64,
}

/// One line of the statistics file, written after each sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStatistics {
	pub timestamp: DateTime<Utc>,
	pub elapsed_ms: u64,
	pub admitted: usize,
	pub running: usize,
	/// Completions since the previous sweep.
	pub completed: u64,
	/// Terminal failures since the previous sweep.
	pub failed: u64,
}

impl fmt::Display for SweepStatistics {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} sweep {} ms: admitted {}, running {}, completed {}, failed {}",
			self.timestamp.format(qos_core::TIMESTAMP_FORMAT),
			self.elapsed_ms,
			self.admitted,
			self.running,
			self.completed,
			self.failed,
		)
	}
}

#[derive(Default)]
struct Inner {
	actions: BTreeMap<QoSAction, ActionCounts>,
	pools: BTreeMap<String, PoolCounts>,
	completed_since_sweep: u64,
	failed_since_sweep: u64,
	last_sweep: Option<SweepStatistics>,
}

/// Completion and failure totals, per action and per pool, plus the
/// optional per-sweep statistics file.
pub struct QoSVerifierCounters {
	inner: Mutex<Inner>,
	statistics_file: Option<PathBuf>,
	to_file: AtomicBool,
}

impl QoSVerifierCounters {
	pub fn new(statistics_file: Option<PathBuf>, to_file: bool) -> Self {
		QoSVerifierCounters {
			inner: Mutex::new(Inner::default()),
			statistics_file,
			to_file: AtomicBool::new(to_file),
		}
	}

	pub fn statistics_file(&self) -> Option<&Path> {
		self.statistics_file.as_deref()
	}

	pub fn is_recording(&self) -> bool {
		self.to_file.load(Ordering::Relaxed)
	}

	pub fn set_to_file(&self, enabled: bool) -> Result<(), CountersError> {
		if enabled && self.statistics_file.is_none() {
			return Err(CountersError::NoStatisticsFile);
		}
		self.to_file.store(enabled, Ordering::Relaxed);
		Ok(())
	}

	pub fn increment_completed(&self, action: Option<QoSAction>, source: Option<&str>, target: Option<&str>) {
		let mut inner = self.inner.lock();
		inner.completed_since_sweep += 1;
		if let Some(action) = action {
			inner.actions.entry(action).or_default().completed += 1;
		}
		if let Some(source) = source {
			inner.pools.entry(source.to_string()).or_default().completed_as_source += 1;
		}
		if let Some(target) = target {
			inner.pools.entry(target.to_string()).or_default().completed_as_target += 1;
		}
	}

	pub fn increment_failed(&self, action: Option<QoSAction>, pool: Option<&str>) {
		let mut inner = self.inner.lock();
		inner.failed_since_sweep += 1;
		if let Some(action) = action {
			inner.actions.entry(action).or_default().failed += 1;
		}
		if let Some(pool) = pool {
			inner.pools.entry(pool.to_string()).or_default().failed += 1;
		}
	}

	pub fn action_counts(&self) -> BTreeMap<QoSAction, ActionCounts> {
		self.inner.lock().actions.clone()
	}

	pub fn pool_counts(&self) -> BTreeMap<String, PoolCounts> {
		self.inner.lock().pools.clone()
	}

	pub fn last_sweep(&self) -> Option<SweepStatistics> {
		self.inner.lock().last_sweep.clone()
	}

	/// Closes a sweep: snapshots the counts since the previous one and, when
	/// recording is on, appends them to the statistics file.
	pub fn record_sweep(&self, elapsed: Duration, admitted: usize, running: usize) -> Result<SweepStatistics, CountersError> {
		let stats = {
			let mut inner = self.inner.lock();
			let stats = SweepStatistics {
				timestamp: Utc::now(),
				elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
				admitted,
				running,
				completed: std::mem::take(&mut inner.completed_since_sweep),
				failed: std::mem::take(&mut inner.failed_since_sweep),
			};
			inner.last_sweep = Some(stats.clone());
			stats
		};

		if self.is_recording() {
			if let Some(path) = &self.statistics_file {
				append_line(path, &stats)?;
			}
		}
		Ok(stats)
	}

	/// Reads back recorded sweeps: the last `limit` of them (all when `None`),
	/// oldest first unless `descending`.
	pub fn read_statistics(&self, limit: Option<usize>, descending: bool) -> Result<Vec<SweepStatistics>, CountersError> {
		let path = self.statistics_file.as_ref().ok_or(CountersError::NoStatisticsFile)?;
		let file = match File::open(path) {
			Ok(file) => file,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(io_err(path, e)),
		};

		let mut stats = Vec::new();
		for (index, line) in BufReader::new(file).lines().enumerate() {
			let line = line.map_err(|e| io_err(path, e))?;
			if line.trim().is_empty() {
				continue;
			}
			let entry: SweepStatistics = serde_json::from_str(&line).map_err(|e| CountersError::Malformed {
				line: index + 1,
				message: e.to_string(),
			})?;
			stats.push(entry);
		}

		if let Some(limit) = limit {
			let skip = stats.len().saturating_sub(limit);
			stats.drain(..skip);
		}
		if descending {
			stats.reverse();
		}
		Ok(stats)
	}
}

fn io_err(path: &Path, e: std::io::Error) -> CountersError {
	CountersError::Io { path: path.to_path_buf(), message: e.to_string() }
}

fn append_line(path: &Path, stats: &SweepStatistics) -> Result<(), CountersError> {
	let line = serde_json::to_string(stats).map_err(|e| CountersError::Io {
		path: path.to_path_buf(),
		message: e.to_string(),
	})?;
	let mut file = OpenOptions::new()
		.create(true)
		.append(true)
		.open(path)
		.map_err(|e| io_err(path, e))?;
	writeln!(file, "{line}").map_err(|e| io_err(path, e))
}
