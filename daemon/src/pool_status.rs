use std::sync::Arc;

use chrono::Utc;
use qos_core::{FileQoSUpdate, PnfsId, PoolInfo, PoolStatus, QoSMessageType};
use tracing::{info, warn};

use crate::{
	db::{self, DbHandle},
	error::{BatchSummary, VerifyError},
	manager::{CancelReport, VerifyOperationManager},
};

/// Inbound events from the pool monitor and the scanner.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
	/// A pool changed state.
	Status { pool: String, status: PoolStatus },
	/// The files found on a pool after it went down or came up.
	StatusScan { pool: String, status: PoolStatus, files: Vec<PnfsId> },
	/// A periodic scan of a pool's files.
	SystemScan { pool: String, files: Vec<PnfsId> },
	/// A scan of a pool was canceled; its queued operations go too.
	ScanCanceled { pool: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolEventReport {
	pub pool: Option<PoolInfo>,
	pub queued: BatchSummary,
	pub canceled: CancelReport,
}

/// Applies pool events to the pool map and the operation table.
pub struct PoolStatusHandler {
	manager: Arc<VerifyOperationManager>,
	db: Option<DbHandle>,
}

impl PoolStatusHandler {
	pub fn new(manager: Arc<VerifyOperationManager>, db: Option<DbHandle>) -> Self {
		PoolStatusHandler { manager, db }
	}

	pub async fn handle(&self, event: PoolEvent) -> Result<PoolEventReport, VerifyError> {
		let mut report = PoolEventReport::default();
		match event {
			PoolEvent::Status { pool, status } => {
				report.pool = Some(self.update_status(&pool, status).await?);
			}
			PoolEvent::StatusScan { pool, status, files } => {
				let message_type = match status {
					PoolStatus::Down | PoolStatus::Uninitialized => QoSMessageType::PoolStatusDown,
					PoolStatus::Enabled | PoolStatus::ReadOnly => QoSMessageType::PoolStatusUp,
				};
				report.pool = Some(self.update_status(&pool, status).await?);
				report.queued = self.enqueue(&pool, message_type, files).await;
			}
			PoolEvent::SystemScan { pool, files } => {
				report.queued = self.enqueue(&pool, QoSMessageType::SystemScan, files).await;
			}
			PoolEvent::ScanCanceled { pool } => {
				report.canceled = self.manager.cancel_file_ops_for_pool(&pool, true).await?;
			}
		}
		Ok(report)
	}

	async fn update_status(&self, pool: &str, status: PoolStatus) -> Result<PoolInfo, VerifyError> {
		let info = self.manager.pools().update_status(pool, status, Utc::now());
		info!(pool, %status, "pool status changed");
		if let Some(db) = &self.db {
			db::save_pool(db, &info).await?;
		}
		Ok(info)
	}

	async fn enqueue(&self, pool: &str, message_type: QoSMessageType, files: Vec<PnfsId>) -> BatchSummary {
		let updates = files
			.into_iter()
			.map(|pnfsid| FileQoSUpdate::new(pnfsid, Some(pool.to_string()), message_type))
			.collect();
		let summary = self.manager.submit(updates).await;
		if !summary.failures.is_empty() {
			warn!(pool, failures = summary.failures.len(), "some scanned files were not queued");
		}
		summary
	}
}
