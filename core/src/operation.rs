use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{pnfsid::PnfsId, update::FileQoSUpdate};

/// Declares a fieldless enum with SCREAMING_SNAKE_CASE names used on the
/// wire, in the database and at the admin shell.
macro_rules! named_enum {
	(
		$(#[$meta:meta])*
		$name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }
	) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize, ::serde::Deserialize)]
		#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
		pub enum $name {
			$($variant),+
		}

		impl $name {
			pub const ALL: &'static [$name] = &[$($name::$variant),+];

			pub fn as_str(&self) -> &'static str {
				match self {
					$($name::$variant => $text),+
				}
			}
		}

		impl ::std::fmt::Display for $name {
			fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
				f.write_str(self.as_str())
			}
		}

		impl ::std::str::FromStr for $name {
			type Err = $crate::error::ParseError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let upper = s.trim().to_ascii_uppercase();
				$name::ALL
					.iter()
					.find(|v| v.as_str() == upper)
					.copied()
					.ok_or_else(|| $crate::error::ParseError::UnknownVariant {
						kind: $kind,
						value: s.to_string(),
					})
			}
		}
	};
}

pub(crate) use named_enum;

named_enum! {
	/// The trigger that created or last updated an operation.
	QoSMessageType, "message type" {
		CorruptFile => "CORRUPT_FILE",
		ClearCacheLocation => "CLEAR_CACHE_LOCATION",
		AddCacheLocation => "ADD_CACHE_LOCATION",
		QosModified => "QOS_MODIFIED",
		QosModifiedCanceled => "QOS_MODIFIED_CANCELED",
		PoolStatusDown => "POOL_STATUS_DOWN",
		PoolStatusUp => "POOL_STATUS_UP",
		SystemScan => "SYSTEM_SCAN",
		ValidateOnly => "VALIDATE_ONLY",
	}
}

impl QoSMessageType {
	/// Scan-originated messages carry the scanned pool as parent rather than source.
	pub fn is_parent_scan(&self) -> bool {
		matches!(
			self,
			QoSMessageType::PoolStatusDown | QoSMessageType::PoolStatusUp | QoSMessageType::SystemScan
		)
	}

	/// Messages about a single known replica, for which tape state is not re-checked.
	pub fn skips_hsm_check(&self) -> bool {
		matches!(self, QoSMessageType::CorruptFile | QoSMessageType::AddCacheLocation)
	}
}

named_enum! {
	/// Corrective action computed for a replica.
	QoSAction, "action" {
		CopyReplica => "COPY_REPLICA",
		CacheReplica => "CACHE_REPLICA",
		PersistReplica => "PERSIST_REPLICA",
		WaitForStage => "WAIT_FOR_STAGE",
		Flush => "FLUSH",
	}
}

impl QoSAction {
	/// Whether the action reads from `source` (which must then stay usable).
	pub fn needs_source(&self) -> bool {
		matches!(self, QoSAction::CopyReplica | QoSAction::Flush)
	}
}

named_enum! {
	VerifyOperationState, "state" {
		Ready => "READY",
		Running => "RUNNING",
		Waiting => "WAITING",
		Done => "DONE",
		Canceled => "CANCELED",
		Failed => "FAILED",
		Aborted => "ABORTED",
	}
}

impl VerifyOperationState {
	pub const ACTIVE: &'static [VerifyOperationState] = &[
		VerifyOperationState::Running,
		VerifyOperationState::Ready,
		VerifyOperationState::Waiting,
	];

	pub fn is_terminal(&self) -> bool {
		!VerifyOperationState::ACTIVE.contains(self)
	}
}

/// One pending or finished verification task for a single file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyOperation {
	pub pnfsid: PnfsId,
	pub arrived: DateTime<Utc>,
	pub last_update: DateTime<Utc>,
	pub message_type: QoSMessageType,
	pub action: Option<QoSAction>,
	pub previous_action: Option<QoSAction>,
	pub state: VerifyOperationState,
	pub source: Option<String>,
	pub target: Option<String>,
	pub parent: Option<String>,
	pub storage_unit: Option<String>,
	pub pool_group: Option<String>,
	pub retried: u32,
	pub needed: u32,
	pub tried: BTreeSet<String>,
	pub error: Option<String>,
	/// Admission counter; completion reports from an older admission are stale.
	#[serde(skip)]
	pub run_id: u64,
}

impl VerifyOperation {
	pub fn from_update(update: &FileQoSUpdate, now: DateTime<Utc>) -> Self {
		let (parent, source) = if update.message_type.is_parent_scan() {
			(update.pool.clone(), None)
		} else {
			(None, update.pool.clone())
		};

		VerifyOperation {
			pnfsid: update.pnfsid.clone(),
			arrived: now,
			last_update: now,
			message_type: update.message_type,
			action: None,
			previous_action: None,
			state: VerifyOperationState::Ready,
			source,
			target: None,
			parent,
			storage_unit: update.storage_unit.clone(),
			pool_group: update.pool_group.clone(),
			retried: 0,
			needed: 0,
			tried: BTreeSet::new(),
			error: None,
			run_id: 0,
		}
	}

	pub fn is_terminal(&self) -> bool {
		self.state.is_terminal()
	}

	/// The pool this operation is chiefly about, used for per-pool counters.
	pub fn principal_pool(&self) -> Option<&str> {
		self.parent
			.as_deref()
			.or(self.source.as_deref())
			.or(self.target.as_deref())
	}

	/// Pools that must be usable for the operation to be admitted, paired
	/// with whether write access is required.
	pub fn required_pools(&self) -> Vec<(&str, bool)> {
		let mut required = Vec::with_capacity(2);
		if let Some(target) = self.target.as_deref() {
			required.push((target, true));
		}
		if let (Some(source), Some(action)) = (self.source.as_deref(), self.action) {
			if action.needs_source() {
				required.push((source, false));
			}
		}
		required
	}

	/// Clears the pools so the next attempt selects afresh.
	pub fn reset_source_and_target(&mut self) {
		self.source = None;
		self.target = None;
	}

	pub fn set_state(&mut self, state: VerifyOperationState, now: DateTime<Utc>) {
		self.state = state;
		self.last_update = now;
	}
}

impl fmt::Display for VerifyOperation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fn or_none(value: &Option<String>) -> &str {
			value.as_deref().unwrap_or("-")
		}

		write!(
			f,
			"{} {} {} (msg {}, action {}) (parent {}, source {}, target {}) (sunit {}, group {}) (retried {})",
			self.last_update.format("%Y/%m/%d-%H:%M:%S"),
			self.pnfsid,
			self.state,
			self.message_type,
			self.action.map(|a| a.as_str()).unwrap_or("-"),
			or_none(&self.parent),
			or_none(&self.source),
			or_none(&self.target),
			or_none(&self.storage_unit),
			or_none(&self.pool_group),
			self.retried,
		)?;
		if let Some(error) = &self.error {
			write!(f, " {error}")?;
		}
		Ok(())
	}
}
