use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

use crate::{
	error::ParseError,
	operation::{named_enum, QoSAction, QoSMessageType, VerifyOperation, VerifyOperationState},
	pnfsid::PnfsId,
	pool::{PoolInfo, PoolStatus},
};

/// Timestamp format accepted by the `lastUpdateBefore`/`lastUpdateAfter` options.
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d-%H:%M:%S";

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ParseError> {
	NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
		.map(|naive| naive.and_utc())
		.map_err(|_| ParseError::InvalidTimestamp(value.to_string()))
}

named_enum! {
	SortOrder, "sort order" {
		Asc => "ASC",
		Desc => "DESC",
	}
}

impl Default for SortOrder {
	fn default() -> Self {
		SortOrder::Asc
	}
}

/// Match on an optional string field of an operation.
///
/// `Any` does not filter. `Unset` matches only operations where the field is
/// absent (the option given with no value). `Exactly` matches the literal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldFilter {
	#[default]
	Any,
	Unset,
	Exactly(String),
}

impl FieldFilter {
	/// Interprets an option value: empty means "match only unset".
	pub fn from_value(value: &str) -> Self {
		let value = value.trim();
		if value.is_empty() {
			FieldFilter::Unset
		} else {
			FieldFilter::Exactly(value.to_string())
		}
	}

	pub fn is_any(&self) -> bool {
		matches!(self, FieldFilter::Any)
	}

	pub fn matches(&self, field: Option<&str>) -> bool {
		match self {
			FieldFilter::Any => true,
			FieldFilter::Unset => field.is_none(),
			FieldFilter::Exactly(value) => field == Some(value.as_str()),
		}
	}
}

/// Predicate over the operation table. Unset members do not filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyOperationFilter {
	/// `None` matches all pnfsids (the `*` argument).
	pub pnfsids: Option<BTreeSet<PnfsId>>,
	pub actions: Option<BTreeSet<QoSAction>>,
	pub message_types: Option<BTreeSet<QoSMessageType>>,
	pub states: Option<BTreeSet<VerifyOperationState>>,
	pub storage_unit: FieldFilter,
	pub pool_group: FieldFilter,
	pub parent: FieldFilter,
	pub source: FieldFilter,
	pub target: FieldFilter,
	pub retried_at_least: Option<u32>,
	pub last_update_before: Option<DateTime<Utc>>,
	pub last_update_after: Option<DateTime<Utc>>,
	pub order: SortOrder,
}

impl VerifyOperationFilter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Filter on a single file.
	pub fn for_pnfsid(pnfsid: PnfsId) -> Self {
		Self::new().pnfsids([pnfsid])
	}

	pub fn pnfsids(mut self, ids: impl IntoIterator<Item = PnfsId>) -> Self {
		self.pnfsids = Some(ids.into_iter().collect());
		self
	}

	pub fn actions(mut self, actions: impl IntoIterator<Item = QoSAction>) -> Self {
		self.actions = Some(actions.into_iter().collect());
		self
	}

	pub fn message_types(mut self, types: impl IntoIterator<Item = QoSMessageType>) -> Self {
		self.message_types = Some(types.into_iter().collect());
		self
	}

	pub fn states(mut self, states: impl IntoIterator<Item = VerifyOperationState>) -> Self {
		self.states = Some(states.into_iter().collect());
		self
	}

	pub fn storage_unit(mut self, filter: FieldFilter) -> Self {
		self.storage_unit = filter;
		self
	}

	pub fn pool_group(mut self, filter: FieldFilter) -> Self {
		self.pool_group = filter;
		self
	}

	pub fn parent(mut self, filter: FieldFilter) -> Self {
		self.parent = filter;
		self
	}

	pub fn source(mut self, filter: FieldFilter) -> Self {
		self.source = filter;
		self
	}

	pub fn target(mut self, filter: FieldFilter) -> Self {
		self.target = filter;
		self
	}

	pub fn retried_at_least(mut self, retried: u32) -> Self {
		self.retried_at_least = Some(retried);
		self
	}

	pub fn last_update_before(mut self, before: DateTime<Utc>) -> Self {
		self.last_update_before = Some(before);
		self
	}

	pub fn last_update_after(mut self, after: DateTime<Utc>) -> Self {
		self.last_update_after = Some(after);
		self
	}

	pub fn order(mut self, order: SortOrder) -> Self {
		self.order = order;
		self
	}

	/// True when no predicate is set, i.e. the filter matches every operation.
	pub fn is_empty(&self) -> bool {
		self.pnfsids.is_none()
			&& self.actions.is_none()
			&& self.message_types.is_none()
			&& self.states.is_none()
			&& self.storage_unit.is_any()
			&& self.pool_group.is_any()
			&& self.parent.is_any()
			&& self.source.is_any()
			&& self.target.is_any()
			&& self.retried_at_least.is_none()
			&& self.last_update_before.is_none()
			&& self.last_update_after.is_none()
	}

	/// Whether the filter names only specific files, allowing direct lookup.
	pub fn single_keys(&self) -> Option<&BTreeSet<PnfsId>> {
		self.pnfsids.as_ref()
	}

	pub fn matches(&self, op: &VerifyOperation) -> bool {
		if let Some(ids) = &self.pnfsids {
			if !ids.contains(&op.pnfsid) {
				return false;
			}
		}
		if let Some(actions) = &self.actions {
			match op.action {
				Some(action) if actions.contains(&action) => {}
				_ => return false,
			}
		}
		if let Some(types) = &self.message_types {
			if !types.contains(&op.message_type) {
				return false;
			}
		}
		if let Some(states) = &self.states {
			if !states.contains(&op.state) {
				return false;
			}
		}
		if let Some(retried) = self.retried_at_least {
			if op.retried < retried {
				return false;
			}
		}
		if let Some(before) = self.last_update_before {
			if op.last_update >= before {
				return false;
			}
		}
		if let Some(after) = self.last_update_after {
			if op.last_update <= after {
				return false;
			}
		}

		self.storage_unit.matches(op.storage_unit.as_deref())
			&& self.pool_group.matches(op.pool_group.as_deref())
			&& self.parent.matches(op.parent.as_deref())
			&& self.source.matches(op.source.as_deref())
			&& self.target.matches(op.target.as_deref())
	}
}

/// Predicate over the pool info map for `pool info`.
#[derive(Debug, Clone, Default)]
pub struct PoolInfoFilter {
	pub pools: Option<Regex>,
	pub statuses: Option<BTreeSet<PoolStatus>>,
	pub last_update_before: Option<DateTime<Utc>>,
	pub last_update_after: Option<DateTime<Utc>>,
}

impl PoolInfoFilter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Pool names must match the whole expression.
	pub fn pools(mut self, pattern: &str) -> Result<Self, ParseError> {
		let anchored = format!("^(?:{pattern})$");
		let regex = Regex::new(&anchored).map_err(|e| ParseError::InvalidPattern(e.to_string()))?;
		self.pools = Some(regex);
		Ok(self)
	}

	pub fn statuses(mut self, statuses: impl IntoIterator<Item = PoolStatus>) -> Self {
		self.statuses = Some(statuses.into_iter().collect());
		self
	}

	pub fn last_update_before(mut self, before: DateTime<Utc>) -> Self {
		self.last_update_before = Some(before);
		self
	}

	pub fn last_update_after(mut self, after: DateTime<Utc>) -> Self {
		self.last_update_after = Some(after);
		self
	}

	pub fn matches(&self, info: &PoolInfo) -> bool {
		if let Some(regex) = &self.pools {
			if !regex.is_match(&info.name) {
				return false;
			}
		}
		if let Some(statuses) = &self.statuses {
			if !statuses.contains(&info.status) {
				return false;
			}
		}
		if let Some(before) = self.last_update_before {
			if info.last_update >= before {
				return false;
			}
		}
		if let Some(after) = self.last_update_after {
			if info.last_update <= after {
				return false;
			}
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use chrono::Duration;

	use super::*;
	use crate::update::FileQoSUpdate;

	fn op(pool: Option<&str>, message_type: QoSMessageType) -> VerifyOperation {
		let pnfsid = PnfsId::new("000000000000000000000001").unwrap();
		let update = FileQoSUpdate::new(pnfsid, pool.map(String::from), message_type);
		VerifyOperation::from_update(&update, Utc::now())
	}

	#[test]
	fn field_filter_three_way() {
		assert!(FieldFilter::Any.matches(None));
		assert!(FieldFilter::Any.matches(Some("p1")));
		assert!(FieldFilter::Unset.matches(None));
		assert!(!FieldFilter::Unset.matches(Some("p1")));
		assert!(FieldFilter::Exactly("p1".into()).matches(Some("p1")));
		assert!(!FieldFilter::Exactly("p1".into()).matches(Some("p2")));
		assert!(!FieldFilter::Exactly("p1".into()).matches(None));
	}

	#[test]
	fn field_filter_from_empty_value_is_unset() {
		assert_eq!(FieldFilter::from_value(""), FieldFilter::Unset);
		assert_eq!(FieldFilter::from_value("pool1"), FieldFilter::Exactly("pool1".into()));
	}

	#[test]
	fn parent_unset_matches_only_non_scan_operations() {
		let scan = op(Some("p1"), QoSMessageType::PoolStatusDown);
		let added = op(Some("p1"), QoSMessageType::AddCacheLocation);
		let filter = VerifyOperationFilter::new().parent(FieldFilter::Unset);

		assert!(!filter.matches(&scan));
		assert!(filter.matches(&added));
	}

	#[test]
	fn action_filter_excludes_uncomputed_action() {
		let mut operation = op(None, QoSMessageType::ValidateOnly);
		let filter = VerifyOperationFilter::new().actions([QoSAction::CopyReplica]);
		assert!(!filter.matches(&operation));

		operation.action = Some(QoSAction::CopyReplica);
		assert!(filter.matches(&operation));
	}

	#[test]
	fn states_and_time_window() {
		let operation = op(None, QoSMessageType::ValidateOnly);
		let hour = Duration::hours(1);

		let filter = VerifyOperationFilter::new()
			.states([VerifyOperationState::Ready])
			.last_update_after(operation.last_update - hour)
			.last_update_before(operation.last_update + hour);
		assert!(filter.matches(&operation));

		let filter = VerifyOperationFilter::new().last_update_before(operation.last_update - hour);
		assert!(!filter.matches(&operation));

		let filter = VerifyOperationFilter::new().states([VerifyOperationState::Running]);
		assert!(!filter.matches(&operation));
	}

	#[test]
	fn empty_filter_detection() {
		assert!(VerifyOperationFilter::new().is_empty());
		assert!(VerifyOperationFilter::new().order(SortOrder::Desc).is_empty());
		assert!(!VerifyOperationFilter::new().parent(FieldFilter::Unset).is_empty());
	}

	#[test]
	fn pool_filter_anchors_regex() {
		let now = Utc::now();
		let filter = PoolInfoFilter::new().pools("pool[0-9]").unwrap();
		assert!(filter.matches(&PoolInfo::new("pool1", PoolStatus::Enabled, now)));
		assert!(!filter.matches(&PoolInfo::new("xpool1", PoolStatus::Enabled, now)));

		let filter = PoolInfoFilter::new().statuses([PoolStatus::Down]);
		assert!(!filter.matches(&PoolInfo::new("pool1", PoolStatus::Enabled, now)));
	}

	#[test]
	fn parses_admin_timestamps() {
		let ts = parse_timestamp("2024/03/01-12:30:00").unwrap();
		assert_eq!(ts.format(TIMESTAMP_FORMAT).to_string(), "2024/03/01-12:30:00");
		assert!(parse_timestamp("yesterday").is_err());
	}
}
