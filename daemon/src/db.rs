use std::{
	collections::{BTreeMap, BTreeSet},
	path::Path,
};

use chrono::{DateTime, TimeZone, Utc};
use qos_core::{PnfsId, PoolInfo, PoolStatus, QoSAction, QoSMessageType, VerifyOperation, VerifyOperationState};
use serde::{Deserialize, Serialize};
use surrealdb::{
	engine::local::{Db, Mem, SurrealKv},
	Surreal,
};

use crate::error::StoreError;

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
	pub db: Surreal<Db>,
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
	StoreError::DbError(e.to_string())
}

/// Opens (or creates) durable storage at `path` and applies the schema.
pub async fn open(path: &Path) -> Result<DbHandle, StoreError> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).map_err(db_err)?;
	}
	let db = Surreal::new::<SurrealKv>(path.to_path_buf()).await.map_err(db_err)?;
	prepare(db).await
}

/// In-memory database, for tests and throwaway runs.
pub async fn open_in_memory() -> Result<DbHandle, StoreError> {
	let db = Surreal::new::<Mem>(()).await.map_err(db_err)?;
	prepare(db).await
}

async fn prepare(db: Surreal<Db>) -> Result<DbHandle, StoreError> {
	db.use_ns("qos").use_db("verifier").await.map_err(db_err)?;
	// DEFINE ... OVERWRITE statements are idempotent.
	db.query(SCHEMA_V1).await.map_err(db_err)?.check().map_err(db_err)?;
	Ok(DbHandle { db })
}

/// Row shape of `verify_operation`. Times are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OperationRecord {
	pnfsid: String,
	arrived: i64,
	last_update: i64,
	message_type: QoSMessageType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	action: Option<QoSAction>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	previous_action: Option<QoSAction>,
	state: VerifyOperationState,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	source: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	target: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	parent: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	storage_unit: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pool_group: Option<String>,
	retried: i64,
	needed: i64,
	#[serde(default)]
	tried: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	error: Option<String>,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
	Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl From<&VerifyOperation> for OperationRecord {
	fn from(op: &VerifyOperation) -> Self {
		OperationRecord {
			pnfsid: op.pnfsid.to_string(),
			arrived: op.arrived.timestamp_millis(),
			last_update: op.last_update.timestamp_millis(),
			message_type: op.message_type,
			action: op.action,
			previous_action: op.previous_action,
			state: op.state,
			source: op.source.clone(),
			target: op.target.clone(),
			parent: op.parent.clone(),
			storage_unit: op.storage_unit.clone(),
			pool_group: op.pool_group.clone(),
			retried: i64::from(op.retried),
			needed: i64::from(op.needed),
			tried: op.tried.iter().cloned().collect(),
			error: op.error.clone(),
		}
	}
}

impl TryFrom<OperationRecord> for VerifyOperation {
	type Error = StoreError;

	fn try_from(row: OperationRecord) -> Result<Self, Self::Error> {
		Ok(VerifyOperation {
			pnfsid: PnfsId::new(&row.pnfsid).map_err(db_err)?,
			arrived: from_millis(row.arrived),
			last_update: from_millis(row.last_update),
			message_type: row.message_type,
			action: row.action,
			previous_action: row.previous_action,
			state: row.state,
			source: row.source,
			target: row.target,
			parent: row.parent,
			storage_unit: row.storage_unit,
			pool_group: row.pool_group,
			retried: u32::try_from(row.retried).unwrap_or(0),
			needed: u32::try_from(row.needed).unwrap_or(0),
			tried: row.tried.into_iter().collect(),
			error: row.error,
			run_id: 0,
		})
	}
}

/// Inserts or replaces the row for each operation.
pub async fn save_operations(db: &DbHandle, ops: &[VerifyOperation]) -> Result<(), StoreError> {
	for op in ops {
		let record = serde_json::to_value(OperationRecord::from(op)).map_err(db_err)?;
		db.db
			.query(
				"DELETE verify_operation WHERE pnfsid = $pnfsid;
				 CREATE verify_operation CONTENT $record;",
			)
			.bind(("pnfsid", op.pnfsid.to_string()))
			.bind(("record", record))
			.await
			.map_err(db_err)?
			.check()
			.map_err(db_err)?;
	}
	Ok(())
}

pub async fn delete_operations(db: &DbHandle, pnfsids: &[PnfsId]) -> Result<(), StoreError> {
	if pnfsids.is_empty() {
		return Ok(());
	}
	let ids: Vec<String> = pnfsids.iter().map(|id| id.to_string()).collect();
	db.db
		.query("DELETE verify_operation WHERE pnfsid INSIDE $ids")
		.bind(("ids", ids))
		.await
		.map_err(db_err)?
		.check()
		.map_err(db_err)?;
	Ok(())
}

/// All persisted operations, oldest update first.
pub async fn load_operations(db: &DbHandle) -> Result<Vec<VerifyOperation>, StoreError> {
	let mut response = db
		.db
		.query(
			"SELECT pnfsid, arrived, last_update, message_type, action, previous_action, state,
			        source, target, parent, storage_unit, pool_group, retried, needed, tried, error
			 FROM verify_operation ORDER BY last_update ASC",
		)
		.await
		.map_err(db_err)?;

	let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
	rows.into_iter()
		.map(|row| {
			let record: OperationRecord = serde_json::from_value(row).map_err(db_err)?;
			VerifyOperation::try_from(record)
		})
		.collect()
}

/// Row shape of `pool_info`. Tags are stored as `key=value` strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolRecord {
	name: String,
	status: PoolStatus,
	#[serde(default)]
	tags: Vec<String>,
	#[serde(default)]
	groups: Vec<String>,
	#[serde(default)]
	hsms: Vec<String>,
	last_update: i64,
}

impl From<&PoolInfo> for PoolRecord {
	fn from(info: &PoolInfo) -> Self {
		PoolRecord {
			name: info.name.clone(),
			status: info.status,
			tags: info.tags.iter().map(|(k, v)| format!("{k}={v}")).collect(),
			groups: info.groups.iter().cloned().collect(),
			hsms: info.hsms.iter().cloned().collect(),
			last_update: info.last_update.timestamp_millis(),
		}
	}
}

impl From<PoolRecord> for PoolInfo {
	fn from(row: PoolRecord) -> Self {
		let tags: BTreeMap<String, String> = row
			.tags
			.iter()
			.filter_map(|tag| tag.split_once('='))
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		PoolInfo {
			name: row.name,
			status: row.status,
			tags,
			groups: row.groups.into_iter().collect::<BTreeSet<_>>(),
			hsms: row.hsms.into_iter().collect::<BTreeSet<_>>(),
			last_update: from_millis(row.last_update),
		}
	}
}

pub async fn save_pool(db: &DbHandle, info: &PoolInfo) -> Result<(), StoreError> {
	let record = serde_json::to_value(PoolRecord::from(info)).map_err(db_err)?;
	db.db
		.query(
			"DELETE pool_info WHERE name = $name;
			 CREATE pool_info CONTENT $record;",
		)
		.bind(("name", info.name.clone()))
		.bind(("record", record))
		.await
		.map_err(db_err)?
		.check()
		.map_err(db_err)?;
	Ok(())
}

pub async fn load_pools(db: &DbHandle) -> Result<Vec<PoolInfo>, StoreError> {
	let mut response = db
		.db
		.query("SELECT name, status, tags, groups, hsms, last_update FROM pool_info ORDER BY name ASC")
		.await
		.map_err(db_err)?;

	let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
	rows.into_iter()
		.map(|row| {
			let record: PoolRecord = serde_json::from_value(row).map_err(db_err)?;
			Ok(PoolInfo::from(record))
		})
		.collect()
}

const SCHEMA_V1: &str = "
	DEFINE TABLE OVERWRITE verify_operation SCHEMAFULL;
	DEFINE FIELD OVERWRITE pnfsid ON verify_operation TYPE string;
	DEFINE FIELD OVERWRITE arrived ON verify_operation TYPE int;
	DEFINE FIELD OVERWRITE last_update ON verify_operation TYPE int;
	DEFINE FIELD OVERWRITE message_type ON verify_operation TYPE string;
	DEFINE FIELD OVERWRITE action ON verify_operation TYPE option<string>;
	DEFINE FIELD OVERWRITE previous_action ON verify_operation TYPE option<string>;
	DEFINE FIELD OVERWRITE state ON verify_operation TYPE string;
	DEFINE FIELD OVERWRITE source ON verify_operation TYPE option<string>;
	DEFINE FIELD OVERWRITE target ON verify_operation TYPE option<string>;
	DEFINE FIELD OVERWRITE parent ON verify_operation TYPE option<string>;
	DEFINE FIELD OVERWRITE storage_unit ON verify_operation TYPE option<string>;
	DEFINE FIELD OVERWRITE pool_group ON verify_operation TYPE option<string>;
	DEFINE FIELD OVERWRITE retried ON verify_operation TYPE int DEFAULT 0;
	DEFINE FIELD OVERWRITE needed ON verify_operation TYPE int DEFAULT 0;
	DEFINE FIELD OVERWRITE tried ON verify_operation TYPE array<string> DEFAULT [];
	DEFINE FIELD OVERWRITE error ON verify_operation TYPE option<string>;
	DEFINE INDEX OVERWRITE idx_op_pnfsid ON verify_operation FIELDS pnfsid UNIQUE;
	DEFINE INDEX OVERWRITE idx_op_last_update ON verify_operation FIELDS last_update;

	DEFINE TABLE OVERWRITE pool_info SCHEMAFULL;
	DEFINE FIELD OVERWRITE name ON pool_info TYPE string;
	DEFINE FIELD OVERWRITE status ON pool_info TYPE string;
	DEFINE FIELD OVERWRITE tags ON pool_info TYPE array<string> DEFAULT [];
	DEFINE FIELD OVERWRITE groups ON pool_info TYPE array<string> DEFAULT [];
	DEFINE FIELD OVERWRITE hsms ON pool_info TYPE array<string> DEFAULT [];
	DEFINE FIELD OVERWRITE last_update ON pool_info TYPE int;
	DEFINE INDEX OVERWRITE idx_pool_name ON pool_info FIELDS name UNIQUE;
";

#[cfg(test)]
mod tests {
	use qos_core::FileQoSUpdate;

	use super::*;

	fn op(id: &str) -> VerifyOperation {
		let update = FileQoSUpdate::new(PnfsId::new(id).unwrap(), Some("pool1".into()), QoSMessageType::ValidateOnly)
			.with_storage_unit("test:disk@osm");
		VerifyOperation::from_update(&update, Utc.timestamp_millis_opt(1_700_000_000_000).unwrap())
	}

	#[tokio::test]
	async fn operations_survive_save_and_load() {
		let db = open_in_memory().await.unwrap();
		let mut first = op("000000000000000000000001");
		first.tried.insert("pool9".into());
		first.action = Some(QoSAction::CopyReplica);
		first.state = VerifyOperationState::Failed;
		first.error = Some("RETRIABLE: busy".into());
		let second = op("000000000000000000000002");

		save_operations(&db, &[first.clone(), second.clone()]).await.unwrap();
		// Saving again replaces the row rather than duplicating it.
		save_operations(&db, &[first.clone()]).await.unwrap();

		let loaded = load_operations(&db).await.unwrap();
		assert_eq!(loaded.len(), 2);
		let reloaded = loaded.iter().find(|o| o.pnfsid == first.pnfsid).unwrap();
		assert_eq!(reloaded, &first);
	}

	#[tokio::test]
	async fn delete_removes_rows() {
		let db = open_in_memory().await.unwrap();
		let a = op("000000000000000000000001");
		let b = op("000000000000000000000002");
		save_operations(&db, &[a.clone(), b.clone()]).await.unwrap();

		delete_operations(&db, &[a.pnfsid.clone()]).await.unwrap();
		let loaded = load_operations(&db).await.unwrap();
		assert_eq!(loaded.len(), 1);
		assert_eq!(loaded[0].pnfsid, b.pnfsid);
	}

	#[tokio::test]
	async fn pools_survive_save_and_load() {
		let db = open_in_memory().await.unwrap();
		let mut info = PoolInfo::new("pool1", PoolStatus::ReadOnly, Utc.timestamp_millis_opt(1_700_000_000_000).unwrap());
		info.tags.insert("rack".into(), "r1".into());
		info.groups.insert("default".into());

		save_pool(&db, &info).await.unwrap();
		info.status = PoolStatus::Enabled;
		save_pool(&db, &info).await.unwrap();

		let pools = load_pools(&db).await.unwrap();
		assert_eq!(pools, vec![info]);
	}
}
