//! Every in-flight origin -> destination transfer, with receipts and
//! status. A row exists only once its origin transaction is confirmed, and
//! never leaves COMPLETED, FAILED or EXPIRED.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ethers::types::TransactionReceipt;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, QueryBuilder, Row};
use uuid::Uuid;

use mark_primitives::{Address, ChainId, Dbps, TickerHash, H256, U256};

use super::{earmarks::EarmarkStatus, numeric_to_u256, Database, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceOperationStatus {
	Pending,
	AwaitingCallback,
	Completed,
	Failed,
	Expired,
}

impl RebalanceOperationStatus {
	/// Statuses the callback loop still has work to do on.
	pub const IN_FLIGHT: &'static [RebalanceOperationStatus] =
		&[Self::Pending, Self::AwaitingCallback];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Pending => "PENDING",
			Self::AwaitingCallback => "AWAITING_CALLBACK",
			Self::Completed => "COMPLETED",
			Self::Failed => "FAILED",
			Self::Expired => "EXPIRED",
		}
	}

	pub fn from_str_exact(s: &str) -> Result<Self, StoreError> {
		match s {
			"PENDING" => Ok(Self::Pending),
			"AWAITING_CALLBACK" => Ok(Self::AwaitingCallback),
			"COMPLETED" => Ok(Self::Completed),
			"FAILED" => Ok(Self::Failed),
			"EXPIRED" => Ok(Self::Expired),
			other =>
				Err(StoreError::Corrupt(format!("unknown operation status {other:?}"))),
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Expired)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
	Bridge,
	SwapAndBridge,
}

impl OperationType {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Bridge => "bridge",
			Self::SwapAndBridge => "swap_and_bridge",
		}
	}

	pub fn from_str_exact(s: &str) -> Result<Self, StoreError> {
		match s {
			"bridge" => Ok(Self::Bridge),
			"swap_and_bridge" => Ok(Self::SwapAndBridge),
			other => Err(StoreError::Corrupt(format!("unknown operation type {other:?}"))),
		}
	}
}

#[derive(Debug, Clone)]
pub struct RebalanceOperation {
	pub id: Uuid,
	/// `None` for rebalances that were not driven by an invoice.
	pub earmark_id: Option<Uuid>,
	pub origin_chain_id: ChainId,
	pub destination_chain_id: ChainId,
	pub ticker_hash: TickerHash,
	/// Effective post-cap/rounding value actually bridged, in the origin
	/// asset's native decimals.
	pub amount: U256,
	pub slippage: Dbps,
	pub status: RebalanceOperationStatus,
	pub bridge: String,
	pub recipient: Address,
	pub transactions: HashMap<ChainId, TransactionReceipt>,
	pub operation_type: OperationType,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl RebalanceOperation {
	pub fn origin_receipt(&self) -> Option<&TransactionReceipt> {
		self.transactions.get(&self.origin_chain_id)
	}
}

#[derive(Debug, Clone)]
pub struct NewRebalanceOperation {
	pub earmark_id: Option<Uuid>,
	pub origin_chain_id: ChainId,
	pub destination_chain_id: ChainId,
	pub ticker_hash: TickerHash,
	pub amount: U256,
	pub slippage: Dbps,
	pub bridge: String,
	pub recipient: Address,
	pub transactions: HashMap<ChainId, TransactionReceipt>,
	pub operation_type: OperationType,
}

#[derive(Debug, Clone, Default)]
pub struct RebalanceOperationUpdate {
	pub status: Option<RebalanceOperationStatus>,
	/// Merged into the existing receipts map, keyed by chain.
	pub transactions: Option<HashMap<ChainId, TransactionReceipt>>,
}

#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
	pub earmark_id: Option<Uuid>,
	pub destination_chain_id: Option<ChainId>,
	pub ticker_hash: Option<TickerHash>,
}

#[async_trait]
pub trait RebalanceOperationStore: Send + Sync {
	/// Records a single operation (non-invoice-driven rebalances).
	async fn create_rebalance_operation(
		&self,
		new: NewRebalanceOperation,
	) -> Result<RebalanceOperation, StoreError>;

	/// Records the operations executed for an earmark and moves the earmark
	/// to its post-execution status in the same transaction, so the commit
	/// point is atomic.
	async fn create_operations_for_earmark(
		&self,
		earmark_id: Uuid,
		earmark_status: EarmarkStatus,
		operations: Vec<NewRebalanceOperation>,
	) -> Result<Vec<RebalanceOperation>, StoreError>;

	async fn get_rebalance_operations(
		&self,
		statuses: &[RebalanceOperationStatus],
		filter: OperationFilter,
	) -> Result<(Vec<RebalanceOperation>, u64), StoreError>;

	async fn get_rebalance_operations_by_earmark(
		&self,
		earmark_id: Uuid,
	) -> Result<Vec<RebalanceOperation>, StoreError>;

	async fn update_rebalance_operation(
		&self,
		id: Uuid,
		update: RebalanceOperationUpdate,
	) -> Result<RebalanceOperation, StoreError>;

	/// Marks operations still in flight after `older_than` as EXPIRED.
	/// Returns the number of rows updated.
	async fn expire_stale_operations(
		&self,
		older_than: std::time::Duration,
	) -> Result<u64, StoreError>;
}

fn receipts_to_json(
	receipts: &HashMap<ChainId, TransactionReceipt>,
) -> Result<serde_json::Value, StoreError> {
	serde_json::to_value(receipts)
		.map_err(|e| StoreError::Corrupt(format!("unserializable receipts: {e}")))
}

fn operation_from_row(row: &PgRow) -> Result<RebalanceOperation, StoreError> {
	let ticker_bytes: Vec<u8> = row.try_get("ticker_hash")?;
	if ticker_bytes.len() != 32 {
		return Err(StoreError::Corrupt(format!(
			"ticker_hash has {} bytes, expected 32",
			ticker_bytes.len()
		)))
	}
	let amount: String = row.try_get("amount")?;
	let status: String = row.try_get("status")?;
	let operation_type: String = row.try_get("operation_type")?;
	let recipient: String = row.try_get("recipient")?;
	let transactions: serde_json::Value = row.try_get("transactions")?;

	Ok(RebalanceOperation {
		id: row.try_get("id")?,
		earmark_id: row.try_get("earmark_id")?,
		origin_chain_id: ChainId(row.try_get::<i64, _>("origin_chain_id")? as u64),
		destination_chain_id: ChainId(row.try_get::<i64, _>("destination_chain_id")? as u64),
		ticker_hash: H256::from_slice(&ticker_bytes),
		amount: numeric_to_u256("amount", &amount)?,
		slippage: row.try_get::<i32, _>("slippage")? as Dbps,
		status: RebalanceOperationStatus::from_str_exact(&status)?,
		bridge: row.try_get("bridge")?,
		recipient: recipient
			.parse()
			.map_err(|_| StoreError::Corrupt(format!("bad recipient {recipient:?}")))?,
		transactions: serde_json::from_value(transactions)
			.map_err(|e| StoreError::Corrupt(format!("bad receipts map: {e}")))?,
		operation_type: OperationType::from_str_exact(&operation_type)?,
		created_at: row.try_get("created_at")?,
		updated_at: row.try_get("updated_at")?,
	})
}

const OPERATION_COLUMNS: &str = "id, earmark_id, origin_chain_id, destination_chain_id, \
	 ticker_hash, amount::text AS amount, slippage, status, bridge, recipient, transactions, \
	 operation_type, created_at, updated_at";

fn insert_operation_query(
	new: &NewRebalanceOperation,
) -> Result<QueryBuilder<'static, sqlx::Postgres>, StoreError> {
	let mut query = QueryBuilder::new(
		"INSERT INTO rebalance_operations \
		 (id, earmark_id, origin_chain_id, destination_chain_id, ticker_hash, amount, \
		  slippage, status, bridge, recipient, transactions, operation_type) VALUES (",
	);
	let mut values = query.separated(", ");
	values.push_bind(Uuid::new_v4());
	values.push_bind(new.earmark_id);
	values.push_bind(new.origin_chain_id.0 as i64);
	values.push_bind(new.destination_chain_id.0 as i64);
	values.push_bind(new.ticker_hash.as_bytes().to_vec());
	values.push_bind(new.amount.to_string());
	values.push_unseparated("::numeric");
	values.push_bind(new.slippage as i32);
	values.push_bind(RebalanceOperationStatus::Pending.as_str());
	values.push_bind(new.bridge.clone());
	values.push_bind(format!("{:?}", new.recipient));
	values.push_bind(receipts_to_json(&new.transactions)?);
	values.push_bind(new.operation_type.as_str());
	query.push(format!(") RETURNING {OPERATION_COLUMNS}"));
	Ok(query)
}

#[async_trait]
impl RebalanceOperationStore for Database {
	async fn create_rebalance_operation(
		&self,
		new: NewRebalanceOperation,
	) -> Result<RebalanceOperation, StoreError> {
		let row = insert_operation_query(&new)?.build().fetch_one(self.pool()).await?;
		operation_from_row(&row)
	}

	async fn create_operations_for_earmark(
		&self,
		earmark_id: Uuid,
		earmark_status: EarmarkStatus,
		operations: Vec<NewRebalanceOperation>,
	) -> Result<Vec<RebalanceOperation>, StoreError> {
		let mut tx = self.pool().begin().await?;

		let mut created = Vec::with_capacity(operations.len());
		for new in &operations {
			let row = insert_operation_query(new)?.build().fetch_one(&mut *tx).await?;
			created.push(operation_from_row(&row)?);
		}

		let result =
			sqlx::query("UPDATE earmarks SET status = $2, updated_at = now() WHERE id = $1")
				.bind(earmark_id)
				.bind(earmark_status.as_str())
				.execute(&mut *tx)
				.await?;
		if result.rows_affected() == 0 {
			return Err(StoreError::NotFound)
		}

		tx.commit().await?;
		Ok(created)
	}

	async fn get_rebalance_operations(
		&self,
		statuses: &[RebalanceOperationStatus],
		filter: OperationFilter,
	) -> Result<(Vec<RebalanceOperation>, u64), StoreError> {
		let statuses: Vec<&str> =
			statuses.iter().map(RebalanceOperationStatus::as_str).collect();

		let mut query = QueryBuilder::new(format!(
			"SELECT {OPERATION_COLUMNS} FROM rebalance_operations WHERE status = ANY("
		));
		query.push_bind(statuses).push(")");
		if let Some(earmark_id) = filter.earmark_id {
			query.push(" AND earmark_id = ").push_bind(earmark_id);
		}
		if let Some(chain) = filter.destination_chain_id {
			query.push(" AND destination_chain_id = ").push_bind(chain.0 as i64);
		}
		if let Some(ticker) = filter.ticker_hash {
			query.push(" AND ticker_hash = ").push_bind(ticker.as_bytes().to_vec());
		}
		query.push(" ORDER BY created_at");

		let rows = query.build().fetch_all(self.pool()).await?;
		let operations: Vec<RebalanceOperation> =
			rows.iter().map(operation_from_row).collect::<Result<_, _>>()?;
		let total = operations.len() as u64;
		Ok((operations, total))
	}

	async fn get_rebalance_operations_by_earmark(
		&self,
		earmark_id: Uuid,
	) -> Result<Vec<RebalanceOperation>, StoreError> {
		let rows = sqlx::query(&format!(
			"SELECT {OPERATION_COLUMNS} FROM rebalance_operations \
			 WHERE earmark_id = $1 ORDER BY created_at"
		))
		.bind(earmark_id)
		.fetch_all(self.pool())
		.await?;
		rows.iter().map(operation_from_row).collect()
	}

	async fn update_rebalance_operation(
		&self,
		id: Uuid,
		update: RebalanceOperationUpdate,
	) -> Result<RebalanceOperation, StoreError> {
		let merged = match &update.transactions {
			Some(receipts) => receipts_to_json(receipts)?,
			None => serde_json::json!({}),
		};

		// Terminal rows are a one-way latch.
		let row = sqlx::query(&format!(
			"UPDATE rebalance_operations SET \
			 status = COALESCE($2, status), \
			 transactions = transactions || $3::jsonb, \
			 updated_at = now() \
			 WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED', 'EXPIRED') \
			 RETURNING {OPERATION_COLUMNS}"
		))
		.bind(id)
		.bind(update.status.map(|s| s.as_str()))
		.bind(merged)
		.fetch_optional(self.pool())
		.await?
		.ok_or(StoreError::NotFound)?;

		operation_from_row(&row)
	}

	async fn expire_stale_operations(
		&self,
		older_than: std::time::Duration,
	) -> Result<u64, StoreError> {
		let cutoff = Utc::now() -
			ChronoDuration::from_std(older_than)
				.map_err(|e| StoreError::Corrupt(format!("bad expiry duration: {e}")))?;

		let result = sqlx::query(
			"UPDATE rebalance_operations SET status = 'EXPIRED', updated_at = now() \
			 WHERE status IN ('PENDING', 'AWAITING_CALLBACK') AND created_at < $1",
		)
		.bind(cutoff)
		.execute(self.pool())
		.await?;

		Ok(result.rows_affected())
	}
}
