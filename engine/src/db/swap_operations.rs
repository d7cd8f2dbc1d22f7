//! CEX swap legs of swap-and-bridge rebalance operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

use mark_primitives::U256;

use super::{numeric_to_u256, Database, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
	PendingDeposit,
	DepositConfirmed,
	Processing,
	Completed,
	Failed,
	Recovering,
}

impl SwapStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::PendingDeposit => "pending_deposit",
			Self::DepositConfirmed => "deposit_confirmed",
			Self::Processing => "processing",
			Self::Completed => "completed",
			Self::Failed => "failed",
			Self::Recovering => "recovering",
		}
	}

	pub fn from_str_exact(s: &str) -> Result<Self, StoreError> {
		match s {
			"pending_deposit" => Ok(Self::PendingDeposit),
			"deposit_confirmed" => Ok(Self::DepositConfirmed),
			"processing" => Ok(Self::Processing),
			"completed" => Ok(Self::Completed),
			"failed" => Ok(Self::Failed),
			"recovering" => Ok(Self::Recovering),
			other => Err(StoreError::Corrupt(format!("unknown swap status {other:?}"))),
		}
	}
}

#[derive(Debug, Clone)]
pub struct SwapOperation {
	pub id: Uuid,
	pub rebalance_operation_id: Uuid,
	pub platform: String,
	pub from_asset: String,
	pub to_asset: String,
	/// Native decimals of the respective assets.
	pub from_amount: U256,
	pub to_amount: U256,
	/// Units of `to` per unit of `from`, scaled by 1e18.
	pub expected_rate: U256,
	pub actual_rate: Option<U256>,
	pub status: SwapStatus,
	pub order_id: Option<String>,
	pub quote_id: Option<String>,
	pub metadata: serde_json::Value,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSwapOperation {
	pub rebalance_operation_id: Uuid,
	pub platform: String,
	pub from_asset: String,
	pub to_asset: String,
	pub from_amount: U256,
	pub to_amount: U256,
	pub expected_rate: U256,
	pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct SwapOperationUpdate {
	pub status: Option<SwapStatus>,
	pub order_id: Option<String>,
	pub quote_id: Option<String>,
	pub actual_rate: Option<U256>,
	pub to_amount: Option<U256>,
	/// Merged into the existing metadata object.
	pub metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait SwapOperationStore: Send + Sync {
	async fn create_swap_operation(
		&self,
		new: NewSwapOperation,
	) -> Result<SwapOperation, StoreError>;

	async fn get_swap_operation_for_rebalance(
		&self,
		rebalance_operation_id: Uuid,
	) -> Result<Option<SwapOperation>, StoreError>;

	async fn get_swap_operations_by_status(
		&self,
		statuses: &[SwapStatus],
	) -> Result<Vec<SwapOperation>, StoreError>;

	async fn update_swap_operation(
		&self,
		id: Uuid,
		update: SwapOperationUpdate,
	) -> Result<SwapOperation, StoreError>;
}

fn swap_from_row(row: &PgRow) -> Result<SwapOperation, StoreError> {
	let from_amount: String = row.try_get("from_amount")?;
	let to_amount: String = row.try_get("to_amount")?;
	let expected_rate: String = row.try_get("expected_rate")?;
	let actual_rate: Option<String> = row.try_get("actual_rate")?;
	let status: String = row.try_get("status")?;

	Ok(SwapOperation {
		id: row.try_get("id")?,
		rebalance_operation_id: row.try_get("rebalance_operation_id")?,
		platform: row.try_get("platform")?,
		from_asset: row.try_get("from_asset")?,
		to_asset: row.try_get("to_asset")?,
		from_amount: numeric_to_u256("from_amount", &from_amount)?,
		to_amount: numeric_to_u256("to_amount", &to_amount)?,
		expected_rate: numeric_to_u256("expected_rate", &expected_rate)?,
		actual_rate: actual_rate
			.as_deref()
			.map(|rate| numeric_to_u256("actual_rate", rate))
			.transpose()?,
		status: SwapStatus::from_str_exact(&status)?,
		order_id: row.try_get("order_id")?,
		quote_id: row.try_get("quote_id")?,
		metadata: row.try_get("metadata")?,
		created_at: row.try_get("created_at")?,
		updated_at: row.try_get("updated_at")?,
	})
}

const SWAP_COLUMNS: &str = "id, rebalance_operation_id, platform, from_asset, to_asset, \
	 from_amount::text AS from_amount, to_amount::text AS to_amount, \
	 expected_rate::text AS expected_rate, actual_rate::text AS actual_rate, \
	 status, order_id, quote_id, metadata, created_at, updated_at";

#[async_trait]
impl SwapOperationStore for Database {
	async fn create_swap_operation(
		&self,
		new: NewSwapOperation,
	) -> Result<SwapOperation, StoreError> {
		let row = sqlx::query(&format!(
			"INSERT INTO swap_operations \
			 (id, rebalance_operation_id, platform, from_asset, to_asset, from_amount, \
			  to_amount, expected_rate, status, metadata) \
			 VALUES ($1, $2, $3, $4, $5, $6::numeric, $7::numeric, $8::numeric, $9, $10) \
			 RETURNING {SWAP_COLUMNS}"
		))
		.bind(Uuid::new_v4())
		.bind(new.rebalance_operation_id)
		.bind(&new.platform)
		.bind(&new.from_asset)
		.bind(&new.to_asset)
		.bind(new.from_amount.to_string())
		.bind(new.to_amount.to_string())
		.bind(new.expected_rate.to_string())
		.bind(SwapStatus::PendingDeposit.as_str())
		.bind(&new.metadata)
		.fetch_one(self.pool())
		.await?;

		swap_from_row(&row)
	}

	async fn get_swap_operation_for_rebalance(
		&self,
		rebalance_operation_id: Uuid,
	) -> Result<Option<SwapOperation>, StoreError> {
		let row = sqlx::query(&format!(
			"SELECT {SWAP_COLUMNS} FROM swap_operations WHERE rebalance_operation_id = $1"
		))
		.bind(rebalance_operation_id)
		.fetch_optional(self.pool())
		.await?;

		row.as_ref().map(swap_from_row).transpose()
	}

	async fn get_swap_operations_by_status(
		&self,
		statuses: &[SwapStatus],
	) -> Result<Vec<SwapOperation>, StoreError> {
		let statuses: Vec<&str> = statuses.iter().map(SwapStatus::as_str).collect();
		let rows = sqlx::query(&format!(
			"SELECT {SWAP_COLUMNS} FROM swap_operations WHERE status = ANY($1) \
			 ORDER BY created_at"
		))
		.bind(statuses)
		.fetch_all(self.pool())
		.await?;

		rows.iter().map(swap_from_row).collect()
	}

	async fn update_swap_operation(
		&self,
		id: Uuid,
		update: SwapOperationUpdate,
	) -> Result<SwapOperation, StoreError> {
		let row = sqlx::query(&format!(
			"UPDATE swap_operations SET \
			 status = COALESCE($2, status), \
			 order_id = COALESCE($3, order_id), \
			 quote_id = COALESCE($4, quote_id), \
			 actual_rate = COALESCE($5::numeric, actual_rate), \
			 to_amount = COALESCE($6::numeric, to_amount), \
			 metadata = metadata || $7::jsonb, \
			 updated_at = now() \
			 WHERE id = $1 RETURNING {SWAP_COLUMNS}"
		))
		.bind(id)
		.bind(update.status.map(|s| s.as_str()))
		.bind(update.order_id)
		.bind(update.quote_id)
		.bind(update.actual_rate.map(|r| r.to_string()))
		.bind(update.to_amount.map(|a| a.to_string()))
		.bind(update.metadata.unwrap_or_else(|| serde_json::json!({})))
		.fetch_optional(self.pool())
		.await?
		.ok_or(StoreError::NotFound)?;

		swap_from_row(&row)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_strings_match_the_schema() {
		for status in [
			SwapStatus::PendingDeposit,
			SwapStatus::DepositConfirmed,
			SwapStatus::Processing,
			SwapStatus::Completed,
			SwapStatus::Failed,
			SwapStatus::Recovering,
		] {
			assert_eq!(SwapStatus::from_str_exact(status.as_str()).unwrap(), status);
		}
	}
}
