//! Persistent reservations of destination-chain funds for an invoice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, QueryBuilder, Row};
use uuid::Uuid;

use mark_primitives::{Amount, ChainId, TickerHash, H256};

use super::{numeric_to_u256, Database, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EarmarkStatus {
	Initiating,
	Pending,
	Ready,
	Completed,
	Cancelled,
	Failed,
}

impl EarmarkStatus {
	/// Statuses that hold the per-invoice reservation. The partial unique
	/// index covers exactly this set.
	pub const ACTIVE: &'static [EarmarkStatus] =
		&[Self::Initiating, Self::Pending, Self::Ready];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Initiating => "INITIATING",
			Self::Pending => "PENDING",
			Self::Ready => "READY",
			Self::Completed => "COMPLETED",
			Self::Cancelled => "CANCELLED",
			Self::Failed => "FAILED",
		}
	}

	pub fn from_str_exact(s: &str) -> Result<Self, StoreError> {
		match s {
			"INITIATING" => Ok(Self::Initiating),
			"PENDING" => Ok(Self::Pending),
			"READY" => Ok(Self::Ready),
			"COMPLETED" => Ok(Self::Completed),
			"CANCELLED" => Ok(Self::Cancelled),
			"FAILED" => Ok(Self::Failed),
			other => Err(StoreError::Corrupt(format!("unknown earmark status {other:?}"))),
		}
	}

	pub fn is_active(&self) -> bool {
		Self::ACTIVE.contains(self)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Earmark {
	pub id: Uuid,
	pub invoice_id: String,
	pub designated_purchase_chain: ChainId,
	pub ticker_hash: TickerHash,
	/// Canonical 18-decimal units. May increase or decrease over the
	/// earmark's life as the invoice reprices.
	pub min_amount: Amount,
	pub status: EarmarkStatus,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEarmark {
	pub invoice_id: String,
	pub designated_purchase_chain: ChainId,
	pub ticker_hash: TickerHash,
	pub min_amount: Amount,
}

#[derive(Debug, Clone, Default)]
pub struct EarmarkFilter {
	pub statuses: Option<Vec<EarmarkStatus>>,
	pub invoice_id: Option<String>,
	pub designated_purchase_chain: Option<ChainId>,
}

#[async_trait]
pub trait EarmarkStore: Send + Sync {
	/// Atomic insert. Fails with [`StoreError::ActiveEarmarkExists`] when
	/// another active earmark holds the invoice, so the caller can re-read.
	async fn create_earmark(
		&self,
		new: NewEarmark,
		status: EarmarkStatus,
	) -> Result<Earmark, StoreError>;

	async fn get_earmark(&self, id: Uuid) -> Result<Option<Earmark>, StoreError>;

	async fn get_active_earmark_for_invoice(
		&self,
		invoice_id: &str,
	) -> Result<Option<Earmark>, StoreError>;

	async fn get_earmarks(&self, filter: EarmarkFilter) -> Result<Vec<Earmark>, StoreError>;

	/// Status transitions are not constrained here; callers obey the FSM.
	async fn update_earmark_status(
		&self,
		id: Uuid,
		status: EarmarkStatus,
	) -> Result<(), StoreError>;

	async fn update_earmark_min_amount(
		&self,
		id: Uuid,
		min_amount: Amount,
	) -> Result<(), StoreError>;
}

pub(super) fn earmark_from_row(row: &PgRow) -> Result<Earmark, StoreError> {
	let ticker_bytes: Vec<u8> = row.try_get("ticker_hash")?;
	if ticker_bytes.len() != 32 {
		return Err(StoreError::Corrupt(format!(
			"ticker_hash has {} bytes, expected 32",
			ticker_bytes.len()
		)))
	}
	let min_amount: String = row.try_get("min_amount")?;
	let status: String = row.try_get("status")?;

	Ok(Earmark {
		id: row.try_get("id")?,
		invoice_id: row.try_get("invoice_id")?,
		designated_purchase_chain: ChainId(row.try_get::<i64, _>("designated_purchase_chain")? as u64),
		ticker_hash: H256::from_slice(&ticker_bytes),
		min_amount: numeric_to_u256("min_amount", &min_amount)?,
		status: EarmarkStatus::from_str_exact(&status)?,
		created_at: row.try_get("created_at")?,
		updated_at: row.try_get("updated_at")?,
	})
}

const EARMARK_COLUMNS: &str = "id, invoice_id, designated_purchase_chain, ticker_hash, \
	 min_amount::text AS min_amount, status, created_at, updated_at";

#[async_trait]
impl EarmarkStore for Database {
	async fn create_earmark(
		&self,
		new: NewEarmark,
		status: EarmarkStatus,
	) -> Result<Earmark, StoreError> {
		let row = sqlx::query(&format!(
			"INSERT INTO earmarks \
			 (id, invoice_id, designated_purchase_chain, ticker_hash, min_amount, status) \
			 VALUES ($1, $2, $3, $4, $5::numeric, $6) \
			 RETURNING {EARMARK_COLUMNS}"
		))
		.bind(Uuid::new_v4())
		.bind(&new.invoice_id)
		.bind(new.designated_purchase_chain.0 as i64)
		.bind(new.ticker_hash.as_bytes())
		.bind(new.min_amount.to_string())
		.bind(status.as_str())
		.fetch_one(self.pool())
		.await
		.map_err(|e| match &e {
			sqlx::Error::Database(db) if db.is_unique_violation() =>
				StoreError::ActiveEarmarkExists(new.invoice_id.clone()),
			_ => StoreError::Database(e),
		})?;

		earmark_from_row(&row)
	}

	async fn get_earmark(&self, id: Uuid) -> Result<Option<Earmark>, StoreError> {
		let row = sqlx::query(&format!("SELECT {EARMARK_COLUMNS} FROM earmarks WHERE id = $1"))
			.bind(id)
			.fetch_optional(self.pool())
			.await?;
		row.as_ref().map(earmark_from_row).transpose()
	}

	async fn get_active_earmark_for_invoice(
		&self,
		invoice_id: &str,
	) -> Result<Option<Earmark>, StoreError> {
		let row = sqlx::query(&format!(
			"SELECT {EARMARK_COLUMNS} FROM earmarks \
			 WHERE invoice_id = $1 AND status IN ('INITIATING', 'PENDING', 'READY') \
			 ORDER BY created_at LIMIT 1"
		))
		.bind(invoice_id)
		.fetch_optional(self.pool())
		.await?;

		row.as_ref().map(earmark_from_row).transpose()
	}

	async fn get_earmarks(&self, filter: EarmarkFilter) -> Result<Vec<Earmark>, StoreError> {
		let mut query = QueryBuilder::new(format!(
			"SELECT {EARMARK_COLUMNS} FROM earmarks WHERE true"
		));
		if let Some(statuses) = &filter.statuses {
			let statuses: Vec<&str> = statuses.iter().map(EarmarkStatus::as_str).collect();
			query.push(" AND status = ANY(").push_bind(statuses).push(")");
		}
		if let Some(invoice_id) = &filter.invoice_id {
			query.push(" AND invoice_id = ").push_bind(invoice_id.clone());
		}
		if let Some(chain) = filter.designated_purchase_chain {
			query.push(" AND designated_purchase_chain = ").push_bind(chain.0 as i64);
		}
		query.push(" ORDER BY created_at");

		let rows = query.build().fetch_all(self.pool()).await?;
		rows.iter().map(earmark_from_row).collect()
	}

	async fn update_earmark_status(
		&self,
		id: Uuid,
		status: EarmarkStatus,
	) -> Result<(), StoreError> {
		let result =
			sqlx::query("UPDATE earmarks SET status = $2, updated_at = now() WHERE id = $1")
				.bind(id)
				.bind(status.as_str())
				.execute(self.pool())
				.await?;
		if result.rows_affected() == 0 {
			return Err(StoreError::NotFound)
		}
		Ok(())
	}

	async fn update_earmark_min_amount(
		&self,
		id: Uuid,
		min_amount: Amount,
	) -> Result<(), StoreError> {
		let result = sqlx::query(
			"UPDATE earmarks SET min_amount = $2::numeric, updated_at = now() WHERE id = $1",
		)
		.bind(id)
		.bind(min_amount.to_string())
		.execute(self.pool())
		.await?;
		if result.rows_affected() == 0 {
			return Err(StoreError::NotFound)
		}
		Ok(())
	}
}
