//! Persistent state: earmarks, rebalance operations and their CEX swap
//! legs, all in Postgres.
//!
//! The partial unique index on active earmarks is the engine's only
//! cross-process mutual-exclusion primitive; its violation surfaces as
//! [`StoreError::ActiveEarmarkExists`] so callers can recover by
//! re-reading. Rows that record on-chain side effects are written only
//! after the corresponding receipt is confirmed, never before.

pub mod earmarks;
#[cfg(test)]
pub mod memory;
pub mod rebalance_operations;
pub mod swap_operations;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use mark_primitives::U256;

use crate::constants::HTTP_TIMEOUT;

pub use earmarks::{Earmark, EarmarkFilter, EarmarkStatus, EarmarkStore, NewEarmark};
pub use rebalance_operations::{
	NewRebalanceOperation, OperationFilter, OperationType, RebalanceOperation,
	RebalanceOperationStatus, RebalanceOperationStore, RebalanceOperationUpdate,
};
pub use swap_operations::{
	NewSwapOperation, SwapOperation, SwapOperationStore, SwapOperationUpdate, SwapStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("an active earmark already exists for invoice {0}")]
	ActiveEarmarkExists(String),
	#[error("row not found")]
	NotFound,
	#[error(transparent)]
	Database(#[from] sqlx::Error),
	#[error(transparent)]
	Migrate(#[from] sqlx::migrate::MigrateError),
	#[error("malformed row: {0}")]
	Corrupt(String),
}

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Marker for the full store surface the engine components depend on.
pub trait Store: EarmarkStore + RebalanceOperationStore + SwapOperationStore {}
impl<T: EarmarkStore + RebalanceOperationStore + SwapOperationStore> Store for T {}

#[derive(Clone)]
pub struct Database {
	pool: PgPool,
}

impl Database {
	pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
		let pool = PgPoolOptions::new()
			.max_connections(max_connections)
			.acquire_timeout(HTTP_TIMEOUT)
			.connect(url)
			.await?;
		Ok(Self { pool })
	}

	pub async fn run_migrations(&self) -> Result<(), StoreError> {
		MIGRATOR.run(&self.pool).await?;
		Ok(())
	}

	pub(crate) fn pool(&self) -> &PgPool {
		&self.pool
	}
}

/// Amounts cross the SQL boundary as decimal strings bound into
/// `NUMERIC(78, 0)` columns, keeping `U256` integer-exact end to end.
pub(crate) fn numeric_to_u256(column: &str, value: &str) -> Result<U256, StoreError> {
	U256::from_dec_str(value)
		.map_err(|e| StoreError::Corrupt(format!("{column} = {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
	use uuid::Uuid;

	use mark_primitives::{ChainId, H256};

	use super::*;

	#[tokio::test]
	#[ignore = "requires a local postgres at MARK_TEST_DATABASE_URL"]
	async fn active_earmark_conflicts_surface_as_typed_errors() {
		let url = std::env::var("MARK_TEST_DATABASE_URL").unwrap();
		let database = Database::connect(&url, 2).await.unwrap();
		database.run_migrations().await.unwrap();

		let new = NewEarmark {
			invoice_id: Uuid::new_v4().to_string(),
			designated_purchase_chain: ChainId(1),
			ticker_hash: H256::repeat_byte(0x6b),
			min_amount: U256::from(1_000_000u64),
		};
		database.create_earmark(new.clone(), EarmarkStatus::Pending).await.unwrap();

		// The partial unique index rejects a second live reservation and the
		// violation comes back as the typed conflict.
		let error = database
			.create_earmark(new.clone(), EarmarkStatus::Initiating)
			.await
			.unwrap_err();
		assert!(matches!(error, StoreError::ActiveEarmarkExists(_)));

		// A closed reservation frees the invoice for a new one.
		let existing = database
			.get_active_earmark_for_invoice(&new.invoice_id)
			.await
			.unwrap()
			.unwrap();
		database
			.update_earmark_status(existing.id, EarmarkStatus::Cancelled)
			.await
			.unwrap();
		database.create_earmark(new, EarmarkStatus::Pending).await.unwrap();
	}

	#[test]
	fn numeric_decoding_rejects_garbage() {
		assert_eq!(
			numeric_to_u256("amount", "1000001").unwrap(),
			U256::from(1_000_001u64)
		);
		assert!(matches!(
			numeric_to_u256("amount", "1.5"),
			Err(StoreError::Corrupt(_))
		));
		assert!(matches!(
			numeric_to_u256("amount", "-3"),
			Err(StoreError::Corrupt(_))
		));
	}
}
