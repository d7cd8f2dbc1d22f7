//! In-memory store used by tests in place of Postgres. Mirrors the
//! store-level semantics the engine relies on, including the
//! active-earmark uniqueness conflict.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use mark_primitives::Amount;

use super::{
	earmarks::{Earmark, EarmarkFilter, EarmarkStatus, EarmarkStore, NewEarmark},
	rebalance_operations::{
		NewRebalanceOperation, OperationFilter, RebalanceOperation, RebalanceOperationStatus,
		RebalanceOperationStore, RebalanceOperationUpdate,
	},
	swap_operations::{
		NewSwapOperation, SwapOperation, SwapOperationStore, SwapOperationUpdate, SwapStatus,
	},
	StoreError,
};

#[derive(Default)]
struct Inner {
	earmarks: Vec<Earmark>,
	operations: Vec<RebalanceOperation>,
	swaps: Vec<SwapOperation>,
}

#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn earmarks(&self) -> Vec<Earmark> {
		self.inner.lock().await.earmarks.clone()
	}

	pub async fn operations(&self) -> Vec<RebalanceOperation> {
		self.inner.lock().await.operations.clone()
	}

	pub async fn swaps(&self) -> Vec<SwapOperation> {
		self.inner.lock().await.swaps.clone()
	}

	pub async fn insert_operation(&self, operation: RebalanceOperation) {
		self.inner.lock().await.operations.push(operation);
	}

	pub async fn insert_earmark(&self, earmark: Earmark) {
		self.inner.lock().await.earmarks.push(earmark);
	}

	pub async fn insert_swap(&self, swap: SwapOperation) {
		self.inner.lock().await.swaps.push(swap);
	}
}

fn build_earmark(new: &NewEarmark, status: EarmarkStatus) -> Earmark {
	let now = Utc::now();
	Earmark {
		id: Uuid::new_v4(),
		invoice_id: new.invoice_id.clone(),
		designated_purchase_chain: new.designated_purchase_chain,
		ticker_hash: new.ticker_hash,
		min_amount: new.min_amount,
		status,
		created_at: now,
		updated_at: now,
	}
}

fn build_operation(new: &NewRebalanceOperation) -> RebalanceOperation {
	let now = Utc::now();
	RebalanceOperation {
		id: Uuid::new_v4(),
		earmark_id: new.earmark_id,
		origin_chain_id: new.origin_chain_id,
		destination_chain_id: new.destination_chain_id,
		ticker_hash: new.ticker_hash,
		amount: new.amount,
		slippage: new.slippage,
		status: RebalanceOperationStatus::Pending,
		bridge: new.bridge.clone(),
		recipient: new.recipient,
		transactions: new.transactions.clone(),
		operation_type: new.operation_type,
		created_at: now,
		updated_at: now,
	}
}

#[async_trait]
impl EarmarkStore for MemoryStore {
	async fn create_earmark(
		&self,
		new: NewEarmark,
		status: EarmarkStatus,
	) -> Result<Earmark, StoreError> {
		let mut inner = self.inner.lock().await;
		if status.is_active() &&
			inner
				.earmarks
				.iter()
				.any(|e| e.invoice_id == new.invoice_id && e.status.is_active())
		{
			return Err(StoreError::ActiveEarmarkExists(new.invoice_id))
		}
		let earmark = build_earmark(&new, status);
		inner.earmarks.push(earmark.clone());
		Ok(earmark)
	}

	async fn get_earmark(&self, id: Uuid) -> Result<Option<Earmark>, StoreError> {
		Ok(self.inner.lock().await.earmarks.iter().find(|e| e.id == id).cloned())
	}

	async fn get_active_earmark_for_invoice(
		&self,
		invoice_id: &str,
	) -> Result<Option<Earmark>, StoreError> {
		Ok(self
			.inner
			.lock()
			.await
			.earmarks
			.iter()
			.find(|e| e.invoice_id == invoice_id && e.status.is_active())
			.cloned())
	}

	async fn get_earmarks(&self, filter: EarmarkFilter) -> Result<Vec<Earmark>, StoreError> {
		Ok(self
			.inner
			.lock()
			.await
			.earmarks
			.iter()
			.filter(|e| {
				filter.statuses.as_ref().map_or(true, |s| s.contains(&e.status)) &&
					filter.invoice_id.as_ref().map_or(true, |id| &e.invoice_id == id) &&
					filter
						.designated_purchase_chain
						.map_or(true, |c| e.designated_purchase_chain == c)
			})
			.cloned()
			.collect())
	}

	async fn update_earmark_status(
		&self,
		id: Uuid,
		status: EarmarkStatus,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		let earmark =
			inner.earmarks.iter_mut().find(|e| e.id == id).ok_or(StoreError::NotFound)?;
		earmark.status = status;
		earmark.updated_at = Utc::now();
		Ok(())
	}

	async fn update_earmark_min_amount(
		&self,
		id: Uuid,
		min_amount: Amount,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		let earmark =
			inner.earmarks.iter_mut().find(|e| e.id == id).ok_or(StoreError::NotFound)?;
		earmark.min_amount = min_amount;
		earmark.updated_at = Utc::now();
		Ok(())
	}
}

#[async_trait]
impl RebalanceOperationStore for MemoryStore {
	async fn create_rebalance_operation(
		&self,
		new: NewRebalanceOperation,
	) -> Result<RebalanceOperation, StoreError> {
		let operation = build_operation(&new);
		self.inner.lock().await.operations.push(operation.clone());
		Ok(operation)
	}

	async fn create_operations_for_earmark(
		&self,
		earmark_id: Uuid,
		earmark_status: EarmarkStatus,
		operations: Vec<NewRebalanceOperation>,
	) -> Result<Vec<RebalanceOperation>, StoreError> {
		let mut inner = self.inner.lock().await;
		let earmark = inner
			.earmarks
			.iter_mut()
			.find(|e| e.id == earmark_id)
			.ok_or(StoreError::NotFound)?;
		earmark.status = earmark_status;
		earmark.updated_at = Utc::now();

		let created: Vec<RebalanceOperation> =
			operations.iter().map(build_operation).collect();
		inner.operations.extend(created.clone());
		Ok(created)
	}

	async fn get_rebalance_operations(
		&self,
		statuses: &[RebalanceOperationStatus],
		filter: OperationFilter,
	) -> Result<(Vec<RebalanceOperation>, u64), StoreError> {
		let operations: Vec<RebalanceOperation> = self
			.inner
			.lock()
			.await
			.operations
			.iter()
			.filter(|op| {
				statuses.contains(&op.status) &&
					filter.earmark_id.map_or(true, |id| op.earmark_id == Some(id)) &&
					filter
						.destination_chain_id
						.map_or(true, |c| op.destination_chain_id == c) &&
					filter.ticker_hash.map_or(true, |t| op.ticker_hash == t)
			})
			.cloned()
			.collect();
		let total = operations.len() as u64;
		Ok((operations, total))
	}

	async fn get_rebalance_operations_by_earmark(
		&self,
		earmark_id: Uuid,
	) -> Result<Vec<RebalanceOperation>, StoreError> {
		Ok(self
			.inner
			.lock()
			.await
			.operations
			.iter()
			.filter(|op| op.earmark_id == Some(earmark_id))
			.cloned()
			.collect())
	}

	async fn update_rebalance_operation(
		&self,
		id: Uuid,
		update: RebalanceOperationUpdate,
	) -> Result<RebalanceOperation, StoreError> {
		let mut inner = self.inner.lock().await;
		let operation = inner
			.operations
			.iter_mut()
			.find(|op| op.id == id && !op.status.is_terminal())
			.ok_or(StoreError::NotFound)?;
		if let Some(status) = update.status {
			operation.status = status;
		}
		if let Some(receipts) = update.transactions {
			operation.transactions.extend(receipts);
		}
		operation.updated_at = Utc::now();
		Ok(operation.clone())
	}

	async fn expire_stale_operations(
		&self,
		older_than: std::time::Duration,
	) -> Result<u64, StoreError> {
		let cutoff = Utc::now() - ChronoDuration::from_std(older_than).unwrap();
		let mut expired = 0;
		for operation in &mut self.inner.lock().await.operations {
			if RebalanceOperationStatus::IN_FLIGHT.contains(&operation.status) &&
				operation.created_at < cutoff
			{
				operation.status = RebalanceOperationStatus::Expired;
				operation.updated_at = Utc::now();
				expired += 1;
			}
		}
		Ok(expired)
	}
}

#[async_trait]
impl SwapOperationStore for MemoryStore {
	async fn create_swap_operation(
		&self,
		new: NewSwapOperation,
	) -> Result<SwapOperation, StoreError> {
		let now = Utc::now();
		let swap = SwapOperation {
			id: Uuid::new_v4(),
			rebalance_operation_id: new.rebalance_operation_id,
			platform: new.platform,
			from_asset: new.from_asset,
			to_asset: new.to_asset,
			from_amount: new.from_amount,
			to_amount: new.to_amount,
			expected_rate: new.expected_rate,
			actual_rate: None,
			status: SwapStatus::PendingDeposit,
			order_id: None,
			quote_id: None,
			metadata: new.metadata,
			created_at: now,
			updated_at: now,
		};
		self.inner.lock().await.swaps.push(swap.clone());
		Ok(swap)
	}

	async fn get_swap_operation_for_rebalance(
		&self,
		rebalance_operation_id: Uuid,
	) -> Result<Option<SwapOperation>, StoreError> {
		Ok(self
			.inner
			.lock()
			.await
			.swaps
			.iter()
			.find(|s| s.rebalance_operation_id == rebalance_operation_id)
			.cloned())
	}

	async fn get_swap_operations_by_status(
		&self,
		statuses: &[SwapStatus],
	) -> Result<Vec<SwapOperation>, StoreError> {
		Ok(self
			.inner
			.lock()
			.await
			.swaps
			.iter()
			.filter(|s| statuses.contains(&s.status))
			.cloned()
			.collect())
	}

	async fn update_swap_operation(
		&self,
		id: Uuid,
		update: SwapOperationUpdate,
	) -> Result<SwapOperation, StoreError> {
		let mut inner = self.inner.lock().await;
		let swap = inner.swaps.iter_mut().find(|s| s.id == id).ok_or(StoreError::NotFound)?;
		if let Some(status) = update.status {
			swap.status = status;
		}
		if let Some(order_id) = update.order_id {
			swap.order_id = Some(order_id);
		}
		if let Some(quote_id) = update.quote_id {
			swap.quote_id = Some(quote_id);
		}
		if let Some(actual_rate) = update.actual_rate {
			swap.actual_rate = Some(actual_rate);
		}
		if let Some(to_amount) = update.to_amount {
			swap.to_amount = to_amount;
		}
		if let (Some(patch), Some(existing)) = (&update.metadata, swap.metadata.as_object_mut())
		{
			if let Some(patch) = patch.as_object() {
				for (key, value) in patch {
					existing.insert(key.clone(), value.clone());
				}
			}
		}
		swap.updated_at = Utc::now();
		Ok(swap.clone())
	}
}
