//! Destination-side completion of rebalance operations.
//!
//! A ticker walks every in-flight operation: PENDING rows are probed for
//! destination readiness, AWAITING_CALLBACK rows get their finishing
//! transaction submitted. Operations are processed sequentially within a
//! tick, which gives the required at-most-once concurrent callback per
//! operation. Swap-and-bridge rows are advanced by the swap state machine
//! instead.

use std::collections::HashMap;

use anyhow::{Context, Result};

use mark_primitives::Route;

use crate::{
	bridge::{retry::with_retries, BridgeKind, BridgeRegistry},
	chain::ChainServices,
	constants::{CALLBACK_INTERVAL, EXPIRY_TICK_INTERVAL, OPERATION_EXPIRY},
	db::{
		EarmarkStatus, OperationFilter, OperationType, RebalanceOperation,
		RebalanceOperationStatus, RebalanceOperationUpdate, Store,
	},
	metrics::REBALANCE_OPERATIONS,
	settings::Settings,
	utils::make_periodic_tick,
};

use super::swap;

/// Runs the callback loop until the process shuts down.
pub async fn run_callback_loop<S: Store>(
	settings: &Settings,
	registry: &BridgeRegistry,
	chains: &ChainServices,
	store: &S,
) {
	let mut tick = make_periodic_tick(CALLBACK_INTERVAL, true);
	loop {
		tick.tick().await;
		if let Err(error) = process_pending_operations(settings, registry, chains, store).await
		{
			tracing::error!(%error, "callback pass failed");
		}
	}
}

/// One pass over every in-flight operation.
pub async fn process_pending_operations<S: Store>(
	settings: &Settings,
	registry: &BridgeRegistry,
	chains: &ChainServices,
	store: &S,
) -> Result<()> {
	let (operations, _) = store
		.get_rebalance_operations(
			RebalanceOperationStatus::IN_FLIGHT,
			OperationFilter::default(),
		)
		.await?;

	for operation in operations {
		if let Err(error) =
			process_operation(settings, registry, chains, store, &operation).await
		{
			tracing::error!(
				operation_id = %operation.id,
				bridge = %operation.bridge,
				%error,
				"operation callback failed, will retry next tick"
			);
		}
	}

	Ok(())
}

async fn process_operation<S: Store>(
	settings: &Settings,
	registry: &BridgeRegistry,
	chains: &ChainServices,
	store: &S,
	operation: &RebalanceOperation,
) -> Result<()> {
	let Some(kind) = BridgeKind::from_identifier(&operation.bridge) else {
		tracing::debug!(
			operation_id = %operation.id,
			bridge = %operation.bridge,
			"unknown bridge identifier, skipping"
		);
		return Ok(())
	};
	let Some(origin_receipt) = operation.origin_receipt() else {
		tracing::debug!(operation_id = %operation.id, "no origin receipt, skipping");
		return Ok(())
	};

	if operation.operation_type == OperationType::SwapAndBridge {
		return swap::advance_swap(settings, registry, chains, store, operation, kind).await
	}

	let adapter = registry.get(kind)?;
	let route = callback_route(settings, operation)?;

	let mut status = operation.status;
	if status == RebalanceOperationStatus::Pending {
		let ready = with_retries("readiness probe", || {
			adapter.ready_on_destination(operation.amount, &route, origin_receipt)
		})
		.await?;
		if !ready {
			return Ok(())
		}
		store
			.update_rebalance_operation(
				operation.id,
				RebalanceOperationUpdate {
					status: Some(RebalanceOperationStatus::AwaitingCallback),
					..Default::default()
				},
			)
			.await?;
		status = RebalanceOperationStatus::AwaitingCallback;
	}

	if status == RebalanceOperationStatus::AwaitingCallback {
		let callback = with_retries("destination callback", || {
			adapter.destination_callback(&route, origin_receipt)
		})
		.await?;

		let destination_receipt = match callback {
			None => None,
			Some(memo_tx) => {
				let destination = chains.get(operation.destination_chain_id)?;
				let receipt = destination
					.submit_and_monitor(memo_tx.tx)
					.await
					.context("destination callback submission")?;
				Some(receipt)
			},
		};

		complete_operation(store, operation, destination_receipt).await?;
		REBALANCE_OPERATIONS
			.with_label_values(&[operation.bridge.as_str(), "COMPLETED"])
			.inc();
	}

	Ok(())
}

pub(super) fn callback_route(
	settings: &Settings,
	operation: &RebalanceOperation,
) -> Result<Route> {
	let origin_asset = settings
		.asset(operation.origin_chain_id, operation.ticker_hash)
		.with_context(|| {
			format!("no asset for ticker on origin chain {}", operation.origin_chain_id)
		})?;
	let destination_asset = settings
		.asset(operation.destination_chain_id, operation.ticker_hash)
		.with_context(|| {
			format!(
				"no asset for ticker on destination chain {}",
				operation.destination_chain_id
			)
		})?;

	Ok(Route {
		origin: operation.origin_chain_id,
		destination: operation.destination_chain_id,
		asset: origin_asset.address,
		destination_asset: Some(destination_asset.address),
	})
}

/// COMPLETED is a one-way latch; once set, the earmark is bubbled when the
/// whole batch is done.
pub(super) async fn complete_operation<S: Store>(
	store: &S,
	operation: &RebalanceOperation,
	destination_receipt: Option<ethers::types::TransactionReceipt>,
) -> Result<()> {
	store
		.update_rebalance_operation(
			operation.id,
			RebalanceOperationUpdate {
				status: Some(RebalanceOperationStatus::Completed),
				transactions: destination_receipt
					.map(|r| HashMap::from([(operation.destination_chain_id, r)])),
			},
		)
		.await?;

	if let Some(earmark_id) = operation.earmark_id {
		bubble_earmark(store, earmark_id).await?;
	}
	Ok(())
}

/// PENDING -> READY once every operation under the earmark is COMPLETED.
async fn bubble_earmark<S: Store>(store: &S, earmark_id: uuid::Uuid) -> Result<()> {
	let operations = store.get_rebalance_operations_by_earmark(earmark_id).await?;
	if !operations
		.iter()
		.all(|op| op.status == RebalanceOperationStatus::Completed)
	{
		return Ok(())
	}

	match store.get_earmark(earmark_id).await? {
		Some(earmark) if earmark.status == EarmarkStatus::Pending => {
			store.update_earmark_status(earmark_id, EarmarkStatus::Ready).await?;
			tracing::info!(%earmark_id, invoice_id = %earmark.invoice_id, "earmark ready");
		},
		_ => {},
	}
	Ok(())
}

/// Periodically expires operations stuck in flight for longer than the
/// 24 h window.
pub async fn run_expiry_ticker<S: Store>(store: &S) {
	let mut tick = make_periodic_tick(EXPIRY_TICK_INTERVAL, true);
	loop {
		tick.tick().await;
		match store.expire_stale_operations(OPERATION_EXPIRY).await {
			Ok(0) => {},
			Ok(expired) => tracing::warn!(expired, "expired stale rebalance operations"),
			Err(error) => tracing::error!(%error, "expiry pass failed"),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{collections::HashMap, sync::Arc};

	use chrono::Utc;
	use ethers::types::TransactionReceipt;
	use uuid::Uuid;

	use mark_primitives::{Address, ChainId, TickerHash, H256, U256};

	use crate::{
		bridge::{MemoTx, MockBridgeAdapter, TxMemo},
		chain::{MockChainService, TxRequest},
		db::{earmarks::Earmark, memory::MemoryStore, RebalanceOperationStore},
		settings::test_utils::{new_test_settings, USDC_TICKER},
	};

	use super::*;

	fn usdc_ticker() -> TickerHash {
		USDC_TICKER.parse().unwrap()
	}

	fn receipt(marker: u8) -> TransactionReceipt {
		TransactionReceipt {
			transaction_hash: H256::repeat_byte(marker),
			..Default::default()
		}
	}

	fn pending_operation(earmark_id: Option<Uuid>) -> RebalanceOperation {
		RebalanceOperation {
			id: Uuid::new_v4(),
			earmark_id,
			origin_chain_id: ChainId(10),
			destination_chain_id: ChainId(1),
			ticker_hash: usdc_ticker(),
			amount: U256::from(1_000_000u64),
			slippage: 1000,
			status: RebalanceOperationStatus::Pending,
			bridge: "cctp_v1".to_string(),
			recipient: Address::repeat_byte(0x22),
			transactions: HashMap::from([(ChainId(10), receipt(0x01))]),
			operation_type: OperationType::Bridge,
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	fn pending_earmark(invoice_id: &str) -> Earmark {
		Earmark {
			id: Uuid::new_v4(),
			invoice_id: invoice_id.to_string(),
			designated_purchase_chain: ChainId(1),
			ticker_hash: usdc_ticker(),
			min_amount: U256::from(10).pow(U256::from(18)),
			status: EarmarkStatus::Pending,
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	fn registry_with(adapter: MockBridgeAdapter) -> BridgeRegistry {
		let mut registry = BridgeRegistry::new();
		registry.register(Arc::new(adapter));
		registry
	}

	fn cctp_adapter() -> MockBridgeAdapter {
		let mut adapter = MockBridgeAdapter::new();
		adapter.expect_kind().return_const(crate::bridge::BridgeKind::CctpV1);
		adapter
	}

	#[tokio::test]
	async fn ready_operation_without_callback_completes_and_bubbles_the_earmark() {
		let settings = new_test_settings();
		let store = MemoryStore::new();

		let earmark = pending_earmark("0xinvoice");
		store.insert_earmark(earmark.clone()).await;
		let operation = pending_operation(Some(earmark.id));
		store.insert_operation(operation.clone()).await;

		let mut adapter = cctp_adapter();
		adapter.expect_ready_on_destination().times(1).returning(|_, _, _| Ok(true));
		adapter.expect_destination_callback().times(1).returning(|_, _| Ok(None));

		process_pending_operations(
			&settings,
			&registry_with(adapter),
			&ChainServices::new(),
			&store,
		)
		.await
		.unwrap();

		let operations = store.operations().await;
		assert_eq!(operations[0].status, RebalanceOperationStatus::Completed);
		assert_eq!(store.earmarks().await[0].status, EarmarkStatus::Ready);
	}

	#[tokio::test]
	async fn an_unready_operation_stays_pending() {
		let settings = new_test_settings();
		let store = MemoryStore::new();
		store.insert_operation(pending_operation(None)).await;

		let mut adapter = cctp_adapter();
		adapter.expect_ready_on_destination().times(1).returning(|_, _, _| Ok(false));
		adapter.expect_destination_callback().times(0);

		process_pending_operations(
			&settings,
			&registry_with(adapter),
			&ChainServices::new(),
			&store,
		)
		.await
		.unwrap();

		assert_eq!(store.operations().await[0].status, RebalanceOperationStatus::Pending);
	}

	#[tokio::test]
	async fn destination_callbacks_are_submitted_and_their_receipt_merged() {
		let settings = new_test_settings();
		let store = MemoryStore::new();
		store.insert_operation(pending_operation(None)).await;

		let mut adapter = cctp_adapter();
		adapter.expect_ready_on_destination().returning(|_, _, _| Ok(true));
		adapter.expect_destination_callback().times(1).returning(|_, _| {
			Ok(Some(MemoTx {
				memo: TxMemo::Wrap,
				tx: TxRequest::new(Address::repeat_byte(0xee), U256::zero(), vec![].into()),
				effective_amount: None,
			}))
		});

		let mut destination = MockChainService::new();
		destination.expect_chain_id().return_const(ChainId(1));
		destination.expect_owner().return_const(Address::repeat_byte(0x22));
		destination
			.expect_submit_and_monitor()
			.times(1)
			.returning(|_| Ok(receipt(0x0d)));
		let mut chains = ChainServices::new();
		chains.insert(Arc::new(destination));

		process_pending_operations(&settings, &registry_with(adapter), &chains, &store)
			.await
			.unwrap();

		let operation = &store.operations().await[0];
		assert_eq!(operation.status, RebalanceOperationStatus::Completed);
		assert_eq!(
			operation.transactions.get(&ChainId(1)).unwrap().transaction_hash,
			H256::repeat_byte(0x0d)
		);
	}

	#[tokio::test]
	async fn completed_operations_are_never_called_back_again() {
		let settings = new_test_settings();
		let store = MemoryStore::new();
		store.insert_operation(pending_operation(None)).await;

		let mut adapter = cctp_adapter();
		adapter.expect_ready_on_destination().times(1).returning(|_, _, _| Ok(true));
		// One completion, then silence: a second pass must not resubmit.
		adapter.expect_destination_callback().times(1).returning(|_, _| Ok(None));
		let registry = registry_with(adapter);

		process_pending_operations(&settings, &registry, &ChainServices::new(), &store)
			.await
			.unwrap();
		process_pending_operations(&settings, &registry, &ChainServices::new(), &store)
			.await
			.unwrap();

		assert_eq!(store.operations().await[0].status, RebalanceOperationStatus::Completed);
	}

	#[tokio::test]
	async fn failed_callback_submission_leaves_the_operation_awaiting() {
		let settings = new_test_settings();
		let store = MemoryStore::new();
		store.insert_operation(pending_operation(None)).await;

		let mut adapter = cctp_adapter();
		adapter.expect_ready_on_destination().returning(|_, _, _| Ok(true));
		adapter.expect_destination_callback().returning(|_, _| {
			Ok(Some(MemoTx {
				memo: TxMemo::Wrap,
				tx: TxRequest::new(Address::repeat_byte(0xee), U256::zero(), vec![].into()),
				effective_amount: None,
			}))
		});

		let mut destination = MockChainService::new();
		destination.expect_chain_id().return_const(ChainId(1));
		destination.expect_owner().return_const(Address::repeat_byte(0x22));
		destination
			.expect_submit_and_monitor()
			.returning(|_| Err(anyhow::anyhow!("gas spike")));
		let mut chains = ChainServices::new();
		chains.insert(Arc::new(destination));

		process_pending_operations(&settings, &registry_with(adapter), &chains, &store)
			.await
			.unwrap();

		assert_eq!(
			store.operations().await[0].status,
			RebalanceOperationStatus::AwaitingCallback
		);
	}

	#[tokio::test]
	async fn expired_operations_are_latched_by_the_store() {
		let store = MemoryStore::new();
		let mut stale = pending_operation(None);
		stale.created_at = Utc::now() - chrono::Duration::hours(25);
		store.insert_operation(stale).await;
		store.insert_operation(pending_operation(None)).await;

		let expired = store.expire_stale_operations(OPERATION_EXPIRY).await.unwrap();
		assert_eq!(expired, 1);

		let operations = store.operations().await;
		assert_eq!(
			operations
				.iter()
				.filter(|op| op.status == RebalanceOperationStatus::Expired)
				.count(),
			1
		);
	}
}
