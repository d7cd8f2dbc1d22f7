//! CEX swap legs: verify deposit, re-check the slippage budget, execute
//! and poll the swap, then withdraw to the destination chain.
//!
//! Recovery from a budget breach is a dedicated `recovering` state; the
//! actual withdrawal of the original asset back to the origin is issued by
//! this same loop through the exchange adapter's destination callback, not
//! a side queue.

use anyhow::{Context, Result};

use mark_primitives::{
	amounts::{slippage_dbps, to_eighteen},
	ChainId, Dbps, Route,
};

use crate::{
	bridge::{
		retry::with_retries, BridgeAdapter, BridgeKind, BridgeRegistry, SwapAdapter,
		SwapExecutionStatus,
	},
	chain::ChainServices,
	constants::{SWAP_POLL_INTERVAL, SWAP_POLL_TIMEOUT},
	db::{
		RebalanceOperation, RebalanceOperationStatus, RebalanceOperationUpdate, Store,
		SwapOperation, SwapOperationUpdate, SwapStatus,
	},
	settings::Settings,
};

use super::callback::complete_operation;

pub const BUDGET_BREACH_REASON: &str = "total_slippage_would_exceed_budget";

/// Advances a swap-and-bridge operation one step. Invoked by the callback
/// loop for every in-flight operation of that type.
pub async fn advance_swap<S: Store>(
	settings: &Settings,
	registry: &BridgeRegistry,
	chains: &ChainServices,
	store: &S,
	operation: &RebalanceOperation,
	kind: BridgeKind,
) -> Result<()> {
	let Some(swap) = store.get_swap_operation_for_rebalance(operation.id).await? else {
		tracing::warn!(
			operation_id = %operation.id,
			"swap_and_bridge operation has no swap leg recorded"
		);
		return Ok(())
	};
	let adapter = registry.get(kind)?;
	let Some(swap_adapter) = registry.swap(kind) else {
		tracing::warn!(operation_id = %operation.id, bridge = %kind, "no swap capability");
		return Ok(())
	};

	match swap.status {
		SwapStatus::PendingDeposit => {
			let route = venue_route(settings, operation, &swap)?;
			let origin_receipt = operation.origin_receipt().context("origin receipt")?;
			let ready = with_retries("deposit probe", || {
				adapter.ready_on_destination(operation.amount, &route, origin_receipt)
			})
			.await?;
			if !ready {
				return Ok(())
			}
			let swap = store
				.update_swap_operation(
					swap.id,
					SwapOperationUpdate {
						status: Some(SwapStatus::DepositConfirmed),
						..Default::default()
					},
				)
				.await?;
			// The swap itself runs immediately after the deposit confirms
			// rather than waiting for the next tick.
			execute_confirmed_swap(
				settings,
				adapter.as_ref(),
				swap_adapter.as_ref(),
				chains,
				store,
				operation,
				&swap,
			)
			.await
		},
		SwapStatus::DepositConfirmed => {
			execute_confirmed_swap(
				settings,
				adapter.as_ref(),
				swap_adapter.as_ref(),
				chains,
				store,
				operation,
				&swap,
			)
			.await
		},
		SwapStatus::Processing => {
			poll_processing_swap(
				settings,
				adapter.as_ref(),
				swap_adapter.as_ref(),
				chains,
				store,
				operation,
				&swap,
			)
			.await
		},
		// A completed swap with the parent still in flight means the
		// withdrawal leg has not landed yet; re-issue it (idempotent on the
		// adapter side).
		SwapStatus::Completed =>
			finish_bridge_leg(settings, adapter.as_ref(), chains, store, operation, &swap)
				.await,
		SwapStatus::Recovering =>
			issue_recovery_withdrawal(
				settings,
				adapter.as_ref(),
				chains,
				store,
				operation,
				&swap,
			)
			.await,
		SwapStatus::Failed => Ok(()),
	}
}

/// Budget recheck and swap execution, once the deposit is on the venue.
async fn execute_confirmed_swap<S: Store>(
	settings: &Settings,
	adapter: &dyn BridgeAdapter,
	swap_adapter: &dyn SwapAdapter,
	chains: &ChainServices,
	store: &S,
	operation: &RebalanceOperation,
	swap: &SwapOperation,
) -> Result<()> {
	let from_decimals = symbol_decimals(settings, operation.origin_chain_id, &swap.from_asset)?;
	let to_decimals =
		symbol_decimals(settings, operation.destination_chain_id, &swap.to_asset)?;

	let quote = with_retries("fresh swap quote", || {
		swap_adapter.swap_quote(&swap.from_asset, &swap.to_asset, swap.from_amount)
	})
	.await?;

	let actual_swap_dbps = slippage_dbps(
		to_eighteen(swap.from_amount, from_decimals),
		to_eighteen(quote.to_amount, to_decimals),
	);
	let planned_bridge_dbps = metadata_dbps(&swap.metadata, "observed_bridge_dbps");
	let total_budget =
		metadata_dbps(&swap.metadata, "total_budget_dbps").max(operation.slippage);

	let estimated_total = actual_swap_dbps.saturating_add(planned_bridge_dbps);
	if estimated_total > total_budget {
		tracing::warn!(
			operation_id = %operation.id,
			actual_swap_dbps,
			planned_bridge_dbps,
			total_budget,
			"swap would blow the slippage budget, recovering"
		);
		fail_and_recover(store, swap, BUDGET_BREACH_REASON, estimated_total).await?;
		return Ok(())
	}

	let execution = with_retries("execute swap", || swap_adapter.execute_swap(&quote)).await?;
	let swap = store
		.update_swap_operation(
			swap.id,
			SwapOperationUpdate {
				status: Some(SwapStatus::Processing),
				order_id: Some(execution.order_id.clone()),
				quote_id: Some(quote.quote_id.clone()),
				actual_rate: Some(quote.rate),
				to_amount: Some(quote.to_amount),
				metadata: None,
			},
		)
		.await?;

	// Short inline poll; slower fills are picked up by later ticks.
	let deadline = tokio::time::Instant::now() + SWAP_POLL_TIMEOUT;
	loop {
		match with_retries("swap status", || swap_adapter.swap_status(&execution.order_id))
			.await?
		{
			SwapExecutionStatus::Success => {
				let swap = store
					.update_swap_operation(
						swap.id,
						SwapOperationUpdate {
							status: Some(SwapStatus::Completed),
							..Default::default()
						},
					)
					.await?;
				return finish_bridge_leg(settings, adapter, chains, store, operation, &swap)
					.await
			},
			SwapExecutionStatus::Failed => {
				fail_and_recover(store, &swap, "venue reported swap failure", 0).await?;
				return Ok(())
			},
			SwapExecutionStatus::Pending if tokio::time::Instant::now() < deadline => {
				tokio::time::sleep(SWAP_POLL_INTERVAL).await;
			},
			SwapExecutionStatus::Pending => return Ok(()),
		}
	}
}

async fn poll_processing_swap<S: Store>(
	settings: &Settings,
	adapter: &dyn BridgeAdapter,
	swap_adapter: &dyn SwapAdapter,
	chains: &ChainServices,
	store: &S,
	operation: &RebalanceOperation,
	swap: &SwapOperation,
) -> Result<()> {
	let order_id = swap.order_id.clone().context("processing swap without an order id")?;
	match with_retries("swap status", || swap_adapter.swap_status(&order_id)).await? {
		SwapExecutionStatus::Pending => Ok(()),
		SwapExecutionStatus::Success => {
			let swap = store
				.update_swap_operation(
					swap.id,
					SwapOperationUpdate {
						status: Some(SwapStatus::Completed),
						..Default::default()
					},
				)
				.await?;
			finish_bridge_leg(settings, adapter, chains, store, operation, &swap).await
		},
		SwapExecutionStatus::Failed =>
			fail_and_recover(store, swap, "venue reported swap failure", 0).await,
	}
}

/// The withdrawal from the venue to the on-chain recipient: the swap's
/// bridge leg. Completing it completes the parent operation.
async fn finish_bridge_leg<S: Store>(
	settings: &Settings,
	adapter: &dyn BridgeAdapter,
	chains: &ChainServices,
	store: &S,
	operation: &RebalanceOperation,
	swap: &SwapOperation,
) -> Result<()> {
	let origin_receipt = operation.origin_receipt().context("origin receipt")?;
	let route = withdrawal_route(
		settings,
		operation.origin_chain_id,
		&swap.from_asset,
		operation.destination_chain_id,
		&swap.to_asset,
	)?;

	let callback = with_retries("withdrawal callback", || {
		adapter.destination_callback(&route, origin_receipt)
	})
	.await?;

	let destination_receipt = match callback {
		None => None,
		Some(memo_tx) => {
			let destination = chains.get(operation.destination_chain_id)?;
			Some(
				destination
					.submit_and_monitor(memo_tx.tx)
					.await
					.context("withdrawal callback submission")?,
			)
		},
	};

	complete_operation(store, operation, destination_receipt).await
}

/// Budget breach or venue failure: record the reason, then hand the swap to
/// recovery, which withdraws the original asset back to the origin.
async fn fail_and_recover<S: Store>(
	store: &S,
	swap: &SwapOperation,
	reason: &str,
	estimated_total_dbps: Dbps,
) -> Result<()> {
	store
		.update_swap_operation(
			swap.id,
			SwapOperationUpdate {
				status: Some(SwapStatus::Failed),
				metadata: Some(serde_json::json!({
					"failure_reason": reason,
					"estimated_total_dbps": estimated_total_dbps,
				})),
				..Default::default()
			},
		)
		.await?;
	store
		.update_swap_operation(
			swap.id,
			SwapOperationUpdate {
				status: Some(SwapStatus::Recovering),
				..Default::default()
			},
		)
		.await?;
	Ok(())
}

/// Withdraws the original asset from the venue back to the origin chain
/// and closes the parent operation as FAILED.
async fn issue_recovery_withdrawal<S: Store>(
	settings: &Settings,
	adapter: &dyn BridgeAdapter,
	chains: &ChainServices,
	store: &S,
	operation: &RebalanceOperation,
	swap: &SwapOperation,
) -> Result<()> {
	let origin_receipt = operation.origin_receipt().context("origin receipt")?;
	let route = withdrawal_route(
		settings,
		operation.origin_chain_id,
		&swap.from_asset,
		operation.origin_chain_id,
		&swap.from_asset,
	)?;

	let callback = with_retries("recovery withdrawal", || {
		adapter.destination_callback(&route, origin_receipt)
	})
	.await?;

	if let Some(memo_tx) = callback {
		let origin = chains.get(operation.origin_chain_id)?;
		origin
			.submit_and_monitor(memo_tx.tx)
			.await
			.context("recovery withdrawal submission")?;
	}

	store
		.update_swap_operation(
			swap.id,
			SwapOperationUpdate {
				status: Some(SwapStatus::Failed),
				metadata: Some(serde_json::json!({ "recovered": true })),
				..Default::default()
			},
		)
		.await?;
	store
		.update_rebalance_operation(
			operation.id,
			RebalanceOperationUpdate {
				status: Some(RebalanceOperationStatus::Failed),
				..Default::default()
			},
		)
		.await?;

	tracing::info!(
		operation_id = %operation.id,
		swap_id = %swap.id,
		"swap recovered, original asset withdrawn to the origin"
	);
	Ok(())
}

/// The deposit leg: origin chain to the venue, same asset family.
fn venue_route(
	settings: &Settings,
	operation: &RebalanceOperation,
	swap: &SwapOperation,
) -> Result<Route> {
	let from = symbol_asset(settings, operation.origin_chain_id, &swap.from_asset)?;
	Ok(Route {
		origin: operation.origin_chain_id,
		destination: operation.destination_chain_id,
		asset: from,
		destination_asset: None,
	})
}

fn withdrawal_route(
	settings: &Settings,
	origin: ChainId,
	from_symbol: &str,
	destination: ChainId,
	to_symbol: &str,
) -> Result<Route> {
	Ok(Route {
		origin,
		destination,
		asset: symbol_asset(settings, origin, from_symbol)?,
		destination_asset: Some(symbol_asset(settings, destination, to_symbol)?),
	})
}

fn symbol_asset(
	settings: &Settings,
	chain: ChainId,
	symbol: &str,
) -> Result<mark_primitives::Address> {
	settings
		.chain(chain)
		.and_then(|c| c.assets.iter().find(|a| a.symbol == symbol))
		.map(|a| a.address)
		.with_context(|| format!("no asset with symbol {symbol} on chain {chain}"))
}

fn symbol_decimals(settings: &Settings, chain: ChainId, symbol: &str) -> Result<u8> {
	settings
		.chain(chain)
		.and_then(|c| c.assets.iter().find(|a| a.symbol == symbol))
		.map(|a| a.decimals)
		.with_context(|| format!("no asset with symbol {symbol} on chain {chain}"))
}

fn metadata_dbps(metadata: &serde_json::Value, key: &str) -> Dbps {
	metadata.get(key).and_then(|v| v.as_u64()).map(|v| v as Dbps).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use std::{collections::HashMap, sync::Arc};

	use chrono::Utc;
	use ethers::types::TransactionReceipt;
	use uuid::Uuid;

	use mark_primitives::{Address, TickerHash, H256, U256};

	use crate::{
		bridge::{
			MockBridgeAdapter, MockSwapAdapter, SwapExecution, SwapQuote,
		},
		chain::MockChainService,
		db::{memory::MemoryStore, OperationType},
		settings::test_utils::new_test_settings,
	};

	use super::*;

	fn usdc_ticker() -> TickerHash {
		crate::settings::test_utils::USDC_TICKER.parse().unwrap()
	}

	fn receipt(marker: u8) -> TransactionReceipt {
		TransactionReceipt {
			transaction_hash: H256::repeat_byte(marker),
			..Default::default()
		}
	}

	fn swap_operation_row(
		rebalance_operation_id: Uuid,
		status: SwapStatus,
		bridge_dbps: u32,
		budget_dbps: u32,
	) -> SwapOperation {
		SwapOperation {
			id: Uuid::new_v4(),
			rebalance_operation_id,
			platform: "binance".to_string(),
			from_asset: "USDC".to_string(),
			to_asset: "WETH".to_string(),
			from_amount: U256::from(10_000_000u64),
			to_amount: U256::from(9_950_000_000_000_000_000u64),
			expected_rate: U256::from(995_000_000_000_000_000u64),
			actual_rate: None,
			status,
			order_id: None,
			quote_id: None,
			metadata: serde_json::json!({
				"observed_bridge_dbps": bridge_dbps,
				"total_budget_dbps": budget_dbps,
			}),
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	fn swap_parent() -> RebalanceOperation {
		RebalanceOperation {
			id: Uuid::new_v4(),
			earmark_id: None,
			origin_chain_id: ChainId(10),
			destination_chain_id: ChainId(1),
			ticker_hash: usdc_ticker(),
			amount: U256::from(10_000_000u64),
			slippage: 500,
			status: RebalanceOperationStatus::Pending,
			bridge: "binance".to_string(),
			recipient: Address::repeat_byte(0x22),
			transactions: HashMap::from([(ChainId(10), receipt(0x01))]),
			operation_type: OperationType::SwapAndBridge,
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	fn quote_with_slippage(from_amount: U256, dbps: u64) -> SwapQuote {
		// from USDC (6 dec) to WETH (18 dec) at a flat 1:1 test rate, less
		// the given slippage.
		let from_18 = from_amount * U256::from(10u64).pow(U256::from(12));
		let to_amount =
			from_18 - from_18 * U256::from(dbps) / U256::from(10_000_000u64);
		SwapQuote {
			quote_id: "q-fresh".to_string(),
			from_symbol: "USDC".to_string(),
			to_symbol: "WETH".to_string(),
			from_amount,
			to_amount,
			rate: U256::from(10u64).pow(U256::from(18)),
			valid_until: Utc::now(),
		}
	}

	#[tokio::test]
	async fn budget_breach_fails_the_swap_and_enters_recovery() {
		let settings = new_test_settings();
		let store = MemoryStore::new();

		let parent = swap_parent();
		store.insert_operation(parent.clone()).await;
		// Planned with 200 dBps on the bridge leg and a 500 dBps total
		// budget; the fresh quote shows 400 dBps on the swap alone.
		store
			.insert_swap(swap_operation_row(parent.id, SwapStatus::DepositConfirmed, 200, 500))
			.await;

		let mut adapter = MockBridgeAdapter::new();
		adapter.expect_kind().return_const(BridgeKind::Binance);
		let mut swap_adapter = MockSwapAdapter::new();
		swap_adapter
			.expect_swap_quote()
			.times(1)
			.returning(|_, _, amount| Ok(quote_with_slippage(amount, 400)));
		swap_adapter.expect_execute_swap().times(0);

		let mut registry = BridgeRegistry::new();
		registry.register(Arc::new(adapter));
		registry.register_swap(BridgeKind::Binance, Arc::new(swap_adapter));

		advance_swap(
			&settings,
			&registry,
			&ChainServices::new(),
			&store,
			&parent,
			BridgeKind::Binance,
		)
		.await
		.unwrap();

		let swap = &store.swaps().await[0];
		assert_eq!(swap.status, SwapStatus::Recovering);
		assert_eq!(swap.metadata["failure_reason"], BUDGET_BREACH_REASON);
		assert_eq!(swap.metadata["estimated_total_dbps"], 600);
	}

	#[tokio::test]
	async fn a_swap_inside_budget_executes_and_completes_the_parent() {
		let settings = new_test_settings();
		let store = MemoryStore::new();

		let parent = swap_parent();
		store.insert_operation(parent.clone()).await;
		store
			.insert_swap(swap_operation_row(parent.id, SwapStatus::DepositConfirmed, 200, 500))
			.await;

		let mut adapter = MockBridgeAdapter::new();
		adapter.expect_kind().return_const(BridgeKind::Binance);
		// The withdrawal needs no on-chain finishing transaction here.
		adapter.expect_destination_callback().times(1).returning(|_, _| Ok(None));

		let mut swap_adapter = MockSwapAdapter::new();
		swap_adapter
			.expect_swap_quote()
			.times(1)
			.returning(|_, _, amount| Ok(quote_with_slippage(amount, 100)));
		swap_adapter.expect_execute_swap().times(1).returning(|_| {
			Ok(SwapExecution {
				order_id: "order-7".to_string(),
				status: SwapExecutionStatus::Pending,
			})
		});
		swap_adapter
			.expect_swap_status()
			.times(1)
			.returning(|_| Ok(SwapExecutionStatus::Success));

		let mut registry = BridgeRegistry::new();
		registry.register(Arc::new(adapter));
		registry.register_swap(BridgeKind::Binance, Arc::new(swap_adapter));

		advance_swap(
			&settings,
			&registry,
			&ChainServices::new(),
			&store,
			&parent,
			BridgeKind::Binance,
		)
		.await
		.unwrap();

		let swap = &store.swaps().await[0];
		assert_eq!(swap.status, SwapStatus::Completed);
		assert_eq!(swap.order_id.as_deref(), Some("order-7"));
		assert_eq!(
			store.operations().await[0].status,
			RebalanceOperationStatus::Completed
		);
	}

	#[tokio::test]
	async fn an_unconfirmed_deposit_leaves_the_swap_untouched() {
		let settings = new_test_settings();
		let store = MemoryStore::new();

		let parent = swap_parent();
		store.insert_operation(parent.clone()).await;
		store
			.insert_swap(swap_operation_row(parent.id, SwapStatus::PendingDeposit, 200, 500))
			.await;

		let mut adapter = MockBridgeAdapter::new();
		adapter.expect_kind().return_const(BridgeKind::Binance);
		adapter.expect_ready_on_destination().times(1).returning(|_, _, _| Ok(false));
		let mut swap_adapter = MockSwapAdapter::new();
		swap_adapter.expect_swap_quote().times(0);

		let mut registry = BridgeRegistry::new();
		registry.register(Arc::new(adapter));
		registry.register_swap(BridgeKind::Binance, Arc::new(swap_adapter));

		advance_swap(
			&settings,
			&registry,
			&ChainServices::new(),
			&store,
			&parent,
			BridgeKind::Binance,
		)
		.await
		.unwrap();

		assert_eq!(store.swaps().await[0].status, SwapStatus::PendingDeposit);
	}

	#[tokio::test]
	async fn recovery_withdraws_the_original_asset_and_fails_the_parent() {
		let settings = new_test_settings();
		let store = MemoryStore::new();

		let parent = swap_parent();
		store.insert_operation(parent.clone()).await;
		store
			.insert_swap(swap_operation_row(parent.id, SwapStatus::Recovering, 200, 500))
			.await;

		let mut adapter = MockBridgeAdapter::new();
		adapter.expect_kind().return_const(BridgeKind::Binance);
		// Recovery withdraws back to the origin chain.
		adapter
			.expect_destination_callback()
			.times(1)
			.withf(|route, _| route.destination == ChainId(10))
			.returning(|_, _| {
				Ok(Some(crate::bridge::MemoTx {
					memo: crate::bridge::TxMemo::Rebalance,
					tx: crate::chain::TxRequest::new(
						Address::repeat_byte(0xee),
						U256::zero(),
						vec![].into(),
					),
					effective_amount: None,
				}))
			});
		let swap_adapter = MockSwapAdapter::new();

		let mut origin = MockChainService::new();
		origin.expect_chain_id().return_const(ChainId(10));
		origin.expect_owner().return_const(Address::repeat_byte(0x11));
		origin.expect_submit_and_monitor().times(1).returning(|_| Ok(receipt(0x0e)));
		let mut chains = ChainServices::new();
		chains.insert(Arc::new(origin));

		let mut registry = BridgeRegistry::new();
		registry.register(Arc::new(adapter));
		registry.register_swap(BridgeKind::Binance, Arc::new(swap_adapter));

		advance_swap(&settings, &registry, &chains, &store, &parent, BridgeKind::Binance)
			.await
			.unwrap();

		let swap = &store.swaps().await[0];
		assert_eq!(swap.status, SwapStatus::Failed);
		assert_eq!(swap.metadata["recovered"], true);
		assert_eq!(store.operations().await[0].status, RebalanceOperationStatus::Failed);
	}
}
