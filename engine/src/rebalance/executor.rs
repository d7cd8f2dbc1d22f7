//! On-demand plan execution.
//!
//! The executor first claims the invoice's reservation by inserting an
//! INITIATING earmark; the partial unique index makes that claim the
//! cross-process lock, so a concurrent executor loses before it reaches an
//! adapter. Operations are then submitted in the planner's order, and all
//! database rows that record on-chain side effects are written only after
//! their receipts are confirmed.

use std::collections::HashMap;

use anyhow::Context;
use ethers::types::TransactionReceipt;
use thiserror::Error;
use uuid::Uuid;

use mark_primitives::{amounts::to_native, Amount, U256};

use crate::{
	bridge::{
		retry::with_retries, BridgeError, BridgeRegistry, SwapAdapter, TxMemo,
	},
	chain::ChainServices,
	db::{
		EarmarkStatus, NewEarmark, NewRebalanceOperation, NewSwapOperation, OperationType,
		Store, StoreError,
	},
	hub::Invoice,
	metrics::REBALANCE_OPERATIONS,
	settings::Settings,
};

use super::planner::{DestinationPlan, PlannedOperation};

#[derive(Debug, Error)]
pub enum ExecutorError {
	#[error("daily withdrawal quota exceeded: {amount_usd} USD needed, {remaining_usd} USD left")]
	QuotaExceeded { amount_usd: u64, remaining_usd: u64 },
	#[error(transparent)]
	Bridge(#[from] BridgeError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

/// An executed operation waiting to be recorded: the confirmed origin
/// receipt plus the row data derived from it.
struct ExecutedOperation {
	row: NewRebalanceOperation,
	swap: Option<NewSwapOperation>,
}

/// Executes a destination plan for an invoice. Returns the id of the
/// PENDING earmark on full success; `None` when nothing usable was
/// reserved (the caller re-plans on a later attempt).
pub async fn execute_plan<S: Store>(
	settings: &Settings,
	registry: &BridgeRegistry,
	chains: &ChainServices,
	store: &S,
	invoice: &Invoice,
	plan: &DestinationPlan,
) -> Result<Option<Uuid>, ExecutorError> {
	// Idempotent fast path: a live reservation means a previous call (or a
	// concurrent one) already did the work.
	if let Some(existing) = store.get_active_earmark_for_invoice(&invoice.intent_id).await? {
		tracing::debug!(
			invoice_id = %invoice.intent_id,
			earmark_id = %existing.id,
			"active earmark already present, skipping execution"
		);
		return Ok(Some(existing.id))
	}

	let earmark = match store
		.create_earmark(
			NewEarmark {
				invoice_id: invoice.intent_id.clone(),
				designated_purchase_chain: plan.destination,
				ticker_hash: plan.ticker_hash,
				min_amount: plan.total_amount,
			},
			EarmarkStatus::Initiating,
		)
		.await
	{
		Ok(earmark) => earmark,
		Err(StoreError::ActiveEarmarkExists(_)) => {
			// A concurrent executor won the claim; no transactions were
			// submitted here.
			let existing =
				store.get_active_earmark_for_invoice(&invoice.intent_id).await?;
			return Ok(match existing {
				Some(earmark) if earmark.status == EarmarkStatus::Pending => Some(earmark.id),
				_ => None,
			})
		},
		Err(e) => return Err(e.into()),
	};

	let planned = plan.operations.len();
	let mut executed: Vec<ExecutedOperation> = Vec::with_capacity(planned);
	for operation in &plan.operations {
		match execute_operation(settings, registry, chains, earmark.id, operation).await {
			Ok(done) => executed.push(done),
			Err(error) => {
				// Carry whatever already completed; later operations still
				// get their chance.
				tracing::error!(
					invoice_id = %invoice.intent_id,
					route = %operation.route,
					bridge = %operation.bridge,
					%error,
					"rebalance operation failed"
				);
				continue
			},
		}
	}

	record_execution(store, &invoice.intent_id, earmark.id, planned, executed).await
}

/// Persists the execution result. Confirmed submissions whose rows cannot
/// be written are unrecoverable (on-chain rollback is impossible) and only
/// logged.
async fn record_execution<S: Store>(
	store: &S,
	invoice_id: &str,
	earmark_id: Uuid,
	planned: usize,
	executed: Vec<ExecutedOperation>,
) -> Result<Option<Uuid>, ExecutorError> {
	let all_succeeded = executed.len() == planned;
	let earmark_status =
		if all_succeeded { EarmarkStatus::Pending } else { EarmarkStatus::Failed };

	if executed.is_empty() {
		store.update_earmark_status(earmark_id, EarmarkStatus::Failed).await?;
		return Ok(None)
	}

	let (rows, swaps): (Vec<_>, Vec<_>) =
		executed.into_iter().map(|e| (e.row, e.swap)).unzip();

	let created = match store
		.create_operations_for_earmark(earmark_id, earmark_status, rows)
		.await
	{
		Ok(created) => created,
		Err(error) => {
			tracing::error!(
				invoice_id,
				%earmark_id,
				%error,
				"confirmed on-chain submissions could not be recorded; \
				 manual reconciliation required"
			);
			return Ok(None)
		},
	};

	for (operation, swap) in created.iter().zip(swaps) {
		REBALANCE_OPERATIONS
			.with_label_values(&[operation.bridge.as_str(), operation.status.as_str()])
			.inc();
		let Some(mut swap) = swap else { continue };
		swap.rebalance_operation_id = operation.id;
		if let Err(error) = store.create_swap_operation(swap).await {
			tracing::error!(
				invoice_id,
				operation_id = %operation.id,
				%error,
				"swap leg could not be recorded; manual reconciliation required"
			);
		}
	}

	Ok(if all_succeeded { Some(earmark_id) } else { None })
}

async fn execute_operation(
	settings: &Settings,
	registry: &BridgeRegistry,
	chains: &ChainServices,
	earmark_id: Uuid,
	operation: &PlannedOperation,
) -> Result<ExecutedOperation, ExecutorError> {
	let route = operation.route;
	let adapter = registry.get(operation.bridge)?;
	let origin = chains.get(route.origin)?;
	let sender = origin.owner();
	let recipient = chains.get(route.destination)?.owner();

	let origin_asset = settings
		.asset_by_address(route.origin, route.asset)
		.context("origin asset missing from settings")?;
	let amount_native = to_native(operation.amount, origin_asset.decimals);

	if operation.bridge.is_cex() {
		let swap_adapter = registry
			.swap(operation.bridge)
			.ok_or(BridgeError::AdapterUnavailable(operation.bridge))?;
		check_withdraw_quota(
			swap_adapter.as_ref(),
			amount_native,
			&origin_asset.symbol,
			origin_asset.decimals,
		)
		.await?;
	}

	// `send` only builds transactions, so the retry wrapper cannot
	// double-submit.
	let memo_txs = with_retries("adapter send", || {
		adapter.send(sender, recipient, amount_native, &route)
	})
	.await?;

	let mut origin_receipt: Option<TransactionReceipt> = None;
	let mut effective_amount = amount_native;
	for memo_tx in memo_txs {
		let receipt = origin
			.submit_and_monitor(memo_tx.tx.clone())
			.await
			.with_context(|| format!("submitting {:?} transaction", memo_tx.memo))?;
		if memo_tx.memo == TxMemo::Rebalance {
			if let Some(effective) = memo_tx.effective_amount {
				effective_amount = effective;
			}
			origin_receipt = Some(receipt);
		}
	}

	let origin_receipt = origin_receipt
		.context("adapter returned no Rebalance transaction for the origin")?;

	let ticker_hash = origin_asset.ticker_hash;
	let row = NewRebalanceOperation {
		earmark_id: Some(earmark_id),
		origin_chain_id: route.origin,
		destination_chain_id: route.destination,
		ticker_hash,
		amount: effective_amount,
		slippage: operation.slippage_budget,
		bridge: operation.bridge.as_str().to_string(),
		recipient,
		transactions: HashMap::from([(route.origin, origin_receipt)]),
		operation_type: if operation.swap.is_some() {
			OperationType::SwapAndBridge
		} else {
			OperationType::Bridge
		},
	};

	let swap = operation.swap.as_ref().map(|planned| NewSwapOperation {
		// Patched to the real row id once the operation is recorded.
		rebalance_operation_id: Uuid::nil(),
		platform: planned.platform.as_str().to_string(),
		from_asset: planned.from_symbol.clone(),
		to_asset: planned.to_symbol.clone(),
		from_amount: planned.expected_from_native,
		to_amount: planned.expected_to_native,
		expected_rate: planned.expected_rate,
		metadata: serde_json::json!({
			"observed_swap_dbps": planned.observed_swap_dbps,
			"observed_bridge_dbps": planned.observed_bridge_dbps,
			"total_budget_dbps": planned.total_budget_dbps,
		}),
	});

	Ok(ExecutedOperation { row, swap })
}

/// Advisory CEX daily-quota check. The USD conversion uses the venue's
/// last-trade price and floors to whole dollars; the venue's own
/// validation remains the final authority.
pub async fn check_withdraw_quota(
	swap_adapter: &dyn SwapAdapter,
	amount_native: U256,
	symbol: &str,
	decimals: u8,
) -> Result<(), ExecutorError> {
	let quota = with_retries("withdraw quota", || swap_adapter.withdraw_quota()).await?;
	let price =
		with_retries("price ticker", || swap_adapter.last_trade_price_usd(symbol)).await?;

	let units = amount_native.to_string().parse::<f64>().unwrap_or(f64::MAX) /
		10f64.powi(i32::from(decimals));
	let amount_usd = (units * price).floor().max(0.0) as u64;

	let remaining_usd = quota.remaining_usd();
	if amount_usd > remaining_usd {
		return Err(ExecutorError::QuotaExceeded { amount_usd, remaining_usd })
	}
	Ok(())
}

/// Executes the extra operations planned for a min-amount increase and
/// lifts the earmark's recorded requirement. The earmark stays PENDING.
/// Returns `false` when any operation failed (the caller decides whether
/// the earmark is still viable).
pub async fn execute_increase<S: Store>(
	settings: &Settings,
	registry: &BridgeRegistry,
	chains: &ChainServices,
	store: &S,
	earmark_id: Uuid,
	plan: &DestinationPlan,
	new_min_amount: Amount,
) -> Result<bool, ExecutorError> {
	let planned = plan.operations.len();
	let mut executed = Vec::with_capacity(planned);
	for operation in &plan.operations {
		match execute_operation(settings, registry, chains, earmark_id, operation).await {
			Ok(done) => executed.push(done),
			Err(error) => {
				tracing::error!(
					%earmark_id,
					route = %operation.route,
					bridge = %operation.bridge,
					%error,
					"min-amount increase operation failed"
				);
				continue
			},
		}
	}

	let all_succeeded = executed.len() == planned;
	if !executed.is_empty() {
		let (rows, swaps): (Vec<_>, Vec<_>) =
			executed.into_iter().map(|e| (e.row, e.swap)).unzip();
		let created = store
			.create_operations_for_earmark(earmark_id, EarmarkStatus::Pending, rows)
			.await?;
		for (operation, swap) in created.iter().zip(swaps) {
			let Some(mut swap) = swap else { continue };
			swap.rebalance_operation_id = operation.id;
			if let Err(error) = store.create_swap_operation(swap).await {
				tracing::error!(
					operation_id = %operation.id,
					%error,
					"swap leg could not be recorded; manual reconciliation required"
				);
			}
		}
	}

	if all_succeeded {
		store.update_earmark_min_amount(earmark_id, new_min_amount).await?;
	}
	Ok(all_succeeded)
}
