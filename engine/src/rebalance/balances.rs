//! Balance accounting net of reservations.
//!
//! Funds reserved by an active earmark and funds already in flight towards
//! a chain double-count the same money (once as the reservation, once as
//! the transfer feeding it), so availability subtracts the larger of the
//! two totals rather than their sum.

use std::collections::HashMap;

use anyhow::Result;
use itertools::Itertools;

use mark_primitives::{amounts::to_eighteen, Amount, ChainId, TickerHash, U256};

use crate::{
	chain::ChainServices,
	db::{
		EarmarkFilter, EarmarkStatus, OperationFilter, RebalanceOperationStatus, Store,
	},
	settings::Settings,
};

/// On-chain balances per (ticker, chain), 18-decimal units.
pub type BalanceSheet = HashMap<TickerHash, HashMap<ChainId, Amount>>;

/// Reads the owner account's balance of every configured asset.
pub async fn mark_balances(
	settings: &Settings,
	chains: &ChainServices,
) -> Result<BalanceSheet> {
	let mut sheet: BalanceSheet = HashMap::new();

	for chain_id in settings.chain_ids() {
		let Some(chain_config) = settings.chain(chain_id) else { continue };
		let service = chains.get(chain_id)?;
		for asset in &chain_config.assets {
			let native = service
				.balance_of(if asset.is_native { None } else { Some(asset.address) })
				.await?;
			sheet
				.entry(asset.ticker_hash)
				.or_default()
				.insert(chain_id, to_eighteen(native, asset.decimals));
		}
	}

	Ok(sheet)
}

/// Operation statuses whose funds are considered on their way to the
/// destination. COMPLETED stays in the set because the earmark that
/// consumes those funds is still active until the purchase lands.
const INFLIGHT_STATUSES: &[RebalanceOperationStatus] = &[
	RebalanceOperationStatus::Pending,
	RebalanceOperationStatus::AwaitingCallback,
	RebalanceOperationStatus::Completed,
];

/// Balance available for new plans per chain:
/// `mark - max(earmarked, inflight-on-demand)`.
pub async fn available_balances<S: Store>(
	store: &S,
	settings: &Settings,
	ticker_hash: TickerHash,
	sheet: &BalanceSheet,
) -> Result<HashMap<ChainId, Amount>> {
	let Some(mark) = sheet.get(&ticker_hash) else { return Ok(HashMap::new()) };

	let active_earmarks = store
		.get_earmarks(EarmarkFilter {
			statuses: Some(EarmarkStatus::ACTIVE.to_vec()),
			..Default::default()
		})
		.await?;

	let earmarked_by_chain: HashMap<ChainId, Amount> = active_earmarks
		.iter()
		.filter(|e| {
			e.ticker_hash == ticker_hash &&
				matches!(e.status, EarmarkStatus::Pending | EarmarkStatus::Ready)
		})
		.map(|e| (e.designated_purchase_chain, e.min_amount))
		.into_grouping_map()
		.fold(U256::zero(), |total, _, amount| total + amount);

	let active_ids: std::collections::HashSet<_> =
		active_earmarks.iter().map(|e| e.id).collect();

	let (operations, _) = store
		.get_rebalance_operations(
			INFLIGHT_STATUSES,
			OperationFilter { ticker_hash: Some(ticker_hash), ..Default::default() },
		)
		.await?;

	let mut inflight_by_chain: HashMap<ChainId, Amount> = HashMap::new();
	for operation in &operations {
		let Some(earmark_id) = operation.earmark_id else { continue };
		if !active_ids.contains(&earmark_id) {
			continue
		}
		let Some(decimals) = settings.decimals(operation.origin_chain_id, ticker_hash) else {
			tracing::warn!(
				operation = %operation.id,
				origin = %operation.origin_chain_id,
				"no decimals configured for in-flight operation, skipping"
			);
			continue
		};
		*inflight_by_chain.entry(operation.destination_chain_id).or_default() +=
			to_eighteen(operation.amount, decimals);
	}

	Ok(mark
		.iter()
		.map(|(chain, balance)| {
			let earmarked = earmarked_by_chain.get(chain).copied().unwrap_or_default();
			let inflight = inflight_by_chain.get(chain).copied().unwrap_or_default();
			(*chain, balance.saturating_sub(earmarked.max(inflight)))
		})
		.collect())
}
