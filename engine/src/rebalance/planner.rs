//! On-demand rebalance planning.
//!
//! Given an invoice and the hub's per-destination requirements, decides
//! which destination to fund and which bridge operations to run. The
//! planner only quotes; it persists nothing and submits nothing.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use mark_primitives::{
	amounts::{
		gross_up_for_slippage, pow10, slippage_dbps, to_eighteen, to_native,
		EIGHTEEN_DECIMALS,
	},
	Amount, ChainId, Dbps, Route, TickerHash, U256,
};

use crate::{
	bridge::{retry::with_retries, BridgeError, BridgeKind, BridgeRegistry},
	hub::Invoice,
	settings::{AssetConfig, RouteConfig, Settings},
};

/// Available (un-earmarked) balance per ticker per chain, 18-dec units.
pub type AvailableSheet = HashMap<TickerHash, HashMap<ChainId, Amount>>;

/// Swap metadata attached to a planned operation on a CEX route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedSwap {
	pub platform: BridgeKind,
	pub from_symbol: String,
	pub to_symbol: String,
	/// Native units of the respective assets.
	pub expected_from_native: U256,
	pub expected_to_native: U256,
	/// Units of `to` per unit of `from`, scaled by 1e18.
	pub expected_rate: U256,
	pub observed_swap_dbps: Dbps,
	pub observed_bridge_dbps: Dbps,
	pub total_budget_dbps: Dbps,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOperation {
	pub route: Route,
	pub bridge: BridgeKind,
	pub slippage_budget: Dbps,
	/// 18-decimal amount leaving the origin (in the origin asset).
	pub amount: Amount,
	/// 18-decimal amount the quotes promise on the destination.
	pub expected_received: Amount,
	pub swap: Option<PlannedSwap>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DestinationPlan {
	pub destination: ChainId,
	pub ticker_hash: TickerHash,
	pub operations: Vec<PlannedOperation>,
	/// The destination's full requirement, not just the moved part.
	pub total_amount: Amount,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
	/// Some destination already holds enough; nothing to move.
	SelfSufficient(ChainId),
	Plan(DestinationPlan),
	/// No destination can be made whole under the configured budgets.
	Infeasible,
}

fn available_for(sheet: &AvailableSheet, ticker_hash: TickerHash, chain: ChainId) -> Amount {
	sheet
		.get(&ticker_hash)
		.and_then(|by_chain| by_chain.get(&chain))
		.copied()
		.unwrap_or_default()
}

/// The ticker a route delivers on its destination: the destination asset's
/// family on swap routes, the origin asset's family otherwise.
fn delivered_ticker(settings: &Settings, route: &RouteConfig) -> Option<TickerHash> {
	match route.destination_asset {
		Some(address) =>
			settings.asset_by_address(route.destination, address).map(|a| a.ticker_hash),
		None => settings.asset_by_address(route.origin, route.asset).map(|a| a.ticker_hash),
	}
}

/// Evaluates every candidate destination of the invoice and picks the one
/// needing the fewest operations, breaking ties on the smaller total.
pub async fn plan_rebalance(
	settings: &Settings,
	registry: &BridgeRegistry,
	invoice: &Invoice,
	min_amounts: &HashMap<ChainId, Amount>,
	available: &AvailableSheet,
) -> Result<PlanOutcome> {
	let mut candidates: Vec<DestinationPlan> = Vec::new();

	for destination in &invoice.destinations {
		let Some(need) = min_amounts.get(destination).copied() else { continue };
		let have = available_for(available, invoice.ticker_hash, *destination);
		if have >= need {
			return Ok(PlanOutcome::SelfSufficient(*destination))
		}

		if let Some(plan) = plan_shortfall_for_destination(
			settings,
			registry,
			invoice.ticker_hash,
			*destination,
			need,
			need - have,
			available,
		)
		.await?
		{
			candidates.push(plan);
		}
	}

	candidates.sort_by_key(|plan| (plan.operations.len(), plan.total_amount));
	Ok(match candidates.into_iter().next() {
		Some(plan) => PlanOutcome::Plan(plan),
		None => PlanOutcome::Infeasible,
	})
}

/// Plans operations covering `shortfall` towards a single destination.
/// Routes are walked in order of descending usable origin balance to keep
/// the operation count down; within a route, preferences are walked in
/// configured order and the first one inside its slippage budget wins.
///
/// Also the entry point for the min-amount-increase sub-flow, which
/// re-plans only the increment for the earmark's designated chain.
pub async fn plan_shortfall_for_destination(
	settings: &Settings,
	registry: &BridgeRegistry,
	ticker_hash: TickerHash,
	destination: ChainId,
	need: Amount,
	shortfall: Amount,
	available: &AvailableSheet,
) -> Result<Option<DestinationPlan>> {
	let Some(dest_asset) = settings.asset(destination, ticker_hash) else {
		return Ok(None)
	};
	// One native unit on the destination absorbs conversion rounding.
	let tolerance = pow10(EIGHTEEN_DECIMALS - dest_asset.decimals.min(EIGHTEEN_DECIMALS));

	let origin_asset_of = |route: &RouteConfig| {
		settings.asset_by_address(route.origin, route.asset)
	};
	let usable = |route: &RouteConfig| {
		origin_asset_of(route)
			.map(|asset| {
				available_for(available, asset.ticker_hash, route.origin)
					.saturating_sub(route.reserve)
			})
			.unwrap_or_default()
	};

	let mut routes: Vec<&RouteConfig> = settings
		.routes
		.iter()
		.filter(|r| r.destination == destination)
		.filter(|r| delivered_ticker(settings, r) == Some(ticker_hash))
		.collect();
	routes.sort_by(|a, b| usable(b).cmp(&usable(a)));

	let mut remaining = shortfall;
	let mut operations: Vec<PlannedOperation> = Vec::new();

	for route_config in routes {
		if remaining <= tolerance {
			break
		}
		let usable_origin = usable(route_config);
		if usable_origin.is_zero() {
			continue
		}
		// Route filtering guarantees the origin asset resolves.
		let Some(origin_asset) = origin_asset_of(route_config) else { continue };

		for (index, kind) in route_config.preferences.iter().enumerate() {
			let Some(budget) = route_config.slippage_for(index) else { continue };
			let evaluated = if route_config.destination_asset.is_some() {
				evaluate_swap_route(
					settings,
					registry,
					route_config,
					*kind,
					budget,
					origin_asset,
					usable_origin,
					dest_asset,
				)
				.await
			} else {
				evaluate_bridge_route(
					registry,
					route_config,
					*kind,
					budget,
					origin_asset,
					usable_origin,
					dest_asset,
					remaining,
				)
				.await
			};

			match evaluated {
				Ok(Some(operation)) => {
					remaining = remaining.saturating_sub(operation.expected_received);
					operations.push(operation);
					break
				},
				Ok(None) => continue,
				Err(error) if error.is_transient() => {
					// Retries inside the adapter layer are exhausted; this
					// preference may recover later, but planning moves on.
					tracing::warn!(
						route = %route_config.route(),
						bridge = %kind,
						%error,
						"quote unavailable, advancing to next preference"
					);
					continue
				},
				Err(error) => {
					tracing::debug!(
						route = %route_config.route(),
						bridge = %kind,
						%error,
						"preference rejected"
					);
					continue
				},
			}
		}
	}

	if remaining <= tolerance && !operations.is_empty() {
		Ok(Some(DestinationPlan {
			destination,
			ticker_hash,
			operations,
			total_amount: need,
		}))
	} else {
		Ok(None)
	}
}

async fn evaluate_bridge_route(
	registry: &BridgeRegistry,
	route_config: &RouteConfig,
	kind: BridgeKind,
	budget: Dbps,
	origin_asset: &AssetConfig,
	usable_origin: Amount,
	dest_asset: &AssetConfig,
	shortfall: Amount,
) -> Result<Option<PlannedOperation>, BridgeError> {
	let adapter = registry.get(kind)?;
	let route = route_config.route();

	// Gross the shortfall up so the budgeted slippage still lands enough,
	// capped by what the origin actually holds.
	let send = gross_up_for_slippage(shortfall, budget)
		.map_err(|e| BridgeError::InvalidRequest(e.to_string()))?
		.min(usable_origin);
	let send_native = to_native(send, origin_asset.decimals);
	if send_native.is_zero() {
		return Ok(None)
	}
	// Truncation to native units is part of what actually leaves.
	let send_effective = to_eighteen(send_native, origin_asset.decimals);

	let received_native =
		with_retries("bridge quote", || adapter.quote(send_native, &route)).await?;
	let received = to_eighteen(received_native, dest_asset.decimals);

	let observed = slippage_dbps(send_effective, received);
	if observed > budget {
		tracing::debug!(
			route = %route,
			bridge = %kind,
			observed,
			budget,
			"quote outside the slippage budget"
		);
		return Ok(None)
	}

	Ok(Some(PlannedOperation {
		route,
		bridge: kind,
		slippage_budget: budget,
		amount: send_effective,
		expected_received: received,
		swap: None,
	}))
}

async fn evaluate_swap_route(
	settings: &Settings,
	registry: &BridgeRegistry,
	route_config: &RouteConfig,
	kind: BridgeKind,
	budget: Dbps,
	origin_asset: &AssetConfig,
	usable_origin: Amount,
	dest_asset: &AssetConfig,
) -> Result<Option<PlannedOperation>, BridgeError> {
	let adapter = registry.get(kind)?;
	let Some(swap_adapter) = registry.swap(kind) else { return Ok(None) };
	let route = route_config.route();

	// The route's destination asset is the invoice ticker's asset on the
	// destination chain; sanity-checked here because configs are external.
	if route_config
		.destination_asset
		.and_then(|address| settings.asset_by_address(route_config.destination, address))
		.map(|a| a.ticker_hash) !=
		Some(dest_asset.ticker_hash)
	{
		return Ok(None)
	}

	let from_symbol = origin_asset.symbol.as_str();
	let to_symbol = dest_asset.symbol.as_str();
	if !swap_adapter.supports_swap(from_symbol, to_symbol) {
		return Ok(None)
	}

	let limits = with_retries("swap exchange info", || {
		swap_adapter.swap_exchange_info(from_symbol, to_symbol)
	})
	.await?;

	let available_native = to_native(usable_origin, origin_asset.decimals);
	// Doubling the venue minimum leaves room for withdrawal fees.
	let minimum = route_config
		.min_swap_amount
		.unwrap_or_default()
		.max(limits.min_native * U256::from(2));
	if available_native < minimum {
		tracing::debug!(
			route = %route,
			bridge = %kind,
			%available_native,
			%minimum,
			"origin balance below the swap minimum gate"
		);
		return Ok(None)
	}

	// Swap the full available balance, then quote the withdrawal leg on the
	// swap's output.
	let quote = with_retries("swap quote", || {
		swap_adapter.swap_quote(from_symbol, to_symbol, available_native)
	})
	.await?;
	let bridged_native =
		with_retries("bridge quote", || adapter.quote(quote.to_amount, &route)).await?;

	let available_18 = to_eighteen(available_native, origin_asset.decimals);
	let swap_out_18 = to_eighteen(quote.to_amount, dest_asset.decimals);
	let bridged_18 = to_eighteen(bridged_native, dest_asset.decimals);

	let observed_swap = slippage_dbps(available_18, swap_out_18);
	let observed_bridge = slippage_dbps(swap_out_18, bridged_18);
	let combined = slippage_dbps(available_18, bridged_18);
	if combined > budget {
		tracing::debug!(
			route = %route,
			bridge = %kind,
			combined,
			budget,
			"combined swap and bridge slippage outside the budget"
		);
		return Ok(None)
	}

	Ok(Some(PlannedOperation {
		route,
		bridge: kind,
		slippage_budget: budget,
		amount: available_18,
		expected_received: bridged_18,
		swap: Some(PlannedSwap {
			platform: kind,
			from_symbol: from_symbol.to_string(),
			to_symbol: to_symbol.to_string(),
			expected_from_native: available_native,
			expected_to_native: quote.to_amount,
			expected_rate: quote.rate,
			observed_swap_dbps: observed_swap,
			observed_bridge_dbps: observed_bridge,
			total_budget_dbps: budget,
		}),
	}))
}
