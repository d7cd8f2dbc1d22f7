//! Per-event processing: validate the invoice, reconcile its earmark,
//! rebalance when the destination is short, then purchase through the hub.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use chrono::Utc;

use mark_primitives::{Amount, ChainId};

use crate::{
	bridge::BridgeRegistry,
	cache::{PurchaseCache, PurchaseRecord},
	chain::ChainServices,
	constants::{
		EARMARK_IN_FLIGHT_RETRY, MAX_INVOICE_AGE, NO_PURCHASE_RETRY,
		TRANSIENT_FAILURE_RETRY,
	},
	db::{EarmarkStatus, Store},
	hub::{HubApi, HubError, Invoice, SettlementStrategy},
	metrics::PURCHASE_CLEARANCE_DURATION,
	rebalance::{
		balances::{available_balances, mark_balances},
		executor::{execute_increase, execute_plan},
		planner::{
			plan_rebalance, plan_shortfall_for_destination, AvailableSheet, PlanOutcome,
		},
	},
	settings::Settings,
};

use super::{EventOutcome, EventType, QueueEvent};

pub struct EventProcessor<S, C, H> {
	settings: Arc<Settings>,
	registry: Arc<BridgeRegistry>,
	chains: ChainServices,
	store: Arc<S>,
	cache: Arc<C>,
	hub: Arc<H>,
}

impl<S, C, H> Clone for EventProcessor<S, C, H> {
	fn clone(&self) -> Self {
		Self {
			settings: self.settings.clone(),
			registry: self.registry.clone(),
			chains: self.chains.clone(),
			store: self.store.clone(),
			cache: self.cache.clone(),
			hub: self.hub.clone(),
		}
	}
}

fn hub_outcome(error: HubError) -> EventOutcome {
	if error.is_transient() {
		EventOutcome::Failure(TRANSIENT_FAILURE_RETRY)
	} else {
		EventOutcome::Invalid(error.to_string())
	}
}

impl<S: Store, C: PurchaseCache, H: HubApi> EventProcessor<S, C, H> {
	pub fn new(
		settings: Arc<Settings>,
		registry: Arc<BridgeRegistry>,
		chains: ChainServices,
		store: Arc<S>,
		cache: Arc<C>,
		hub: Arc<H>,
	) -> Self {
		Self { settings, registry, chains, store, cache, hub }
	}

	pub async fn process(&self, event: &QueueEvent) -> EventOutcome {
		match event.event_type {
			EventType::InvoiceEnqueued => self.process_invoice(&event.id).await,
			EventType::SettlementEnqueued => self.process_settlement(&event.id).await,
		}
	}

	async fn process_invoice(&self, invoice_id: &str) -> EventOutcome {
		let invoice = match self.hub.get_invoice(invoice_id).await {
			Ok(Some(invoice)) => invoice,
			Ok(None) => {
				// The hub forgot the invoice; release anything reserved.
				if let Err(error) =
					self.cleanup_stale_earmarks(&[invoice_id.to_string()]).await
				{
					tracing::error!(invoice_id, %error, "stale earmark cleanup failed");
					return EventOutcome::Failure(TRANSIENT_FAILURE_RETRY)
				}
				return EventOutcome::Success
			},
			Err(error) => return hub_outcome(error),
		};

		if let Some(reason) = self.validate_invoice(&invoice) {
			return EventOutcome::Invalid(reason)
		}

		// XERC20-settled destinations are handled by a different strategy
		// entirely; the economy fetch also yields custodied amounts for the
		// purchase split.
		let mut economies = HashMap::new();
		for destination in self.supported_destinations(&invoice) {
			match self.hub.get_economy(destination, invoice.ticker_hash).await {
				Ok(economy) => {
					if economy.strategy == SettlementStrategy::Xerc20 {
						return EventOutcome::Invalid(format!(
							"destination {destination} settles via XERC20"
						))
					}
					economies.insert(destination, economy);
				},
				Err(error) => return hub_outcome(error),
			}
		}

		let mut min_amounts = match self.hub.get_min_amounts(invoice_id).await {
			Ok(min_amounts) => min_amounts,
			Err(error) => return hub_outcome(error),
		};

		match self.reconcile_earmark(&invoice, &mut min_amounts).await {
			Ok(Some(outcome)) => return outcome,
			Ok(None) => {},
			Err(error) => {
				tracing::error!(invoice_id, %error, "earmark reconciliation failed");
				return EventOutcome::Failure(TRANSIENT_FAILURE_RETRY)
			},
		}

		match self.cache.is_purchase_paused().await {
			Ok(false) => {},
			Ok(true) => {
				tracing::info!(invoice_id, "purchasing is paused");
				return EventOutcome::Failure(TRANSIENT_FAILURE_RETRY)
			},
			Err(error) => {
				tracing::error!(invoice_id, %error, "pause flag unavailable");
				return EventOutcome::Failure(TRANSIENT_FAILURE_RETRY)
			},
		}

		match self.cache.get_purchases(invoice_id).await {
			Ok(Some(_)) => {
				tracing::debug!(invoice_id, "purchase already cached, nothing to do");
				return EventOutcome::Success
			},
			Ok(None) => {},
			Err(error) => {
				tracing::error!(invoice_id, %error, "purchase cache unavailable");
				return EventOutcome::Failure(TRANSIENT_FAILURE_RETRY)
			},
		}

		let sheet = match mark_balances(&self.settings, &self.chains).await {
			Ok(sheet) => sheet,
			Err(error) => {
				tracing::error!(invoice_id, %error, "balance read failed");
				return EventOutcome::Failure(TRANSIENT_FAILURE_RETRY)
			},
		};
		let balances = sheet.get(&invoice.ticker_hash).cloned().unwrap_or_default();
		let custodied: HashMap<ChainId, Amount> = economies
			.iter()
			.map(|(chain, economy)| {
				(*chain, economy.custodied_amount + economy.incoming_amount)
			})
			.collect();

		let purchases = match self
			.hub
			.split_and_send_intents(invoice.clone(), balances, custodied, min_amounts)
			.await
		{
			Ok(purchases) => purchases,
			Err(error) => return hub_outcome(error),
		};

		if purchases.is_empty() {
			tracing::debug!(invoice_id, "no purchases created, deferring");
			return EventOutcome::Failure(NO_PURCHASE_RETRY)
		}

		let records: Vec<PurchaseRecord> = purchases
			.into_iter()
			.map(|purchase| PurchaseRecord {
				invoice_id: invoice_id.to_string(),
				purchase_intent: purchase.purchase_intent,
				transaction_hash: purchase.transaction_hash,
				transaction_type: purchase.transaction_type,
				destination: purchase.destination,
				hub_invoice_enqueued_timestamp: invoice.hub_invoice_enqueued_timestamp,
				cached_at: Utc::now(),
			})
			.collect();
		if let Err(error) = self.cache.add_purchases(invoice_id, records).await {
			tracing::warn!(invoice_id, %error, "purchases submitted but not cached");
		}
		if let Err(error) =
			self.cleanup_completed_earmarks(&[invoice_id.to_string()]).await
		{
			tracing::warn!(invoice_id, %error, "completed earmark cleanup failed");
		}

		EventOutcome::Success
	}

	/// Settlement closes the book on an invoice: observe how long the
	/// purchase took to clear and drop its cached record. Always succeeds.
	async fn process_settlement(&self, invoice_id: &str) -> EventOutcome {
		match self.cache.get_purchases(invoice_id).await {
			Ok(Some(records)) => {
				let now = Utc::now().timestamp().max(0) as u64;
				for record in &records {
					let elapsed =
						now.saturating_sub(record.hub_invoice_enqueued_timestamp);
					let destination = record.destination.to_string();
					PURCHASE_CLEARANCE_DURATION
						.with_label_values(&[destination.as_str()])
						.observe(elapsed as f64);
				}
				if let Err(error) =
					self.cache.remove_purchases(&[invoice_id.to_string()]).await
				{
					tracing::warn!(invoice_id, %error, "purchase record removal failed");
				}
			},
			Ok(None) => {},
			Err(error) => {
				tracing::warn!(invoice_id, %error, "purchase cache unavailable");
			},
		}
		EventOutcome::Success
	}

	fn validate_invoice(&self, invoice: &Invoice) -> Option<String> {
		let now = Utc::now().timestamp().max(0) as u64;
		if now.saturating_sub(invoice.hub_invoice_enqueued_timestamp) > MAX_INVOICE_AGE {
			return Some("invoice is older than the purchase window".to_string())
		}

		let owned_by_us = self
			.chains
			.chain_ids()
			.filter_map(|chain| self.chains.get(chain).ok())
			.any(|service| service.owner() == invoice.owner);
		if owned_by_us {
			return Some("invoice is owned by this operator".to_string())
		}

		if self.supported_destinations(invoice).is_empty() {
			return Some("no destination supports the invoice ticker".to_string())
		}
		None
	}

	fn supported_destinations(&self, invoice: &Invoice) -> Vec<ChainId> {
		invoice
			.destinations
			.iter()
			.copied()
			.filter(|destination| {
				self.chains.contains(*destination) &&
					self.settings.supports_destination(*destination, invoice.ticker_hash)
			})
			.collect()
	}

	async fn available_sheet(&self) -> Result<AvailableSheet> {
		let sheet = mark_balances(&self.settings, &self.chains).await?;
		let mut available = AvailableSheet::new();
		for ticker in self.settings.tickers() {
			available.insert(
				ticker,
				available_balances(self.store.as_ref(), &self.settings, ticker, &sheet)
					.await?,
			);
		}
		Ok(available)
	}

	/// Earmark reconciliation. `Some(outcome)` short-circuits the event;
	/// `None` proceeds to the purchase path (possibly with `min_amounts`
	/// restricted to a READY earmark's designated chain).
	async fn reconcile_earmark(
		&self,
		invoice: &Invoice,
		min_amounts: &mut HashMap<ChainId, Amount>,
	) -> Result<Option<EventOutcome>> {
		let active =
			self.store.get_active_earmark_for_invoice(&invoice.intent_id).await?;

		match active {
			Some(earmark) if earmark.status == EarmarkStatus::Initiating =>
				Ok(Some(EventOutcome::Continue(EARMARK_IN_FLIGHT_RETRY))),

			Some(earmark) if earmark.status == EarmarkStatus::Pending => {
				let Some(current) =
					min_amounts.get(&earmark.designated_purchase_chain).copied()
				else {
					return Ok(Some(EventOutcome::Continue(EARMARK_IN_FLIGHT_RETRY)))
				};

				if current > earmark.min_amount {
					return self.handle_min_amount_increase(invoice, &earmark, current).await
				}
				if current < earmark.min_amount {
					// Repricing downwards only shrinks the reservation.
					self.store.update_earmark_min_amount(earmark.id, current).await?;
				}
				Ok(Some(EventOutcome::Continue(EARMARK_IN_FLIGHT_RETRY)))
			},

			Some(earmark) if earmark.status == EarmarkStatus::Ready => {
				// Funds were moved for this chain; purchase only there.
				min_amounts.retain(|chain, _| *chain == earmark.designated_purchase_chain);
				Ok(None)
			},

			_ => self.maybe_start_rebalance(invoice, min_amounts).await,
		}
	}

	async fn handle_min_amount_increase(
		&self,
		invoice: &Invoice,
		earmark: &crate::db::Earmark,
		current_min: Amount,
	) -> Result<Option<EventOutcome>> {
		if self.cache.is_rebalance_paused().await? {
			return Ok(Some(EventOutcome::Continue(EARMARK_IN_FLIGHT_RETRY)))
		}

		let available = self.available_sheet().await?;
		let plan = plan_shortfall_for_destination(
			&self.settings,
			&self.registry,
			earmark.ticker_hash,
			earmark.designated_purchase_chain,
			current_min,
			current_min - earmark.min_amount,
			&available,
		)
		.await?;

		match plan {
			None => {
				tracing::warn!(
					invoice_id = %invoice.intent_id,
					earmark_id = %earmark.id,
					"min amount increase is unfulfillable, cancelling the earmark"
				);
				self.store
					.update_earmark_status(earmark.id, EarmarkStatus::Cancelled)
					.await?;
				Ok(Some(EventOutcome::Failure(TRANSIENT_FAILURE_RETRY)))
			},
			Some(plan) => {
				let all_succeeded = execute_increase(
					&self.settings,
					&self.registry,
					&self.chains,
					self.store.as_ref(),
					earmark.id,
					&plan,
					current_min,
				)
				.await?;
				if !all_succeeded {
					tracing::warn!(
						invoice_id = %invoice.intent_id,
						earmark_id = %earmark.id,
						"min amount increase partially executed, retrying later"
					);
				}
				Ok(Some(EventOutcome::Continue(EARMARK_IN_FLIGHT_RETRY)))
			},
		}
	}

	async fn maybe_start_rebalance(
		&self,
		invoice: &Invoice,
		min_amounts: &HashMap<ChainId, Amount>,
	) -> Result<Option<EventOutcome>> {
		let available = self.available_sheet().await?;
		let by_chain = available.get(&invoice.ticker_hash).cloned().unwrap_or_default();

		let all_short = self.supported_destinations(invoice).iter().all(|destination| {
			match min_amounts.get(destination) {
				Some(need) =>
					by_chain.get(destination).copied().unwrap_or_default() < *need,
				None => true,
			}
		});
		if !all_short {
			return Ok(None)
		}

		if self.cache.is_rebalance_paused().await? {
			tracing::info!(invoice_id = %invoice.intent_id, "rebalancing is paused");
			return Ok(Some(EventOutcome::Failure(TRANSIENT_FAILURE_RETRY)))
		}

		match plan_rebalance(&self.settings, &self.registry, invoice, min_amounts, &available)
			.await?
		{
			PlanOutcome::SelfSufficient(_) => Ok(None),
			// Purchasing may still partially work; the split decides.
			PlanOutcome::Infeasible => Ok(None),
			PlanOutcome::Plan(plan) => {
				let earmark_id = execute_plan(
					&self.settings,
					&self.registry,
					&self.chains,
					self.store.as_ref(),
					invoice,
					&plan,
				)
				.await?;
				Ok(Some(match earmark_id {
					Some(_) => EventOutcome::Continue(EARMARK_IN_FLIGHT_RETRY),
					None => EventOutcome::Failure(TRANSIENT_FAILURE_RETRY),
				}))
			},
		}
	}

	/// CANCELs reservations whose upstream invoice no longer exists.
	/// INITIATING earmarks are left for their executor to finish.
	pub async fn cleanup_stale_earmarks(&self, invoice_ids: &[String]) -> Result<()> {
		for invoice_id in invoice_ids {
			let Some(earmark) =
				self.store.get_active_earmark_for_invoice(invoice_id).await?
			else {
				continue
			};
			if matches!(earmark.status, EarmarkStatus::Pending | EarmarkStatus::Ready) {
				self.store
					.update_earmark_status(earmark.id, EarmarkStatus::Cancelled)
					.await?;
				tracing::info!(
					invoice_id,
					earmark_id = %earmark.id,
					"cancelled earmark for a vanished invoice"
				);
			}
		}
		Ok(())
	}

	/// READY -> COMPLETED once the invoice was purchased.
	pub async fn cleanup_completed_earmarks(&self, invoice_ids: &[String]) -> Result<()> {
		for invoice_id in invoice_ids {
			let Some(earmark) =
				self.store.get_active_earmark_for_invoice(invoice_id).await?
			else {
				continue
			};
			if earmark.status == EarmarkStatus::Ready {
				self.store
					.update_earmark_status(earmark.id, EarmarkStatus::Completed)
					.await?;
			}
		}
		Ok(())
	}
}
