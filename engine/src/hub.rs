//! Client for the Everclear hub REST API.
//!
//! The hub is the source of truth for invoices, their per-destination
//! minimum purchase amounts and the per-domain token economy. Purchase
//! intents are also created through it; the splitting strategy itself is
//! the hub's concern, the engine only forwards its view of balances.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use mark_primitives::{Address, Amount, ChainId, TickerHash, H256, U256};

use crate::constants::HTTP_TIMEOUT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
	pub intent_id: String,
	pub owner: Address,
	pub ticker_hash: TickerHash,
	/// Canonical 18-decimal units.
	pub amount: Amount,
	pub origin: ChainId,
	pub destinations: Vec<ChainId>,
	/// Unix seconds at which the hub enqueued the invoice.
	pub hub_invoice_enqueued_timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStrategy {
	Default,
	Xerc20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainEconomy {
	pub strategy: SettlementStrategy,
	/// Asset already custodied by the hub on this domain.
	pub custodied_amount: Amount,
	/// Asset en route from other settlers, counted before it lands.
	pub incoming_amount: Amount,
}

/// A purchase the hub created from one of our intents.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedPurchase {
	pub purchase_intent: serde_json::Value,
	pub transaction_hash: H256,
	pub transaction_type: String,
	pub destination: ChainId,
}

#[derive(Debug, Error)]
pub enum HubError {
	#[error("hub request failed: {0}")]
	Transport(String),
	#[error("hub rejected the request: {status} {body}")]
	Rejected { status: u16, body: String },
	#[error("malformed hub response: {0}")]
	Malformed(String),
}

impl HubError {
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Transport(_) => true,
			Self::Rejected { status, .. } => *status >= 500,
			Self::Malformed(_) => false,
		}
	}
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HubApi: Send + Sync {
	/// `None` when the hub no longer knows the invoice (404).
	async fn get_invoice(&self, intent_id: &str) -> Result<Option<Invoice>, HubError>;

	/// The hub's per-destination purchase requirement, 18-decimal units.
	async fn get_min_amounts(
		&self,
		intent_id: &str,
	) -> Result<HashMap<ChainId, Amount>, HubError>;

	async fn get_economy(
		&self,
		domain: ChainId,
		ticker_hash: TickerHash,
	) -> Result<DomainEconomy, HubError>;

	/// Splits the invoice across destinations and submits purchase
	/// intents. Returns zero or more created purchases.
	async fn split_and_send_intents(
		&self,
		invoice: Invoice,
		balances: HashMap<ChainId, Amount>,
		custodied: HashMap<ChainId, Amount>,
		min_amounts: HashMap<ChainId, Amount>,
	) -> Result<Vec<CreatedPurchase>, HubError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceWire {
	intent_id: String,
	owner: String,
	ticker_hash: String,
	amount: String,
	origin: String,
	destinations: Vec<String>,
	hub_invoice_enqueued_timestamp: u64,
}

impl InvoiceWire {
	fn into_invoice(self) -> Result<Invoice, HubError> {
		let malformed = |field: &str| HubError::Malformed(format!("bad {field}"));
		Ok(Invoice {
			owner: self.owner.parse().map_err(|_| malformed("owner"))?,
			ticker_hash: self.ticker_hash.parse().map_err(|_| malformed("tickerHash"))?,
			amount: U256::from_dec_str(&self.amount).map_err(|_| malformed("amount"))?,
			origin: self.origin.parse().map_err(|_| malformed("origin"))?,
			destinations: self
				.destinations
				.iter()
				.map(|d| d.parse().map_err(|_| malformed("destinations")))
				.collect::<Result<_, _>>()?,
			hub_invoice_enqueued_timestamp: self.hub_invoice_enqueued_timestamp,
			intent_id: self.intent_id,
		})
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MinAmountsWire {
	min_amounts: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EconomyWire {
	strategy: SettlementStrategy,
	custodied_amount: String,
	incoming_amount: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedPurchaseWire {
	intent: serde_json::Value,
	transaction_hash: String,
	transaction_type: String,
	destination: String,
}

#[derive(Clone)]
pub struct HttpHubClient {
	base_url: String,
	client: reqwest::Client,
}

impl HttpHubClient {
	pub fn new(base_url: &str) -> Result<Self, HubError> {
		let client = reqwest::Client::builder()
			.timeout(HTTP_TIMEOUT)
			.build()
			.map_err(|e| HubError::Transport(e.to_string()))?;
		Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client })
	}

	async fn get_json<T: serde::de::DeserializeOwned>(
		&self,
		path: &str,
	) -> Result<Option<T>, HubError> {
		let response = self
			.client
			.get(format!("{}{path}", self.base_url))
			.send()
			.await
			.map_err(|e| HubError::Transport(e.to_string()))?;

		match response.status() {
			StatusCode::NOT_FOUND => Ok(None),
			status if status.is_success() =>
				Ok(Some(response.json().await.map_err(|e| HubError::Malformed(e.to_string()))?)),
			status => Err(HubError::Rejected {
				status: status.as_u16(),
				body: response.text().await.unwrap_or_default(),
			}),
		}
	}
}

#[async_trait]
impl HubApi for HttpHubClient {
	async fn get_invoice(&self, intent_id: &str) -> Result<Option<Invoice>, HubError> {
		self.get_json::<InvoiceWire>(&format!("/invoices/{intent_id}"))
			.await?
			.map(InvoiceWire::into_invoice)
			.transpose()
	}

	async fn get_min_amounts(
		&self,
		intent_id: &str,
	) -> Result<HashMap<ChainId, Amount>, HubError> {
		let wire: MinAmountsWire = self
			.get_json(&format!("/invoices/{intent_id}/min-amounts"))
			.await?
			.ok_or_else(|| HubError::Malformed("min-amounts missing for invoice".into()))?;

		wire.min_amounts
			.into_iter()
			.map(|(domain, amount)| {
				Ok((
					domain
						.parse()
						.map_err(|_| HubError::Malformed(format!("bad domain {domain}")))?,
					U256::from_dec_str(&amount)
						.map_err(|_| HubError::Malformed(format!("bad amount {amount}")))?,
				))
			})
			.collect()
	}

	async fn get_economy(
		&self,
		domain: ChainId,
		ticker_hash: TickerHash,
	) -> Result<DomainEconomy, HubError> {
		let wire: EconomyWire = self
			.get_json(&format!("/economy/{domain}/{ticker_hash:?}"))
			.await?
			.ok_or_else(|| HubError::Malformed(format!("no economy for domain {domain}")))?;

		Ok(DomainEconomy {
			strategy: wire.strategy,
			custodied_amount: U256::from_dec_str(&wire.custodied_amount)
				.map_err(|_| HubError::Malformed("bad custodiedAmount".into()))?,
			incoming_amount: U256::from_dec_str(&wire.incoming_amount)
				.map_err(|_| HubError::Malformed("bad incomingAmount".into()))?,
		})
	}

	async fn split_and_send_intents(
		&self,
		invoice: Invoice,
		balances: HashMap<ChainId, Amount>,
		custodied: HashMap<ChainId, Amount>,
		min_amounts: HashMap<ChainId, Amount>,
	) -> Result<Vec<CreatedPurchase>, HubError> {
		let stringify = |map: HashMap<ChainId, Amount>| -> HashMap<String, String> {
			map.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
		};
		let body = serde_json::json!({
			"invoiceId": invoice.intent_id,
			"tickerHash": invoice.ticker_hash,
			"balances": stringify(balances),
			"custodied": stringify(custodied),
			"minAmounts": stringify(min_amounts),
		});

		let response = self
			.client
			.post(format!("{}/intents", self.base_url))
			.json(&body)
			.send()
			.await
			.map_err(|e| HubError::Transport(e.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			return Err(HubError::Rejected {
				status: status.as_u16(),
				body: response.text().await.unwrap_or_default(),
			})
		}

		let wires: Vec<CreatedPurchaseWire> =
			response.json().await.map_err(|e| HubError::Malformed(e.to_string()))?;
		wires
			.into_iter()
			.map(|wire| {
				Ok(CreatedPurchase {
					purchase_intent: wire.intent,
					transaction_hash: wire
						.transaction_hash
						.parse()
						.map_err(|_| HubError::Malformed("bad transactionHash".into()))?,
					transaction_type: wire.transaction_type,
					destination: wire
						.destination
						.parse()
						.map_err(|_| HubError::Malformed("bad destination".into()))?,
				})
			})
			.collect()
	}
}
