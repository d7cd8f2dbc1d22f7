//! The uniform contract every bridge and exchange integration satisfies.
//!
//! Concrete adapters (REST signing, request paging, venue quirks) live
//! outside the engine; the engine plans against [`BridgeAdapter`] quotes,
//! submits the [`MemoTx`] lists adapters hand back, and drives destination
//! readiness through the same interface. CEX venues additionally expose the
//! optional [`SwapAdapter`] capability, probed at runtime through the
//! registry.

pub mod retry;

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::TransactionReceipt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mark_primitives::{Address, ChainId, Route, H256, U256};

use crate::chain::TxRequest;

/// The closed set of supported bridge and exchange integrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeKind {
	Across,
	Binance,
	Coinbase,
	Kraken,
	Near,
	CctpV1,
	CctpV2,
	CowSwap,
	Stargate,
	Mantle,
	Linea,
	Zircuit,
	Zksync,
	Pendle,
	Ccip,
	TacInner,
}

impl BridgeKind {
	pub const ALL: &'static [BridgeKind] = &[
		Self::Across,
		Self::Binance,
		Self::Coinbase,
		Self::Kraken,
		Self::Near,
		Self::CctpV1,
		Self::CctpV2,
		Self::CowSwap,
		Self::Stargate,
		Self::Mantle,
		Self::Linea,
		Self::Zircuit,
		Self::Zksync,
		Self::Pendle,
		Self::Ccip,
		Self::TacInner,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Across => "across",
			Self::Binance => "binance",
			Self::Coinbase => "coinbase",
			Self::Kraken => "kraken",
			Self::Near => "near",
			Self::CctpV1 => "cctp_v1",
			Self::CctpV2 => "cctp_v2",
			Self::CowSwap => "cowswap",
			Self::Stargate => "stargate",
			Self::Mantle => "mantle",
			Self::Linea => "linea",
			Self::Zircuit => "zircuit",
			Self::Zksync => "zksync",
			Self::Pendle => "pendle",
			Self::Ccip => "ccip",
			Self::TacInner => "tac_inner",
		}
	}

	pub fn is_cex(&self) -> bool {
		matches!(self, Self::Binance | Self::Coinbase | Self::Kraken)
	}

	/// Parses an operation's stored bridge identifier. Identifiers may carry
	/// a `:suffix` for sub-flows; only the prefix names the adapter.
	pub fn from_identifier(identifier: &str) -> Option<Self> {
		identifier.split(':').next().and_then(|prefix| prefix.parse().ok())
	}
}

impl fmt::Display for BridgeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for BridgeKind {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.iter()
			.copied()
			.find(|kind| kind.as_str() == s)
			.ok_or(())
	}
}

/// Semantic tag on a transaction an adapter hands back for submission.
/// Only the `Rebalance` receipt is persisted as the operation's origin tx;
/// the others are prelude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMemo {
	Approval,
	Unwrap,
	Wrap,
	Rebalance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoTx {
	pub memo: TxMemo,
	pub tx: TxRequest,
	/// Present when the adapter capped or rounded the requested amount; the
	/// effective value replaces the planned amount for downstream
	/// accounting. Native decimals.
	pub effective_amount: Option<U256>,
}

#[derive(Debug, Error)]
pub enum BridgeError {
	// Transient: the caller may retry with backoff.
	#[error("network error: {0}")]
	Network(String),
	#[error("rate limited")]
	RateLimited,

	// Permanent: skip to the next preference, or fail the operation.
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("unauthorized")]
	Unauthorized,
	#[error("asset unsupported on this venue")]
	AssetUnsupported,
	#[error("amount below the venue minimum of {minimum}")]
	AmountBelowMinimum { minimum: U256 },
	#[error("quote expired")]
	QuoteExpired,
	#[error("venue balance insufficient")]
	BelowBalance,
	#[error("no adapter registered for {0}")]
	AdapterUnavailable(BridgeKind),
}

impl BridgeError {
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Network(_) | Self::RateLimited)
	}
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeAdapter: Send + Sync {
	fn kind(&self) -> BridgeKind;

	/// Quoted amount received on the destination for sending
	/// `amount` (native decimals) over `route`.
	async fn quote(&self, amount: U256, route: &Route) -> Result<U256, BridgeError>;

	/// Builds the origin-side transactions for the transfer. The engine
	/// submits them in list order.
	async fn send(
		&self,
		sender: Address,
		recipient: Address,
		amount: U256,
		route: &Route,
	) -> Result<Vec<MemoTx>, BridgeError>;

	/// Idempotent probe: have the funds landed (or become claimable) on the
	/// destination? Must not advance any external state.
	async fn ready_on_destination(
		&self,
		amount: U256,
		route: &Route,
		origin_receipt: &TransactionReceipt,
	) -> Result<bool, BridgeError>;

	/// The destination-side finishing transaction, if the route needs one
	/// (claim, wrap after a CEX withdrawal, ...). Must be idempotent with
	/// respect to its own side.
	async fn destination_callback(
		&self,
		route: &Route,
		origin_receipt: &TransactionReceipt,
	) -> Result<Option<MemoTx>, BridgeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapLimits {
	pub min_native: U256,
	pub max_native: U256,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwapQuote {
	pub quote_id: String,
	pub from_symbol: String,
	pub to_symbol: String,
	pub from_amount: U256,
	pub to_amount: U256,
	/// Units of `to` per unit of `from`, scaled by 1e18.
	pub rate: U256,
	pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapExecutionStatus {
	Pending,
	Success,
	Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwapExecution {
	pub order_id: String,
	pub status: SwapExecutionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawQuota {
	pub limit_usd: u64,
	pub used_usd: u64,
}

impl WithdrawQuota {
	pub fn remaining_usd(&self) -> u64 {
		self.limit_usd.saturating_sub(self.used_usd)
	}
}

/// Optional capability of CEX adapters: convert between asset symbols on
/// the venue before withdrawing to the destination chain.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapAdapter: Send + Sync {
	fn supports_swap(&self, from_symbol: &str, to_symbol: &str) -> bool;

	async fn swap_exchange_info(
		&self,
		from_symbol: &str,
		to_symbol: &str,
	) -> Result<SwapLimits, BridgeError>;

	async fn swap_quote(
		&self,
		from_symbol: &str,
		to_symbol: &str,
		amount: U256,
	) -> Result<SwapQuote, BridgeError>;

	async fn execute_swap(&self, quote: &SwapQuote) -> Result<SwapExecution, BridgeError>;

	async fn swap_status(&self, order_id: &str) -> Result<SwapExecutionStatus, BridgeError>;

	/// The venue's global daily withdrawal quota, in whole USD.
	async fn withdraw_quota(&self) -> Result<WithdrawQuota, BridgeError>;

	/// Last-trade USD price for a symbol. Advisory only: the quota check is
	/// the single consumer and the venue remains the final authority.
	async fn last_trade_price_usd(&self, symbol: &str) -> Result<f64, BridgeError>;
}

/// All registered adapters, keyed by kind, with the swap capability as a
/// second, optional registration.
#[derive(Clone, Default)]
pub struct BridgeRegistry {
	adapters: HashMap<BridgeKind, Arc<dyn BridgeAdapter>>,
	swap_adapters: HashMap<BridgeKind, Arc<dyn SwapAdapter>>,
}

impl BridgeRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, adapter: Arc<dyn BridgeAdapter>) {
		self.adapters.insert(adapter.kind(), adapter);
	}

	pub fn register_swap(&mut self, kind: BridgeKind, adapter: Arc<dyn SwapAdapter>) {
		self.swap_adapters.insert(kind, adapter);
	}

	pub fn get(&self, kind: BridgeKind) -> Result<&Arc<dyn BridgeAdapter>, BridgeError> {
		self.adapters.get(&kind).ok_or(BridgeError::AdapterUnavailable(kind))
	}

	/// Runtime capability probe for the swap extension.
	pub fn swap(&self, kind: BridgeKind) -> Option<&Arc<dyn SwapAdapter>> {
		self.swap_adapters.get(&kind)
	}

	pub fn kinds(&self) -> impl Iterator<Item = BridgeKind> + '_ {
		self.adapters.keys().copied()
	}
}

/// Deterministic idempotency key for CEX withdrawals. Repeated invocations
/// for the same origin transaction produce the same id, so the adapter can
/// find an existing withdrawal instead of issuing a duplicate.
pub fn withdraw_order_id(
	origin_tx_hash: H256,
	origin: ChainId,
	destination: ChainId,
	asset: Address,
) -> String {
	format!(
		"mark-{}-{}-{}-{}",
		hex::encode(&origin_tx_hash.as_bytes()[..4]),
		origin,
		destination,
		hex::encode(&asset.as_bytes()[..3]),
	)
}
