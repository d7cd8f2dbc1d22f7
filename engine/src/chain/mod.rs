//! On-chain access used by the engine.
//!
//! The engine only ever submits pre-built calldata and reads receipts and
//! balances; everything protocol-specific lives behind [`ChainService`].
//! A successful `submit_and_monitor` return means the transaction is mined
//! with at least the configured number of confirmations.

pub mod evm;

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::types::{Bytes, TransactionReceipt};
use serde::{Deserialize, Serialize};

use mark_primitives::{Address, ChainId, H256, U256};

/// A transaction ready for submission on some chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
	pub to: Address,
	pub value: U256,
	pub data: Bytes,
}

impl TxRequest {
	pub fn new(to: Address, value: U256, data: Bytes) -> Self {
		Self { to, value, data }
	}
}

/// A Gnosis Safe with a Zodiac module enabled for this engine's signer.
/// When configured, submissions are wrapped through the module and the Safe
/// is the funds-holding owner on that chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SafeAccount {
	pub address: Address,
	pub module: Address,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainService: Send + Sync {
	fn chain_id(&self) -> ChainId;

	/// The funds-holding account on this chain: the Safe when one is
	/// configured, otherwise the signer's own address.
	fn owner(&self) -> Address;

	/// Submits a transaction and waits until it is mined with the
	/// configured confirmations. Wraps through the Zodiac module first when
	/// the chain runs on a Safe.
	async fn submit_and_monitor(&self, tx: TxRequest) -> Result<TransactionReceipt>;

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<TransactionReceipt>;

	/// The owner's balance of the given ERC-20, or of the native asset when
	/// `asset` is `None`. Returned in the asset's native decimals.
	async fn balance_of(&self, asset: Option<Address>) -> Result<U256>;

	/// A read-only `eth_call`.
	async fn read_tx(&self, to: Address, data: Bytes) -> Result<Bytes>;
}

/// The per-chain services the engine was configured with.
#[derive(Clone, Default)]
pub struct ChainServices {
	services: HashMap<ChainId, Arc<dyn ChainService>>,
}

impl ChainServices {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, service: Arc<dyn ChainService>) {
		self.services.insert(service.chain_id(), service);
	}

	pub fn get(&self, chain_id: ChainId) -> Result<&Arc<dyn ChainService>> {
		self.services
			.get(&chain_id)
			.ok_or_else(|| anyhow!("no chain service configured for chain {chain_id}"))
	}

	pub fn contains(&self, chain_id: ChainId) -> bool {
		self.services.contains_key(&chain_id)
	}

	pub fn chain_ids(&self) -> impl Iterator<Item = ChainId> + '_ {
		self.services.keys().copied()
	}
}
