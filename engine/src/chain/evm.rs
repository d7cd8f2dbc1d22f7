use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ethers::{
	abi::{encode, Token},
	prelude::SignerMiddleware,
	providers::{Http, Middleware, Provider},
	signers::{LocalWallet, Signer},
	types::{
		transaction::eip2718::TypedTransaction, Bytes, Eip1559TransactionRequest,
		TransactionReceipt,
	},
};

use mark_primitives::{Address, ChainId, H256, U256};

use super::{ChainService, SafeAccount, TxRequest};

/// `balanceOf(address)`
const ERC20_BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
/// `execTransactionFromModule(address,uint256,bytes,uint8)`
const EXEC_FROM_MODULE_SELECTOR: [u8; 4] = [0x46, 0x87, 0x21, 0xa7];

pub fn erc20_balance_of_calldata(owner: Address) -> Bytes {
	let mut data = ERC20_BALANCE_OF_SELECTOR.to_vec();
	data.extend(encode(&[Token::Address(owner)]));
	data.into()
}

/// Wraps a payload into a Zodiac `execTransactionFromModule` call addressed
/// to the Safe's module. Operation is always CALL (0).
pub fn wrap_for_module(safe: &SafeAccount, tx: TxRequest) -> TxRequest {
	let mut data = EXEC_FROM_MODULE_SELECTOR.to_vec();
	data.extend(encode(&[
		Token::Address(tx.to),
		Token::Uint(tx.value),
		Token::Bytes(tx.data.to_vec()),
		Token::Uint(U256::zero()),
	]));
	TxRequest::new(safe.module, U256::zero(), data.into())
}

#[derive(Clone)]
pub struct EvmChainService {
	chain_id: ChainId,
	provider: Arc<Provider<Http>>,
	signer: SignerMiddleware<Arc<Provider<Http>>, LocalWallet>,
	safe: Option<SafeAccount>,
	confirmations: usize,
}

impl EvmChainService {
	pub fn new(
		chain_id: ChainId,
		http_endpoint: &str,
		private_key: &str,
		safe: Option<SafeAccount>,
		confirmations: usize,
	) -> Result<Self> {
		let provider = Arc::new(
			Provider::<Http>::try_from(http_endpoint)
				.with_context(|| format!("invalid rpc endpoint for chain {chain_id}"))?,
		);
		let wallet = private_key
			.trim_start_matches("0x")
			.parse::<LocalWallet>()
			.context("invalid signer private key")?
			.with_chain_id(chain_id.0);
		let signer = SignerMiddleware::new(provider.clone(), wallet);

		Ok(Self { chain_id, provider, signer, safe, confirmations })
	}
}

#[async_trait]
impl ChainService for EvmChainService {
	fn chain_id(&self) -> ChainId {
		self.chain_id
	}

	fn owner(&self) -> Address {
		match &self.safe {
			Some(safe) => safe.address,
			None => self.signer.signer().address(),
		}
	}

	async fn submit_and_monitor(&self, tx: TxRequest) -> Result<TransactionReceipt> {
		let tx = match &self.safe {
			Some(safe) => wrap_for_module(safe, tx),
			None => tx,
		};

		let request = Eip1559TransactionRequest::new()
			.to(tx.to)
			.value(tx.value)
			.data(tx.data.clone());

		let pending = self
			.signer
			.send_transaction(request, None)
			.await
			.with_context(|| format!("submission failed on chain {}", self.chain_id))?;
		let tx_hash = pending.tx_hash();

		tracing::debug!(chain = %self.chain_id, ?tx_hash, "submitted, awaiting confirmations");

		let receipt = pending
			.confirmations(self.confirmations)
			.await
			.with_context(|| format!("monitoring {tx_hash:?} on chain {}", self.chain_id))?
			.ok_or_else(|| anyhow!("transaction {tx_hash:?} dropped from the mempool"))?;

		if receipt.status != Some(1.into()) {
			bail!("transaction {tx_hash:?} reverted on chain {}", self.chain_id);
		}

		Ok(receipt)
	}

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<TransactionReceipt> {
		self.provider
			.get_transaction_receipt(tx_hash)
			.await?
			.ok_or_else(|| anyhow!("no receipt for {tx_hash:?} on chain {}", self.chain_id))
	}

	async fn balance_of(&self, asset: Option<Address>) -> Result<U256> {
		let owner = self.owner();
		match asset {
			None => Ok(self.provider.get_balance(owner, None).await?),
			Some(token) => {
				let out = self.read_tx(token, erc20_balance_of_calldata(owner)).await?;
				if out.len() < 32 {
					bail!("malformed balanceOf return from {token:?}: 0x{}", hex::encode(&out));
				}
				Ok(U256::from_big_endian(&out[..32]))
			},
		}
	}

	async fn read_tx(&self, to: Address, data: Bytes) -> Result<Bytes> {
		let call: TypedTransaction =
			Eip1559TransactionRequest::new().to(to).data(data).into();
		Ok(self.provider.call(&call, None).await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn balance_of_calldata_is_selector_plus_padded_owner() {
		let owner = Address::repeat_byte(0x11);
		let data = erc20_balance_of_calldata(owner);
		assert_eq!(data.len(), 4 + 32);
		assert_eq!(&data[..4], &ERC20_BALANCE_OF_SELECTOR);
		assert_eq!(&data[16..36], owner.as_bytes());
	}

	#[test]
	fn module_wrapping_targets_the_module_and_keeps_the_payload() {
		let safe = SafeAccount {
			address: Address::repeat_byte(0xaa),
			module: Address::repeat_byte(0xbb),
		};
		let inner = TxRequest::new(
			Address::repeat_byte(0xcc),
			U256::from(7),
			vec![0xde, 0xad].into(),
		);

		let wrapped = wrap_for_module(&safe, inner.clone());
		assert_eq!(wrapped.to, safe.module);
		assert_eq!(wrapped.value, U256::zero());
		assert_eq!(&wrapped.data[..4], &EXEC_FROM_MODULE_SELECTOR);
		// The inner target and value are the first two encoded words.
		assert_eq!(&wrapped.data[16..36], inner.to.as_bytes());
		assert_eq!(U256::from_big_endian(&wrapped.data[36..68]), inner.value);
	}
}
