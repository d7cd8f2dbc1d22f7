//! Ephemeral state in Redis: cached purchase records and the two global
//! pause flags.
//!
//! Purchase records live in the `purchases:data` hash, one field per
//! invoice id holding that invoice's purchases; the hash expires a day
//! after its last write. The queue serializes per-invoice processing, so
//! every field has a single writer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::MultiplexedConnection, AsyncCommands};
use serde::{Deserialize, Serialize};

use mark_primitives::{ChainId, H256};

use crate::constants::PURCHASE_CACHE_TTL;

const PURCHASES_KEY: &str = "purchases:data";
const PURCHASE_PAUSED_KEY: &str = "purchases:paused";
const REBALANCE_PAUSED_KEY: &str = "rebalance:paused";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
	pub invoice_id: String,
	pub purchase_intent: serde_json::Value,
	pub transaction_hash: H256,
	pub transaction_type: String,
	pub destination: ChainId,
	/// Unix seconds at which the hub enqueued the purchased invoice; the
	/// settlement handler measures clearance from this.
	pub hub_invoice_enqueued_timestamp: u64,
	pub cached_at: DateTime<Utc>,
}

#[async_trait]
pub trait PurchaseCache: Send + Sync {
	async fn add_purchases(
		&self,
		invoice_id: &str,
		purchases: Vec<PurchaseRecord>,
	) -> anyhow::Result<()>;
	async fn get_purchases(
		&self,
		invoice_id: &str,
	) -> anyhow::Result<Option<Vec<PurchaseRecord>>>;
	async fn remove_purchases(&self, invoice_ids: &[String]) -> anyhow::Result<()>;

	/// While set, new planning and purchasing are suppressed; in-flight
	/// callbacks continue.
	async fn is_purchase_paused(&self) -> anyhow::Result<bool>;
	async fn is_rebalance_paused(&self) -> anyhow::Result<bool>;
	async fn set_purchase_paused(&self, paused: bool) -> anyhow::Result<()>;
	async fn set_rebalance_paused(&self, paused: bool) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct RedisCache {
	con: MultiplexedConnection,
}

impl RedisCache {
	pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(redis_url)?;
		Ok(Self { con: client.get_multiplexed_tokio_connection().await? })
	}

	async fn read_flag(&self, key: &str) -> anyhow::Result<bool> {
		let mut con = self.con.clone();
		let value: Option<String> = con.get(key).await?;
		Ok(value.as_deref() == Some("1"))
	}

	async fn write_flag(&self, key: &str, paused: bool) -> anyhow::Result<()> {
		let mut con = self.con.clone();
		con.set::<_, _, ()>(key, if paused { "1" } else { "0" }).await?;
		Ok(())
	}
}

#[async_trait]
impl PurchaseCache for RedisCache {
	async fn add_purchases(
		&self,
		invoice_id: &str,
		purchases: Vec<PurchaseRecord>,
	) -> anyhow::Result<()> {
		if purchases.is_empty() {
			return Ok(())
		}
		let mut con = self.con.clone();
		con.hset::<_, _, _, ()>(PURCHASES_KEY, invoice_id, serde_json::to_string(&purchases)?)
			.await?;
		con.expire::<_, ()>(PURCHASES_KEY, PURCHASE_CACHE_TTL.as_secs() as i64).await?;
		Ok(())
	}

	async fn get_purchases(
		&self,
		invoice_id: &str,
	) -> anyhow::Result<Option<Vec<PurchaseRecord>>> {
		let mut con = self.con.clone();
		let raw: Option<String> = con.hget(PURCHASES_KEY, invoice_id).await?;
		raw.map(|json| serde_json::from_str(&json).map_err(Into::into)).transpose()
	}

	async fn remove_purchases(&self, invoice_ids: &[String]) -> anyhow::Result<()> {
		if invoice_ids.is_empty() {
			return Ok(())
		}
		let mut con = self.con.clone();
		con.hdel::<_, _, ()>(PURCHASES_KEY, invoice_ids.to_vec()).await?;
		Ok(())
	}

	async fn is_purchase_paused(&self) -> anyhow::Result<bool> {
		self.read_flag(PURCHASE_PAUSED_KEY).await
	}

	async fn is_rebalance_paused(&self) -> anyhow::Result<bool> {
		self.read_flag(REBALANCE_PAUSED_KEY).await
	}

	async fn set_purchase_paused(&self, paused: bool) -> anyhow::Result<()> {
		self.write_flag(PURCHASE_PAUSED_KEY, paused).await
	}

	async fn set_rebalance_paused(&self, paused: bool) -> anyhow::Result<()> {
		self.write_flag(REBALANCE_PAUSED_KEY, paused).await
	}
}

#[cfg(test)]
pub mod memory {
	use std::collections::HashMap;

	use tokio::sync::Mutex;

	use super::*;

	#[derive(Default)]
	pub struct MemoryCache {
		purchases: Mutex<HashMap<String, Vec<PurchaseRecord>>>,
		purchase_paused: Mutex<bool>,
		rebalance_paused: Mutex<bool>,
	}

	impl MemoryCache {
		pub fn new() -> Self {
			Self::default()
		}

		pub async fn len(&self) -> usize {
			self.purchases.lock().await.len()
		}
	}

	#[async_trait]
	impl PurchaseCache for MemoryCache {
		async fn add_purchases(
			&self,
			invoice_id: &str,
			purchases: Vec<PurchaseRecord>,
		) -> anyhow::Result<()> {
			if !purchases.is_empty() {
				self.purchases.lock().await.insert(invoice_id.to_string(), purchases);
			}
			Ok(())
		}

		async fn get_purchases(
			&self,
			invoice_id: &str,
		) -> anyhow::Result<Option<Vec<PurchaseRecord>>> {
			Ok(self.purchases.lock().await.get(invoice_id).cloned())
		}

		async fn remove_purchases(&self, invoice_ids: &[String]) -> anyhow::Result<()> {
			let mut map = self.purchases.lock().await;
			for id in invoice_ids {
				map.remove(id);
			}
			Ok(())
		}

		async fn is_purchase_paused(&self) -> anyhow::Result<bool> {
			Ok(*self.purchase_paused.lock().await)
		}

		async fn is_rebalance_paused(&self) -> anyhow::Result<bool> {
			Ok(*self.rebalance_paused.lock().await)
		}

		async fn set_purchase_paused(&self, paused: bool) -> anyhow::Result<()> {
			*self.purchase_paused.lock().await = paused;
			Ok(())
		}

		async fn set_rebalance_paused(&self, paused: bool) -> anyhow::Result<()> {
			*self.rebalance_paused.lock().await = paused;
			Ok(())
		}
	}
}
