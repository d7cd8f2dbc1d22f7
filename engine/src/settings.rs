//! Layered engine configuration: defaults, then a TOML file, then
//! environment variables (`MARK__` prefix, `__` separator), then command
//! line overrides.

use std::collections::{BTreeSet, HashMap};

use clap::Parser;
use config::{Config, ConfigError, Environment, File, Map, Source, Value};
use serde::{Deserialize, Deserializer};

use mark_primitives::{Address, Amount, ChainId, Dbps, Route, TickerHash, U256};

use crate::{bridge::BridgeKind, chain::SafeAccount};

fn deserialize_u256_dec<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
	let raw = String::deserialize(deserializer)?;
	U256::from_dec_str(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_opt_u256_dec<'de, D: Deserializer<'de>>(
	deserializer: D,
) -> Result<Option<U256>, D::Error> {
	let raw = Option::<String>::deserialize(deserializer)?;
	raw.map(|s| U256::from_dec_str(&s).map_err(serde::de::Error::custom)).transpose()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetConfig {
	pub ticker_hash: TickerHash,
	pub symbol: String,
	pub address: Address,
	pub decimals: u8,
	#[serde(default)]
	pub is_native: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
	pub rpc_url: String,
	#[serde(default = "default_confirmations")]
	pub confirmations: usize,
	#[serde(default)]
	pub safe: Option<SafeAccount>,
	pub assets: Vec<AssetConfig>,
}

fn default_confirmations() -> usize {
	crate::constants::MIN_CONFIRMATIONS
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
	pub origin: ChainId,
	pub destination: ChainId,
	/// The asset's address on the origin chain.
	pub asset: Address,
	/// Set when the asset symbol changes across the trip (CEX swap routes).
	#[serde(default)]
	pub destination_asset: Option<Address>,
	/// Bridge preferences in evaluation order.
	pub preferences: Vec<BridgeKind>,
	/// Slippage budget per preference, decibasis-points.
	pub slippages_dbps: Vec<Dbps>,
	/// Origin balance that is never spent by this route, 18-decimal units.
	#[serde(default, deserialize_with = "deserialize_u256_dec")]
	pub reserve: Amount,
	/// Floor for swap routes, native units of the origin asset.
	#[serde(default, deserialize_with = "deserialize_opt_u256_dec")]
	pub min_swap_amount: Option<U256>,
}

impl RouteConfig {
	pub fn route(&self) -> Route {
		Route {
			origin: self.origin,
			destination: self.destination,
			asset: self.asset,
			destination_asset: self.destination_asset,
		}
	}

	pub fn slippage_for(&self, preference_index: usize) -> Option<Dbps> {
		self.slippages_dbps.get(preference_index).copied()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
	pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
	pub hostname: String,
	pub port: u16,
	pub secret: String,
	/// Events below this block number are dropped as stale.
	#[serde(default)]
	pub min_block_number: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
	pub hostname: String,
	pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
	pub url: String,
	#[serde(default = "default_max_connections")]
	pub max_connections: u32,
}

fn default_max_connections() -> u32 {
	10
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CexCredentials {
	#[serde(default)]
	pub api_key: String,
	#[serde(default)]
	pub api_secret: String,
}

impl CexCredentials {
	pub fn is_configured(&self) -> bool {
		!self.api_key.is_empty() && !self.api_secret.is_empty()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	/// Keyed by decimal chain id. String keys because that is what layered
	/// config sources produce; use [`Settings::chain`] to look up by id.
	pub chains: HashMap<String, ChainConfig>,
	#[serde(default)]
	pub routes: Vec<RouteConfig>,
	pub hub: HubConfig,
	pub webhook: WebhookConfig,
	pub metrics: MetricsConfig,
	pub database: DatabaseConfig,
	pub redis_url: String,
	/// Hex-encoded signing key for the engine's EOA.
	pub signer_private_key: String,
	#[serde(default)]
	pub binance: CexCredentials,
	#[serde(default)]
	pub coinbase: CexCredentials,
	#[serde(default)]
	pub kraken: CexCredentials,
}

impl Settings {
	pub fn load(opts: EngineOptions) -> Result<Self, ConfigError> {
		let mut builder = Config::builder()
			.set_default("webhook.hostname", "0.0.0.0")?
			.set_default("webhook.port", 8080)?
			.set_default("webhook.min_block_number", 0)?
			.set_default("metrics.hostname", "127.0.0.1")?
			.set_default("metrics.port", 5566)?
			.set_default("redis_url", "redis://127.0.0.1:6379")?;

		if let Some(config_file) = &opts.config_file {
			builder = builder.add_source(File::with_name(config_file));
		}

		builder
			.add_source(Environment::with_prefix("MARK").separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		for (key, chain) in &self.chains {
			key.parse::<u64>()
				.map_err(|_| anyhow::anyhow!("chain key {key:?} is not a chain id"))?;
			if chain.assets.is_empty() {
				anyhow::bail!("chain {key} configures no assets");
			}
		}
		for route in &self.routes {
			if route.preferences.is_empty() {
				anyhow::bail!("route {} has no bridge preferences", route.route());
			}
			if route.preferences.len() != route.slippages_dbps.len() {
				anyhow::bail!(
					"route {} configures {} preferences but {} slippage budgets",
					route.route(),
					route.preferences.len(),
					route.slippages_dbps.len()
				);
			}
			for chain in [route.origin, route.destination] {
				if self.chain(chain).is_none() {
					anyhow::bail!("route {} references unknown chain {chain}", route.route());
				}
			}
			if route.destination_asset.is_some() &&
				!route.preferences.iter().any(BridgeKind::is_cex)
			{
				anyhow::bail!("swap route {} has no exchange preference", route.route());
			}
			for kind in &route.preferences {
				let configured = match kind {
					BridgeKind::Binance => self.binance.is_configured(),
					BridgeKind::Coinbase => self.coinbase.is_configured(),
					BridgeKind::Kraken => self.kraken.is_configured(),
					_ => true,
				};
				if !configured {
					anyhow::bail!(
						"route {} prefers {kind} but its credentials are not configured",
						route.route()
					);
				}
			}
		}
		Ok(())
	}

	pub fn chain(&self, chain_id: ChainId) -> Option<&ChainConfig> {
		self.chains.get(&chain_id.to_string())
	}

	pub fn chain_ids(&self) -> Vec<ChainId> {
		let mut ids: Vec<ChainId> =
			self.chains.keys().filter_map(|k| k.parse().ok()).collect();
		ids.sort();
		ids
	}

	pub fn asset(&self, chain_id: ChainId, ticker_hash: TickerHash) -> Option<&AssetConfig> {
		self.chain(chain_id)?.assets.iter().find(|a| a.ticker_hash == ticker_hash)
	}

	pub fn asset_by_address(&self, chain_id: ChainId, address: Address) -> Option<&AssetConfig> {
		self.chain(chain_id)?.assets.iter().find(|a| a.address == address)
	}

	pub fn decimals(&self, chain_id: ChainId, ticker_hash: TickerHash) -> Option<u8> {
		self.asset(chain_id, ticker_hash).map(|a| a.decimals)
	}

	pub fn tickers(&self) -> BTreeSet<TickerHash> {
		self.chains
			.values()
			.flat_map(|chain| chain.assets.iter().map(|a| a.ticker_hash))
			.collect()
	}

	pub fn supports_destination(&self, chain_id: ChainId, ticker_hash: TickerHash) -> bool {
		self.asset(chain_id, ticker_hash).is_some()
	}

	pub fn cex_credentials(&self, kind: BridgeKind) -> Option<&CexCredentials> {
		match kind {
			BridgeKind::Binance => Some(&self.binance),
			BridgeKind::Coinbase => Some(&self.coinbase),
			BridgeKind::Kraken => Some(&self.kraken),
			_ => None,
		}
	}
}

#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about = "Mark settlement engine")]
pub struct EngineOptions {
	/// Path to a TOML settings file.
	#[clap(long = "config")]
	pub config_file: Option<String>,
	#[clap(long = "database.url")]
	pub database_url: Option<String>,
	#[clap(long = "redis_url")]
	pub redis_url: Option<String>,
	#[clap(long = "hub.base_url")]
	pub hub_base_url: Option<String>,
	#[clap(long = "webhook.port")]
	pub webhook_port: Option<u16>,
	#[clap(long = "metrics.port")]
	pub metrics_port: Option<u16>,
}

fn insert_command_line_option<T: ToString>(
	map: &mut HashMap<String, Value>,
	key: &str,
	option: &Option<T>,
) {
	if let Some(value) = option {
		map.insert(key.to_string(), Value::from(value.to_string()));
	}
}

impl Source for EngineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "database.url", &self.database_url);
		insert_command_line_option(&mut map, "redis_url", &self.redis_url);
		insert_command_line_option(&mut map, "hub.base_url", &self.hub_base_url);
		insert_command_line_option(&mut map, "webhook.port", &self.webhook_port);
		insert_command_line_option(&mut map, "metrics.port", &self.metrics_port);

		Ok(map)
	}
}
