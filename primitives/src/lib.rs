//! Primitive types shared across the Mark settlement engine.
//!
//! Everything in this crate is pure data: no I/O, no async, no floats.
//! Monetary amounts are `U256` integers in the canonical 18-decimal scale
//! unless a name says otherwise ("native" amounts carry the asset's own
//! decimals and only exist at adapter boundaries).

pub mod amounts;

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub use ethers::types::{Address, H256, U256};

/// Canonical amount in 18 decimals.
pub type Amount = U256;

/// 32-byte canonical identifier of an asset family across chains.
pub type TickerHash = H256;

/// Integer rate in decibasis-points: 10^7 scale, 1% = 1000 dBps.
pub type Dbps = u32;

/// EVM-style chain identifier.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ChainId {
	type Err = core::num::ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

impl From<u64> for ChainId {
	fn from(id: u64) -> Self {
		Self(id)
	}
}

/// An origin -> destination fund movement for one asset.
///
/// `destination_asset` is set on swap routes, where the asset symbol changes
/// across the trip (CEX swap-and-bridge flows). On plain bridge routes the
/// asset is the same family on both sides and the field is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
	pub origin: ChainId,
	pub destination: ChainId,
	pub asset: Address,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub destination_asset: Option<Address>,
}

impl Route {
	pub fn new(origin: ChainId, destination: ChainId, asset: Address) -> Self {
		Self { origin, destination, asset, destination_asset: None }
	}

	pub fn with_destination_asset(mut self, destination_asset: Address) -> Self {
		self.destination_asset = Some(destination_asset);
		self
	}

	pub fn is_swap_route(&self) -> bool {
		self.destination_asset.is_some()
	}
}

impl fmt::Display for Route {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.destination_asset {
			Some(dest_asset) =>
				write!(f, "{}:{:?}->{}:{:?}", self.origin, self.asset, self.destination, dest_asset),
			None => write!(f, "{}->{}:{:?}", self.origin, self.destination, self.asset),
		}
	}
}

pub fn hex_encode_bytes(bytes: &[u8]) -> String {
	format!("0x{}", hex::encode(bytes))
}
