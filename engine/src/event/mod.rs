//! The invoice event pipeline: webhook-fed queue entries driven to
//! completion by per-invoice processors.

pub mod processor;
pub mod queue;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	InvoiceEnqueued,
	SettlementEnqueued,
}

impl EventType {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::InvoiceEnqueued => "invoice_enqueued",
			Self::SettlementEnqueued => "settlement_enqueued",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEvent {
	/// The invoice's intent id; also the queue's dedup key.
	pub id: String,
	pub event_type: EventType,
	pub enqueued_at: DateTime<Utc>,
	pub attempts: u32,
}

impl QueueEvent {
	pub fn new(id: String, event_type: EventType) -> Self {
		Self { id, event_type, enqueued_at: Utc::now(), attempts: 0 }
	}
}

/// What the processor decided about an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
	Success,
	/// Permanently unprocessable; never retried.
	Invalid(String),
	/// Transient failure; re-enqueued after the delay.
	Failure(Duration),
	/// Still in progress elsewhere (earmark in flight); re-enqueued after
	/// the delay without counting as a failure.
	Continue(Duration),
}

impl EventOutcome {
	pub fn label(&self) -> &'static str {
		match self {
			Self::Success => "success",
			Self::Invalid(_) => "invalid",
			Self::Failure(_) => "failure",
			Self::Continue(_) => "continue",
		}
	}

	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::Failure(delay) | Self::Continue(delay) => Some(*delay),
			Self::Success | Self::Invalid(_) => None,
		}
	}
}
