//! Prometheus metrics for the engine, served over warp.

use std::net::IpAddr;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tracing::info;
use warp::Filter;

use crate::settings::MetricsConfig;

lazy_static! {
	static ref REGISTRY: Registry = Registry::new();
	pub static ref EVENTS_PROCESSED: IntCounterVec = IntCounterVec::new(
		Opts::new("mark_events_processed", "Queue events by type and outcome"),
		&["event_type", "outcome"]
	)
	.expect("metric created");
	pub static ref REBALANCE_OPERATIONS: IntCounterVec = IntCounterVec::new(
		Opts::new("mark_rebalance_operations", "Rebalance operation status transitions"),
		&["bridge", "status"]
	)
	.expect("metric created");
	pub static ref ADAPTER_ERRORS: IntCounterVec = IntCounterVec::new(
		Opts::new("mark_adapter_errors", "Adapter errors by bridge and class"),
		&["bridge", "class"]
	)
	.expect("metric created");
	pub static ref PURCHASE_CLEARANCE_DURATION: HistogramVec = HistogramVec::new(
		HistogramOpts::new(
			"mark_purchase_clearance_duration_seconds",
			"Time from hub invoice enqueue to settlement, per destination"
		)
		.buckets(vec![30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 14400.0, 86400.0]),
		&["destination"]
	)
	.expect("metric created");
}

pub fn register_metrics() {
	REGISTRY.register(Box::new(EVENTS_PROCESSED.clone())).expect("metric registered");
	REGISTRY.register(Box::new(REBALANCE_OPERATIONS.clone())).expect("metric registered");
	REGISTRY.register(Box::new(ADAPTER_ERRORS.clone())).expect("metric registered");
	REGISTRY
		.register(Box::new(PURCHASE_CLEARANCE_DURATION.clone()))
		.expect("metric registered");
}

fn metrics_handler() -> String {
	use prometheus::Encoder;
	let encoder = prometheus::TextEncoder::new();

	let mut buffer = Vec::new();
	if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
		tracing::error!("could not encode metrics: {e}");
	}
	String::from_utf8(buffer).unwrap_or_default()
}

#[tracing::instrument(name = "prometheus-metrics", skip_all)]
pub async fn start(metrics_settings: &MetricsConfig) -> anyhow::Result<()> {
	info!("Starting on {}:{}", metrics_settings.hostname, metrics_settings.port);

	warp::serve(
		warp::any()
			.and(warp::path("metrics"))
			.and(warp::path::end())
			.map(metrics_handler),
	)
	.run((metrics_settings.hostname.parse::<IpAddr>()?, metrics_settings.port))
	.await;

	Ok(())
}
