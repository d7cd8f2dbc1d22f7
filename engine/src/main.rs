use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;

use mark_engine::{
	bridge::BridgeRegistry,
	cache::RedisCache,
	chain::{evm::EvmChainService, ChainServices},
	db::Database,
	event::{
		processor::EventProcessor,
		queue::{event_queue, run_dispatcher},
	},
	hub::HttpHubClient,
	metrics, rebalance,
	settings::{EngineOptions, Settings},
	webhook,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	let settings = Settings::load(EngineOptions::parse()).context("loading settings")?;
	settings.validate()?;
	metrics::register_metrics();

	let database =
		Database::connect(&settings.database.url, settings.database.max_connections)
			.await
			.context("connecting to postgres")?;
	database.run_migrations().await.context("running migrations")?;
	let store = Arc::new(database);

	let cache = Arc::new(
		RedisCache::connect(&settings.redis_url).await.context("connecting to redis")?,
	);
	let hub = Arc::new(HttpHubClient::new(&settings.hub.base_url)?);

	let mut chains = ChainServices::new();
	for chain_id in settings.chain_ids() {
		let chain_config =
			settings.chain(chain_id).context("chain listed but not configured")?;
		chains.insert(Arc::new(EvmChainService::new(
			chain_id,
			&chain_config.rpc_url,
			&settings.signer_private_key,
			chain_config.safe,
			chain_config.confirmations,
		)?));
	}

	// Bridge and exchange integrations register here; a registry without an
	// adapter for a configured preference leaves that preference unusable.
	let registry = BridgeRegistry::new();
	for route in &settings.routes {
		for kind in &route.preferences {
			if registry.get(*kind).is_err() {
				tracing::warn!(bridge = %kind, route = %route.route(), "no adapter registered");
			}
		}
	}
	let registry = Arc::new(registry);
	let settings = Arc::new(settings);

	let (queue, receiver) = event_queue();
	let processor = EventProcessor::new(
		settings.clone(),
		registry.clone(),
		chains.clone(),
		store.clone(),
		cache.clone(),
		hub,
	);

	let mut dispatcher = tokio::spawn(run_dispatcher(receiver, processor));

	let mut webhook_server = tokio::spawn(webhook::start(
		settings.webhook.clone(),
		queue.clone(),
		cache.clone(),
	));

	let mut metrics_server = {
		let metrics_settings = settings.metrics.clone();
		tokio::spawn(async move { metrics::start(&metrics_settings).await })
	};

	let mut callback_loop = {
		let settings = settings.clone();
		let registry = registry.clone();
		let chains = chains.clone();
		let store = store.clone();
		tokio::spawn(async move {
			rebalance::callback::run_callback_loop(&settings, &registry, &chains, store.as_ref())
				.await
		})
	};

	let mut expiry_ticker = {
		let store = store.clone();
		tokio::spawn(async move { rebalance::callback::run_expiry_ticker(store.as_ref()).await })
	};

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("shutdown requested, draining in-flight events");
		},
		result = &mut webhook_server => {
			result.context("webhook server panicked")??;
			anyhow::bail!("webhook server exited unexpectedly");
		},
		result = &mut metrics_server => {
			result.context("metrics server panicked")??;
			anyhow::bail!("metrics server exited unexpectedly");
		},
		result = &mut dispatcher => {
			result.context("dispatcher panicked")?;
			anyhow::bail!("dispatcher exited unexpectedly");
		},
		result = &mut callback_loop => {
			result.context("callback loop panicked")?;
			anyhow::bail!("callback loop exited unexpectedly");
		},
		result = &mut expiry_ticker => {
			result.context("expiry ticker panicked")?;
			anyhow::bail!("expiry ticker exited unexpectedly");
		},
	}

	// Stop taking events, let the dispatcher drain briefly, then go down.
	// Anything still in flight is safe to resume on restart because rows
	// are only written after confirmation.
	webhook_server.abort();
	drop(queue);
	let _ = tokio::time::timeout(SHUTDOWN_GRACE, dispatcher).await;
	metrics_server.abort();
	callback_loop.abort();
	expiry_ticker.abort();

	Ok(())
}
