//! Inbound webhook surface: hub events in, plus health and the operator
//! pause toggles.
//!
//! Authentication is a constant-time compare of the `goldsky-webhook-secret`
//! header against the configured secret. Events below the configured block
//! number are acknowledged but dropped as stale.

use std::{net::IpAddr, sync::Arc};

use ethers::utils::keccak256;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use warp::{http::StatusCode, Filter};

use crate::{
	cache::PurchaseCache,
	event::{queue::QueueHandle, EventType, QueueEvent},
	settings::WebhookConfig,
};

pub const SECRET_HEADER: &str = "goldsky-webhook-secret";

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookQuery {
	pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
	#[serde(rename = "_gs_gid", default)]
	pub gs_gid: Option<String>,
	/// Explicit intent id, when the indexer provides one.
	#[serde(default)]
	pub intent_id: Option<String>,
	/// Base64-encoded intent bytes; hashed into the id when no explicit id
	/// is present.
	#[serde(default)]
	pub intent: Option<String>,
	pub block_number: u64,
}

fn secret_matches(provided: Option<&str>, expected: &str) -> bool {
	match provided {
		Some(provided) => provided.as_bytes().ct_eq(expected.as_bytes()).into(),
		None => false,
	}
}

fn intent_id(payload: &WebhookPayload) -> Option<String> {
	if let Some(id) = &payload.intent_id {
		return Some(id.clone())
	}
	use base64::Engine;
	let bytes = base64::engine::general_purpose::STANDARD
		.decode(payload.intent.as_deref()?)
		.ok()?;
	Some(mark_primitives::hex_encode_bytes(&keccak256(bytes)))
}

fn event_type(name: &str) -> Option<EventType> {
	match name {
		"invoice-enqueued" => Some(EventType::InvoiceEnqueued),
		"settlement-enqueued" => Some(EventType::SettlementEnqueued),
		_ => None,
	}
}

async fn process_webhook(
	settings: &WebhookConfig,
	queue: &QueueHandle,
	query: WebhookQuery,
	secret: Option<String>,
	payload: WebhookPayload,
) -> (StatusCode, serde_json::Value) {
	if !secret_matches(secret.as_deref(), &settings.secret) {
		return (
			StatusCode::UNAUTHORIZED,
			serde_json::json!({ "message": "unauthorized" }),
		)
	}

	let webhook_id = payload.gs_gid.clone();
	let respond = |message: &str, processed: bool| {
		(
			StatusCode::OK,
			serde_json::json!({
				"message": message,
				"processed": processed,
				"webhookId": webhook_id,
			}),
		)
	};

	let Some(event_type) = event_type(&query.name) else {
		return (
			StatusCode::BAD_REQUEST,
			serde_json::json!({ "message": format!("unknown webhook {:?}", query.name) }),
		)
	};

	if payload.block_number < settings.min_block_number {
		return respond("stale event dropped", false)
	}

	let Some(id) = intent_id(&payload) else {
		return (
			StatusCode::BAD_REQUEST,
			serde_json::json!({ "message": "payload carries no intent" }),
		)
	};

	match queue.enqueue(QueueEvent::new(id, event_type)).await {
		Ok(()) => respond("event enqueued", true),
		Err(error) => {
			tracing::error!(%error, "failed to enqueue webhook event");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				serde_json::json!({ "message": "internal error" }),
			)
		},
	}
}

/// Serves the webhook, health and admin-pause endpoints until shutdown.
pub async fn start<C: PurchaseCache + 'static>(
	settings: WebhookConfig,
	queue: QueueHandle,
	cache: Arc<C>,
) -> anyhow::Result<()> {
	let address: IpAddr = settings.hostname.parse()?;
	let port = settings.port;
	tracing::info!("webhook listening on {address}:{port}");

	let settings = Arc::new(settings);

	let webhook = {
		let settings = settings.clone();
		warp::post()
			.and(warp::path("webhook"))
			.and(warp::path::end())
			.and(warp::query::<WebhookQuery>())
			.and(warp::header::optional::<String>(SECRET_HEADER))
			.and(warp::body::json::<WebhookPayload>())
			.then(move |query, secret, payload| {
				let settings = settings.clone();
				let queue = queue.clone();
				async move {
					let (status, body) =
						process_webhook(&settings, &queue, query, secret, payload).await;
					warp::reply::with_status(warp::reply::json(&body), status)
				}
			})
	};

	let health = warp::get()
		.and(warp::path("health"))
		.and(warp::path::end())
		.map(|| StatusCode::OK);

	let pause = |paused: bool| {
		let settings = settings.clone();
		let cache = cache.clone();
		warp::path!("admin" / "pause" / String)
			.and(warp::path::end())
			.and(warp::header::optional::<String>(SECRET_HEADER))
			.then(move |which: String, secret: Option<String>| {
				let settings = settings.clone();
				let cache = cache.clone();
				async move {
					if !secret_matches(secret.as_deref(), &settings.secret) {
						return StatusCode::UNAUTHORIZED
					}
					let result = match which.as_str() {
						"purchase" => cache.set_purchase_paused(paused).await,
						"rebalance" => cache.set_rebalance_paused(paused).await,
						_ => return StatusCode::NOT_FOUND,
					};
					match result {
						Ok(()) => StatusCode::OK,
						Err(error) => {
							tracing::error!(%error, %which, "pause toggle failed");
							StatusCode::INTERNAL_SERVER_ERROR
						},
					}
				}
			})
	};
	let set_pause = warp::post().and(pause(true));
	let clear_pause = warp::delete().and(pause(false));

	warp::serve(webhook.or(health).or(set_pause).or(clear_pause))
		.run((address, port))
		.await;
	Ok(())
}

#[cfg(test)]
mod tests {
	use crate::event::queue::event_queue;

	use super::*;

	fn test_settings() -> WebhookConfig {
		WebhookConfig {
			hostname: "127.0.0.1".to_string(),
			port: 0,
			secret: "hunter2".to_string(),
			min_block_number: 100,
		}
	}

	fn payload(block_number: u64) -> WebhookPayload {
		WebhookPayload {
			gs_gid: Some("gid-1".to_string()),
			intent_id: Some("0xdeadbeef".to_string()),
			intent: None,
			block_number,
		}
	}

	fn query(name: &str) -> WebhookQuery {
		WebhookQuery { name: name.to_string() }
	}

	#[tokio::test]
	async fn a_valid_event_is_enqueued() {
		let (handle, mut receiver) = event_queue();
		let (status, body) = process_webhook(
			&test_settings(),
			&handle,
			query("invoice-enqueued"),
			Some("hunter2".to_string()),
			payload(500),
		)
		.await;

		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["processed"], true);
		assert_eq!(body["webhookId"], "gid-1");

		let event = receiver.recv().await.unwrap();
		assert_eq!(event.id, "0xdeadbeef");
		assert_eq!(event.event_type, EventType::InvoiceEnqueued);
	}

	#[tokio::test]
	async fn a_bad_secret_is_rejected_without_enqueueing() {
		let (handle, mut receiver) = event_queue();
		let (status, _) = process_webhook(
			&test_settings(),
			&handle,
			query("invoice-enqueued"),
			Some("hunter3".to_string()),
			payload(500),
		)
		.await;
		assert_eq!(status, StatusCode::UNAUTHORIZED);

		let (status, _) = process_webhook(
			&test_settings(),
			&handle,
			query("invoice-enqueued"),
			None,
			payload(500),
		)
		.await;
		assert_eq!(status, StatusCode::UNAUTHORIZED);

		drop(handle);
		assert!(receiver.recv().await.is_none());
	}

	#[tokio::test]
	async fn stale_blocks_are_acknowledged_but_dropped() {
		let (handle, mut receiver) = event_queue();
		let (status, body) = process_webhook(
			&test_settings(),
			&handle,
			query("settlement-enqueued"),
			Some("hunter2".to_string()),
			payload(99),
		)
		.await;

		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["processed"], false);

		drop(handle);
		assert!(receiver.recv().await.is_none());
	}

	#[tokio::test]
	async fn intent_bytes_hash_into_a_stable_id() {
		use base64::Engine;
		let bytes = b"intent-bytes";
		let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

		let payload = WebhookPayload {
			gs_gid: None,
			intent_id: None,
			intent: Some(encoded),
			block_number: 500,
		};
		let id = intent_id(&payload).unwrap();
		assert_eq!(id, mark_primitives::hex_encode_bytes(&keccak256(bytes)));
		// Deterministic.
		assert_eq!(intent_id(&payload).unwrap(), id);
	}

	#[tokio::test]
	async fn unknown_webhook_names_are_bad_requests() {
		let (handle, _receiver) = event_queue();
		let (status, _) = process_webhook(
			&test_settings(),
			&handle,
			query("intent-created"),
			Some("hunter2".to_string()),
			payload(500),
		)
		.await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
	}
}
