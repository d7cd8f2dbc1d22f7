//! Bounded retry wrapper for adapter calls.
//!
//! Transient adapter errors (network, rate limits) are retried up to
//! [`MAX_ADAPTER_RETRIES`] times with capped exponential backoff and
//! jitter; permanent errors surface immediately. This layer is distinct
//! from the event queue's retry-after scheduling, which handles semantic
//! failures on a much coarser clock.

use std::{cmp::min, future::Future, time::Duration};

use rand::Rng;

use crate::constants::{
	ADAPTER_RETRY_BACKOFF, ADAPTER_RETRY_BACKOFF_CAP, MAX_ADAPTER_RETRIES,
};

use super::BridgeError;

fn max_sleep_duration(attempt: u32) -> Duration {
	min(
		ADAPTER_RETRY_BACKOFF_CAP,
		ADAPTER_RETRY_BACKOFF.saturating_mul(2u32.saturating_pow(attempt)),
	)
}

/// Runs `request`, retrying transient failures. We avoid tiny delays by
/// always sleeping at least half of the backoff window for the attempt.
pub async fn with_retries<T, F, Fut>(
	request_name: &'static str,
	mut request: F,
) -> Result<T, BridgeError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, BridgeError>>,
{
	let mut attempt: u32 = 0;
	loop {
		match request().await {
			Ok(value) => return Ok(value),
			Err(error) if error.is_transient() && attempt < MAX_ADAPTER_RETRIES => {
				let half_max = max_sleep_duration(attempt) / 2;
				let sleep_duration =
					half_max + rand::thread_rng().gen_range(Duration::default()..half_max);
				tracing::warn!(
					request = request_name,
					attempt,
					%error,
					"transient adapter error, retrying in {}ms",
					sleep_duration.as_millis()
				);
				tokio::time::sleep(sleep_duration).await;
				attempt += 1;
			},
			Err(error) => return Err(error),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use mark_primitives::U256;

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn transient_errors_are_retried_until_success() {
		let calls = AtomicU32::new(0);
		let result = with_retries("quote", || {
			let attempt = calls.fetch_add(1, Ordering::Relaxed);
			async move {
				if attempt < 2 {
					Err(BridgeError::RateLimited)
				} else {
					Ok(U256::from(42))
				}
			}
		})
		.await
		.unwrap();

		assert_eq!(result, U256::from(42));
		assert_eq!(calls.load(Ordering::Relaxed), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn retries_are_exhausted_after_the_cap() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = with_retries("quote", || {
			calls.fetch_add(1, Ordering::Relaxed);
			async { Err(BridgeError::Network("connection reset".into())) }
		})
		.await;

		assert!(matches!(result, Err(BridgeError::Network(_))));
		// Initial attempt plus MAX_ADAPTER_RETRIES retries.
		assert_eq!(calls.load(Ordering::Relaxed), 1 + MAX_ADAPTER_RETRIES);
	}

	#[tokio::test]
	async fn permanent_errors_are_not_retried() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = with_retries("quote", || {
			calls.fetch_add(1, Ordering::Relaxed);
			async { Err(BridgeError::AssetUnsupported) }
		})
		.await;

		assert!(matches!(result, Err(BridgeError::AssetUnsupported)));
		assert_eq!(calls.load(Ordering::Relaxed), 1);
	}
}
