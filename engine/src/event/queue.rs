//! Event dispatch.
//!
//! Distinct invoices are processed concurrently; a single invoice is
//! serialized by the in-flight id set, and duplicate arrivals for an id
//! already being worked are dropped. Outcomes asking for a retry are
//! re-enqueued after their delay with the attempt counter bumped;
//! attempts are unbounded because permanently bad events are classified
//! Invalid instead.

use std::{collections::HashSet, pin::Pin};

use async_trait::async_trait;
use futures::Future;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;

use crate::{
	cache::PurchaseCache,
	db::Store,
	hub::HubApi,
	metrics::EVENTS_PROCESSED,
};

use super::{processor::EventProcessor, EventOutcome, QueueEvent};

const QUEUE_DEPTH: usize = 1024;

type ProcessingFuture =
	Pin<Box<dyn Future<Output = (QueueEvent, EventOutcome)> + Send + 'static>>;
type RetryFuture = Pin<Box<dyn Future<Output = QueueEvent> + Send + 'static>>;

/// How the dispatcher drives an event. Implemented by the event processor;
/// tests substitute counters.
#[async_trait]
pub trait ProcessEvent: Clone + Send + Sync + 'static {
	async fn process_event(&self, event: &QueueEvent) -> EventOutcome;
}

#[async_trait]
impl<S, C, H> ProcessEvent for EventProcessor<S, C, H>
where
	S: Store + 'static,
	C: PurchaseCache + 'static,
	H: HubApi + 'static,
{
	async fn process_event(&self, event: &QueueEvent) -> EventOutcome {
		self.process(event).await
	}
}

#[derive(Clone)]
pub struct QueueHandle {
	sender: mpsc::Sender<QueueEvent>,
}

impl QueueHandle {
	pub async fn enqueue(&self, event: QueueEvent) -> anyhow::Result<()> {
		self.sender
			.send(event)
			.await
			.map_err(|_| anyhow::anyhow!("event queue is shut down"))
	}
}

pub fn event_queue() -> (QueueHandle, mpsc::Receiver<QueueEvent>) {
	let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
	(QueueHandle { sender }, receiver)
}

/// Runs until the queue handle side is dropped and all in-flight work and
/// scheduled retries have drained.
pub async fn run_dispatcher<P: ProcessEvent>(
	mut receiver: mpsc::Receiver<QueueEvent>,
	processor: P,
) {
	let mut in_flight: HashSet<String> = HashSet::new();
	let mut processing: FuturesUnordered<ProcessingFuture> = FuturesUnordered::new();
	let mut retry_delays: FuturesUnordered<RetryFuture> = FuturesUnordered::new();
	let mut closed = false;

	let dispatch =
		|event: QueueEvent,
		 in_flight: &mut HashSet<String>,
		 processing: &mut FuturesUnordered<ProcessingFuture>,
		 processor: &P| {
			if !in_flight.insert(event.id.clone()) {
				tracing::trace!(invoice_id = %event.id, "duplicate event dropped");
				return
			}
			let processor = processor.clone();
			processing.push(Box::pin(async move {
				let outcome = processor.process_event(&event).await;
				(event, outcome)
			}));
		};

	loop {
		tokio::select! {
			maybe_event = receiver.recv(), if !closed => {
				match maybe_event {
					Some(event) => dispatch(event, &mut in_flight, &mut processing, &processor),
					None => closed = true,
				}
			},
			Some((event, outcome)) = processing.next(), if !processing.is_empty() => {
				in_flight.remove(&event.id);
				EVENTS_PROCESSED
					.with_label_values(&[event.event_type.as_str(), outcome.label()])
					.inc();

				match &outcome {
					EventOutcome::Success => {
						tracing::debug!(invoice_id = %event.id, attempts = event.attempts, "event done");
					},
					EventOutcome::Invalid(reason) => {
						tracing::info!(invoice_id = %event.id, %reason, "event discarded");
					},
					EventOutcome::Failure(delay) | EventOutcome::Continue(delay) => {
						let delay = *delay;
						tracing::debug!(
							invoice_id = %event.id,
							attempts = event.attempts,
							delay_ms = delay.as_millis() as u64,
							"event re-enqueued"
						);
						retry_delays.push(Box::pin(async move {
							tokio::time::sleep(delay).await;
							QueueEvent { attempts: event.attempts + 1, ..event }
						}));
					},
				}
			},
			Some(event) = retry_delays.next(), if !retry_delays.is_empty() => {
				dispatch(event, &mut in_flight, &mut processing, &processor);
			},
			else => {},
		}

		if closed && processing.is_empty() && retry_delays.is_empty() {
			break
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{
		collections::HashMap,
		sync::{
			atomic::{AtomicU32, Ordering},
			Arc,
		},
		time::Duration,
	};

	use tokio::sync::Mutex;

	use crate::event::EventType;

	use super::*;

	/// Scripted processor: pops the next outcome for an id, recording call
	/// counts and the attempt values it saw.
	#[derive(Clone, Default)]
	struct ScriptedProcessor {
		scripts: Arc<Mutex<HashMap<String, Vec<EventOutcome>>>>,
		calls: Arc<AtomicU32>,
		seen_attempts: Arc<Mutex<Vec<u32>>>,
		hold: Option<Duration>,
	}

	impl ScriptedProcessor {
		fn script(outcomes: Vec<(&str, Vec<EventOutcome>)>) -> Self {
			Self {
				scripts: Arc::new(Mutex::new(
					outcomes
						.into_iter()
						.map(|(id, list)| (id.to_string(), list))
						.collect(),
				)),
				..Default::default()
			}
		}
	}

	#[async_trait]
	impl ProcessEvent for ScriptedProcessor {
		async fn process_event(&self, event: &QueueEvent) -> EventOutcome {
			self.calls.fetch_add(1, Ordering::SeqCst);
			self.seen_attempts.lock().await.push(event.attempts);
			if let Some(hold) = self.hold {
				tokio::time::sleep(hold).await;
			}
			let mut scripts = self.scripts.lock().await;
			match scripts.get_mut(&event.id) {
				Some(list) if !list.is_empty() => list.remove(0),
				_ => EventOutcome::Success,
			}
		}
	}

	fn event(id: &str) -> QueueEvent {
		QueueEvent::new(id.to_string(), EventType::InvoiceEnqueued)
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_ids_are_dropped_while_in_flight() {
		let mut processor = ScriptedProcessor::script(vec![]);
		processor.hold = Some(Duration::from_millis(500));

		let (handle, receiver) = event_queue();
		handle.enqueue(event("0xaaa")).await.unwrap();
		handle.enqueue(event("0xaaa")).await.unwrap();
		handle.enqueue(event("0xbbb")).await.unwrap();
		drop(handle);

		run_dispatcher(receiver, processor.clone()).await;

		// Two distinct ids, one duplicate dropped.
		assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn failures_are_retried_after_their_delay_with_attempts_bumped() {
		let processor = ScriptedProcessor::script(vec![(
			"0xaaa",
			vec![
				EventOutcome::Failure(Duration::from_secs(1)),
				EventOutcome::Continue(Duration::from_secs(1)),
			],
		)]);

		let (handle, receiver) = event_queue();
		handle.enqueue(event("0xaaa")).await.unwrap();
		drop(handle);

		run_dispatcher(receiver, processor.clone()).await;

		assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
		assert_eq!(*processor.seen_attempts.lock().await, vec![0, 1, 2]);
	}

	#[tokio::test]
	async fn invalid_events_are_not_retried() {
		let processor = ScriptedProcessor::script(vec![(
			"0xaaa",
			vec![EventOutcome::Invalid("bad destination".to_string())],
		)]);

		let (handle, receiver) = event_queue();
		handle.enqueue(event("0xaaa")).await.unwrap();
		drop(handle);

		run_dispatcher(receiver, processor.clone()).await;

		assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
	}
}
