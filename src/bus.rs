//! In-process event bus.
//!
//! Publishers enqueue a [`PublishedEvent`] envelope and return immediately.
//! A dispatcher task hands each envelope to every subscriber registered for
//! its event type, one spawned task per delivery. A delivery that fails is
//! redelivered up to `max_attempts` times with a fixed delay, so subscribers
//! may see the same event more than once.
//!
//! [`EventBus::shutdown`] stops intake, drains queued envelopes and waits for
//! every delivery; pending redeliveries run immediately instead of sleeping.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::BusConfig;
use crate::event::{BranchEvent, EventError, EventType, PublishedEvent};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// A subscriber for one or more branch event types.
pub trait BranchHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handle<'a>(&'a self, event: &'a BranchEvent) -> HandlerFuture<'a>;
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,
    #[error("cannot build envelope: {0}")]
    Envelope(#[from] EventError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub redelivery_delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            redelivery_delay: Duration::from_secs(60),
        }
    }
}

impl From<&BusConfig> for DeliveryPolicy {
    fn from(config: &BusConfig) -> Self {
        Self {
            max_attempts: config.max_delivery_attempts.max(1),
            redelivery_delay: Duration::from_secs(config.redelivery_delay_secs),
        }
    }
}

type Subscribers = HashMap<EventType, Vec<Arc<dyn BranchHandler>>>;

pub struct EventBusBuilder {
    name: String,
    capacity: usize,
    policy: DeliveryPolicy,
    subscribers: Subscribers,
}

impl EventBusBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn subscribe(mut self, event_type: EventType, handler: Arc<dyn BranchHandler>) -> Self {
        self.subscribers.entry(event_type).or_default().push(handler);
        self
    }

    /// Spawn the dispatcher. Must be called inside a Tokio runtime.
    pub fn start(self) -> EventBus {
        let (tx, rx) = mpsc::channel(self.capacity);
        let counts = self
            .subscribers
            .iter()
            .map(|(ty, handlers)| (*ty, handlers.len()))
            .collect();

        let tracker = TaskTracker::new();
        let closing = CancellationToken::new();

        info!(bus = %self.name, capacity = self.capacity, "starting event bus");
        tracker.spawn(dispatch(
            rx,
            Arc::new(self.subscribers),
            self.policy,
            tracker.clone(),
            closing.clone(),
        ));

        EventBus {
            name: Arc::from(self.name),
            tx,
            counts: Arc::new(counts),
            tracker,
            closing,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    name: Arc<str>,
    tx: mpsc::Sender<PublishedEvent>,
    counts: Arc<HashMap<EventType, usize>>,
    tracker: TaskTracker,
    closing: CancellationToken,
}

impl EventBus {
    pub fn builder(name: impl Into<String>) -> EventBusBuilder {
        EventBusBuilder {
            name: name.into(),
            capacity: 256,
            policy: DeliveryPolicy::default(),
            subscribers: HashMap::new(),
        }
    }

    pub fn from_config(config: &BusConfig) -> EventBusBuilder {
        Self::builder(config.name.clone())
            .capacity(config.capacity)
            .policy(DeliveryPolicy::from(config))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.counts.get(&event_type).copied().unwrap_or(0)
    }

    /// Enqueue an event for delivery. Returns once accepted, not once handled.
    pub async fn publish(&self, event: &BranchEvent, source: &str) -> Result<PublishedEvent, BusError> {
        if self.closing.is_cancelled() {
            return Err(BusError::Closed);
        }
        let envelope = PublishedEvent::new(event, source, &self.name)?;
        self.tx
            .send(envelope.clone())
            .await
            .map_err(|_| BusError::Closed)?;
        info!(
            bus = %self.name,
            id = %envelope.id,
            detail_type = %envelope.detail_type,
            branch = %event.branch(),
            source,
            "published branch event"
        );
        Ok(envelope)
    }

    /// Stop accepting events, then wait until every queued envelope has been
    /// dispatched and every delivery has finished.
    pub async fn shutdown(&self) {
        info!(bus = %self.name, in_flight = self.tracker.len(), "draining event bus");
        self.closing.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(bus = %self.name, "event bus drained");
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<PublishedEvent>,
    subscribers: Arc<Subscribers>,
    policy: DeliveryPolicy,
    tracker: TaskTracker,
    closing: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            envelope = rx.recv() => envelope,
            _ = closing.cancelled() => {
                rx.close();
                rx.recv().await
            }
        };
        let Some(envelope) = next else {
            break;
        };

        let event = match envelope.branch_event() {
            Ok(event) => event,
            Err(e) => {
                error!(id = %envelope.id, error = %e, "dropping undeliverable envelope");
                continue;
            }
        };

        let Some(handlers) = subscribers.get(&event.event_type()) else {
            warn!(id = %envelope.id, detail_type = %envelope.detail_type, "no subscribers");
            continue;
        };

        for handler in handlers {
            tracker.spawn(deliver(
                handler.clone(),
                envelope.id.clone(),
                event.clone(),
                policy,
                closing.clone(),
            ));
        }
    }
}

async fn deliver(
    handler: Arc<dyn BranchHandler>,
    id: String,
    event: BranchEvent,
    policy: DeliveryPolicy,
    closing: CancellationToken,
) {
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match handler.handle(&event).await {
            Ok(()) => {
                info!(id = %id, handler = handler.name(), branch = %event.branch(), attempt, "event delivered");
                return;
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    id = %id,
                    handler = handler.name(),
                    branch = %event.branch(),
                    attempt,
                    error = %e,
                    "delivery failed, redelivering"
                );
                tokio::select! {
                    _ = tokio::time::sleep(policy.redelivery_delay) => {}
                    _ = closing.cancelled() => {
                        info!(id = %id, handler = handler.name(), "shutting down, redelivering now");
                    }
                }
            }
            Err(e) => {
                error!(
                    id = %id,
                    handler = handler.name(),
                    branch = %event.branch(),
                    attempts = attempt,
                    error = %e,
                    "delivery failed, giving up"
                );
            }
        }
    }
}
