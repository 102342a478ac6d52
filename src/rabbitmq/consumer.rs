// src/rabbitmq/consumer.rs
// Listener side: keeps a consumer attached to the task event queue and
// settles every delivery exactly once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionManager, Role, Subscription};
use super::errors::{RabbitMQError, Result};
use super::retry::RetryPolicy;
use super::topology::BrokerEndpoint;
use super::transport::{InboundMessage, Transport};
use crate::message::EventSummary;

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// A delivery that parsed as a JSON object.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub routing_key: String,
    pub summary: EventSummary,
    pub document: Value,
}

/// Application hook run before a delivery is acknowledged. An error rejects
/// the delivery without requeue.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: &ReceivedEvent) -> anyhow::Result<()>;
}

enum Wake {
    Stop,
    StateChanged,
    HealthCheck,
    Delivery(u64, Option<Result<InboundMessage>>),
}

pub struct ConsumerLoop {
    manager: ConnectionManager,
    health_check_interval: Duration,
    stop: CancellationToken,
    processor: Option<Arc<dyn EventProcessor>>,
}

impl ConsumerLoop {
    pub fn new(
        endpoint: BrokerEndpoint,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        stop: &CancellationToken,
    ) -> Self {
        ConsumerLoop {
            manager: ConnectionManager::new(Role::Consumer, endpoint, transport, retry, stop),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            stop: stop.clone(),
            processor: None,
        }
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Supervises the connection until `stop` is cancelled, then tears it
    /// down. Connect failures are logged and retried on the next health
    /// check; they never end the loop.
    pub async fn run(&self) {
        info!(
            queue = %self.manager.endpoint().queue,
            interval = ?self.health_check_interval,
            "RabbitMQ listener starting"
        );

        let mut state_rx = self.manager.state_changes();
        let mut subscription: Option<Subscription> = None;

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            if subscription.is_none() || !self.manager.is_healthy().await {
                subscription = None;
                match self.attach().await {
                    Ok(attached) => subscription = Some(attached),
                    Err(RabbitMQError::Cancelled) => break,
                    Err(e) => error!(
                        error = %e,
                        retry_in = ?self.health_check_interval,
                        "RabbitMQ listener could not attach a consumer"
                    ),
                }
            }

            // Transitions caused by our own connect are not news.
            state_rx.borrow_and_update();

            let wake = tokio::select! {
                _ = self.stop.cancelled() => Wake::Stop,
                changed = state_rx.changed() => match changed {
                    Ok(()) => Wake::StateChanged,
                    Err(_) => Wake::Stop,
                },
                _ = tokio::time::sleep(self.health_check_interval) => Wake::HealthCheck,
                (generation, delivery) = next_delivery(&mut subscription) => {
                    Wake::Delivery(generation, delivery)
                }
            };

            match wake {
                Wake::Stop => break,
                Wake::StateChanged => {
                    debug!(state = %*state_rx.borrow(), "RabbitMQ listener saw a connection state change");
                }
                Wake::HealthCheck => debug!("RabbitMQ listener health check"),
                Wake::Delivery(generation, Some(Ok(message))) => {
                    self.handle_delivery(generation, message).await;
                }
                Wake::Delivery(_, Some(Err(e))) => {
                    error!(error = %e, "RabbitMQ consumer stream failed");
                    subscription = None;
                }
                Wake::Delivery(_, None) => {
                    warn!("RabbitMQ consumer stream ended");
                    subscription = None;
                }
            }
        }

        info!("RabbitMQ listener stopping");
        self.manager.shutdown().await;
    }

    async fn attach(&self) -> Result<Subscription> {
        self.manager.connect().await?;
        self.manager.subscribe().await
    }

    /// Settles `message` exactly once: ack when it is a JSON object the
    /// processor accepts, nack without requeue otherwise.
    async fn handle_delivery(&self, generation: u64, message: InboundMessage) {
        let raw = String::from_utf8_lossy(&message.body);

        let document: Value = match serde_json::from_slice(&message.body) {
            Ok(document) => document,
            Err(e) => {
                error!(
                    error = %e,
                    routing_key = %message.routing_key,
                    delivery_tag = message.delivery_tag,
                    body = %raw,
                    "Failed to parse JSON message"
                );
                self.nack(generation, message.delivery_tag).await;
                return;
            }
        };

        let event = ReceivedEvent {
            routing_key: message.routing_key.clone(),
            summary: EventSummary::extract(&document),
            document,
        };

        match self.process(&event).await {
            Ok(()) => {
                info!(
                    event_type = %event.summary.event_type,
                    task_id = %event.summary.task_id,
                    routing_key = %event.routing_key,
                    delivery_tag = message.delivery_tag,
                    body = %raw,
                    "Received event"
                );
                self.ack(generation, message.delivery_tag).await;
            }
            Err(e) => {
                error!(
                    error = %e,
                    event_type = %event.summary.event_type,
                    task_id = %event.summary.task_id,
                    routing_key = %event.routing_key,
                    delivery_tag = message.delivery_tag,
                    body = %raw,
                    "Error processing message"
                );
                self.nack(generation, message.delivery_tag).await;
            }
        }
    }

    async fn process(&self, event: &ReceivedEvent) -> anyhow::Result<()> {
        if !event.document.is_object() {
            anyhow::bail!("message root is not a JSON object");
        }
        match &self.processor {
            Some(processor) => processor.process(event).await,
            None => Ok(()),
        }
    }

    async fn ack(&self, generation: u64, delivery_tag: u64) {
        if let Err(e) = self.manager.ack(generation, delivery_tag).await {
            error!(error = %e, delivery_tag, "Failed to acknowledge message");
        }
    }

    async fn nack(&self, generation: u64, delivery_tag: u64) {
        if let Err(e) = self.manager.nack(generation, delivery_tag, false).await {
            error!(error = %e, delivery_tag, "Failed to reject message");
        }
    }
}

async fn next_delivery(
    subscription: &mut Option<Subscription>,
) -> (u64, Option<Result<InboundMessage>>) {
    match subscription {
        Some(subscription) => (subscription.generation, subscription.stream.next().await),
        None => std::future::pending().await,
    }
}
