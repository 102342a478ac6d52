use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::connection::{ConnectionManager, Role};
use super::errors::{RabbitMQError, Result};
use super::retry::RetryPolicy;
use super::topology::BrokerEndpoint;
use super::transport::{OutboundMessage, Transport};

/// What business code needs from a broker: hand over a body, learn whether it
/// was accepted.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn send_message(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;
}

pub struct Publisher {
    manager: ConnectionManager,
}

impl Publisher {
    /// Connects eagerly. A failed first connect is logged, not returned: the
    /// next [`Publisher::send`] tries again.
    pub async fn new(
        endpoint: BrokerEndpoint,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        stop: &CancellationToken,
    ) -> Self {
        let manager = ConnectionManager::new(Role::Publisher, endpoint, transport, retry, stop);

        if let Err(e) = manager.connect().await {
            error!(error = %e, "RabbitMQ producer could not connect at startup");
        }

        Publisher { manager }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Publishes `body` to `exchange`. Concurrent callers are serialized; a
    /// closed channel gets exactly one reconnect before the call gives up with
    /// [`RabbitMQError::ChannelUnavailable`].
    pub async fn send(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let mut guard = self.manager.lock().await;

        if !guard.is_healthy() {
            warn!("RabbitMQ channel is not open, attempting to reconnect before publishing");
            if let Err(e) = guard.connect().await {
                error!(error = %e, "RabbitMQ reconnect before publish failed");
            }
        }

        let Some(session) = guard.session() else {
            error!(exchange, routing_key, "Cannot publish message, RabbitMQ channel is not available");
            return Err(RabbitMQError::ChannelUnavailable);
        };

        if let Err(e) = session.check_exchange(exchange).await {
            error!(exchange, error = %e, "Exchange check failed, message not published");
            return Err(e);
        }

        let message = OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
        };
        if let Err(e) = session.publish(&message).await {
            error!(exchange, routing_key, error = %e, "Failed to publish message");
            return Err(e);
        }

        info!(
            exchange,
            routing_key,
            bytes = body.len(),
            "Message published"
        );
        Ok(())
    }

    /// Stops the reconnect handler, then closes channel and connection.
    pub async fn close(&self) {
        info!("Disposing RabbitMQ producer");
        self.manager.shutdown().await;
    }
}

#[async_trait]
impl MessageProducer for Publisher {
    async fn send_message(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.send(exchange, routing_key, body).await
    }
}
