// src/rabbitmq/amqp_client.rs

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    protocol::{AMQPErrorKind, AMQPSoftError},
    BasicProperties, Channel, Connection, ConnectionProperties, Error as LapinError, ExchangeKind,
};
use tracing::{debug, info, warn};

use super::errors::{RabbitMQError, Result};
use super::topology::{BrokerEndpoint, Topology};
use super::transport::{
    DeliveryStream, InboundMessage, OutboundMessage, Session, ShutdownListener, ShutdownNotice,
    ShutdownScope, Transport,
};

const REPLY_SUCCESS: u16 = 200;

/// [`Transport`] backed by a real RabbitMQ broker.
#[derive(Clone, Default)]
pub struct AmqpTransport {
    properties: ConnectionProperties,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn Session>> {
        info!(host = %endpoint.host, port = endpoint.port, "Attempting to connect to RabbitMQ host");

        let connection = Connection::connect_uri(endpoint.amqp_uri(), self.properties.clone()).await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_error) = connection.close(REPLY_SUCCESS, "Channel setup failed").await {
                    warn!(error = %close_error, "Failed to close RabbitMQ connection after channel error");
                }
                return Err(e.into());
            }
        };

        debug!(channel_id = channel.id(), "RabbitMQ connection and channel opened");
        Ok(Box::new(AmqpSession { connection, channel }))
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl Session for AmqpSession {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    fn on_shutdown(&self, listener: ShutdownListener) {
        let connection_listener = listener.clone();
        self.connection.on_error(move |error| {
            connection_listener(ShutdownNotice {
                scope: ShutdownScope::Connection,
                reason: error.to_string(),
            })
        });
        self.channel.on_error(move |error| {
            listener(ShutdownNotice {
                scope: ShutdownScope::Channel,
                reason: error.to_string(),
            })
        });
    }

    async fn declare(&self, topology: &Topology) -> Result<()> {
        self.channel
            .exchange_declare(
                &topology.exchange.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: topology.exchange.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        if let Some(queue) = &topology.queue {
            self.channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: queue.durable,
                        exclusive: queue.exclusive,
                        auto_delete: queue.auto_delete,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        if let Some(binding) = &topology.binding {
            self.channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        // prefetch-size is always 0 with lapin; global=false scopes the limit per consumer.
        if let Some(prefetch_count) = topology.prefetch_count {
            self.channel
                .basic_qos(prefetch_count, BasicQosOptions { global: false })
                .await?;
        }

        Ok(())
    }

    async fn check_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| passive_declare_error(exchange, e))
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|delivery| InboundMessage {
                        routing_key: delivery.routing_key.as_str().to_string(),
                        body: delivery.data,
                        delivery_tag: delivery.delivery_tag,
                    })
                    .map_err(RabbitMQError::from)
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        let mut first_error = None;

        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "Closing channel").await {
                first_error = Some(RabbitMQError::from(e));
            }
        }

        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(REPLY_SUCCESS, "Closing connection").await {
                first_error.get_or_insert(RabbitMQError::from(e));
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// Only the broker's 404 channel close means the exchange is missing; anything
// else (socket loss, channel already closed) keeps its own classification.
fn passive_declare_error(exchange: &str, error: LapinError) -> RabbitMQError {
    match &error {
        LapinError::ProtocolError(amqp_error)
            if *amqp_error.kind() == AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) =>
        {
            RabbitMQError::ExchangeNotFound {
                exchange: exchange.to_string(),
                reason: error.to_string(),
            }
        }
        _ => RabbitMQError::from(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::AMQPError;
    use std::io;
    use std::sync::Arc;

    fn channel_close(kind: AMQPSoftError, text: &str) -> LapinError {
        LapinError::ProtocolError(AMQPError::new(AMQPErrorKind::Soft(kind), text.into()))
    }

    #[test]
    fn not_found_close_means_missing_exchange() {
        let error = passive_declare_error(
            "tasks",
            channel_close(AMQPSoftError::NOTFOUND, "NOT_FOUND - no exchange 'tasks' in vhost '/'"),
        );

        assert!(matches!(
            error,
            RabbitMQError::ExchangeNotFound { ref exchange, .. } if exchange == "tasks"
        ));
    }

    #[test]
    fn other_failures_keep_their_classification() {
        let refused = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer");
        let dropped = passive_declare_error("tasks", LapinError::IOError(Arc::new(refused)));
        assert!(matches!(dropped, RabbitMQError::Unreachable(_)));

        let denied = passive_declare_error(
            "tasks",
            channel_close(AMQPSoftError::ACCESSREFUSED, "ACCESS_REFUSED - no access to 'tasks'"),
        );
        assert!(matches!(denied, RabbitMQError::ProtocolError(_)));

        let closed = passive_declare_error("tasks", LapinError::InvalidChannel(3));
        assert!(matches!(closed, RabbitMQError::ChannelError(_)));
    }
}
