// src/rabbitmq/mod.rs
// Broker plumbing shared by the listener and the producer

pub mod amqp_client;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod publisher;
pub mod retry;
pub mod topology;
pub mod transport;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::AmqpTransport;
pub use connection::{ConnectionManager, ConnectionState, Role, Subscription};
pub use consumer::{ConsumerLoop, EventProcessor, ReceivedEvent};
pub use errors::{RabbitMQError, Result};
pub use publisher::{MessageProducer, Publisher};
pub use retry::{backoff_delay, RetryAttempt, RetryPolicy};
pub use topology::{BrokerEndpoint, Topology};
pub use transport::{InboundMessage, OutboundMessage, Session, Transport};
