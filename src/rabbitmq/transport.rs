// src/rabbitmq/transport.rs
// Seam between the connection managers and the broker client library.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;
use super::topology::{BrokerEndpoint, Topology};

/// A delivery as handed to the listener. `delivery_tag` is only meaningful on
/// the channel that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownScope {
    Connection,
    Channel,
}

impl fmt::Display for ShutdownScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownScope::Connection => f.write_str("connection"),
            ShutdownScope::Channel => f.write_str("channel"),
        }
    }
}

/// Unsolicited close reported by the broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownNotice {
    pub scope: ShutdownScope,
    pub reason: String,
}

/// Invoked from whatever thread the client library reports errors on. Must not
/// block.
pub type ShutdownListener = Arc<dyn Fn(ShutdownNotice) + Send + Sync>;

pub type DeliveryStream = BoxStream<'static, Result<InboundMessage>>;

/// Opens broker sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a connection and one channel on it. Implementations close the
    /// connection again when the channel cannot be opened.
    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<Box<dyn Session>>;
}

/// One connection plus its channel.
#[async_trait]
pub trait Session: Send + Sync {
    /// Both the connection and the channel are open.
    fn is_open(&self) -> bool;

    fn on_shutdown(&self, listener: ShutdownListener);

    async fn declare(&self, topology: &Topology) -> Result<()>;

    /// Passive declare: fails when the exchange does not exist.
    async fn check_exchange(&self, exchange: &str) -> Result<()>;

    async fn publish(&self, message: &OutboundMessage) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Closes the channel, then the connection.
    async fn close(&self) -> Result<()>;
}
