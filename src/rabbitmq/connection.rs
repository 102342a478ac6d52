// src/rabbitmq/connection.rs
// Ownership of one broker connection and its channel.
//
// A `ConnectionManager` holds at most one open session (connection plus
// channel) behind a single mutex. Shutdown notifications raised by the client
// library are not acted on where they fire: they are posted to a handler task
// owned by the manager, which takes the same mutex before tearing the session
// down. Every session gets a generation number; notifications and deliveries
// from an older generation are ignored or refused.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};
use super::retry::RetryPolicy;
use super::topology::{BrokerEndpoint, Topology};
use super::transport::{DeliveryStream, Session, ShutdownNotice, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reconnects are driven by the supervising consumer loop.
    Consumer,
    /// Reconnects run inside the shutdown handler itself.
    Publisher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// Live consumer on the current channel.
pub struct Subscription {
    pub generation: u64,
    pub consumer_tag: String,
    pub stream: DeliveryStream,
}

struct Slot {
    session: Option<Box<dyn Session>>,
    generation: u64,
}

impl Slot {
    fn is_healthy(&self) -> bool {
        self.session.as_ref().map_or(false, |session| session.is_open())
    }

    fn current(&self, generation: u64) -> Option<&dyn Session> {
        if self.generation == generation {
            self.session.as_deref()
        } else {
            None
        }
    }
}

struct SessionEvent {
    generation: u64,
    notice: ShutdownNotice,
}

struct Shared {
    role: Role,
    endpoint: BrokerEndpoint,
    topology: Topology,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    stop: CancellationToken,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    handler: JoinHandle<()>,
}

impl ConnectionManager {
    /// Creates a disconnected manager and spawns its shutdown-notification
    /// handler. Must be called from within a Tokio runtime.
    ///
    /// Cancelling `stop` aborts pending retries and stops the handler; it does
    /// not close an open session, see [`ConnectionManager::shutdown`].
    pub fn new(
        role: Role,
        endpoint: BrokerEndpoint,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        stop: &CancellationToken,
    ) -> Self {
        let topology = match role {
            Role::Consumer => Topology::consumer(&endpoint),
            Role::Publisher => Topology::publisher(&endpoint),
        };
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            role,
            endpoint,
            topology,
            transport,
            retry,
            stop: stop.child_token(),
            slot: Mutex::new(Slot {
                session: None,
                generation: 0,
            }),
            state_tx,
            events_tx,
        });

        let handler = tokio::spawn(handle_session_events(shared.clone(), events_rx));

        Self { shared, handler }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.shared.endpoint
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Receives every state transition, including connection loss.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Opens a session and declares the topology, retrying connectivity
    /// failures per the retry policy. Returns immediately if already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.shared.slot.lock().await;
        self.shared.connect_locked(&mut slot).await
    }

    /// Closes the channel and connection if any. Safe to call repeatedly.
    pub async fn teardown(&self) {
        let mut slot = self.shared.slot.lock().await;
        self.shared.teardown_locked(&mut slot).await;
    }

    /// Stops the notification handler, then tears the session down, so no
    /// reconnect can race a deliberate shutdown.
    pub async fn shutdown(&self) {
        self.shared.stop.cancel();
        self.teardown().await;
    }

    pub async fn is_healthy(&self) -> bool {
        self.shared.slot.lock().await.is_healthy()
    }

    /// Starts consuming from the topology's queue on the current channel.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let slot = self.shared.slot.lock().await;
        let session = slot
            .session
            .as_deref()
            .filter(|session| session.is_open())
            .ok_or(RabbitMQError::ChannelUnavailable)?;

        let queue = match &self.shared.topology.queue {
            Some(queue) => queue.name.as_str(),
            None => self.shared.endpoint.queue.as_str(),
        };
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let stream = session.consume(queue, &consumer_tag).await?;

        info!(queue, consumer_tag = %consumer_tag, "Consumer started listening on queue");
        Ok(Subscription {
            generation: slot.generation,
            consumer_tag,
            stream,
        })
    }

    /// Acknowledges a delivery received on session `generation`.
    pub async fn ack(&self, generation: u64, delivery_tag: u64) -> Result<()> {
        let slot = self.shared.slot.lock().await;
        let session = slot
            .current(generation)
            .ok_or(RabbitMQError::StaleDelivery { delivery_tag })?;
        session.ack(delivery_tag).await
    }

    /// Rejects a delivery received on session `generation`.
    pub async fn nack(&self, generation: u64, delivery_tag: u64, requeue: bool) -> Result<()> {
        let slot = self.shared.slot.lock().await;
        let session = slot
            .current(generation)
            .ok_or(RabbitMQError::StaleDelivery { delivery_tag })?;
        session.nack(delivery_tag, requeue).await
    }

    /// Holds the manager lock so a caller can reconnect and use the channel as
    /// one critical section.
    pub(crate) async fn lock(&self) -> SessionGuard<'_> {
        SessionGuard {
            shared: &self.shared,
            slot: self.shared.slot.lock().await,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.stop.cancel();
        self.handler.abort();
    }
}

pub(crate) struct SessionGuard<'a> {
    shared: &'a Shared,
    slot: MutexGuard<'a, Slot>,
}

impl SessionGuard<'_> {
    pub(crate) fn is_healthy(&self) -> bool {
        self.slot.is_healthy()
    }

    pub(crate) async fn connect(&mut self) -> Result<()> {
        self.shared.connect_locked(&mut self.slot).await
    }

    pub(crate) fn session(&self) -> Option<&dyn Session> {
        self.slot
            .session
            .as_deref()
            .filter(|session| session.is_open())
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    async fn connect_locked(&self, slot: &mut Slot) -> Result<()> {
        if slot.is_healthy() {
            return Ok(());
        }

        if slot.session.is_some() {
            warn!("RabbitMQ connection or channel found closed, replacing it");
            self.teardown_locked(slot).await;
        }

        self.set_state(ConnectionState::Connecting);
        info!(endpoint = %self.endpoint, role = ?self.role, "Attempting to connect to RabbitMQ");

        match self.retry.run(&self.stop, || self.establish()).await {
            Ok(session) => {
                slot.generation += 1;
                let generation = slot.generation;
                let events = self.events_tx.clone();
                session.on_shutdown(Arc::new(move |notice| {
                    // The handler task may already be gone during shutdown.
                    let _ = events.send(SessionEvent { generation, notice });
                }));
                slot.session = Some(session);
                self.set_state(ConnectionState::Connected);

                info!(
                    exchange = %self.topology.exchange.name,
                    queue = self.topology.queue.as_ref().map(|q| q.name.as_str()),
                    generation,
                    "Successfully connected to RabbitMQ, channel opened and topology declared"
                );
                Ok(())
            }
            Err(RabbitMQError::Cancelled) => {
                self.set_state(ConnectionState::Disconnected);
                debug!("RabbitMQ connect cancelled");
                Err(RabbitMQError::Cancelled)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(error = %e, "Failed to establish RabbitMQ connection");
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<Box<dyn Session>> {
        let session = self.transport.open(&self.endpoint).await?;

        if let Err(e) = session.declare(&self.topology).await {
            error!(error = %e, "Failed to declare RabbitMQ topology");
            close_quietly(session.as_ref()).await;
            return Err(e);
        }

        Ok(session)
    }

    async fn teardown_locked(&self, slot: &mut Slot) {
        // Orphans the listener registered on the outgoing session.
        slot.generation += 1;

        if let Some(session) = slot.session.take() {
            info!("Closing RabbitMQ channel and connection");
            close_quietly(session.as_ref()).await;
        }

        self.set_state(ConnectionState::Disconnected);
    }

    async fn on_shutdown_notice(&self, event: SessionEvent) {
        let mut slot = self.slot.lock().await;

        if event.generation != slot.generation || slot.session.is_none() {
            debug!(
                scope = %event.notice.scope,
                generation = event.generation,
                "Ignoring shutdown notification from a replaced session"
            );
            return;
        }

        warn!(
            scope = %event.notice.scope,
            reason = %event.notice.reason,
            "RabbitMQ {} shut down: {}",
            event.notice.scope,
            event.notice.reason
        );
        self.teardown_locked(&mut slot).await;

        if self.role == Role::Publisher {
            info!("Attempting to reconnect RabbitMQ publisher");
            if let Err(e) = self.connect_locked(&mut slot).await {
                error!(error = %e, "RabbitMQ publisher reconnect failed");
            }
        }
    }
}

async fn close_quietly(session: &dyn Session) {
    if let Err(e) = session.close().await {
        error!(error = %e, "Error disposing RabbitMQ channel or connection");
    }
}

async fn handle_session_events(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = shared.stop.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        shared.on_shutdown_notice(event).await;
    }
    debug!(role = ?shared.role, "RabbitMQ shutdown handler stopped");
}
