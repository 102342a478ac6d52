// src/testing/memory_broker.rs
// In-process broker with AMQP 0-9-1 semantics close enough to exercise the
// connection managers: topic routing, durable queues, per-channel delivery
// tags, prefetch limits, requeue of unacknowledged deliveries when a channel
// goes away, and failure injection.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;

use crate::rabbitmq::errors::{RabbitMQError, Result};
use crate::rabbitmq::topology::{BindingSpec, BrokerEndpoint, Topology};
use crate::rabbitmq::transport::{
    DeliveryStream, InboundMessage, OutboundMessage, Session, ShutdownListener, ShutdownNotice,
    ShutdownScope, Transport,
};

/// How a delivery was settled by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub session: u64,
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
struct Stored {
    routing_key: String,
    body: Vec<u8>,
}

struct ConsumerState {
    queue: String,
    sender: mpsc::UnboundedSender<Result<InboundMessage>>,
}

struct SessionState {
    open: bool,
    prefetch: Option<u16>,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Stored)>,
    consumer: Option<ConsumerState>,
    listeners: Vec<ShutdownListener>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, VecDeque<Stored>>,
    bindings: Vec<BindingSpec>,
    sessions: BTreeMap<u64, SessionState>,
    next_session: u64,
    fail_connects: u32,
    fail_declares: u32,
    connection_attempts: u32,
    declarations: u32,
    published: Vec<OutboundMessage>,
    settlements: Vec<Settlement>,
    violations: Vec<String>,
}

/// Cheap to clone; all clones share one broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not hide the broker from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `count` connection attempts fail as if the host were down.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().fail_connects = count;
    }

    /// The next `count` topology declarations fail with a channel-level
    /// protocol error.
    pub fn fail_next_declares(&self, count: u32) {
        self.lock().fail_declares = count;
    }

    pub fn declare_exchange(&self, name: &str) {
        self.lock().exchanges.insert(name.to_string());
    }

    pub fn delete_exchange(&self, name: &str) {
        let mut state = self.lock();
        state.exchanges.remove(name);
        state.bindings.retain(|binding| binding.exchange != name);
    }

    /// Closes every open connection from the broker side and notifies the
    /// registered listeners, like a broker restart or a forced close.
    pub fn drop_connections(&self, reason: &str) {
        let notify = {
            let mut state = self.lock();
            let ids: Vec<u64> = state
                .sessions
                .iter()
                .filter(|(_, session)| session.open)
                .map(|(id, _)| *id)
                .collect();
            let mut notify = Vec::new();
            for id in ids {
                notify.extend(state.close_session(id));
            }
            notify
        };

        for listener in notify {
            listener(ShutdownNotice {
                scope: ShutdownScope::Connection,
                reason: reason.to_string(),
            });
        }
    }

    /// Publishes as an unrelated client would. Returns whether any queue
    /// received the message.
    pub fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> bool {
        let mut state = self.lock();
        if !state.exchanges.contains(exchange) {
            return false;
        }
        let routed = state.route(&OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
        });
        state.dispatch();
        routed
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, pattern: &str) -> bool {
        self.lock().bindings.iter().any(|binding| {
            binding.queue == queue && binding.exchange == exchange && binding.pattern == pattern
        })
    }

    /// Ready messages, not counting deliveries awaiting settlement.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked(&self) -> usize {
        self.lock()
            .sessions
            .values()
            .map(|session| session.unacked.len())
            .sum()
    }

    pub fn prefetch_limits(&self) -> Vec<u16> {
        self.lock()
            .sessions
            .values()
            .filter(|session| session.open)
            .filter_map(|session| session.prefetch)
            .collect()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock()
            .sessions
            .values()
            .filter(|session| session.open)
            .count()
    }

    pub fn connection_attempts(&self) -> u32 {
        self.lock().connection_attempts
    }

    pub fn declarations(&self) -> u32 {
        self.lock().declarations
    }

    /// Messages accepted by an exchange through a client session.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.lock().published.clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }

    pub fn dispositions(&self) -> Vec<Outcome> {
        self.lock()
            .settlements
            .iter()
            .map(|settlement| settlement.outcome)
            .collect()
    }

    /// Protocol misuse seen so far, such as settling a tag twice.
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }
}

impl BrokerState {
    fn session_mut(&mut self, id: u64) -> Result<&mut SessionState> {
        match self.sessions.get_mut(&id) {
            Some(session) if session.open => Ok(session),
            _ => Err(RabbitMQError::ChannelError(format!(
                "channel {id} is closed"
            ))),
        }
    }

    /// Marks the session closed, returns its deliveries to their queues and
    /// hands back the listeners to notify once the lock is released.
    fn close_session(&mut self, id: u64) -> Vec<ShutdownListener> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        if !session.open {
            return Vec::new();
        }
        session.open = false;
        session.consumer = None;
        let unacked = std::mem::take(&mut session.unacked);
        let listeners = std::mem::take(&mut session.listeners);

        for (_, (queue, message)) in unacked.into_iter().rev() {
            if let Some(messages) = self.queues.get_mut(&queue) {
                messages.push_front(message);
            }
        }
        self.dispatch();
        listeners
    }

    fn route(&mut self, message: &OutboundMessage) -> bool {
        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|binding| {
                binding.exchange == message.exchange
                    && topic_matches(&binding.pattern, &message.routing_key)
            })
            .map(|binding| binding.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for queue in &targets {
            if let Some(messages) = self.queues.get_mut(queue) {
                messages.push_back(Stored {
                    routing_key: message.routing_key.clone(),
                    body: message.body.clone(),
                });
            }
        }
        !targets.is_empty()
    }

    /// Pushes ready messages to consumers with free prefetch capacity.
    fn dispatch(&mut self) {
        let queues = &mut self.queues;
        for session in self.sessions.values_mut().filter(|session| session.open) {
            let Some(consumer) = &session.consumer else {
                continue;
            };
            let Some(messages) = queues.get_mut(&consumer.queue) else {
                continue;
            };

            loop {
                let limit = session.prefetch.filter(|limit| *limit > 0);
                if limit.is_some_and(|limit| session.unacked.len() >= usize::from(limit)) {
                    break;
                }
                let Some(message) = messages.pop_front() else {
                    break;
                };

                session.next_tag += 1;
                let delivery_tag = session.next_tag;
                let delivered = consumer.sender.unbounded_send(Ok(InboundMessage {
                    routing_key: message.routing_key.clone(),
                    body: message.body.clone(),
                    delivery_tag,
                }));
                if delivered.is_err() {
                    // Consumer stream was dropped; keep the message.
                    messages.push_front(message);
                    break;
                }
                session
                    .unacked
                    .insert(delivery_tag, (consumer.queue.clone(), message));
            }
        }
    }

    /// `Some(listeners)` when the tag was unknown and the channel got closed.
    fn settle(
        &mut self,
        id: u64,
        delivery_tag: u64,
        outcome: Outcome,
    ) -> Result<Option<Vec<ShutdownListener>>> {
        let session = self.session_mut(id)?;
        let Some((queue, message)) = session.unacked.remove(&delivery_tag) else {
            self.violations.push(format!(
                "channel {id}: {outcome:?} for unknown delivery tag {delivery_tag}"
            ));
            // PRECONDITION_FAILED closes the channel on a real broker.
            return Ok(Some(self.close_session(id)));
        };

        self.settlements.push(Settlement {
            session: id,
            delivery_tag,
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            outcome,
        });
        if outcome == (Outcome::Nack { requeue: true }) {
            if let Some(messages) = self.queues.get_mut(&queue) {
                messages.push_front(message);
            }
        }
        self.dispatch();
        Ok(None)
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn open(&self, _endpoint: &BrokerEndpoint) -> Result<Box<dyn Session>> {
        let mut state = self.lock();
        state.connection_attempts += 1;

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(RabbitMQError::Unreachable(
                "connection refused (os error 111)".to_string(),
            ));
        }

        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            SessionState {
                open: true,
                prefetch: None,
                next_tag: 0,
                unacked: BTreeMap::new(),
                consumer: None,
                listeners: Vec::new(),
            },
        );

        Ok(Box::new(InMemorySession {
            id,
            broker: self.clone(),
        }))
    }
}

struct InMemorySession {
    id: u64,
    broker: InMemoryBroker,
}

impl InMemorySession {
    /// Closes the channel from the broker side and notifies listeners.
    fn fail_channel(&self, reason: &str) {
        let listeners = self.broker.lock().close_session(self.id);
        notify(listeners, ShutdownScope::Channel, reason);
    }
}

fn notify(listeners: Vec<ShutdownListener>, scope: ShutdownScope, reason: &str) {
    for listener in listeners {
        listener(ShutdownNotice {
            scope,
            reason: reason.to_string(),
        });
    }
}

fn unknown_tag(rejected: Option<Vec<ShutdownListener>>, delivery_tag: u64) -> Result<()> {
    let Some(listeners) = rejected else {
        return Ok(());
    };
    notify(listeners, ShutdownScope::Channel, "PRECONDITION_FAILED - unknown delivery tag");
    Err(RabbitMQError::AckError(format!(
        "unknown delivery tag {delivery_tag}"
    )))
}

#[async_trait]
impl Session for InMemorySession {
    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .sessions
            .get(&self.id)
            .is_some_and(|session| session.open)
    }

    fn on_shutdown(&self, listener: ShutdownListener) {
        if let Some(session) = self.broker.lock().sessions.get_mut(&self.id) {
            session.listeners.push(listener);
        }
    }

    async fn declare(&self, topology: &Topology) -> Result<()> {
        let mut state = self.broker.lock();
        state.session_mut(self.id)?;

        if state.fail_declares > 0 {
            state.fail_declares -= 1;
            return Err(RabbitMQError::ProtocolError(
                "PRECONDITION_FAILED - inequivalent arg 'durable'".to_string(),
            ));
        }

        state.declarations += 1;
        state.exchanges.insert(topology.exchange.name.clone());
        if let Some(queue) = &topology.queue {
            state.queues.entry(queue.name.clone()).or_default();
        }
        if let Some(binding) = &topology.binding {
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
        }
        let prefetch = topology.prefetch_count;
        state.session_mut(self.id)?.prefetch = prefetch;
        Ok(())
    }

    async fn check_exchange(&self, exchange: &str) -> Result<()> {
        let exists = {
            let mut state = self.broker.lock();
            state.session_mut(self.id)?;
            state.exchanges.contains(exchange)
        };

        if exists {
            return Ok(());
        }

        let reason = format!("NOT_FOUND - no exchange '{exchange}' in vhost '/'");
        self.fail_channel(&reason);
        Err(RabbitMQError::ExchangeNotFound {
            exchange: exchange.to_string(),
            reason,
        })
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        let exists = {
            let mut state = self.broker.lock();
            state.session_mut(self.id)?;
            state.exchanges.contains(&message.exchange)
        };

        if !exists {
            let reason = format!("NOT_FOUND - no exchange '{}' in vhost '/'", message.exchange);
            self.fail_channel(&reason);
            return Err(RabbitMQError::PublishError(reason));
        }

        let mut state = self.broker.lock();
        state.published.push(message.clone());
        state.route(message);
        state.dispatch();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            return Err(RabbitMQError::ProtocolError(format!(
                "NOT_FOUND - no queue '{queue}' in vhost '/'"
            )));
        }

        let (sender, receiver) = mpsc::unbounded();
        state.session_mut(self.id)?.consumer = Some(ConsumerState {
            queue: queue.to_string(),
            sender,
        });
        state.dispatch();
        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let rejected = self.broker.lock().settle(self.id, delivery_tag, Outcome::Ack)?;
        unknown_tag(rejected, delivery_tag)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let rejected = self
            .broker
            .lock()
            .settle(self.id, delivery_tag, Outcome::Nack { requeue })?;
        unknown_tag(rejected, delivery_tag)
    }

    async fn close(&self) -> Result<()> {
        // Client-initiated close does not raise shutdown notifications.
        drop(self.broker.lock().close_session(self.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("task.*", "task.created"));
        assert!(topic_matches("task.*", "task.deleted"));
        assert!(!topic_matches("task.*", "task"));
        assert!(!topic_matches("task.*", "task.created.v2"));
        assert!(!topic_matches("task.*", "user.created"));
        assert!(topic_matches("task.#", "task"));
        assert!(topic_matches("task.#", "task.created.v2"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "task.created"));
    }

    #[tokio::test]
    async fn unacked_deliveries_return_to_the_queue_when_the_channel_closes() {
        let broker = InMemoryBroker::new();
        let endpoint = crate::testing::test_endpoint();
        let topology = Topology::consumer(&endpoint);
        let session = broker.open(&endpoint).await.unwrap();
        session.declare(&topology).await.unwrap();
        let mut stream = session.consume(&endpoint.queue, "c1").await.unwrap();

        assert!(broker.publish("tasks", "task.created", b"{}"));
        assert!(broker.publish("tasks", "task.updated", b"{}"));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delivery_tag, 1);
        // prefetch 1 holds the second message back
        assert_eq!(broker.queue_depth(&endpoint.queue), 1);

        session.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth(&endpoint.queue), 2);
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test]
    async fn settling_twice_is_a_violation() {
        let broker = InMemoryBroker::new();
        let endpoint = crate::testing::test_endpoint();
        let session = broker.open(&endpoint).await.unwrap();
        session.declare(&Topology::consumer(&endpoint)).await.unwrap();
        let mut stream = session.consume(&endpoint.queue, "c1").await.unwrap();
        broker.publish("tasks", "task.created", b"{}");
        let delivery = stream.next().await.unwrap().unwrap();

        session.ack(delivery.delivery_tag).await.unwrap();
        assert!(session.ack(delivery.delivery_tag).await.is_err());

        assert_eq!(broker.violations().len(), 1);
        assert!(!session.is_open());
    }
}
