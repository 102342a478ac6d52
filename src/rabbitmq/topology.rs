use std::fmt;

use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};

/// Routing pattern the listener queue is bound with.
pub const TASK_ROUTING_PATTERN: &str = "task.*";

/// Where the broker lives and which exchange/queue the roles use.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    pub exchange: String,
    pub queue: String,
    pub routing_pattern: String,
}

impl BrokerEndpoint {
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            ..AMQPUri::default()
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("virtual_host", &self.virtual_host)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("routing_pattern", &self.routing_pattern)
            .finish()
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "amqp://{}@{}:{}/{}",
            self.username, self.host, self.port, self.virtual_host
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub pattern: String,
}

/// Everything declared on a fresh channel before it is used.
///
/// The exchange is always a topic exchange. The listener additionally owns a
/// queue, its binding and a per-consumer prefetch limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: ExchangeSpec,
    pub queue: Option<QueueSpec>,
    pub binding: Option<BindingSpec>,
    pub prefetch_count: Option<u16>,
}

impl Topology {
    pub fn consumer(endpoint: &BrokerEndpoint) -> Self {
        Self {
            exchange: ExchangeSpec {
                name: endpoint.exchange.clone(),
                durable: true,
            },
            queue: Some(QueueSpec {
                name: endpoint.queue.clone(),
                durable: true,
                exclusive: false,
                auto_delete: false,
            }),
            binding: Some(BindingSpec {
                queue: endpoint.queue.clone(),
                exchange: endpoint.exchange.clone(),
                pattern: endpoint.routing_pattern.clone(),
            }),
            prefetch_count: Some(1),
        }
    }

    pub fn publisher(endpoint: &BrokerEndpoint) -> Self {
        Self {
            exchange: ExchangeSpec {
                name: endpoint.exchange.clone(),
                durable: true,
            },
            queue: None,
            binding: None,
            prefetch_count: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> BrokerEndpoint {
        BrokerEndpoint {
            host: "rabbit.internal".to_string(),
            port: 5673,
            username: "tasks".to_string(),
            password: "s3cret".to_string(),
            virtual_host: "/".to_string(),
            exchange: "tasks".to_string(),
            queue: "task_events_log_queue".to_string(),
            routing_pattern: TASK_ROUTING_PATTERN.to_string(),
        }
    }

    #[test]
    fn consumer_topology_declares_queue_binding_and_qos() {
        let topology = Topology::consumer(&endpoint());

        assert!(topology.exchange.durable);
        let queue = topology.queue.expect("queue");
        assert!(queue.durable && !queue.exclusive && !queue.auto_delete);
        assert_eq!(
            topology.binding,
            Some(BindingSpec {
                queue: "task_events_log_queue".to_string(),
                exchange: "tasks".to_string(),
                pattern: "task.*".to_string(),
            })
        );
        assert_eq!(topology.prefetch_count, Some(1));
    }

    #[test]
    fn publisher_topology_only_declares_the_exchange() {
        let topology = Topology::publisher(&endpoint());

        assert_eq!(topology.exchange.name, "tasks");
        assert!(topology.queue.is_none());
        assert!(topology.binding.is_none());
        assert!(topology.prefetch_count.is_none());
    }

    #[test]
    fn uri_carries_every_endpoint_field() {
        let uri = endpoint().amqp_uri();

        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "tasks");
        assert_eq!(uri.authority.userinfo.password, "s3cret");
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn password_is_never_rendered() {
        let endpoint = endpoint();

        assert!(!format!("{endpoint}").contains("s3cret"));
        assert!(!format!("{endpoint:?}").contains("s3cret"));
    }
}
