// src/testing/mod.rs
// Test support: an in-process broker and small helpers shared by the unit
// and integration tests.

mod memory_broker;

use std::time::Duration;

pub use memory_broker::{topic_matches, InMemoryBroker, Outcome, Settlement};

use crate::rabbitmq::topology::{BrokerEndpoint, TASK_ROUTING_PATTERN};

/// Endpoint matching the default configuration.
pub fn test_endpoint() -> BrokerEndpoint {
    BrokerEndpoint {
        host: "localhost".to_string(),
        port: 5672,
        username: "guest".to_string(),
        password: "guest".to_string(),
        virtual_host: "/".to_string(),
        exchange: "tasks".to_string(),
        queue: "task_events_log_queue".to_string(),
        routing_pattern: TASK_ROUTING_PATTERN.to_string(),
    }
}

/// Polls `condition` until it holds. Panics after ten seconds of Tokio time,
/// so it also works with a paused clock.
pub async fn eventually<F>(condition: F)
where
    F: FnMut() -> bool,
{
    eventually_within(Duration::from_secs(10), condition).await;
}

/// [`eventually`] with a caller-chosen deadline, for paused-clock tests that
/// sit through whole backoff schedules.
pub async fn eventually_within<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
