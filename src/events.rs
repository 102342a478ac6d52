// src/events.rs
// Emits task events after the task store has accepted a change.
//
// Publishing is best-effort: a broker failure is logged and reported as
// `false`, it never undoes or fails the business operation that triggered it.

use serde::Serialize;
use tracing::{error, info};

use crate::message::{
    EventEnvelope, TaskDeletedPayload, TaskEventType, TaskRecord, TASKS_EXCHANGE,
};
use crate::rabbitmq::publisher::MessageProducer;

pub struct TaskEventPublisher<P> {
    producer: P,
    exchange: String,
}

impl<P: MessageProducer> TaskEventPublisher<P> {
    pub fn new(producer: P) -> Self {
        Self::with_exchange(producer, TASKS_EXCHANGE)
    }

    pub fn with_exchange(producer: P, exchange: impl Into<String>) -> Self {
        TaskEventPublisher {
            producer,
            exchange: exchange.into(),
        }
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    pub async fn task_created(&self, task: &TaskRecord) -> bool {
        self.emit(TaskEventType::TaskCreated, task.id, task).await
    }

    pub async fn task_updated(&self, task: &TaskRecord) -> bool {
        self.emit(TaskEventType::TaskUpdated, task.id, task).await
    }

    pub async fn task_deleted(&self, task_id: i32) -> bool {
        self.emit(
            TaskEventType::TaskDeleted,
            task_id,
            &TaskDeletedPayload { task_id },
        )
        .await
    }

    async fn emit<T: Serialize + Sync>(&self, event_type: TaskEventType, task_id: i32, payload: &T) -> bool {
        let envelope = EventEnvelope::new(event_type, payload);

        let result = match envelope.to_body() {
            Ok(body) => {
                self.producer
                    .send_message(&self.exchange, event_type.routing_key(), &body)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(event_type = %event_type, task_id, "{event_type} event published");
                true
            }
            Err(e) => {
                error!(
                    event_type = %event_type,
                    task_id,
                    error = %e,
                    "Failed to publish {event_type} event"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::errors::{RabbitMQError, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProducer {
        sent: Mutex<Vec<(String, String, Value)>>,
        unavailable: bool,
    }

    #[async_trait]
    impl MessageProducer for RecordingProducer {
        async fn send_message(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
            if self.unavailable {
                return Err(RabbitMQError::ChannelUnavailable);
            }
            self.sent.lock().unwrap().push((
                exchange.to_string(),
                routing_key.to_string(),
                serde_json::from_slice(body).unwrap(),
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn created_event_carries_the_task() {
        let events = TaskEventPublisher::new(RecordingProducer::default());
        let task = TaskRecord::new(1, "New Test Task");

        assert!(events.task_created(&task).await);

        let sent = events.producer().sent.lock().unwrap();
        let (exchange, routing_key, body) = &sent[0];
        assert_eq!(exchange, "tasks");
        assert_eq!(routing_key, "task.created");
        assert_eq!(body["EventType"], "TaskCreated");
        let payload: TaskRecord = serde_json::from_value(body["Payload"].clone()).unwrap();
        assert_eq!(payload, task);
    }

    #[tokio::test]
    async fn updated_and_deleted_use_their_routing_keys() {
        let events = TaskEventPublisher::new(RecordingProducer::default());

        assert!(events.task_updated(&TaskRecord::new(2, "Edited")).await);
        assert!(events.task_deleted(2).await);

        let sent = events.producer().sent.lock().unwrap();
        assert_eq!(sent[0].1, "task.updated");
        assert_eq!(sent[1].1, "task.deleted");
        assert_eq!(sent[1].2["Payload"], serde_json::json!({ "TaskId": 2 }));
    }

    #[tokio::test]
    async fn broker_failure_is_reported_not_raised() {
        let events = TaskEventPublisher::new(RecordingProducer {
            unavailable: true,
            ..RecordingProducer::default()
        });

        assert!(!events.task_deleted(5).await);
        assert!(events.producer().sent.lock().unwrap().is_empty());
    }
}
