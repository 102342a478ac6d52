use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rabbitmq::errors::Result;

/// Exchange every task event is published to.
pub const TASKS_EXCHANGE: &str = "tasks";

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum TaskEventType {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
}

impl TaskEventType {
    pub fn routing_key(self) -> &'static str {
        match self {
            TaskEventType::TaskCreated => "task.created",
            TaskEventType::TaskUpdated => "task.updated",
            TaskEventType::TaskDeleted => "task.deleted",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskEventType::TaskCreated => "TaskCreated",
            TaskEventType::TaskUpdated => "TaskUpdated",
            TaskEventType::TaskDeleted => "TaskDeleted",
        }
    }
}

impl fmt::Display for TaskEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire format: `{"EventType": "...", "Payload": {...}}`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct EventEnvelope<P> {
    pub event_type: TaskEventType,
    pub payload: P,
}

impl<P: Serialize> EventEnvelope<P> {
    pub fn new(event_type: TaskEventType, payload: P) -> Self {
        EventEnvelope {
            event_type,
            payload,
        }
    }

    pub fn routing_key(&self) -> &'static str {
        self.event_type.routing_key()
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    New,
    InProgress,
    Completed,
}

/// Task as it is published with created and updated events.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskRecord {
    pub id: i32,
    pub title: String,
    pub description: Option<String>,
    pub item_status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: i32, title: impl Into<String>) -> Self {
        let now = Utc::now();
        TaskRecord {
            id,
            title: title.into(),
            description: None,
            item_status: TaskStatus::New,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskDeletedPayload {
    pub task_id: i32,
}

/// Fields pulled out of a received body for log lines. Extraction never
/// fails: anything missing or of the wrong type gets a placeholder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventSummary {
    pub event_type: String,
    pub task_id: String,
}

impl Default for EventSummary {
    fn default() -> Self {
        EventSummary {
            event_type: "Unknown".to_string(),
            task_id: "Unknown".to_string(),
        }
    }
}

impl EventSummary {
    pub fn extract(document: &Value) -> Self {
        let mut summary = EventSummary::default();

        if let Some(event_type) = document.get("EventType").and_then(Value::as_str) {
            summary.event_type = event_type.to_string();
        }

        // `Id` wins over `TaskId` when both are present.
        if let Some(payload) = document.get("Payload") {
            let id = payload.get("Id").or_else(|| payload.get("TaskId"));
            if let Some(id) = id {
                summary.task_id = match id.as_i64().and_then(|id| i32::try_from(id).ok()) {
                    Some(id) => id.to_string(),
                    None => "NonInt".to_string(),
                };
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn created_envelope_uses_pascal_case_keys() {
        let mut task = TaskRecord::new(1, "Write report");
        task.item_status = TaskStatus::InProgress;
        let envelope = EventEnvelope::new(TaskEventType::TaskCreated, task);

        let value: Value = serde_json::from_slice(&envelope.to_body().unwrap()).unwrap();

        assert_eq!(value["EventType"], "TaskCreated");
        assert_eq!(value["Payload"]["Id"], 1);
        assert_eq!(value["Payload"]["Title"], "Write report");
        assert_eq!(value["Payload"]["ItemStatus"], "InProgress");
        assert!(value["Payload"]["Description"].is_null());
        assert!(value["Payload"]["CreatedAt"].is_string());
        assert_eq!(envelope.routing_key(), "task.created");
    }

    #[test]
    fn deleted_envelope_carries_only_the_task_id() {
        let envelope =
            EventEnvelope::new(TaskEventType::TaskDeleted, TaskDeletedPayload { task_id: 7 });

        let body = String::from_utf8(envelope.to_body().unwrap()).unwrap();

        assert_eq!(body, r#"{"EventType":"TaskDeleted","Payload":{"TaskId":7}}"#);
        assert_eq!(envelope.routing_key(), "task.deleted");
    }

    #[test]
    fn routing_keys_match_the_listener_binding() {
        use crate::testing::topic_matches;

        for event_type in [
            TaskEventType::TaskCreated,
            TaskEventType::TaskUpdated,
            TaskEventType::TaskDeleted,
        ] {
            assert!(topic_matches("task.*", event_type.routing_key()));
        }
    }

    #[test]
    fn summary_reads_event_type_and_id() {
        let summary = EventSummary::extract(&json!({
            "EventType": "TaskUpdated",
            "Payload": { "Id": 42, "Title": "x" }
        }));

        assert_eq!(summary.event_type, "TaskUpdated");
        assert_eq!(summary.task_id, "42");
    }

    #[test]
    fn summary_falls_back_to_task_id() {
        let summary = EventSummary::extract(&json!({
            "EventType": "TaskDeleted",
            "Payload": { "TaskId": 3 }
        }));

        assert_eq!(summary.task_id, "3");
    }

    #[test]
    fn summary_marks_non_integer_ids() {
        let text = EventSummary::extract(&json!({ "Payload": { "Id": "abc" } }));
        let fraction = EventSummary::extract(&json!({ "Payload": { "Id": 1.5 } }));
        let too_large = EventSummary::extract(&json!({ "Payload": { "TaskId": 4_000_000_000u64 } }));

        assert_eq!(text.task_id, "NonInt");
        assert_eq!(fraction.task_id, "NonInt");
        assert_eq!(too_large.task_id, "NonInt");
        assert_eq!(text.event_type, "Unknown");
    }

    #[test]
    fn summary_defaults_when_fields_are_missing() {
        assert_eq!(EventSummary::extract(&json!({})), EventSummary::default());
        assert_eq!(
            EventSummary::extract(&json!({ "EventType": 5, "Payload": [1, 2] })),
            EventSummary::default()
        );
    }
}
