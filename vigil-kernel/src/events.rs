//! Task lifecycle events.
//!
//! The engine reports every task transition to an [`EventSink`] injected at
//! construction; the sink decides where events go (log, MQTT, test recorder).

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const RECOVERY_EVENTS_TOPIC: &str = "vigil/recovery/events@v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTransition {
    Started,
    Retrying,
    Succeeded,
    Failed,
}

impl fmt::Display for TaskTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskTransition::Started => "started",
            TaskTransition::Retrying => "retrying",
            TaskTransition::Succeeded => "succeeded",
            TaskTransition::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_name: String,
    pub notification_uuid: Option<Uuid>,
    pub transition: TaskTransition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl TaskEvent {
    pub fn new(task_name: &str, notification_uuid: Option<Uuid>, transition: TaskTransition) -> Self {
        Self {
            task_name: task_name.to_string(),
            notification_uuid,
            transition,
            cause: None,
            at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: TaskEvent);
}

pub type SharedEventSink = Arc<dyn EventSink>;

/// Writes task events to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: TaskEvent) {
        let notification = event.notification_uuid.map(|u| u.to_string()).unwrap_or_default();
        match event.transition {
            TaskTransition::Failed | TaskTransition::Retrying => warn!(
                task = %event.task_name,
                notification = %notification,
                cause = event.cause.as_deref().unwrap_or(""),
                "task {}", event.transition
            ),
            _ => info!(
                task = %event.task_name,
                notification = %notification,
                "task {}", event.transition
            ),
        }
    }
}

/// Publishes task events on the recovery events topic and mirrors them to the log
pub struct MqttEventSink {
    client: AsyncClient,
    topic: String,
}

impl MqttEventSink {
    pub fn new(client: AsyncClient) -> Self {
        Self { client, topic: RECOVERY_EVENTS_TOPIC.to_string() }
    }
}

impl EventSink for MqttEventSink {
    fn emit(&self, event: TaskEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => {
                // emit is called from inside running tasks; never block on the broker
                if let Err(e) = self.client.try_publish(&self.topic, QoS::AtLeastOnce, false, payload) {
                    warn!("failed to publish task event for {}: {e}", event.task_name);
                } else {
                    debug!(task = %event.task_name, "published task event");
                }
            }
            Err(e) => warn!("failed to serialize task event: {e}"),
        }
        TracingEventSink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let uuid = Uuid::new_v4();
        let event = TaskEvent::new("disable_compute_service_task", Some(uuid), TaskTransition::Failed)
            .with_cause("connection refused");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["task_name"], "disable_compute_service_task");
        assert_eq!(json["notification_uuid"], uuid.to_string());
        assert_eq!(json["transition"], "failed");
        assert_eq!(json["cause"], "connection refused");

        let started = serde_json::to_value(TaskEvent::new("x", None, TaskTransition::Started)).unwrap();
        assert!(started.get("cause").is_none());
    }
}
