use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;
use vigil_kernel::events::{EventSink, TaskEvent, TaskTransition};

/// Keeps every task event the engine emits, in emission order
#[derive(Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<TaskEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().clone()
    }

    pub fn for_notification(&self, uuid: Uuid) -> Vec<TaskEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.notification_uuid == Some(uuid))
            .cloned()
            .collect()
    }

    /// `(task, transition)` pairs for one notification, handy for exact assertions
    pub fn transitions(&self, uuid: Uuid) -> Vec<(String, TaskTransition)> {
        self.for_notification(uuid)
            .into_iter()
            .map(|e| (e.task_name, e.transition))
            .collect()
    }

    pub fn count(&self, transition: TaskTransition) -> usize {
        self.events.lock().iter().filter(|e| e.transition == transition).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: TaskEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_order_and_filters() {
        let sink = RecordingEventSink::new();
        let ours = Uuid::new_v4();
        sink.emit(TaskEvent::new("a", Some(ours), TaskTransition::Started));
        sink.emit(TaskEvent::new("a", Some(Uuid::new_v4()), TaskTransition::Started));
        sink.emit(TaskEvent::new("a", Some(ours), TaskTransition::Failed).with_cause("boom"));

        assert_eq!(sink.events().len(), 3);
        assert_eq!(
            sink.transitions(ours),
            vec![("a".to_string(), TaskTransition::Started), ("a".to_string(), TaskTransition::Failed)]
        );
        assert_eq!(sink.count(TaskTransition::Started), 2);

        sink.clear();
        assert!(sink.events().is_empty());
    }
}
