//! Worker event taxonomy and the in-process event publisher.
//!
//! The worker emits four kinds of events. Only [`WorkerEvent`] decides task
//! completion; [`TaskEvent`], [`ProgressEvent`] and [`DataEvent`] are
//! forwarded telemetry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::state::WorkerState;
use crate::task::TaskId;

/// Completion flags for the task a worker event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task the event belongs to
    pub task_id: TaskId,
    /// The task has finished (successfully or not)
    pub task_complete: bool,
    /// The task has failed
    pub task_failed: bool,
}

/// Worker state change, optionally tied to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEvent {
    /// Engine state after the change
    pub state: WorkerState,
    /// Task the change relates to
    #[serde(default)]
    pub task_status: Option<TaskStatus>,
    /// Errors raised by the task, in order
    #[serde(default)]
    pub errors: Vec<String>,
    /// Warnings raised by the task, in order
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl WorkerEvent {
    /// True for the event that ends a task.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
            && self
                .task_status
                .as_ref()
                .is_some_and(|status| status.task_complete)
    }

    /// True when the task reported errors.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Task this event refers to, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<&TaskId> {
        self.task_status.as_ref().map(|status| &status.task_id)
    }
}

/// Lifecycle phase of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Registered, waiting for the start command
    Pending,
    /// Executing
    Running,
    /// Finished without error
    Succeeded,
    /// Finished with an error or was aborted
    Failed,
}

/// Task lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task identifier
    pub task_id: TaskId,
    /// Plan name
    pub name: String,
    /// New phase
    pub phase: TaskPhase,
    /// Errors, present when the phase is `failed`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Progress of one long-running operation inside a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    /// Human-readable name of the operation
    pub display_name: String,
    /// Current value
    #[serde(default)]
    pub current: Option<f64>,
    /// Value when the operation started
    #[serde(default)]
    pub initial: Option<f64>,
    /// Value the operation is heading to
    #[serde(default)]
    pub target: Option<f64>,
    /// Unit of the values
    #[serde(default)]
    pub unit: Option<String>,
    /// Fraction completed in 0..=1
    #[serde(default)]
    pub percentage: Option<f64>,
    /// Seconds since the operation started
    #[serde(default)]
    pub time_elapsed: Option<f64>,
    /// Whether the operation is finished
    pub done: bool,
}

/// Progress report for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Task identifier
    pub task_id: TaskId,
    /// Operation id to progress view
    pub statuses: BTreeMap<String, StatusView>,
}

/// A data document produced by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Document kind ("start", "event", "stop", ...)
    pub name: String,
    /// Document body
    pub doc: Value,
    /// Task that produced it
    pub task_id: TaskId,
}

/// Any event delivered over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Worker state change
    Worker(WorkerEvent),
    /// Task progress
    Progress(ProgressEvent),
    /// Task lifecycle
    Task(TaskEvent),
    /// Data document
    Data(DataEvent),
}

impl BusEvent {
    /// Task the event is correlated with.
    #[must_use]
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Worker(event) => event.task_id(),
            Self::Progress(event) => Some(&event.task_id),
            Self::Task(event) => Some(&event.task_id),
            Self::Data(event) => Some(&event.task_id),
        }
    }

    /// The terminal worker event, if this is one.
    #[must_use]
    pub fn as_terminal(&self) -> Option<&WorkerEvent> {
        match self {
            Self::Worker(event) if event.is_complete() => Some(event),
            _ => None,
        }
    }

    /// Serialize the wrapped event as it travels on the wire.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Self::Worker(event) => serde_json::to_value(event),
            Self::Progress(event) => serde_json::to_value(event),
            Self::Task(event) => serde_json::to_value(event),
            Self::Data(event) => serde_json::to_value(event),
        }
    }
}

/// Broadcast-based publisher for in-process worker events.
///
/// Uses `tokio::broadcast` so multiple subscribers can receive the same events.
/// Slow subscribers will miss events (lagged) rather than blocking the worker.
#[derive(Debug, Clone)]
pub struct EventPublisher<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventPublisher<T> {
    /// Create a publisher with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Publish an event to all active subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: T) -> usize {
        // send() returns Err if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the current number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone> Default for EventPublisher<T> {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(task_id: &str, errors: Vec<String>) -> WorkerEvent {
        WorkerEvent {
            state: WorkerState::Idle,
            task_status: Some(TaskStatus {
                task_id: TaskId::from(task_id),
                task_complete: true,
                task_failed: !errors.is_empty(),
            }),
            errors,
            warnings: vec![],
        }
    }

    #[test]
    fn test_completion_requires_terminal_state_and_flag() {
        assert!(finished("t1", vec![]).is_complete());

        let mut running = finished("t1", vec![]);
        running.state = WorkerState::Running;
        assert!(!running.is_complete());

        let mut not_done = finished("t1", vec![]);
        not_done.task_status.as_mut().unwrap().task_complete = false;
        assert!(!not_done.is_complete());

        let idle = WorkerEvent {
            state: WorkerState::Idle,
            task_status: None,
            errors: vec![],
            warnings: vec![],
        };
        assert!(!idle.is_complete());
    }

    #[test]
    fn test_is_error() {
        assert!(!finished("t1", vec![]).is_error());
        assert!(finished("t1", vec!["motor fault".into()]).is_error());
    }

    #[test]
    fn test_worker_event_round_trip_preserves_predicates() {
        let events = [
            finished("t1", vec![]),
            finished("t2", vec!["aborted".into()]),
            WorkerEvent {
                state: WorkerState::Paused,
                task_status: Some(TaskStatus {
                    task_id: TaskId::from("t3"),
                    task_complete: false,
                    task_failed: false,
                }),
                errors: vec![],
                warnings: vec!["slow".into()],
            },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let back: WorkerEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back.is_complete(), event.is_complete());
            assert_eq!(back.is_error(), event.is_error());
            assert_eq!(back, event);
        }
    }

    #[test]
    fn test_bus_event_task_id() {
        let id = TaskId::from("t9");
        let events = vec![
            BusEvent::Worker(finished("t9", vec![])),
            BusEvent::Progress(ProgressEvent {
                task_id: id.clone(),
                statuses: BTreeMap::new(),
            }),
            BusEvent::Task(TaskEvent {
                task_id: id.clone(),
                name: "sleep".into(),
                phase: TaskPhase::Running,
                errors: vec![],
            }),
            BusEvent::Data(DataEvent {
                name: "start".into(),
                doc: serde_json::json!({}),
                task_id: id.clone(),
            }),
        ];
        for event in events {
            assert_eq!(event.task_id(), Some(&id));
        }
    }

    #[test]
    fn test_only_worker_events_are_terminal() {
        assert!(BusEvent::Worker(finished("t1", vec![])).as_terminal().is_some());
        let task = BusEvent::Task(TaskEvent {
            task_id: TaskId::from("t1"),
            name: "sleep".into(),
            phase: TaskPhase::Succeeded,
            errors: vec![],
        });
        assert!(task.as_terminal().is_none());
    }

    #[tokio::test]
    async fn test_publisher_fan_out() {
        let publisher = EventPublisher::new(16);
        let mut rx1 = publisher.subscribe();
        let mut rx2 = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);

        let count = publisher.publish(finished("t1", vec![]));
        assert_eq!(count, 2);
        assert!(rx1.recv().await.unwrap().is_complete());
        assert!(rx2.recv().await.unwrap().is_complete());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publisher: EventPublisher<WorkerEvent> = EventPublisher::default();
        assert_eq!(publisher.publish(finished("t1", vec![])), 0);
    }
}
