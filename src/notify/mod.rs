//! Task event notifications.
//!
//! The queue publishes a [`TaskEvent`] for every status change and progress
//! report. Delivery is pluggable through [`NotificationSink`]:
//!
//! - [`BroadcastNotifier`]: push channel for real-time subscribers
//! - [`PollingNotifier`]: bounded store-and-poll buffer for clients that poll
//!
//! Publishing is best effort. The queue logs sink failures and carries on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FableResult;
use crate::task::{Task, TaskId};

pub mod broadcast;
pub mod polling;

pub use broadcast::BroadcastNotifier;
pub use polling::PollingNotifier;

/// Kind of task event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEventType {
    /// Status changed (queued, running, canceled, requeued)
    Status,
    /// Progress reported
    Progress,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

/// Event published for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// Task the event belongs to
    pub task_id: TaskId,
    /// Owner of the task
    pub owner_id: String,
    /// Event kind
    pub event_type: TaskEventType,
    /// Event payload
    pub data: serde_json::Value,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    /// Create an event for `task` timestamped now
    pub fn new(task: &Task, event_type: TaskEventType, data: serde_json::Value) -> Self {
        Self {
            task_id: task.id,
            owner_id: task.owner_id.clone(),
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }

    /// `status` event carrying the task's current status
    pub fn status(task: &Task) -> Self {
        let mut data = serde_json::json!({ "status": task.status });
        if let Some(error) = &task.error {
            data["message"] = serde_json::Value::String(error.clone());
        }
        Self::new(task, TaskEventType::Status, data)
    }
}

/// Destination for task events
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Publish one event
    async fn publish(&self, event: TaskEvent) -> FableResult<()>;
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    async fn publish(&self, _event: TaskEvent) -> FableResult<()> {
        Ok(())
    }
}
