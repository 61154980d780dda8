//! Store-and-poll notification buffer.
//!
//! Keeps the most recent events per task in memory so clients without a push
//! channel can poll for them. Each task holds at most `max_events_per_task`
//! events; events older than the retention window are dropped by
//! [`PollingNotifier::prune`] and ignored by readers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{NotificationSink, TaskEvent};
use crate::config::NotificationConfig;
use crate::error::FableResult;
use crate::task::TaskId;

/// Bounded in-memory event buffer
#[derive(Debug, Clone)]
pub struct PollingNotifier {
    events: Arc<RwLock<HashMap<TaskId, VecDeque<TaskEvent>>>>,
    max_events_per_task: usize,
    retention: Duration,
}

impl PollingNotifier {
    /// Create a buffer with explicit bounds
    pub fn new(max_events_per_task: usize, retention: Duration) -> Self {
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
            max_events_per_task: max_events_per_task.max(1),
            retention,
        }
    }

    /// Create a buffer from configuration
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(
            config.max_events_per_task,
            Duration::hours(i64::from(config.event_retention_hours)),
        )
    }

    fn cutoff(&self, since: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let oldest = Utc::now()
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        since.map_or(oldest, |s| s.max(oldest))
    }

    /// Events for one task newer than `since`, oldest first
    pub async fn events_for_task(
        &self,
        task_id: TaskId,
        since: Option<DateTime<Utc>>,
    ) -> Vec<TaskEvent> {
        let cutoff = self.cutoff(since);
        let events = self.events.read().await;
        events
            .get(&task_id)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|e| e.timestamp > cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Events across an owner's tasks newer than `since`, oldest first
    pub async fn events_for_owner(
        &self,
        owner_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Vec<TaskEvent> {
        let cutoff = self.cutoff(since);
        let events = self.events.read().await;
        let mut found: Vec<TaskEvent> = events
            .values()
            .flatten()
            .filter(|e| e.owner_id == owner_id && e.timestamp > cutoff)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.timestamp);
        found
    }

    /// Drop expired events and empty buffers; returns how many were removed
    pub async fn prune(&self) -> usize {
        let cutoff = self.cutoff(None);
        let mut events = self.events.write().await;
        let mut removed = 0;
        events.retain(|_, buffer| {
            let before = buffer.len();
            buffer.retain(|e| e.timestamp >= cutoff);
            removed += before - buffer.len();
            !buffer.is_empty()
        });
        if removed > 0 {
            tracing::debug!("Pruned {} expired task events", removed);
        }
        removed
    }

    /// Number of tasks with buffered events
    pub async fn tracked_tasks(&self) -> usize {
        self.events.read().await.len()
    }
}

impl Default for PollingNotifier {
    fn default() -> Self {
        Self::from_config(&NotificationConfig::default())
    }
}

#[async_trait]
impl NotificationSink for PollingNotifier {
    async fn publish(&self, event: TaskEvent) -> FableResult<()> {
        let mut events = self.events.write().await;
        let buffer = events.entry(event.task_id).or_default();
        buffer.push_back(event);
        while buffer.len() > self.max_events_per_task {
            buffer.pop_front();
        }
        Ok(())
    }
}
