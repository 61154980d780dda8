//! In-memory task store.
//!
//! All records live in one map behind a single async lock, so every
//! conditional transition is atomic with respect to every other. Suitable for
//! development, tests and single-process deployments where persistence across
//! restarts is not required.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Finalize, Reschedule, StatusCounts, TaskStore};
use crate::error::{FableError, FableResult};
use crate::task::{RunId, Task, TaskFilter, TaskId, TaskPage, TaskStatus, TaskType};

/// Pickup order: priority desc, queued_at asc, created_at asc.
fn pickup_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.queued_at.cmp(&b.queued_at))
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// In-memory task store implementation
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
}

impl InMemoryTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    fn owned_by(task: &Task, owner_id: Option<&str>) -> bool {
        owner_id.is_none_or(|owner| task.owner_id == owner)
    }

    fn running_as(task: &Task, run_id: Option<RunId>) -> bool {
        task.status == TaskStatus::Running && task.run_id == run_id
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task) -> FableResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(FableError::store_msg(format!(
                "task {} already exists",
                task.id
            )));
        }
        tracing::trace!(task_id = %task.id, "inserted task");
        tasks.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> FableResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn list_for_owner(&self, owner_id: &str, filter: &TaskFilter) -> FableResult<TaskPage> {
        let tasks = self.tasks.read().await;
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| t.owner_id == owner_id && filter.matches(t))
            .cloned()
            .collect();
        matching.sort_by(pickup_order);

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();

        Ok(TaskPage { tasks: page, total })
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        types: &[TaskType],
        limit: usize,
    ) -> FableResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut due: Vec<Task> = tasks
            .values()
            .filter(|t| t.is_due(now) && types.contains(&t.task_type))
            .cloned()
            .collect();
        due.sort_by(pickup_order);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, task_id: TaskId, now: DateTime<Utc>) -> FableResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(task) if task.is_due(now) => {
                task.status = TaskStatus::Running;
                task.started_at = Some(now);
                task.completed_at = None;
                task.run_id = Some(Uuid::new_v4());
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_progress(
        &self,
        task_id: TaskId,
        run_id: Option<RunId>,
        progress: u8,
    ) -> FableResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(task)
                if task.status == TaskStatus::Running
                    && run_id.is_none_or(|run| task.run_id == Some(run)) =>
            {
                task.progress = task.progress.max(progress.min(100));
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn finalize(&self, task_id: TaskId, outcome: Finalize) -> FableResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(task) if Self::running_as(task, outcome.run_id) => {
                if outcome.status == TaskStatus::Completed {
                    task.progress = 100;
                }
                task.status = outcome.status;
                task.result = outcome.result;
                task.error = outcome.error;
                task.completed_at = Some(outcome.completed_at);
                task.actual_time = outcome.actual_time;
                task.run_id = None;
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn reschedule(&self, task_id: TaskId, retry: Reschedule) -> FableResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(task) if Self::running_as(task, retry.run_id) => {
                task.status = TaskStatus::Queued;
                task.retry_count = retry.retry_count;
                task.queued_at = retry.queued_at;
                task.error = Some(retry.error);
                task.started_at = None;
                task.progress = 0;
                task.run_id = None;
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel(
        &self,
        task_id: TaskId,
        owner_id: Option<&str>,
        now: DateTime<Utc>,
        reason: &str,
    ) -> FableResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(task) if task.status.is_active() && Self::owned_by(task, owner_id) => {
                task.status = TaskStatus::Canceled;
                task.completed_at = Some(now);
                task.error = Some(reason.to_string());
                task.run_id = None;
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn requeue_finished(
        &self,
        task_id: TaskId,
        owner_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> FableResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(task)
                if matches!(task.status, TaskStatus::Failed | TaskStatus::Canceled)
                    && task.can_retry()
                    && Self::owned_by(task, owner_id) =>
            {
                task.status = TaskStatus::Queued;
                task.retry_count += 1;
                task.error = None;
                task.result = None;
                task.progress = 0;
                task.started_at = None;
                task.completed_at = None;
                task.actual_time = None;
                task.queued_at = now;
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn count_ahead(&self, task: &Task) -> FableResult<u64> {
        let tasks = self.tasks.read().await;
        let ahead = tasks
            .values()
            .filter(|t| t.id != task.id && t.status == TaskStatus::Queued && t.is_ahead_of(task))
            .count();
        Ok(ahead as u64)
    }

    async fn status_counts(&self) -> FableResult<StatusCounts> {
        let tasks = self.tasks.read().await;
        let mut counts = StatusCounts::default();
        for task in tasks.values() {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }

    async fn finished_since(&self, since: DateTime<Utc>) -> FableResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Failed))
            .filter(|t| t.completed_at.is_some_and(|at| at >= since))
            .cloned()
            .collect())
    }

    async fn requeue_stale(
        &self,
        started_before: DateTime<Utc>,
        in_flight: &HashSet<TaskId>,
        now: DateTime<Utc>,
    ) -> FableResult<Vec<TaskId>> {
        let mut tasks = self.tasks.write().await;
        let mut recovered = Vec::new();
        for task in tasks.values_mut() {
            let stale = task.status == TaskStatus::Running
                && !in_flight.contains(&task.id)
                && task.started_at.is_none_or(|at| at <= started_before);
            if stale {
                task.status = TaskStatus::Queued;
                task.started_at = None;
                task.progress = 0;
                task.queued_at = now;
                task.run_id = None;
                recovered.push(task.id);
            }
        }
        Ok(recovered)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> FableResult<u64> {
        let mut tasks = self.tasks.write().await;
        let initial = tasks.len();
        tasks.retain(|_, t| {
            !(t.status.is_terminal() && t.completed_at.is_some_and(|at| at < before))
        });
        let purged = (initial - tasks.len()) as u64;
        if purged > 0 {
            tracing::info!("Purged {} finished tasks", purged);
        }
        Ok(purged)
    }

    async fn health_check(&self) -> FableResult<()> {
        let tasks = self.tasks.read().await;
        tracing::debug!("Store health check: {} tasks", tasks.len());
        Ok(())
    }
}
