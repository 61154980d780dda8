//! Task store contract and adapters.
//!
//! The store is the single source of truth for task state. Every status
//! transition is a conditional update: it only applies when the record is in
//! the expected state, and reports `None` otherwise. The QUEUED→RUNNING
//! [`TaskStore::claim`] is what keeps two schedulers from running the same
//! task. Each claim stamps a fresh [`RunId`]; writes made on behalf of a run
//! only apply while that run is still the current one.
//!
//! Adapters:
//! - **In-Memory**: single-process deployments and tests
//! - **PostgreSQL** (feature `postgres-store`): shared durable store for
//!   horizontally scaled managers
//!
//! # Examples
//!
//! ```rust,no_run
//! use fableq::store::{InMemoryTaskStore, TaskStore};
//!
//! # async fn example() -> fableq::FableResult<()> {
//! let store = InMemoryTaskStore::new();
//! store.health_check().await?;
//!
//! # #[cfg(feature = "postgres-store")]
//! # {
//! let store = fableq::store::PostgresTaskStore::connect("postgresql://localhost/fable").await?;
//! store.migrate().await?;
//! # }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::FableResult;
use crate::task::{RunId, Task, TaskFilter, TaskId, TaskPage, TaskStatus, TaskType};

pub mod memory;
pub use memory::InMemoryTaskStore;

#[cfg(feature = "postgres-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
pub mod postgres;

#[cfg(feature = "postgres-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
pub use postgres::PostgresTaskStore;

/// Live count of tasks per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// QUEUED tasks
    pub queued: u64,
    /// RUNNING tasks
    pub running: u64,
    /// COMPLETED tasks
    pub completed: u64,
    /// FAILED tasks
    pub failed: u64,
    /// CANCELED tasks
    pub canceled: u64,
}

impl StatusCounts {
    /// Increment the counter for `status`
    pub fn add(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Queued => self.queued += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Canceled => self.canceled += n,
        }
    }
}

/// Terminal write for a RUNNING task
#[derive(Debug, Clone)]
pub struct Finalize {
    /// Run the write belongs to; must equal the stored run
    pub run_id: Option<RunId>,
    /// COMPLETED or FAILED
    pub status: TaskStatus,
    /// Processor output
    pub result: Option<serde_json::Value>,
    /// Error message
    pub error: Option<String>,
    /// Completion timestamp
    pub completed_at: DateTime<Utc>,
    /// Measured processing time in seconds
    pub actual_time: Option<u64>,
}

/// Retry write for a RUNNING task
#[derive(Debug, Clone)]
pub struct Reschedule {
    /// Run the write belongs to; must equal the stored run
    pub run_id: Option<RunId>,
    /// New retry count
    pub retry_count: u32,
    /// New due time (now + backoff)
    pub queued_at: DateTime<Utc>,
    /// `retry N/max: <message>`
    pub error: String,
}

/// Trait that all task stores must implement
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task
    async fn insert(&self, task: Task) -> FableResult<()>;

    /// Get a task by ID
    async fn get(&self, task_id: TaskId) -> FableResult<Option<Task>>;

    /// List an owner's tasks, ordered by priority desc then `queued_at` asc
    async fn list_for_owner(&self, owner_id: &str, filter: &TaskFilter) -> FableResult<TaskPage>;

    /// QUEUED tasks of `types` due at `now`, in pickup order
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        types: &[TaskType],
        limit: usize,
    ) -> FableResult<Vec<Task>>;

    /// Atomically move a due QUEUED task to RUNNING.
    ///
    /// Stamps a fresh `run_id`. Returns `None` when the task is no longer
    /// claimable (already claimed, canceled, or not yet due).
    async fn claim(&self, task_id: TaskId, now: DateTime<Utc>) -> FableResult<Option<Task>>;

    /// Raise the progress of a RUNNING task; never lowers it.
    ///
    /// With `run_id` set, only applies while that run is current.
    async fn update_progress(
        &self,
        task_id: TaskId,
        run_id: Option<RunId>,
        progress: u8,
    ) -> FableResult<Option<Task>>;

    /// Move a RUNNING task to COMPLETED or FAILED, if `outcome.run_id` is the
    /// current run
    async fn finalize(&self, task_id: TaskId, outcome: Finalize) -> FableResult<Option<Task>>;

    /// Move a RUNNING task back to QUEUED for a delayed retry, if
    /// `retry.run_id` is the current run
    async fn reschedule(&self, task_id: TaskId, retry: Reschedule) -> FableResult<Option<Task>>;

    /// Cancel a QUEUED or RUNNING task, optionally scoped to its owner
    async fn cancel(
        &self,
        task_id: TaskId,
        owner_id: Option<&str>,
        now: DateTime<Utc>,
        reason: &str,
    ) -> FableResult<Option<Task>>;

    /// Requeue a FAILED or CANCELED task that still has retry budget
    async fn requeue_finished(
        &self,
        task_id: TaskId,
        owner_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> FableResult<Option<Task>>;

    /// QUEUED tasks picked before `task`
    async fn count_ahead(&self, task: &Task) -> FableResult<u64>;

    /// Live counts per status
    async fn status_counts(&self) -> FableResult<StatusCounts>;

    /// COMPLETED and FAILED tasks finished at or after `since`
    async fn finished_since(&self, since: DateTime<Utc>) -> FableResult<Vec<Task>>;

    /// Requeue RUNNING tasks started before `started_before` that are not in
    /// `in_flight`; returns their ids
    async fn requeue_stale(
        &self,
        started_before: DateTime<Utc>,
        in_flight: &HashSet<TaskId>,
        now: DateTime<Utc>,
    ) -> FableResult<Vec<TaskId>>;

    /// Delete terminal tasks finished before `before`
    async fn purge_finished(&self, before: DateTime<Utc>) -> FableResult<u64>;

    /// Health check for the store
    async fn health_check(&self) -> FableResult<()>;
}
