//! Task model: the record every other component reads and mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::FableError;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Token identifying one claim of a task
pub type RunId = Uuid;

/// Kind of work a task represents.
///
/// Determines which processor handles the task and which timeout and
/// estimate apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// AI story generation from a chat analysis
    StoryGeneration,
    /// Chat analysis
    Analysis,
    /// Export of generated content
    Export,
}

impl TaskType {
    /// All known task types
    pub const ALL: [TaskType; 3] = [
        TaskType::StoryGeneration,
        TaskType::Analysis,
        TaskType::Export,
    ];

    /// Stable wire/storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::StoryGeneration => "STORY_GENERATION",
            TaskType::Analysis => "ANALYSIS",
            TaskType::Export => "EXPORT",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = FableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| FableError::validation(format!("unknown task type '{s}'")))
    }
}

/// Priority levels for tasks, ordered by weight.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    /// Background work
    Low = 0,
    /// Default
    #[default]
    Normal = 1,
    /// User-facing work
    High = 2,
    /// Jumps ahead of everything else
    Urgent = 3,
}

impl TaskPriority {
    /// Ordinal weight used for ordering
    pub fn weight(&self) -> i16 {
        *self as i16
    }

    /// Inverse of [`TaskPriority::weight`]
    pub fn from_weight(weight: i16) -> Option<Self> {
        match weight {
            0 => Some(TaskPriority::Low),
            1 => Some(TaskPriority::Normal),
            2 => Some(TaskPriority::High),
            3 => Some(TaskPriority::Urgent),
            _ => None,
        }
    }
}

/// Status of a task in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be picked up (possibly deferred by `queued_at`)
    Queued,
    /// Dispatched to a processor
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error and no retries left
    Failed,
    /// Canceled by its owner
    Canceled,
}

impl TaskStatus {
    /// Stable wire/storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        }
    }

    /// No further transitions except an explicit retry
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Queued or running
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = FableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(TaskStatus::Queued),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELED" => Ok(TaskStatus::Canceled),
            other => Err(FableError::validation(format!("unknown task status '{other}'"))),
        }
    }
}

/// A persisted task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Requesting principal
    pub owner_id: String,
    /// Kind of work
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Scheduling priority
    pub priority: TaskPriority,
    /// Current status
    pub status: TaskStatus,
    /// Processor input
    pub payload: serde_json::Value,
    /// 0-100
    pub progress: u8,
    /// Processor output on success
    pub result: Option<serde_json::Value>,
    /// Human-readable error
    pub error: Option<String>,
    /// Retry attempts used so far
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Estimated processing time in seconds
    pub estimated_time: Option<u64>,
    /// Measured processing time in seconds
    pub actual_time: Option<u64>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// Scheduling due time
    pub queued_at: DateTime<Utc>,
    /// When the current run started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Current run; set on claim, cleared when the run ends
    #[serde(default)]
    pub run_id: Option<RunId>,
}

impl Task {
    /// Create a fresh QUEUED task due at `now`.
    pub fn new(
        owner_id: impl Into<String>,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: TaskPriority,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            task_type,
            priority,
            status: TaskStatus::Queued,
            payload,
            progress: 0,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            estimated_time: None,
            actual_time: None,
            created_at: now,
            queued_at: now,
            started_at: None,
            completed_at: None,
            run_id: None,
        }
    }

    /// Whether the scheduler may pick this task at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued && self.queued_at <= now
    }

    /// Whether `self` is picked before `other`: higher priority first, then
    /// earlier `queued_at`.
    pub fn is_ahead_of(&self, other: &Task) -> bool {
        self.priority > other.priority
            || (self.priority == other.priority && self.queued_at < other.queued_at)
    }

    /// Whether the retry budget still allows another attempt
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Outcome reported by a processor.
///
/// `retryable` is an explicit hint that takes precedence over message-based
/// classification when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Whether the work succeeded
    pub success: bool,
    /// Output data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Explicit retryability hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl TaskResult {
    /// Successful result carrying `data`
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            retryable: None,
        }
    }

    /// Failed result; retryability left to classification
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            retryable: None,
        }
    }

    /// Failed result that must not be retried
    pub fn permanent_failure(error: impl Into<String>) -> Self {
        Self::failure(error).with_retryable(false)
    }

    /// Failed result that should be retried if budget remains
    pub fn transient_failure(error: impl Into<String>) -> Self {
        Self::failure(error).with_retryable(true)
    }

    /// Attach an explicit retryability hint
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Error message, or a generic one
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("task failed without an error message")
    }
}

/// Parameters for enqueueing a task
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Requesting principal
    pub owner_id: String,
    /// Kind of work
    pub task_type: TaskType,
    /// Processor input
    pub payload: serde_json::Value,
    /// Scheduling priority
    pub priority: TaskPriority,
    /// Retry budget override (defaults to the per-type configuration)
    pub max_retries: Option<u32>,
    /// Defer the first pickup
    pub delay: Option<Duration>,
}

impl EnqueueRequest {
    /// Request with NORMAL priority and configured defaults
    pub fn new(
        owner_id: impl Into<String>,
        task_type: TaskType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            task_type,
            payload,
            priority: TaskPriority::Normal,
            max_retries: None,
            delay: None,
        }
    }

    /// Set the priority
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the retry budget
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Defer the first pickup by `delay`
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Filters for listing an owner's tasks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    /// Only tasks in this status
    pub status: Option<TaskStatus>,
    /// Only tasks of this type
    pub task_type: Option<TaskType>,
    /// Page size (None = all)
    pub limit: Option<usize>,
    /// Rows to skip
    pub offset: usize,
}

impl TaskFilter {
    /// Whether `task` passes the status/type filters
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.task_type.is_none_or(|t| task.task_type == t)
    }
}

/// One page of tasks plus the unpaginated total
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    /// Tasks in this page
    pub tasks: Vec<Task>,
    /// Total matching tasks
    pub total: u64,
}

/// Derived queue position for a QUEUED task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePosition {
    /// 1-based position
    pub position: u64,
    /// Estimated wait before pickup
    pub estimated_wait_secs: u64,
}

/// Aggregated queue metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    /// Tasks currently queued
    pub queued: u64,
    /// Tasks currently running
    pub running: u64,
    /// Completed within the metrics window
    pub completed: u64,
    /// Failed within the metrics window
    pub failed: u64,
    /// Average `started_at - queued_at`
    pub avg_wait_secs: f64,
    /// Average `completed_at - started_at`
    pub avg_processing_secs: f64,
    /// Percentage of finished tasks that completed
    pub success_rate: f64,
}
