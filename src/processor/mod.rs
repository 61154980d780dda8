//! Processor contract.
//!
//! A [`TaskProcessor`] performs the work for one [`TaskType`]. The manager
//! validates the payload, races [`TaskProcessor::process`] against the
//! per-type timeout and hands whatever comes back to the queue service, which
//! alone decides between finalizing and retrying.
//!
//! # Examples
//!
//! ```rust
//! use fableq::prelude::*;
//! use serde_json::{Value, json};
//!
//! struct ExportProcessor;
//!
//! #[async_trait::async_trait]
//! impl TaskProcessor for ExportProcessor {
//!     fn task_type(&self) -> TaskType {
//!         TaskType::Export
//!     }
//!
//!     fn validate_payload(&self, payload: &Value) -> FableResult<()> {
//!         payload
//!             .get("storyId")
//!             .and_then(Value::as_str)
//!             .map(|_| ())
//!             .ok_or_else(|| FableError::validation("storyId is required"))
//!     }
//!
//!     fn estimate_time(&self, _payload: &Value) -> u64 {
//!         10
//!     }
//!
//!     async fn process(&self, ctx: TaskContext, payload: Value) -> TaskResult {
//!         ctx.report_progress(50, "rendering").await;
//!         TaskResult::success(json!({ "exported": payload["storyId"] }))
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::FableResult;
use crate::task::{RunId, Task, TaskId, TaskResult, TaskType};

pub mod story;

pub use story::{
    GeneratedStory, StoryBackend, StoryBackendError, StoryGenerationProcessor, StoryLength,
    StoryRequest,
};

/// Work handler for one task type
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Task type this processor handles
    fn task_type(&self) -> TaskType;

    /// Structural checks on the payload, run before the task is accepted and
    /// again before it runs
    fn validate_payload(&self, payload: &Value) -> FableResult<()>;

    /// Estimated processing time in seconds, used for ETAs only
    fn estimate_time(&self, payload: &Value) -> u64;

    /// Do the work.
    ///
    /// Must not panic; every failure is reported as a failed [`TaskResult`],
    /// optionally with an explicit retryability hint.
    async fn process(&self, ctx: TaskContext, payload: Value) -> TaskResult;
}

/// Callbacks a running processor uses to talk back to the queue.
///
/// `run_id` names the claim the processor is working under; reports from a
/// run that is no longer current are dropped.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Persist and publish progress for a running task
    async fn report_progress(
        &self,
        task_id: TaskId,
        run_id: Option<RunId>,
        progress: u8,
        current_step: Option<String>,
    ) -> FableResult<()>;

    /// Whether the task was canceled, or claimed again, since this run started
    async fn is_canceled(&self, task_id: TaskId, run_id: Option<RunId>) -> FableResult<bool>;
}

/// Reporter for processors run outside a queue
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedReporter;

#[async_trait]
impl ProgressReporter for DetachedReporter {
    async fn report_progress(
        &self,
        _task_id: TaskId,
        _run_id: Option<RunId>,
        _progress: u8,
        _current_step: Option<String>,
    ) -> FableResult<()> {
        Ok(())
    }

    async fn is_canceled(&self, _task_id: TaskId, _run_id: Option<RunId>) -> FableResult<bool> {
        Ok(false)
    }
}

/// Per-execution context handed to [`TaskProcessor::process`]
#[derive(Clone)]
pub struct TaskContext {
    /// Task being processed
    pub task_id: TaskId,
    /// Owner of the task
    pub owner_id: String,
    /// Task type
    pub task_type: TaskType,
    /// 1-based attempt number
    pub attempt: u32,
    /// Claim this execution runs under
    pub run_id: Option<RunId>,
    reporter: Arc<dyn ProgressReporter>,
}

impl TaskContext {
    /// Context for `task` reporting through `reporter`
    pub fn new(task: &Task, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            task_id: task.id,
            owner_id: task.owner_id.clone(),
            task_type: task.task_type,
            attempt: task.retry_count + 1,
            run_id: task.run_id,
            reporter,
        }
    }

    /// Context that discards progress and never reports cancellation
    pub fn detached(task: &Task) -> Self {
        Self::new(task, Arc::new(DetachedReporter))
    }

    /// Report progress (0-100) with a step label. Failures are logged only.
    pub async fn report_progress(&self, progress: u8, step: impl Into<String>) {
        if let Err(e) = self
            .reporter
            .report_progress(self.task_id, self.run_id, progress, Some(step.into()))
            .await
        {
            tracing::warn!(task_id = %self.task_id, "failed to report progress: {}", e);
        }
    }

    /// Cooperative cancellation check. Store errors read as "not canceled".
    pub async fn is_canceled(&self) -> bool {
        match self.reporter.is_canceled(self.task_id, self.run_id).await {
            Ok(canceled) => canceled,
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, "cancellation check failed: {}", e);
                false
            }
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("owner_id", &self.owner_id)
            .field("task_type", &self.task_type)
            .field("attempt", &self.attempt)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable processor and reporter for queue tests.

    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// One scripted step
    #[derive(Debug, Clone)]
    pub enum Step {
        /// Report these progress values, then succeed
        Succeed(Vec<u8>),
        /// Return this result
        Return(TaskResult),
        /// Sleep, then succeed
        Sleep(Duration),
        /// Panic
        Panic,
    }

    /// Processor that replays scripted steps and records what it ran
    pub struct ScriptedProcessor {
        task_type: TaskType,
        script: Mutex<VecDeque<Step>>,
        fallback: Step,
        pub runs: Mutex<Vec<TaskId>>,
    }

    impl ScriptedProcessor {
        pub fn new(task_type: TaskType, script: Vec<Step>, fallback: Step) -> Self {
            Self {
                task_type,
                script: Mutex::new(script.into()),
                fallback,
                runs: Mutex::new(Vec::new()),
            }
        }

        pub fn always(task_type: TaskType, step: Step) -> Self {
            Self::new(task_type, Vec::new(), step)
        }

        pub async fn run_order(&self) -> Vec<TaskId> {
            self.runs.lock().await.clone()
        }
    }

    #[async_trait]
    impl TaskProcessor for ScriptedProcessor {
        fn task_type(&self) -> TaskType {
            self.task_type
        }

        fn validate_payload(&self, payload: &Value) -> FableResult<()> {
            if payload.get("invalid").is_some() {
                return Err(crate::error::FableError::validation("invalid payload"));
            }
            Ok(())
        }

        fn estimate_time(&self, _payload: &Value) -> u64 {
            7
        }

        async fn process(&self, ctx: TaskContext, _payload: Value) -> TaskResult {
            self.runs.lock().await.push(ctx.task_id);
            let step = self
                .script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());

            match step {
                Step::Succeed(progress) => {
                    for value in progress {
                        ctx.report_progress(value, format!("step {value}")).await;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    TaskResult::success(serde_json::json!({ "attempt": ctx.attempt }))
                }
                Step::Return(result) => result,
                Step::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    TaskResult::success(serde_json::json!({}))
                }
                Step::Panic => panic!("scripted processor panic"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;
    use serde_json::json;

    #[tokio::test]
    async fn test_detached_context() {
        let mut task = Task::new("u1", TaskType::Export, json!({}), TaskPriority::Normal, 3);
        task.retry_count = 2;
        let ctx = TaskContext::detached(&task);

        assert_eq!(ctx.attempt, 3);
        assert!(!ctx.is_canceled().await);
        ctx.report_progress(40, "halfway").await;
        assert!(format!("{ctx:?}").contains("TaskContext"));
    }
}
