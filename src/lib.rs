//! # fableq
//!
//! An async, persistent, priority-ordered task queue for long-running AI
//! generation work.
//!
//! ## Features
//!
//! - **Priority scheduling**: higher priority first, FIFO within a priority
//! - **Bounded concurrency**: at most `max_concurrent_tasks` in flight
//! - **Classified retries**: transient failures are requeued with backoff,
//!   permanent ones fail immediately
//! - **Progress and cancellation**: processors report progress and observe
//!   cooperative cancellation
//! - **Pluggable storage and notifications**: in-memory store built in,
//!   PostgreSQL behind `postgres-store`
//! - **Observability**: `tracing` logs, Prometheus metrics behind `metrics`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fableq::prelude::*;
//! use serde_json::{Value, json};
//! use std::sync::Arc;
//!
//! struct AnalysisProcessor;
//!
//! #[async_trait]
//! impl TaskProcessor for AnalysisProcessor {
//!     fn task_type(&self) -> TaskType {
//!         TaskType::Analysis
//!     }
//!
//!     fn validate_payload(&self, _payload: &Value) -> FableResult<()> {
//!         Ok(())
//!     }
//!
//!     fn estimate_time(&self, _payload: &Value) -> u64 {
//!         45
//!     }
//!
//!     async fn process(&self, ctx: TaskContext, _payload: Value) -> TaskResult {
//!         ctx.report_progress(50, "analysing").await;
//!         TaskResult::success(json!({ "characters": 3 }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> FableResult<()> {
//!     let config = FableConfig::development();
//!     init_tracing(&config.logging);
//!
//!     let events = BroadcastNotifier::default();
//!     let queue = FableQueue::in_memory(config, Arc::new(events.clone()))?;
//!     queue.register_processor(Arc::new(AnalysisProcessor)).await;
//!     queue.start().await?;
//!
//!     let task_id = queue
//!         .enqueue_task("user-1", TaskType::Analysis, json!({}), TaskPriority::High)
//!         .await?;
//!     println!("queued {task_id}");
//!
//!     queue.wait_for_shutdown().await
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod notify;
pub mod processor;
pub mod retry;
pub mod store;
pub mod task;
pub mod utils;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

/// Common imports for queue users and processor authors.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::{CompletionOutcome, FableQueue, ProcessorRegistry, TaskQueueService};
    pub use crate::error::{FableError, FableResult};
    pub use crate::logging::init_tracing;
    pub use crate::notify::{
        BroadcastNotifier, NotificationSink, NullNotifier, PollingNotifier, TaskEvent,
        TaskEventType,
    };
    pub use crate::processor::{ProgressReporter, TaskContext, TaskProcessor};
    pub use crate::retry::{ErrorCategory, ErrorClassifier};
    pub use crate::store::{InMemoryTaskStore, TaskStore};
    pub use crate::task::{
        EnqueueRequest, QueueMetrics, QueuePosition, Task, TaskFilter, TaskId, TaskPage,
        TaskPriority, TaskResult, TaskStatus, TaskType,
    };
    pub use async_trait::async_trait;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::QueueMetricsCollector;

    #[cfg(feature = "postgres-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
    pub use crate::store::PostgresTaskStore;
}

pub use crate::config::*;
pub use crate::core::{FableQueue, QueueManager, TaskQueueService};
pub use crate::error::{FableError, FableResult};
pub use crate::processor::{TaskContext, TaskProcessor};
pub use crate::store::{InMemoryTaskStore, TaskStore};
pub use crate::task::{Task, TaskId, TaskPriority, TaskResult, TaskStatus, TaskType};
pub use async_trait::async_trait;
