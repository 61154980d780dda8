//! The queue facade and its engine parts.
//!
//! [`FableQueue`] wires a [`TaskStore`], a [`NotificationSink`] and the
//! processor registry together and owns the [`QueueManager`] while it runs.

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::FableConfig;
use crate::error::{FableError, FableResult};
use crate::notify::NotificationSink;
use crate::processor::TaskProcessor;
use crate::store::{InMemoryTaskStore, TaskStore};
use crate::task::{
    EnqueueRequest, QueueMetrics, QueuePosition, Task, TaskFilter, TaskId, TaskPage,
    TaskPriority, TaskResult, TaskType,
};

pub mod manager;
pub mod registry;
pub mod service;

pub use manager::QueueManager;
pub use registry::{ExecutionOutcome, ProcessorRegistry, RegistrySummary, TaskTypeStats};
pub use service::{CompletionOutcome, TaskQueueService};

/// The task queue.
///
/// # Examples
///
/// ```rust,no_run
/// use fableq::prelude::*;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> FableResult<()> {
///     let events = BroadcastNotifier::default();
///     let queue = FableQueue::in_memory(FableConfig::default(), Arc::new(events.clone()))?;
///     queue.start().await?;
///
///     let task_id = queue
///         .enqueue_task("user-1", TaskType::Export, serde_json::json!({}), TaskPriority::Normal)
///         .await;
///     println!("{:?}", task_id);
///
///     queue.stop().await?;
///     Ok(())
/// }
/// ```
pub struct FableQueue {
    service: TaskQueueService,
    manager: Arc<RwLock<Option<QueueManager>>>,
}

impl FableQueue {
    /// Create a queue over `store`, publishing events to `notifier`.
    pub fn new(
        config: FableConfig,
        store: Arc<dyn TaskStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> FableResult<Self> {
        config
            .validate()
            .map_err(|errors| FableError::config(errors.join("; ")))?;

        let registry = Arc::new(ProcessorRegistry::new());
        Ok(Self {
            service: TaskQueueService::new(config, store, notifier, registry),
            manager: Arc::new(RwLock::new(None)),
        })
    }

    /// Create a queue backed by [`InMemoryTaskStore`].
    pub fn in_memory(config: FableConfig, notifier: Arc<dyn NotificationSink>) -> FableResult<Self> {
        Self::new(config, Arc::new(InMemoryTaskStore::new()), notifier)
    }

    /// Record queue activity into Prometheus metrics.
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::QueueMetricsCollector>) -> Self {
        self.service = self.service.with_metrics(metrics);
        self
    }

    /// Register the processor for its task type.
    ///
    /// Tasks of a type without a processor are rejected at enqueue and never
    /// picked up.
    pub async fn register_processor(&self, processor: Arc<dyn TaskProcessor>) {
        self.service.registry().register(processor).await;
        self.service.wake_scheduler();
    }

    /// Start processing tasks.
    ///
    /// Returns immediately; use [`FableQueue::wait_for_shutdown`] to block.
    pub async fn start(&self) -> FableResult<()> {
        let mut guard = self.manager.write().await;
        if guard.is_some() {
            return Err(FableError::AlreadyRunning);
        }

        let mut manager = QueueManager::new(self.service.clone());
        manager.start().await?;
        *guard = Some(manager);
        Ok(())
    }

    /// Stop processing and wait for running tasks.
    pub async fn stop(&self) -> FableResult<()> {
        let mut guard = self.manager.write().await;
        let mut manager = guard.take().ok_or(FableError::NotRunning)?;
        manager.stop().await
    }

    /// Check if the queue is processing tasks.
    pub async fn is_running(&self) -> bool {
        self.manager
            .read()
            .await
            .as_ref()
            .is_some_and(|m| m.is_running())
    }

    /// Block until Ctrl-C, then stop.
    pub async fn wait_for_shutdown(&self) -> FableResult<()> {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| FableError::config(format!("cannot listen for shutdown signal: {e}")))?;
        tracing::info!("Shutdown signal received");
        self.stop().await
    }

    /// Enqueue a task with the type's default retry budget.
    pub async fn enqueue_task(
        &self,
        owner_id: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: TaskPriority,
    ) -> FableResult<TaskId> {
        self.service
            .enqueue_task(owner_id, task_type, payload, priority)
            .await
    }

    /// Enqueue a task described by `request`.
    pub async fn enqueue(&self, request: EnqueueRequest) -> FableResult<TaskId> {
        self.service.enqueue(request).await
    }

    /// Fetch a task, optionally restricted to `owner_id`.
    pub async fn get_task(&self, task_id: TaskId, owner_id: Option<&str>) -> FableResult<Option<Task>> {
        self.service.get_task(task_id, owner_id).await
    }

    /// List an owner's tasks in pickup order.
    pub async fn get_user_tasks(&self, owner_id: &str, filter: &TaskFilter) -> FableResult<TaskPage> {
        self.service.get_user_tasks(owner_id, filter).await
    }

    /// Cancel a QUEUED or RUNNING task; `false` when absent, foreign or
    /// already finished.
    pub async fn cancel_task(&self, task_id: TaskId, owner_id: Option<&str>) -> FableResult<bool> {
        self.service.cancel_task(task_id, owner_id).await
    }

    /// Requeue a FAILED or CANCELED task, spending one retry.
    pub async fn retry_task(&self, task_id: TaskId, owner_id: Option<&str>) -> FableResult<bool> {
        self.service.retry_task(task_id, owner_id).await
    }

    /// Position and estimated wait of a queued task.
    pub async fn get_queue_position(&self, task_id: TaskId) -> FableResult<Option<QueuePosition>> {
        self.service.get_queue_position(task_id).await
    }

    /// Queue depth, throughput and success rate.
    pub async fn get_queue_metrics(&self) -> FableResult<QueueMetrics> {
        self.service.get_queue_metrics().await
    }

    /// Record progress reported from outside a processor.
    pub async fn update_task_progress(
        &self,
        task_id: TaskId,
        progress: i32,
        current_step: Option<String>,
    ) -> FableResult<bool> {
        self.service
            .update_task_progress(task_id, progress, current_step)
            .await
    }

    /// Apply a result produced outside the manager.
    pub async fn complete_task(
        &self,
        task_id: TaskId,
        result: TaskResult,
    ) -> FableResult<CompletionOutcome> {
        self.service.complete_task(task_id, result).await
    }

    /// Delete finished tasks past retention.
    pub async fn cleanup_finished(&self) -> FableResult<u64> {
        self.service.cleanup_finished().await
    }

    /// Check the store, and the manager when running.
    pub async fn health_check(&self) -> FableResult<()> {
        match self.manager.read().await.as_ref() {
            Some(manager) => manager.health_check().await,
            None => self.service.store().health_check().await,
        }
    }

    /// The underlying queue service.
    pub fn service(&self) -> &TaskQueueService {
        &self.service
    }

    /// Registered processors and their execution stats.
    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        self.service.registry()
    }

    /// Configuration in use.
    pub fn config(&self) -> &FableConfig {
        self.service.config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{BroadcastNotifier, TaskEventType};
    use crate::processor::testing::{ScriptedProcessor, Step};
    use crate::task::TaskStatus;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn queue() -> (FableQueue, BroadcastNotifier) {
        let events = BroadcastNotifier::new(64);
        let queue = FableQueue::in_memory(FableConfig::testing(), Arc::new(events.clone())).unwrap();
        (queue, events)
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = FableConfig::testing();
        config.manager.max_concurrent_tasks = 0;
        let result = FableQueue::in_memory(config, Arc::new(BroadcastNotifier::default()));
        assert!(matches!(result, Err(FableError::ConfigError { .. })));
    }

    #[tokio::test]
    async fn test_queue_lifecycle() {
        let (queue, _) = queue();
        assert!(!queue.is_running().await);
        assert_ok!(queue.health_check().await);

        assert_ok!(queue.start().await);
        assert!(queue.is_running().await);
        assert!(matches!(queue.start().await, Err(FableError::AlreadyRunning)));

        assert_ok!(queue.stop().await);
        assert!(!queue.is_running().await);
        assert_err!(queue.stop().await);
    }

    #[tokio::test]
    async fn test_end_to_end_with_subscriber() {
        let (queue, events) = queue();
        let mut rx = events.subscribe();
        queue
            .register_processor(Arc::new(ScriptedProcessor::always(
                TaskType::Export,
                Step::Succeed(vec![50]),
            )))
            .await;
        queue.start().await.unwrap();

        let task_id = queue
            .enqueue_task("u1", TaskType::Export, json!({ "format": "pdf" }), TaskPriority::Normal)
            .await
            .unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.event_type == TaskEventType::Completed {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(completed.task_id, task_id);
        assert_eq!(completed.data["result"]["attempt"], 1);

        let task = queue.get_task(task_id, Some("u1")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(queue.get_task(task_id, Some("u2")).await.unwrap().is_none());

        let metrics = queue.get_queue_metrics().await.unwrap();
        assert_eq!(metrics.completed, 1);

        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_type_is_rejected() {
        let (queue, _) = queue();
        let result = queue
            .enqueue_task("u1", TaskType::Analysis, json!({}), TaskPriority::Normal)
            .await;
        assert!(matches!(result, Err(FableError::UnknownTaskType { .. })));
    }
}
