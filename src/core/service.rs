//! Queue service: the single decision point for task state.
//!
//! Everything that changes a task goes through here: enqueue, cancel,
//! manual retry, progress reports and, above all, [`TaskQueueService::complete_task`],
//! which decides between finalizing a run and rescheduling it with backoff.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::registry::ProcessorRegistry;
use crate::config::FableConfig;
use crate::error::{FableError, FableResult};
use crate::notify::{NotificationSink, TaskEvent, TaskEventType};
use crate::processor::ProgressReporter;
use crate::retry::{ErrorCategory, ErrorClassifier, calculate_backoff};
use crate::store::{Finalize, Reschedule, TaskStore};
use crate::task::{
    EnqueueRequest, QueueMetrics, QueuePosition, RunId, Task, TaskFilter, TaskId, TaskPage,
    TaskPriority, TaskResult, TaskStatus, TaskType,
};
use crate::utils::{add_duration, secs_between_f64, sub_duration};

#[cfg(feature = "metrics")]
use crate::metrics::QueueMetricsCollector;

/// Error recorded on a task canceled by its owner
pub const CANCELED_BY_USER: &str = "canceled by user";

/// What [`TaskQueueService::complete_task`] did with a result
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// Task finalized as COMPLETED
    Completed(Task),
    /// Task finalized as FAILED
    Failed(Task),
    /// Task requeued for an automatic retry after `delay`
    Rescheduled {
        /// Requeued task
        task: Task,
        /// Backoff before the task is due again
        delay: Duration,
        /// Category that picked the backoff policy
        category: ErrorCategory,
    },
    /// Task was no longer RUNNING (e.g. canceled in flight); left untouched
    Ignored,
}

/// Core queue operations over a task store
#[derive(Clone)]
pub struct TaskQueueService {
    config: Arc<FableConfig>,
    store: Arc<dyn TaskStore>,
    notifier: Arc<dyn NotificationSink>,
    registry: Arc<ProcessorRegistry>,
    classifier: ErrorClassifier,
    in_flight: Arc<Mutex<HashMap<TaskId, Option<RunId>>>>,
    wake: Arc<Notify>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<QueueMetricsCollector>>,
}

impl TaskQueueService {
    /// Create a service over `store`, publishing to `notifier`
    pub fn new(
        config: FableConfig,
        store: Arc<dyn TaskStore>,
        notifier: Arc<dyn NotificationSink>,
        registry: Arc<ProcessorRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            notifier,
            registry,
            classifier: ErrorClassifier::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record queue activity into `metrics`
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub fn with_metrics(mut self, metrics: Arc<QueueMetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &FableConfig {
        &self.config
    }

    /// Underlying task store
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Processor registry
    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    /// Scheduler wake signal
    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Wake the scheduler without blocking
    pub fn wake_scheduler(&self) {
        self.wake.notify_one();
    }

    /// Number of tasks currently dispatched by this process
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Snapshot of the in-flight set
    pub async fn in_flight_ids(&self) -> HashSet<TaskId> {
        self.in_flight.lock().await.keys().copied().collect()
    }

    /// Run currently tracked for `task_id`, if it is in flight
    pub async fn in_flight_run(&self, task_id: TaskId) -> Option<Option<RunId>> {
        self.in_flight.lock().await.get(&task_id).copied()
    }

    /// Track the claimed run of `task`; returns the new in-flight count
    pub(crate) async fn mark_in_flight(&self, task: &Task) -> usize {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.insert(task.id, task.run_id);
        let count = in_flight.len();
        drop(in_flight);
        self.observe_in_flight(count);
        count
    }

    /// Stop tracking `task_id`, whichever run it is on
    pub(crate) async fn release(&self, task_id: TaskId) {
        self.release_run(task_id, None).await;
    }

    /// Stop tracking `task_id` only if it is still on `run_id`.
    ///
    /// `None` matches any run.
    pub(crate) async fn release_run(&self, task_id: TaskId, run_id: Option<RunId>) {
        let mut in_flight = self.in_flight.lock().await;
        let owned = in_flight
            .get(&task_id)
            .is_some_and(|current| run_id.is_none() || *current == run_id);
        if !owned {
            return;
        }
        in_flight.remove(&task_id);
        let count = in_flight.len();
        drop(in_flight);
        self.observe_in_flight(count);
    }

    #[allow(unused_variables)]
    fn observe_in_flight(&self, count: usize) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.set_in_flight(count);
        }
    }

    /// Publish an event; failures are logged, never returned
    pub(crate) async fn publish(&self, event: TaskEvent) {
        let task_id = event.task_id;
        let event_type = event.event_type;
        if let Err(e) = self.notifier.publish(event).await {
            tracing::warn!(%task_id, ?event_type, "failed to publish task event: {}", e);
        }
    }

    /// Enqueue a task with default retry budget and no delay
    pub async fn enqueue_task(
        &self,
        owner_id: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: TaskPriority,
    ) -> FableResult<TaskId> {
        self.enqueue(EnqueueRequest::new(owner_id, task_type, payload).priority(priority))
            .await
    }

    /// Enqueue a task.
    ///
    /// Rejects task types without a registered processor and payloads the
    /// processor does not accept.
    pub async fn enqueue(&self, request: EnqueueRequest) -> FableResult<TaskId> {
        if request.owner_id.trim().is_empty() {
            return Err(FableError::validation("owner id must not be empty"));
        }

        let processor = self
            .registry
            .get(request.task_type)
            .await
            .ok_or(FableError::UnknownTaskType {
                task_type: request.task_type,
            })?;
        processor.validate_payload(&request.payload)?;

        let type_config = self.config.tasks.get(request.task_type);
        let estimated_time = match type_config.estimated_processing_secs {
            0 => processor.estimate_time(&request.payload),
            configured => configured,
        };

        let mut task = Task::new(
            request.owner_id,
            request.task_type,
            request.payload,
            request.priority,
            request.max_retries.unwrap_or(type_config.max_retries),
        );
        task.estimated_time = Some(estimated_time);
        if let Some(delay) = request.delay {
            task.queued_at = add_duration(task.created_at, delay);
        }

        self.store.insert(task.clone()).await?;

        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            owner_id = %task.owner_id,
            priority = ?task.priority,
            "Task enqueued"
        );

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_enqueued(task.task_type);
        }

        self.publish(TaskEvent::status(&task)).await;
        self.wake_scheduler();
        Ok(task.id)
    }

    /// Look up a task, optionally scoped to its owner
    pub async fn get_task(
        &self,
        task_id: TaskId,
        owner_id: Option<&str>,
    ) -> FableResult<Option<Task>> {
        let task = self.store.get(task_id).await?;
        Ok(task.filter(|t| owner_id.is_none_or(|owner| t.owner_id == owner)))
    }

    /// An owner's tasks, paginated
    pub async fn get_user_tasks(&self, owner_id: &str, filter: &TaskFilter) -> FableResult<TaskPage> {
        self.store.list_for_owner(owner_id, filter).await
    }

    /// Cancel a QUEUED or RUNNING task.
    ///
    /// Returns `false` when the task is absent, owned by someone else, or
    /// already terminal. A running processor is not interrupted; it sees the
    /// cancellation through [`crate::processor::TaskContext::is_canceled`].
    pub async fn cancel_task(&self, task_id: TaskId, owner_id: Option<&str>) -> FableResult<bool> {
        let Some(task) = self
            .store
            .cancel(task_id, owner_id, Utc::now(), CANCELED_BY_USER)
            .await?
        else {
            return Ok(false);
        };

        tracing::info!(%task_id, owner_id = %task.owner_id, "Task canceled");
        self.release(task_id).await;
        self.publish(TaskEvent::status(&task)).await;
        self.wake_scheduler();
        Ok(true)
    }

    /// Requeue a FAILED or CANCELED task immediately.
    ///
    /// Consumes one unit of the retry budget; returns `false` when the task is
    /// absent, foreign, not in a retryable state, or out of budget.
    pub async fn retry_task(&self, task_id: TaskId, owner_id: Option<&str>) -> FableResult<bool> {
        let Some(task) = self
            .store
            .requeue_finished(task_id, owner_id, Utc::now())
            .await?
        else {
            return Ok(false);
        };

        tracing::info!(
            %task_id,
            retry_count = task.retry_count,
            max_retries = task.max_retries,
            "Task manually requeued"
        );
        self.publish(TaskEvent::status(&task)).await;
        self.wake_scheduler();
        Ok(true)
    }

    /// Average processing time for `task_type`: observed when available,
    /// configured otherwise
    pub async fn avg_processing_secs(&self, task_type: TaskType) -> f64 {
        match self.registry.avg_duration(task_type).await {
            Some(avg) => avg.as_secs_f64(),
            None => self.config.tasks.get(task_type).estimated_processing_secs as f64,
        }
    }

    /// Position and estimated wait of a QUEUED task
    pub async fn get_queue_position(&self, task_id: TaskId) -> FableResult<Option<QueuePosition>> {
        let Some(task) = self.store.get(task_id).await? else {
            return Ok(None);
        };
        if task.status != TaskStatus::Queued {
            return Ok(None);
        }

        let position = self.store.count_ahead(&task).await? + 1;
        let available = self
            .config
            .manager
            .max_concurrent_tasks
            .saturating_sub(self.in_flight_count().await) as u64;
        let waiting = position.saturating_sub(available);
        let avg = self.avg_processing_secs(task.task_type).await;

        Ok(Some(QueuePosition {
            position,
            estimated_wait_secs: (waiting as f64 * avg).ceil() as u64,
        }))
    }

    /// Live counts plus averages over the metrics window
    pub async fn get_queue_metrics(&self) -> FableResult<QueueMetrics> {
        let counts = self.store.status_counts().await?;
        let window = Duration::from_secs(u64::from(self.config.retention.metrics_window_hours) * 3600);
        let finished = self
            .store
            .finished_since(sub_duration(Utc::now(), window))
            .await?;

        let completed = finished
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count() as u64;
        let failed = finished.len() as u64 - completed;

        let waits: Vec<f64> = finished
            .iter()
            .filter_map(|t| t.started_at.map(|s| secs_between_f64(t.queued_at, s)))
            .collect();
        let runs: Vec<f64> = finished
            .iter()
            .filter_map(|t| Some(secs_between_f64(t.started_at?, t.completed_at?)))
            .collect();

        let mean = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };
        let success_rate = if finished.is_empty() {
            0.0
        } else {
            completed as f64 / finished.len() as f64 * 100.0
        };

        Ok(QueueMetrics {
            queued: counts.queued,
            running: counts.running,
            completed,
            failed,
            avg_wait_secs: mean(&waits),
            avg_processing_secs: mean(&runs),
            success_rate,
        })
    }

    /// Record progress for a RUNNING task.
    ///
    /// `progress` is clamped to 0-100 and never lowers the stored value.
    /// Returns `false` when the task is not running.
    pub async fn update_task_progress(
        &self,
        task_id: TaskId,
        progress: i32,
        current_step: Option<String>,
    ) -> FableResult<bool> {
        self.update_run_progress(task_id, None, progress, current_step)
            .await
    }

    /// Record progress on behalf of run `run_id`; `None` means the current run
    pub async fn update_run_progress(
        &self,
        task_id: TaskId,
        run_id: Option<RunId>,
        progress: i32,
        current_step: Option<String>,
    ) -> FableResult<bool> {
        let clamped = progress.clamp(0, 100) as u8;
        let Some(task) = self.store.update_progress(task_id, run_id, clamped).await? else {
            tracing::debug!(%task_id, ?run_id, "ignoring progress for a run that is not current");
            return Ok(false);
        };

        let remaining = task
            .estimated_time
            .map(|estimate| estimate * u64::from(100 - task.progress) / 100);

        tracing::debug!(%task_id, progress = task.progress, step = ?current_step, "Task progress");
        self.publish(TaskEvent::new(
            &task,
            TaskEventType::Progress,
            json!({
                "progress": task.progress,
                "currentStep": current_step,
                "estimatedTimeRemaining": remaining,
            }),
        ))
        .await;
        Ok(true)
    }

    /// Finalize or reschedule the current run of a task.
    ///
    /// A failed result with budget left is classified (an explicit
    /// `retryable` hint wins over message patterns); retryable failures go
    /// back to QUEUED with a backoff delay, everything else ends COMPLETED or
    /// FAILED. Tasks no longer RUNNING are left untouched.
    pub async fn complete_task(
        &self,
        task_id: TaskId,
        result: TaskResult,
    ) -> FableResult<CompletionOutcome> {
        self.complete_run(task_id, None, result).await
    }

    /// Like [`TaskQueueService::complete_task`], scoped to run `run_id`.
    ///
    /// A result from a run that was canceled and superseded by a newer claim
    /// is ignored and leaves the newer run tracked.
    pub async fn complete_run(
        &self,
        task_id: TaskId,
        run_id: Option<RunId>,
        result: TaskResult,
    ) -> FableResult<CompletionOutcome> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(FableError::TaskNotFound { task_id })?;

        let superseded = run_id.is_some_and(|run| task.run_id != Some(run));
        if task.status != TaskStatus::Running || superseded {
            tracing::debug!(
                %task_id,
                status = %task.status,
                ?run_id,
                "run no longer current, result discarded"
            );
            self.release_run(task_id, run_id).await;
            return Ok(CompletionOutcome::Ignored);
        }
        let run_id = task.run_id;

        let now = Utc::now();
        let processing_secs = task.started_at.map(|s| secs_between_f64(s, now));

        if !result.success && task.can_retry() {
            let message = result.error_message();
            let classification =
                self.classifier
                    .resolve(message, result.retryable, Some(task.task_type));

            if classification.retryable {
                return self
                    .schedule_retry(&task, message, classification.category, now)
                    .await;
            }

            tracing::info!(
                %task_id,
                category = %classification.category,
                "non-retryable failure, finalizing"
            );
        }

        let outcome = Finalize {
            run_id,
            status: if result.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            result: if result.success { result.data.clone() } else { None },
            error: (!result.success).then(|| result.error_message().to_string()),
            completed_at: now,
            actual_time: processing_secs.map(|secs| secs.ceil() as u64),
        };

        let Some(updated) = self.store.finalize(task_id, outcome).await? else {
            self.release_run(task_id, run_id).await;
            return Ok(CompletionOutcome::Ignored);
        };

        let outcome = if result.success {
            tracing::info!(
                %task_id,
                task_type = %updated.task_type,
                actual_time = ?updated.actual_time,
                "Task completed"
            );
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record_completed(updated.task_type, processing_secs.unwrap_or_default());
            }
            self.publish(TaskEvent::new(
                &updated,
                TaskEventType::Completed,
                json!({ "result": updated.result, "actualTime": updated.actual_time }),
            ))
            .await;
            CompletionOutcome::Completed(updated)
        } else {
            tracing::warn!(
                %task_id,
                task_type = %updated.task_type,
                retry_count = updated.retry_count,
                "Task failed: {}",
                updated.error.as_deref().unwrap_or_default()
            );
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record_failed(updated.task_type, processing_secs.unwrap_or_default());
            }
            self.publish(TaskEvent::new(
                &updated,
                TaskEventType::Failed,
                json!({ "error": updated.error, "retryCount": updated.retry_count }),
            ))
            .await;
            CompletionOutcome::Failed(updated)
        };

        self.release_run(task_id, run_id).await;
        self.wake_scheduler();
        Ok(outcome)
    }

    async fn schedule_retry(
        &self,
        task: &Task,
        message: &str,
        category: ErrorCategory,
        now: chrono::DateTime<Utc>,
    ) -> FableResult<CompletionOutcome> {
        let retry_count = task.retry_count + 1;
        let delay = calculate_backoff(self.config.retry.policy_for(category), retry_count);
        let retry = Reschedule {
            run_id: task.run_id,
            retry_count,
            queued_at: add_duration(now, delay),
            error: format!("retry {}/{}: {}", retry_count, task.max_retries, message),
        };

        let Some(updated) = self.store.reschedule(task.id, retry).await? else {
            self.release_run(task.id, task.run_id).await;
            return Ok(CompletionOutcome::Ignored);
        };

        tracing::warn!(
            task_id = %task.id,
            retry_count,
            max_retries = task.max_retries,
            %category,
            delay_ms = delay.as_millis() as u64,
            "Task failed, retry scheduled: {}",
            message
        );

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_retried(task.task_type);
        }

        // Retries surface to the owner only as "still queued"
        self.publish(TaskEvent::new(
            &updated,
            TaskEventType::Status,
            json!({ "status": TaskStatus::Queued, "message": "still processing" }),
        ))
        .await;

        self.release_run(task.id, task.run_id).await;
        self.wake_scheduler();

        let wake = self.wake_handle();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            wake.notify_one();
        });

        Ok(CompletionOutcome::Rescheduled {
            task: updated,
            delay,
            category,
        })
    }

    /// Delete terminal tasks older than the retention window
    pub async fn cleanup_finished(&self) -> FableResult<u64> {
        let window = Duration::from_secs(u64::from(self.config.retention.retention_days) * 86_400);
        let purged = self
            .store
            .purge_finished(sub_duration(Utc::now(), window))
            .await?;
        if purged > 0 {
            tracing::info!(purged, "Cleaned up finished tasks");
        }
        Ok(purged)
    }

    /// Requeue RUNNING tasks started before `started_before` that this
    /// process is not executing
    pub async fn recover_stale(
        &self,
        started_before: chrono::DateTime<Utc>,
    ) -> FableResult<Vec<TaskId>> {
        let in_flight = self.in_flight_ids().await;
        let recovered = self
            .store
            .requeue_stale(started_before, &in_flight, Utc::now())
            .await?;

        for task_id in &recovered {
            tracing::warn!(%task_id, "Recovered orphaned running task");
            if let Some(task) = self.store.get(*task_id).await? {
                self.publish(TaskEvent::status(&task)).await;
            }
        }
        if !recovered.is_empty() {
            self.wake_scheduler();
        }
        Ok(recovered)
    }
}

#[async_trait]
impl ProgressReporter for TaskQueueService {
    async fn report_progress(
        &self,
        task_id: TaskId,
        run_id: Option<RunId>,
        progress: u8,
        current_step: Option<String>,
    ) -> FableResult<()> {
        self.update_run_progress(task_id, run_id, i32::from(progress), current_step)
            .await
            .map(|_| ())
    }

    async fn is_canceled(&self, task_id: TaskId, run_id: Option<RunId>) -> FableResult<bool> {
        Ok(self.store.get(task_id).await?.is_none_or(|t| {
            t.status == TaskStatus::Canceled || run_id.is_some_and(|run| t.run_id != Some(run))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::PollingNotifier;
    use crate::processor::testing::{ScriptedProcessor, Step};
    use crate::store::InMemoryTaskStore;
    use serde_json::json;

    struct Harness {
        service: TaskQueueService,
        store: Arc<InMemoryTaskStore>,
        events: PollingNotifier,
    }

    async fn harness() -> Harness {
        harness_with(FableConfig::testing()).await
    }

    /// Every category retries with no delay
    fn instant_retries() -> FableConfig {
        let mut config = FableConfig::testing();
        config.retry = crate::config::RetryConfig {
            policies: Default::default(),
            default_policy: crate::config::RetryPolicy::fixed(1, 0),
        };
        config
    }

    async fn harness_with(config: FableConfig) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let events = PollingNotifier::default();
        let registry = Arc::new(ProcessorRegistry::new());
        for task_type in TaskType::ALL {
            registry
                .register(Arc::new(ScriptedProcessor::always(
                    task_type,
                    Step::Succeed(vec![]),
                )))
                .await;
        }
        let service = TaskQueueService::new(
            config,
            store.clone(),
            Arc::new(events.clone()),
            registry,
        );
        Harness {
            service,
            store,
            events,
        }
    }

    /// Claim `task_id` the way the manager does
    async fn start(h: &Harness, task_id: TaskId) -> Task {
        let task = h.store.claim(task_id, Utc::now()).await.unwrap().unwrap();
        h.service.mark_in_flight(&task).await;
        task
    }

    async fn enqueue(h: &Harness, max_retries: u32) -> TaskId {
        h.service
            .enqueue(
                EnqueueRequest::new("u1", TaskType::StoryGeneration, json!({}))
                    .max_retries(max_retries),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_sets_defaults_and_publishes() {
        let h = harness().await;
        let id = h
            .service
            .enqueue_task("u1", TaskType::Analysis, json!({"chatId": 1}), TaskPriority::High)
            .await
            .unwrap();

        let task = h.service.get_task(id, Some("u1")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.max_retries, 2);
        assert_eq!(task.estimated_time, Some(1));

        assert!(h.service.get_task(id, Some("u2")).await.unwrap().is_none());

        let events = h.events.events_for_task(id, None).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, TaskEventType::Status);
    }

    #[tokio::test]
    async fn test_enqueue_rejections() {
        let store = Arc::new(InMemoryTaskStore::new());
        let registry = Arc::new(ProcessorRegistry::new());
        registry
            .register(Arc::new(ScriptedProcessor::always(
                TaskType::Export,
                Step::Succeed(vec![]),
            )))
            .await;
        let service = TaskQueueService::new(
            FableConfig::testing(),
            store.clone(),
            Arc::new(crate::notify::NullNotifier),
            registry,
        );

        let err = service
            .enqueue_task("u1", TaskType::Analysis, json!({}), TaskPriority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, FableError::UnknownTaskType { .. }));

        let err = service
            .enqueue_task("u1", TaskType::Export, json!({"invalid": true}), TaskPriority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, FableError::Validation { .. }));

        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_delayed_enqueue_is_not_due() {
        let h = harness().await;
        let id = h
            .service
            .enqueue(
                EnqueueRequest::new("u1", TaskType::Export, json!({}))
                    .delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let due = h
            .store
            .fetch_due(Utc::now(), &TaskType::ALL, 10)
            .await
            .unwrap();
        assert!(due.iter().all(|t| t.id != id));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_completion_forces_100() {
        let h = harness().await;
        let id = enqueue(&h, 2).await;

        // Not running yet
        assert!(!h.service.update_task_progress(id, 10, None).await.unwrap());

        start(&h, id).await;
        assert!(h.service.update_task_progress(id, 60, Some("drafting".into())).await.unwrap());
        h.service.update_task_progress(id, 30, None).await.unwrap();
        h.service.update_task_progress(id, 150, None).await.unwrap();
        h.service.update_task_progress(id, -5, None).await.unwrap();
        assert_eq!(h.store.get(id).await.unwrap().unwrap().progress, 100);

        let progress: Vec<_> = h
            .events
            .events_for_task(id, None)
            .await
            .into_iter()
            .filter(|e| e.event_type == TaskEventType::Progress)
            .map(|e| e.data["progress"].as_u64().unwrap())
            .collect();
        assert_eq!(progress, vec![60, 60, 100, 100]);

        let outcome = h
            .service
            .complete_task(id, TaskResult::success(json!({"ok": true})))
            .await
            .unwrap();
        let CompletionOutcome::Completed(task) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(task.progress, 100);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(h.service.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_progress_event_carries_eta() {
        let h = harness().await;
        let id = h
            .service
            .enqueue(EnqueueRequest::new("u1", TaskType::Export, json!({})))
            .await
            .unwrap();
        start(&h, id).await;

        h.service.update_task_progress(id, 50, Some("render".into())).await.unwrap();
        let events = h.events.events_for_task(id, None).await;
        let last = events.last().unwrap();
        assert_eq!(last.data["currentStep"], "render");
        assert_eq!(last.data["estimatedTimeRemaining"], 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_rescheduled() {
        let h = harness().await;
        let id = enqueue(&h, 2).await;
        start(&h, id).await;

        let before = Utc::now();
        let outcome = h
            .service
            .complete_task(id, TaskResult::failure("AI service timeout"))
            .await
            .unwrap();

        let CompletionOutcome::Rescheduled {
            task,
            delay,
            category,
        } = outcome
        else {
            panic!("expected reschedule, got {outcome:?}");
        };
        assert_eq!(category, ErrorCategory::AiService);
        assert!(delay >= Duration::from_millis(1500) && delay <= Duration::from_secs(3));
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.progress, 0);
        assert!(task.started_at.is_none());
        assert!(task.queued_at > before);
        assert_eq!(task.error.as_deref(), Some("retry 1/2: AI service timeout"));
        assert_eq!(h.service.in_flight_count().await, 0);

        // No failure surfaced to the owner
        let events = h.events.events_for_task(id, None).await;
        assert!(events.iter().all(|e| e.event_type != TaskEventType::Failed));
    }

    #[tokio::test]
    async fn test_retry_budget_is_never_exceeded() {
        let h = harness_with(instant_retries()).await;
        let id = enqueue(&h, 2).await;

        for expected_retry in 1..=2 {
            start(&h, id).await;
            let outcome = h
                .service
                .complete_task(id, TaskResult::failure("network unreachable"))
                .await
                .unwrap();
            let CompletionOutcome::Rescheduled { task, delay, .. } = outcome else {
                panic!("expected reschedule, got {outcome:?}");
            };
            assert_eq!(task.retry_count, expected_retry);
            assert_eq!(delay, Duration::ZERO);
        }

        start(&h, id).await;
        let outcome = h
            .service
            .complete_task(id, TaskResult::failure("network unreachable"))
            .await
            .unwrap();
        let CompletionOutcome::Failed(task) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error.as_deref(), Some("network unreachable"));

        let events = h.events.events_for_task(id, None).await;
        assert_eq!(events.last().unwrap().event_type, TaskEventType::Failed);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let h = harness().await;
        let id = enqueue(&h, 3).await;
        start(&h, id).await;

        let outcome = h
            .service
            .complete_task(id, TaskResult::failure("Unauthorized access to analysis"))
            .await
            .unwrap();
        let CompletionOutcome::Failed(task) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_hint_overrides_classification() {
        let h = harness().await;
        let id = enqueue(&h, 3).await;
        start(&h, id).await;

        // Pattern says retryable, hint says no
        let outcome = h
            .service
            .complete_task(id, TaskResult::permanent_failure("connection reset"))
            .await
            .unwrap();
        assert!(matches!(outcome, CompletionOutcome::Failed(_)));

        let id = enqueue(&h, 3).await;
        start(&h, id).await;
        let outcome = h
            .service
            .complete_task(id, TaskResult::transient_failure("analysis not found"))
            .await
            .unwrap();
        assert!(matches!(outcome, CompletionOutcome::Rescheduled { .. }));
    }

    #[tokio::test]
    async fn test_zero_budget_fails_with_original_message() {
        let h = harness().await;
        let id = enqueue(&h, 0).await;
        start(&h, id).await;

        let outcome = h
            .service
            .complete_task(id, TaskResult::failure("AI service timeout"))
            .await
            .unwrap();
        let CompletionOutcome::Failed(task) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(task.retry_count, 0);
        assert!(task.error.unwrap().contains("AI service timeout"));
    }

    #[tokio::test]
    async fn test_complete_unknown_task_errors() {
        let h = harness().await;
        let err = h
            .service
            .complete_task(uuid::Uuid::new_v4(), TaskResult::success(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, FableError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancel_guards() {
        let h = harness().await;
        let id = enqueue(&h, 1).await;

        assert!(!h.service.cancel_task(id, Some("someone-else")).await.unwrap());
        assert!(h.service.cancel_task(id, Some("u1")).await.unwrap());
        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.error.as_deref(), Some(CANCELED_BY_USER));
        assert!(task.completed_at.is_some());

        // Idempotent
        assert!(!h.service.cancel_task(id, Some("u1")).await.unwrap());
        assert!(!h.service.cancel_task(uuid::Uuid::new_v4(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_completed_task_is_rejected() {
        let h = harness().await;
        let id = enqueue(&h, 1).await;
        start(&h, id).await;
        h.service
            .complete_task(id, TaskResult::success(json!({})))
            .await
            .unwrap();

        let before = h.store.get(id).await.unwrap().unwrap();
        assert!(!h.service.cancel_task(id, None).await.unwrap());
        assert_eq!(h.store.get(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_result_for_canceled_task_is_ignored() {
        let h = harness().await;
        let id = enqueue(&h, 1).await;
        start(&h, id).await;

        assert!(h.service.cancel_task(id, None).await.unwrap());
        assert!(h.service.is_canceled(id, None).await.unwrap());

        let outcome = h
            .service
            .complete_task(id, TaskResult::success(json!({})))
            .await
            .unwrap();
        assert_eq!(outcome, CompletionOutcome::Ignored);
        assert_eq!(
            h.store.get(id).await.unwrap().unwrap().status,
            TaskStatus::Canceled
        );
        assert_eq!(h.service.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_superseded_run_result_is_ignored() {
        let h = harness().await;
        let id = enqueue(&h, 2).await;
        let first = start(&h, id).await;

        assert!(h.service.cancel_task(id, None).await.unwrap());
        assert!(h.service.retry_task(id, None).await.unwrap());
        let second = start(&h, id).await;
        assert_ne!(first.run_id, second.run_id);

        assert!(h.service.is_canceled(id, first.run_id).await.unwrap());
        assert!(!h.service.is_canceled(id, second.run_id).await.unwrap());
        assert!(!h
            .service
            .update_run_progress(id, first.run_id, 90, None)
            .await
            .unwrap());

        let stale = h
            .service
            .complete_run(id, first.run_id, TaskResult::success(json!({})))
            .await
            .unwrap();
        assert_eq!(stale, CompletionOutcome::Ignored);

        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.run_id, second.run_id);
        assert_eq!(task.progress, 0);
        assert_eq!(h.service.in_flight_run(id).await, Some(second.run_id));

        let outcome = h
            .service
            .complete_run(id, second.run_id, TaskResult::success(json!({})))
            .await
            .unwrap();
        assert!(matches!(outcome, CompletionOutcome::Completed(_)));
        assert_eq!(h.service.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_manual_retry() {
        let h = harness().await;
        let id = enqueue(&h, 1).await;
        start(&h, id).await;
        h.service
            .complete_task(id, TaskResult::permanent_failure("bad request"))
            .await
            .unwrap();

        assert!(h.service.retry_task(id, Some("u1")).await.unwrap());
        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.is_none());
        assert!(task.completed_at.is_none());

        // Budget spent
        start(&h, id).await;
        h.service
            .complete_task(id, TaskResult::failure("bad request"))
            .await
            .unwrap();
        assert!(!h.service.retry_task(id, Some("u1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_position_for_urgent_peers() {
        let h = harness().await;
        let first = h
            .service
            .enqueue_task("u1", TaskType::StoryGeneration, json!({}), TaskPriority::Urgent)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = h
            .service
            .enqueue_task("u2", TaskType::StoryGeneration, json!({}), TaskPriority::Urgent)
            .await
            .unwrap();

        let pos = h.service.get_queue_position(second).await.unwrap().unwrap();
        assert_eq!(pos.position, 2);
        // One slot free, configured estimate of 1s
        assert_eq!(pos.estimated_wait_secs, 1);

        let pos = h.service.get_queue_position(first).await.unwrap().unwrap();
        assert_eq!(pos.position, 1);
        assert_eq!(pos.estimated_wait_secs, 0);

        start(&h, first).await;
        assert!(h.service.get_queue_position(first).await.unwrap().is_none());
        let pos = h.service.get_queue_position(second).await.unwrap().unwrap();
        assert_eq!(pos.position, 1);
        // No free slot while `first` runs
        assert_eq!(pos.estimated_wait_secs, 1);
    }

    #[tokio::test]
    async fn test_queue_metrics() {
        let h = harness().await;
        let ok = enqueue(&h, 0).await;
        let bad = enqueue(&h, 0).await;
        let _waiting = enqueue(&h, 0).await;

        start(&h, ok).await;
        h.service
            .complete_task(ok, TaskResult::success(json!({})))
            .await
            .unwrap();
        start(&h, bad).await;
        h.service
            .complete_task(bad, TaskResult::failure("boom"))
            .await
            .unwrap();

        let metrics = h.service.get_queue_metrics().await.unwrap();
        assert_eq!(metrics.queued, 1);
        assert_eq!(metrics.running, 0);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert!((metrics.success_rate - 50.0).abs() < f64::EPSILON);
        assert!(metrics.avg_wait_secs >= 0.0);
    }

    #[tokio::test]
    async fn test_recover_stale_skips_in_flight() {
        let h = harness().await;
        let tracked = enqueue(&h, 1).await;
        let orphan = enqueue(&h, 1).await;
        start(&h, tracked).await;
        h.store.claim(orphan, Utc::now()).await.unwrap();

        let recovered = h.service.recover_stale(Utc::now()).await.unwrap();
        assert_eq!(recovered, vec![orphan]);
        assert_eq!(
            h.store.get(orphan).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }
}
