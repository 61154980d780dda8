//! Queue manager: the scheduler loop.
//!
//! The manager owns two background loops:
//! - the scheduler, ticking on a fixed interval and whenever the service
//!   signals a wake (enqueue, completion, retry, cancel)
//! - maintenance, requeueing orphaned RUNNING tasks and purging old finished
//!   ones
//!
//! Each tick claims due tasks up to the free capacity and runs every claimed
//! task in its own tokio task. Whatever the processor does (succeed, fail,
//! time out, panic) ends in [`TaskQueueService::complete_run`], scoped to the
//! run the claim stamped.
//!
//! A canceled execution keeps its slot until its future returns, so a task
//! that is canceled, retried and claimed again never runs twice over the
//! concurrency limit.

use chrono::Utc;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};

use super::registry::ExecutionOutcome;
use super::service::TaskQueueService;
use crate::error::{FableError, FableResult};
use crate::notify::TaskEvent;
use crate::processor::TaskContext;
use crate::task::{Task, TaskResult};
use crate::utils::sub_duration;

/// Consecutive store failures after which the manager reports unhealthy
const STORE_FAILURE_THRESHOLD: u32 = 3;

/// Scheduler state shared with the background loops
#[derive(Clone)]
struct Scheduler {
    service: TaskQueueService,
    executions: Arc<Mutex<JoinSet<()>>>,
    store_failures: Arc<AtomicU32>,
}

impl Scheduler {
    fn record_store_failure(&self, error: &FableError) {
        let failures = self.store_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= STORE_FAILURE_THRESHOLD {
            tracing::error!(
                failures,
                "Task store unavailable, scheduling halted: {}",
                error
            );
        } else {
            tracing::error!(failures, "Task store error during tick: {}", error);
        }
    }

    fn record_store_success(&self) {
        let previous = self.store_failures.swap(0, Ordering::Relaxed);
        if previous >= STORE_FAILURE_THRESHOLD {
            tracing::info!(previous, "Task store reachable again, scheduling resumed");
        }
    }

    /// Drop finished executions from the join set
    async fn reap(&self) {
        let mut executions = self.executions.lock().await;
        while let Some(joined) = executions.try_join_next() {
            if let Err(e) = joined {
                tracing::error!("Execution task failed: {}", e);
            }
        }
    }

    async fn tick(&self) -> FableResult<usize> {
        self.reap().await;

        let config = self.service.config();
        let running = self.executions.lock().await.len();
        let occupied = running.max(self.service.in_flight_count().await);
        let capacity = config.manager.max_concurrent_tasks.saturating_sub(occupied);
        if capacity == 0 {
            tracing::trace!("At capacity, skipping tick");
            return Ok(0);
        }

        let task_types = self.service.registry().registered_types().await;
        if task_types.is_empty() {
            return Ok(0);
        }

        let due = match self
            .service
            .store()
            .fetch_due(Utc::now(), &task_types, capacity)
            .await
        {
            Ok(due) => {
                self.record_store_success();
                due
            }
            Err(e) => {
                self.record_store_failure(&e);
                return Err(e);
            }
        };

        let mut dispatched = 0;
        for candidate in due {
            let claimed = match self.service.store().claim(candidate.id, Utc::now()).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tracing::debug!(task_id = %candidate.id, "Task claimed elsewhere, skipping");
                    continue;
                }
                Err(e) => {
                    self.record_store_failure(&e);
                    return Err(e);
                }
            };

            self.service.mark_in_flight(&claimed).await;
            tracing::info!(
                task_id = %claimed.id,
                run_id = ?claimed.run_id,
                task_type = %claimed.task_type,
                retry_count = claimed.retry_count,
                "Dispatching task"
            );
            self.service.publish(TaskEvent::status(&claimed)).await;

            let service = self.service.clone();
            self.executions
                .lock()
                .await
                .spawn(async move { execute(service, claimed).await });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Wait for every running execution
    async fn drain(&self) {
        let mut executions = self.executions.lock().await;
        while executions.join_next().await.is_some() {}
    }
}

/// Run one claimed task to completion
async fn execute(service: TaskQueueService, task: Task) {
    let task_id = task.id;
    let run_id = task.run_id;
    let task_type = task.task_type;
    let started = Instant::now();

    let (result, outcome) = match service.registry().get(task_type).await {
        None => (
            TaskResult::permanent_failure(format!(
                "no processor registered for task type {task_type}"
            )),
            None,
        ),
        Some(processor) => match processor.validate_payload(&task.payload) {
            Err(e) => (
                TaskResult::permanent_failure(e.to_string()),
                Some(ExecutionOutcome::Failed),
            ),
            Ok(()) => {
                let limit = service.config().tasks.timeout(task_type);
                let ctx = TaskContext::new(&task, Arc::new(service.clone()));
                let payload = task.payload.clone();
                let mut handle = tokio::spawn(async move { processor.process(ctx, payload).await });

                match timeout(limit, &mut handle).await {
                    Ok(Ok(result)) => {
                        let outcome = if result.success {
                            ExecutionOutcome::Succeeded
                        } else {
                            ExecutionOutcome::Failed
                        };
                        (result, Some(outcome))
                    }
                    Ok(Err(join_error)) => {
                        let message = join_failure_message(join_error);
                        tracing::error!(%task_id, "Processor crashed: {}", message);
                        (TaskResult::failure(message), Some(ExecutionOutcome::Panicked))
                    }
                    Err(_) => {
                        handle.abort();
                        tracing::error!(%task_id, timeout_secs = limit.as_secs(), "Processor timed out");
                        (
                            TaskResult::failure(format!(
                                "processing timeout after {}s",
                                limit.as_secs()
                            )),
                            Some(ExecutionOutcome::TimedOut),
                        )
                    }
                }
            }
        },
    };

    if let Some(outcome) = outcome {
        service
            .registry()
            .record_execution(task_type, outcome, started.elapsed())
            .await;
    }

    match service.complete_run(task_id, run_id, result).await {
        Ok(completion) => tracing::debug!(%task_id, ?run_id, ?completion, "Execution finished"),
        Err(e) => tracing::error!(%task_id, ?run_id, "Failed to complete task: {}", e),
    }
    service.release_run(task_id, run_id).await;
}

fn join_failure_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "processor was cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("processor panicked: {detail}")
}

/// Long-lived scheduler driving a [`TaskQueueService`]
pub struct QueueManager {
    scheduler: Scheduler,
    is_running: Arc<AtomicBool>,
    is_shutting_down: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    scheduler_handle: Option<JoinHandle<()>>,
    maintenance_handle: Option<JoinHandle<()>>,
    start_time: Option<Instant>,
}

impl QueueManager {
    /// Create a stopped manager for `service`
    pub fn new(service: TaskQueueService) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            scheduler: Scheduler {
                service,
                executions: Arc::new(Mutex::new(JoinSet::new())),
                store_failures: Arc::new(AtomicU32::new(0)),
            },
            is_running: Arc::new(AtomicBool::new(false)),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            scheduler_handle: None,
            maintenance_handle: None,
            start_time: None,
        }
    }

    /// Service this manager drives
    pub fn service(&self) -> &TaskQueueService {
        &self.scheduler.service
    }

    /// Start the scheduler and maintenance loops
    pub async fn start(&mut self) -> FableResult<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Err(FableError::AlreadyRunning);
        }

        let config = self.service().config().manager.clone();
        tracing::info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            poll_interval_secs = config.poll_interval_secs,
            "Starting queue manager"
        );

        if config.recover_on_start {
            match self.service().recover_stale(Utc::now()).await {
                Ok(recovered) if !recovered.is_empty() => {
                    tracing::warn!(count = recovered.len(), "Requeued running tasks on start");
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Startup recovery failed: {}", e),
            }
        }

        self.shutdown_tx.send_replace(false);
        self.is_shutting_down.store(false, Ordering::Relaxed);
        self.scheduler_handle = Some(self.start_scheduler());
        self.maintenance_handle = Some(self.start_maintenance());

        self.is_running.store(true, Ordering::Relaxed);
        self.start_time = Some(Instant::now());
        self.service().wake_scheduler();

        tracing::info!("Queue manager started");
        Ok(())
    }

    /// Stop both loops and wait for running executions.
    ///
    /// Executions still running after `shutdown_timeout_secs` are aborted;
    /// their tasks stay RUNNING in the store until a recovery sweep requeues
    /// them.
    pub async fn stop(&mut self) -> FableResult<()> {
        if !self.is_running.load(Ordering::Relaxed) {
            return Err(FableError::NotRunning);
        }

        tracing::info!("Stopping queue manager...");
        self.is_shutting_down.store(true, Ordering::Relaxed);
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = self.scheduler_handle.take() {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler loop ended abnormally: {}", e);
            }
        }
        if let Some(handle) = self.maintenance_handle.take() {
            handle.abort();
        }

        let grace = Duration::from_secs(self.service().config().manager.shutdown_timeout_secs);
        if timeout(grace, self.scheduler.drain()).await.is_err() {
            let mut executions = self.scheduler.executions.lock().await;
            tracing::warn!(
                remaining = executions.len(),
                "Shutdown timeout reached, aborting running executions"
            );
            executions.abort_all();
            while executions.join_next().await.is_some() {}
        }

        self.is_running.store(false, Ordering::Relaxed);
        self.is_shutting_down.store(false, Ordering::Relaxed);
        tracing::info!("Queue manager stopped");
        Ok(())
    }

    /// Run one scheduling pass; returns how many tasks were dispatched
    pub async fn tick(&self) -> FableResult<usize> {
        self.scheduler.tick().await
    }

    /// Wait until every dispatched execution has finished
    pub async fn wait_idle(&self) {
        self.scheduler.drain().await;
    }

    fn start_scheduler(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let wake = scheduler.service.wake_handle();
        let poll_interval = scheduler
            .service
            .config()
            .manager
            .poll_interval()
            .max(Duration::from_secs(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            tracing::info!("Scheduler loop started");
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                    _ = shutdown_rx.changed() => break,
                }
                if *shutdown_rx.borrow() {
                    break;
                }

                match scheduler.tick().await {
                    Ok(0) => {}
                    Ok(dispatched) => tracing::debug!(dispatched, "Scheduler tick"),
                    // Already logged with the failure count
                    Err(_) => {}
                }
            }

            tracing::info!("Scheduler loop stopped");
        })
    }

    fn start_maintenance(&self) -> JoinHandle<()> {
        let service = self.scheduler.service.clone();
        let manager_config = service.config().manager.clone();
        let stale_after = Duration::from_secs(manager_config.stale_after_secs.max(1));
        let cleanup_every = Duration::from_secs(manager_config.cleanup_interval_secs.max(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            tracing::info!("Maintenance loop started");
            let mut stale_ticker = interval(stale_after);
            let mut cleanup_ticker = interval(cleanup_every);
            stale_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            cleanup_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stale_ticker.tick() => {
                        let cutoff = sub_duration(Utc::now(), stale_after);
                        if let Err(e) = service.recover_stale(cutoff).await {
                            tracing::error!("Stale task recovery failed: {}", e);
                        }
                    }
                    _ = cleanup_ticker.tick() => {
                        if let Err(e) = service.cleanup_finished().await {
                            tracing::error!("Finished task cleanup failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            tracing::info!("Maintenance loop stopped");
        })
    }

    /// Fails when stopped, after repeated store failures, or when the store
    /// health check fails
    pub async fn health_check(&self) -> FableResult<()> {
        if !self.is_running.load(Ordering::Relaxed) {
            return Err(FableError::NotRunning);
        }

        let failures = self.consecutive_store_failures();
        if failures >= STORE_FAILURE_THRESHOLD {
            return Err(FableError::store_msg(format!(
                "{failures} consecutive store failures"
            )));
        }

        let in_flight = self.service().in_flight_count().await;
        let max = self.service().config().manager.max_concurrent_tasks;
        tracing::debug!(in_flight, max, uptime = ?self.uptime(), "Manager health check");

        self.service().store().health_check().await
    }

    /// Store failures since the last successful tick
    pub fn consecutive_store_failures(&self) -> u32 {
        self.scheduler.store_failures.load(Ordering::Relaxed)
    }

    /// Time since the manager was started
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.map(|start| start.elapsed())
    }

    /// Check if the manager is running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Check if the manager is shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FableConfig, RetryPolicy, TaskTypeConfig};
    use crate::core::registry::ProcessorRegistry;
    use crate::notify::{PollingNotifier, TaskEventType};
    use crate::processor::TaskProcessor;
    use crate::processor::testing::{ScriptedProcessor, Step};
    use crate::retry::ErrorCategory;
    use crate::store::{InMemoryTaskStore, TaskStore};
    use crate::task::{EnqueueRequest, TaskId, TaskPriority, TaskStatus, TaskType};
    use serde_json::json;
    use tokio_test::assert_ok;

    struct Harness {
        manager: QueueManager,
        store: Arc<InMemoryTaskStore>,
        events: PollingNotifier,
        processor: Arc<ScriptedProcessor>,
    }

    async fn harness(config: FableConfig, processor: ScriptedProcessor) -> Harness {
        harness_on(config, processor, Arc::new(InMemoryTaskStore::new())).await
    }

    async fn harness_on(
        config: FableConfig,
        processor: ScriptedProcessor,
        store: Arc<InMemoryTaskStore>,
    ) -> Harness {
        let processor = Arc::new(processor);
        shared_harness(config, processor, store).await
    }

    async fn shared_harness(
        config: FableConfig,
        processor: Arc<ScriptedProcessor>,
        store: Arc<InMemoryTaskStore>,
    ) -> Harness {
        let events = PollingNotifier::default();
        let registry = Arc::new(ProcessorRegistry::new());
        registry
            .register(processor.clone() as Arc<dyn TaskProcessor>)
            .await;
        let service =
            TaskQueueService::new(config, store.clone(), Arc::new(events.clone()), registry);
        Harness {
            manager: QueueManager::new(service),
            store,
            events,
            processor,
        }
    }

    async fn enqueue(h: &Harness, priority: TaskPriority, max_retries: u32) -> TaskId {
        let id = h
            .manager
            .service()
            .enqueue(
                EnqueueRequest::new("u1", TaskType::StoryGeneration, json!({}))
                    .priority(priority)
                    .max_retries(max_retries),
            )
            .await
            .unwrap();
        // Distinct queued_at for FIFO checks
        tokio::time::sleep(Duration::from_millis(3)).await;
        id
    }

    async fn wait_for_status(h: &Harness, task_id: TaskId, status: TaskStatus) -> Task {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(task) = h.store.get(task_id).await.unwrap() {
                    if task.status == status {
                        return task;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task did not reach expected status")
    }

    fn story(step: Step) -> ScriptedProcessor {
        ScriptedProcessor::always(TaskType::StoryGeneration, step)
    }

    #[tokio::test]
    async fn test_manager_lifecycle() {
        let mut h = harness(FableConfig::testing(), story(Step::Succeed(vec![]))).await;
        assert!(!h.manager.is_running());
        assert!(matches!(h.manager.health_check().await, Err(FableError::NotRunning)));

        h.manager.start().await.unwrap();
        assert!(h.manager.is_running());
        assert!(matches!(h.manager.start().await, Err(FableError::AlreadyRunning)));
        assert_ok!(h.manager.health_check().await);
        assert!(h.manager.uptime().is_some());

        h.manager.stop().await.unwrap();
        assert!(!h.manager.is_running());
        assert!(matches!(h.manager.stop().await, Err(FableError::NotRunning)));
    }

    #[tokio::test]
    async fn test_enqueued_task_runs_to_completion() {
        let mut h = harness(FableConfig::testing(), story(Step::Succeed(vec![10, 50, 100]))).await;
        h.manager.start().await.unwrap();

        let id = enqueue(&h, TaskPriority::Normal, 2).await;
        let task = wait_for_status(&h, id, TaskStatus::Completed).await;

        assert_eq!(task.progress, 100);
        assert!(task.actual_time.unwrap() > 0);
        assert!(task.started_at.is_some());

        let events = h.events.events_for_task(id, None).await;
        let progress: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == TaskEventType::Progress)
            .map(|e| e.data["progress"].as_u64().unwrap())
            .collect();
        assert_eq!(progress, vec![10, 50, 100]);
        assert_eq!(events.last().unwrap().event_type, TaskEventType::Completed);

        let stats = h
            .manager
            .service()
            .registry()
            .stats(TaskType::StoryGeneration)
            .await
            .unwrap();
        assert_eq!(stats.successful, 1);

        h.manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_order_with_single_slot() {
        let h = harness(FableConfig::testing(), story(Step::Succeed(vec![]))).await;
        let low = enqueue(&h, TaskPriority::Low, 0).await;
        let high = enqueue(&h, TaskPriority::High, 0).await;
        let normal = enqueue(&h, TaskPriority::Normal, 0).await;

        for _ in 0..3 {
            assert_eq!(h.manager.tick().await.unwrap(), 1);
            h.manager.wait_idle().await;
        }
        assert_eq!(h.manager.tick().await.unwrap(), 0);
        assert_eq!(h.processor.run_order().await, vec![high, normal, low]);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let h = harness(FableConfig::testing(), story(Step::Succeed(vec![]))).await;
        let first = enqueue(&h, TaskPriority::Normal, 0).await;
        let second = enqueue(&h, TaskPriority::Normal, 0).await;

        for _ in 0..2 {
            h.manager.tick().await.unwrap();
            h.manager.wait_idle().await;
        }
        assert_eq!(h.processor.run_order().await, vec![first, second]);
    }

    #[tokio::test]
    async fn test_capacity_is_respected() {
        let h = harness(
            FableConfig::testing(),
            story(Step::Sleep(Duration::from_millis(200))),
        )
        .await;
        enqueue(&h, TaskPriority::Normal, 0).await;
        enqueue(&h, TaskPriority::Normal, 0).await;

        assert_eq!(h.manager.tick().await.unwrap(), 1);
        // Slot still taken
        assert_eq!(h.manager.tick().await.unwrap(), 0);
        h.manager.wait_idle().await;
        assert_eq!(h.manager.tick().await.unwrap(), 1);
        h.manager.wait_idle().await;
    }

    #[tokio::test]
    async fn test_concurrent_managers_never_double_dispatch() {
        let mut config = FableConfig::testing();
        config.manager.max_concurrent_tasks = 8;
        let store = Arc::new(InMemoryTaskStore::new());
        let processor = Arc::new(story(Step::Sleep(Duration::from_millis(5))));

        let a = shared_harness(config.clone(), processor.clone(), store.clone()).await;
        let b = shared_harness(config, processor.clone(), store.clone()).await;

        let mut ids = Vec::new();
        for _ in 0..12 {
            ids.push(enqueue(&a, TaskPriority::Normal, 0).await);
        }

        for _ in 0..4 {
            let (ra, rb) = tokio::join!(a.manager.tick(), b.manager.tick());
            ra.unwrap();
            rb.unwrap();
            tokio::join!(a.manager.wait_idle(), b.manager.wait_idle());
        }

        let mut runs = processor.run_order().await;
        assert_eq!(runs.len(), ids.len());
        runs.sort();
        runs.dedup();
        assert_eq!(runs.len(), ids.len());

        for id in ids {
            assert_eq!(
                store.get(id).await.unwrap().unwrap().status,
                TaskStatus::Completed
            );
        }
    }

    #[tokio::test]
    async fn test_canceled_task_is_never_picked() {
        let h = harness(FableConfig::testing(), story(Step::Succeed(vec![]))).await;
        let id = enqueue(&h, TaskPriority::Urgent, 0).await;
        assert!(h.manager.service().cancel_task(id, Some("u1")).await.unwrap());

        assert_eq!(h.manager.tick().await.unwrap(), 0);
        assert!(h.processor.run_order().await.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_fails_task() {
        let mut config = FableConfig::testing();
        config.tasks.set(
            TaskType::StoryGeneration,
            TaskTypeConfig {
                timeout_secs: 1,
                estimated_processing_secs: 1,
                max_retries: 0,
            },
        );
        let h = harness(config, story(Step::Sleep(Duration::from_secs(30)))).await;
        let id = enqueue(&h, TaskPriority::Normal, 0).await;

        h.manager.tick().await.unwrap();
        h.manager.wait_idle().await;

        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("processing timeout after 1s"));
        assert_eq!(h.manager.service().in_flight_count().await, 0);

        let stats = h
            .manager
            .service()
            .registry()
            .stats(TaskType::StoryGeneration)
            .await
            .unwrap();
        assert_eq!(stats.timed_out, 1);
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_failure() {
        let h = harness(FableConfig::testing(), story(Step::Panic)).await;
        let id = enqueue(&h, TaskPriority::Normal, 0).await;

        h.manager.tick().await.unwrap();
        h.manager.wait_idle().await;

        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("scripted processor panic"));
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_before_running() {
        let h = harness(FableConfig::testing(), story(Step::Succeed(vec![]))).await;
        let mut task = Task::new(
            "u1",
            TaskType::StoryGeneration,
            json!({ "invalid": true }),
            TaskPriority::Normal,
            3,
        );
        task.queued_at = Utc::now() - chrono::Duration::seconds(1);
        h.store.insert(task.clone()).await.unwrap();

        h.manager.tick().await.unwrap();
        h.manager.wait_idle().await;

        let stored = h.store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(h.processor.run_order().await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_is_picked_up_after_backoff() {
        let mut config = FableConfig::testing();
        // Long poll interval: only the retry timer can wake the scheduler
        config.manager.poll_interval_secs = 600;
        config.retry = config.retry.with_policy(
            ErrorCategory::AiService,
            RetryPolicy::exponential(2, 0.2, 0.4, 1.5),
        );
        let processor = ScriptedProcessor::new(
            TaskType::StoryGeneration,
            vec![Step::Return(TaskResult::failure("AI service timeout"))],
            Step::Succeed(vec![]),
        );
        let mut h = harness(config, processor).await;
        h.manager.start().await.unwrap();

        let id = enqueue(&h, TaskPriority::Normal, 2).await;
        let task = wait_for_status(&h, id, TaskStatus::Completed).await;

        assert_eq!(task.retry_count, 1);
        assert_eq!(h.processor.run_order().await, vec![id, id]);

        let events = h.events.events_for_task(id, None).await;
        assert!(events.iter().all(|e| e.event_type != TaskEventType::Failed));

        h.manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_orphans_are_recovered_on_start() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut orphan = Task::new("u1", TaskType::StoryGeneration, json!({}), TaskPriority::Normal, 1);
        orphan.queued_at = Utc::now() - chrono::Duration::seconds(5);
        store.insert(orphan.clone()).await.unwrap();
        store.claim(orphan.id, Utc::now()).await.unwrap();

        let mut h = harness_on(FableConfig::testing(), story(Step::Succeed(vec![])), store).await;
        h.manager.start().await.unwrap();

        wait_for_status(&h, orphan.id, TaskStatus::Completed).await;
        h.manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_execution() {
        let mut h = harness(
            FableConfig::testing(),
            story(Step::Sleep(Duration::from_millis(300))),
        )
        .await;
        h.manager.start().await.unwrap();
        let id = enqueue(&h, TaskPriority::Normal, 0).await;
        wait_for_status(&h, id, TaskStatus::Running).await;

        h.manager.stop().await.unwrap();
        assert_eq!(
            h.store.get(id).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_canceled_run_keeps_its_slot() {
        let h = harness(
            FableConfig::testing(),
            story(Step::Sleep(Duration::from_millis(300))),
        )
        .await;
        let service = h.manager.service();
        let id = enqueue(&h, TaskPriority::Normal, 1).await;

        assert_eq!(h.manager.tick().await.unwrap(), 1);
        wait_for_status(&h, id, TaskStatus::Running).await;
        assert!(service.cancel_task(id, None).await.unwrap());
        assert!(service.retry_task(id, None).await.unwrap());

        // The canceled run is still executing
        assert_eq!(h.manager.tick().await.unwrap(), 0);
        h.manager.wait_idle().await;
        assert_eq!(
            h.store.get(id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );

        assert_eq!(h.manager.tick().await.unwrap(), 1);
        h.manager.wait_idle().await;
        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(h.processor.run_order().await, vec![id, id]);
    }

    #[tokio::test]
    async fn test_superseded_run_cannot_finalize_new_run() {
        let mut config = FableConfig::testing();
        config.manager.max_concurrent_tasks = 2;
        let processor = ScriptedProcessor::new(
            TaskType::StoryGeneration,
            vec![
                Step::Sleep(Duration::from_millis(300)),
                Step::Sleep(Duration::from_millis(900)),
            ],
            Step::Succeed(vec![]),
        );
        let h = harness(config, processor).await;
        let service = h.manager.service();
        let id = enqueue(&h, TaskPriority::Normal, 1).await;

        assert_eq!(h.manager.tick().await.unwrap(), 1);
        let first = wait_for_status(&h, id, TaskStatus::Running).await;
        assert!(service.cancel_task(id, None).await.unwrap());
        assert!(service.retry_task(id, None).await.unwrap());

        assert_eq!(h.manager.tick().await.unwrap(), 1);
        let second = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Running);
        assert_ne!(second.run_id, first.run_id);

        // First run finishes while the second is still going
        tokio::time::sleep(Duration::from_millis(500)).await;
        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.run_id, second.run_id);
        assert!(task.completed_at.is_none());
        assert_eq!(service.in_flight_run(id).await, Some(second.run_id));
        assert_eq!(service.in_flight_count().await, 1);

        h.manager.wait_idle().await;
        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(service.in_flight_count().await, 0);

        let completions = h
            .events
            .events_for_task(id, None)
            .await
            .into_iter()
            .filter(|e| e.event_type == TaskEventType::Completed)
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_zero_poll_interval_does_not_panic() {
        let mut config = FableConfig::testing();
        config.manager.poll_interval_secs = 0;
        let mut h = harness(config, story(Step::Succeed(vec![]))).await;
        h.manager.start().await.unwrap();

        let id = enqueue(&h, TaskPriority::Normal, 0).await;
        wait_for_status(&h, id, TaskStatus::Completed).await;
        assert_ok!(h.manager.health_check().await);
        h.manager.stop().await.unwrap();
    }
}
