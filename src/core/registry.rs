//! Processor registry.
//!
//! Maps each [`TaskType`] to the [`TaskProcessor`] that handles it and keeps
//! per-type execution statistics. The scheduler only picks tasks whose type
//! has a registered processor; the observed average duration feeds queue
//! ETAs.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::processor::TaskProcessor;
use crate::task::TaskType;

/// Weight of the newest sample in the moving average
const EMA_ALPHA: f64 = 0.1;

/// How one execution ended, as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Processor reported success
    Succeeded,
    /// Processor reported failure
    Failed,
    /// Processor exceeded the per-type timeout
    TimedOut,
    /// Processor panicked
    Panicked,
}

/// Statistics for a registered task type.
#[derive(Debug, Clone, Default)]
pub struct TaskTypeStats {
    /// Total number of executions
    pub total_executed: u64,
    /// Successful executions
    pub successful: u64,
    /// Failed executions
    pub failed: u64,
    /// Timed out executions
    pub timed_out: u64,
    /// Panicked executions
    pub panicked: u64,
    /// Exponential moving average of execution time
    pub avg_duration: Option<Duration>,
    /// Last execution time
    pub last_executed: Option<DateTime<Utc>>,
}

impl TaskTypeStats {
    fn record(&mut self, outcome: ExecutionOutcome, duration: Duration) {
        self.total_executed += 1;
        self.last_executed = Some(Utc::now());

        match outcome {
            ExecutionOutcome::Succeeded => self.successful += 1,
            ExecutionOutcome::Failed => self.failed += 1,
            ExecutionOutcome::TimedOut => self.timed_out += 1,
            ExecutionOutcome::Panicked => self.panicked += 1,
        }

        self.avg_duration = Some(match self.avg_duration {
            Some(avg) => Duration::from_secs_f64(
                EMA_ALPHA * duration.as_secs_f64() + (1.0 - EMA_ALPHA) * avg.as_secs_f64(),
            ),
            None => duration,
        });
    }
}

/// Registry of task processors
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<TaskType, Arc<dyn TaskProcessor>>>,
    stats: RwLock<HashMap<TaskType, TaskTypeStats>>,
}

impl ProcessorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for its task type, replacing any previous one.
    pub async fn register(&self, processor: Arc<dyn TaskProcessor>) {
        let task_type = processor.task_type();
        let replaced = self
            .processors
            .write()
            .await
            .insert(task_type, processor)
            .is_some();

        if replaced {
            tracing::warn!(%task_type, "Replaced task processor");
        } else {
            tracing::info!(%task_type, "Registered task processor");
        }

        self.stats.write().await.entry(task_type).or_default();
    }

    /// Processor for `task_type`
    pub async fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskProcessor>> {
        self.processors.read().await.get(&task_type).cloned()
    }

    /// Whether a processor is registered for `task_type`
    pub async fn is_registered(&self, task_type: TaskType) -> bool {
        self.processors.read().await.contains_key(&task_type)
    }

    /// Registered task types, in declaration order
    pub async fn registered_types(&self) -> Vec<TaskType> {
        let processors = self.processors.read().await;
        TaskType::ALL
            .into_iter()
            .filter(|t| processors.contains_key(t))
            .collect()
    }

    /// Number of registered processors
    pub async fn processor_count(&self) -> usize {
        self.processors.read().await.len()
    }

    /// Record one execution
    pub async fn record_execution(
        &self,
        task_type: TaskType,
        outcome: ExecutionOutcome,
        duration: Duration,
    ) {
        self.stats
            .write()
            .await
            .entry(task_type)
            .or_default()
            .record(outcome, duration);
    }

    /// Statistics for `task_type`
    pub async fn stats(&self, task_type: TaskType) -> Option<TaskTypeStats> {
        self.stats.read().await.get(&task_type).cloned()
    }

    /// Statistics for every task type seen
    pub async fn all_stats(&self) -> HashMap<TaskType, TaskTypeStats> {
        self.stats.read().await.clone()
    }

    /// Observed average execution time for `task_type`
    pub async fn avg_duration(&self, task_type: TaskType) -> Option<Duration> {
        self.stats
            .read()
            .await
            .get(&task_type)
            .and_then(|s| s.avg_duration)
    }

    /// Reset statistics for all task types.
    pub async fn reset_stats(&self) {
        let mut stats = self.stats.write().await;
        for entry in stats.values_mut() {
            *entry = TaskTypeStats::default();
        }
        tracing::info!("Processor statistics reset");
    }

    /// Snapshot of the registry state
    pub async fn summary(&self) -> RegistrySummary {
        let registered_types = self.registered_types().await;
        let stats = self.stats.read().await;

        RegistrySummary {
            processor_count: registered_types.len(),
            registered_types,
            total_executed: stats.values().map(|s| s.total_executed).sum(),
            total_successful: stats.values().map(|s| s.successful).sum(),
            total_failed: stats
                .values()
                .map(|s| s.failed + s.timed_out + s.panicked)
                .sum(),
        }
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry").finish_non_exhaustive()
    }
}

/// Summary of the registry state
#[derive(Debug, Clone)]
pub struct RegistrySummary {
    /// Number of registered processors
    pub processor_count: usize,
    /// Registered task types
    pub registered_types: Vec<TaskType>,
    /// Executions across all types
    pub total_executed: u64,
    /// Successful executions across all types
    pub total_successful: u64,
    /// Failed, timed out or panicked executions across all types
    pub total_failed: u64,
}

impl fmt::Display for RegistrySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<&str> = self.registered_types.iter().map(|t| t.as_str()).collect();
        write!(
            f,
            "{} processors [{}], {} executed ({} ok, {} failed)",
            self.processor_count,
            types.join(", "),
            self.total_executed,
            self.total_successful,
            self.total_failed
        )
    }
}
