//! Configuration types for fableq.
//!
//! This module contains all configuration structures used throughout fableq:
//! scheduler settings, per-task-type limits, the per-category retry policy
//! table, retention windows, notification buffers and logging.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{FableError, FableResult};
use crate::retry::ErrorCategory;
use crate::task::TaskType;

/// Main configuration for fableq.
///
/// # Examples
///
/// ```rust
/// use fableq::config::{FableConfig, ManagerConfig};
///
/// let config = FableConfig {
///     manager: ManagerConfig {
///         max_concurrent_tasks: 8,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FableConfig {
    /// Scheduler loop configuration
    pub manager: ManagerConfig,

    /// Per-task-type limits and estimates
    pub tasks: TaskTypeTable,

    /// Retry policy table
    pub retry: RetryConfig,

    /// Retention windows
    pub retention: RetentionConfig,

    /// Notification buffers
    pub notifications: NotificationConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Upper bound on concurrently executing tasks
    pub max_concurrent_tasks: usize,

    /// Fixed polling cadence (in seconds)
    pub poll_interval_secs: u64,

    /// Time to wait for in-flight tasks on shutdown (in seconds)
    pub shutdown_timeout_secs: u64,

    /// Requeue every RUNNING task on start (single-instance deployments only)
    pub recover_on_start: bool,

    /// RUNNING tasks older than this are considered orphaned; also the
    /// recovery sweep interval (in seconds). Must exceed every task timeout.
    pub stale_after_secs: u64,

    /// Interval between retention sweeps (in seconds)
    pub cleanup_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            poll_interval_secs: 5,
            shutdown_timeout_secs: 30,
            recover_on_start: true,
            stale_after_secs: 1800, // 30 minutes
            cleanup_interval_secs: 3600,
        }
    }
}

impl ManagerConfig {
    /// Set the concurrency cap.
    pub fn with_max_concurrent(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Limits and estimates for one task type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskTypeConfig {
    /// Processing timeout (in seconds)
    pub timeout_secs: u64,

    /// Expected processing time, used for ETA display (in seconds)
    pub estimated_processing_secs: u64,

    /// Default retry budget
    pub max_retries: u32,
}

impl Default for TaskTypeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            estimated_processing_secs: 60,
            max_retries: 3,
        }
    }
}

/// Per-task-type configuration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskTypeTable(pub HashMap<TaskType, TaskTypeConfig>);

impl Default for TaskTypeTable {
    fn default() -> Self {
        let mut table = HashMap::new();
        table.insert(
            TaskType::StoryGeneration,
            TaskTypeConfig {
                timeout_secs: 300,
                estimated_processing_secs: 60,
                max_retries: 3,
            },
        );
        table.insert(
            TaskType::Analysis,
            TaskTypeConfig {
                timeout_secs: 600,
                estimated_processing_secs: 120,
                max_retries: 3,
            },
        );
        table.insert(
            TaskType::Export,
            TaskTypeConfig {
                timeout_secs: 120,
                estimated_processing_secs: 30,
                max_retries: 2,
            },
        );
        Self(table)
    }
}

impl TaskTypeTable {
    /// Configuration for `task_type`, falling back to defaults
    pub fn get(&self, task_type: TaskType) -> TaskTypeConfig {
        self.0.get(&task_type).cloned().unwrap_or_default()
    }

    /// Processing timeout for `task_type`
    pub fn timeout(&self, task_type: TaskType) -> Duration {
        Duration::from_secs(self.get(task_type).timeout_secs)
    }

    /// Longest configured timeout
    pub fn max_timeout(&self) -> Duration {
        let secs = self
            .0
            .values()
            .map(|c| c.timeout_secs)
            .max()
            .unwrap_or(TaskTypeConfig::default().timeout_secs);
        Duration::from_secs(secs)
    }

    /// Override the configuration of one type.
    pub fn set(&mut self, task_type: TaskType, config: TaskTypeConfig) {
        self.0.insert(task_type, config);
    }
}

/// Retry policy for one error category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts for in-process retries
    pub max_attempts: u32,

    /// Base delay between retries (in milliseconds)
    pub base_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Growth factor per attempt
    pub backoff_multiplier: f64,

    /// Whether to randomize the delay into [50%, 100%] of its value
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,  // 1 second
            max_delay_ms: 30_000, // 30 seconds
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy with jitter, expressed in seconds.
    pub fn exponential(max_attempts: u32, base_secs: f64, max_secs: f64, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: (base_secs * 1000.0) as u64,
            max_delay_ms: (max_secs * 1000.0) as u64,
            backoff_multiplier: multiplier,
            jitter: true,
        }
    }

    /// Fixed delay without jitter.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Disable in-process retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Per-category retry policy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Policies by category
    pub policies: HashMap<ErrorCategory, RetryPolicy>,

    /// Used for categories without an entry
    pub default_policy: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            ErrorCategory::Database,
            RetryPolicy::exponential(3, 1.0, 10.0, 2.0),
        );
        policies.insert(
            ErrorCategory::ExternalService,
            RetryPolicy::exponential(2, 2.0, 8.0, 2.0),
        );
        policies.insert(
            ErrorCategory::AiService,
            RetryPolicy::exponential(2, 3.0, 6.0, 1.5),
        );
        policies.insert(ErrorCategory::TaskSpecific, RetryPolicy::fixed(1, 5000));
        policies.insert(
            ErrorCategory::Network,
            RetryPolicy::exponential(3, 1.0, 10.0, 2.0),
        );
        policies.insert(
            ErrorCategory::System,
            RetryPolicy::exponential(2, 2.0, 10.0, 2.0),
        );

        Self {
            policies,
            default_policy: RetryPolicy::default(),
        }
    }
}

impl RetryConfig {
    /// Policy for `category`, falling back to the default policy
    pub fn policy_for(&self, category: ErrorCategory) -> &RetryPolicy {
        self.policies.get(&category).unwrap_or(&self.default_policy)
    }

    /// Override the policy of one category.
    pub fn with_policy(mut self, category: ErrorCategory, policy: RetryPolicy) -> Self {
        self.policies.insert(category, policy);
        self
    }
}

/// Retention windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Terminal tasks older than this are deleted by the cleanup sweep
    pub retention_days: u32,

    /// Trailing window for completed/failed metrics (in hours)
    pub metrics_window_hours: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            metrics_window_hours: 24,
        }
    }
}

/// Notification buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Capacity of the broadcast channel
    pub channel_capacity: usize,

    /// Events kept per task by the polling buffer
    pub max_events_per_task: usize,

    /// Events older than this are pruned from the polling buffer (in hours)
    pub event_retention_hours: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            max_events_per_task: 50,
            event_retention_hours: 24,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FableConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            manager: ManagerConfig {
                max_concurrent_tasks: 2,
                poll_interval_secs: 2,
                ..Default::default()
            },
            retention: RetentionConfig {
                retention_days: 1,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            manager: ManagerConfig {
                max_concurrent_tasks: (num_cpus::get() * 2).max(2),
                poll_interval_secs: 5,
                shutdown_timeout_secs: 120,
                recover_on_start: false,
                ..Default::default()
            },
            retention: RetentionConfig {
                retention_days: 90,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        let mut tasks = TaskTypeTable::default();
        for task_type in TaskType::ALL {
            tasks.set(
                task_type,
                TaskTypeConfig {
                    timeout_secs: 5,
                    estimated_processing_secs: 1,
                    max_retries: 2,
                },
            );
        }

        Self {
            manager: ManagerConfig {
                max_concurrent_tasks: 1,
                poll_interval_secs: 1,
                shutdown_timeout_secs: 5,
                cleanup_interval_secs: 60,
                ..Default::default()
            },
            tasks,
            notifications: NotificationConfig {
                channel_capacity: 64,
                max_events_per_task: 20,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Parse a JSON configuration document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> FableResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config
            .validate()
            .map_err(|errors| FableError::config(errors.join("; ")))?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> FableResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            FableError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.manager.max_concurrent_tasks == 0 {
            errors.push("max_concurrent_tasks must be greater than 0".to_string());
        }

        if self.manager.max_concurrent_tasks > 1000 {
            errors.push("max_concurrent_tasks should not exceed 1000".to_string());
        }

        if self.manager.poll_interval_secs == 0 {
            errors.push("Poll interval must be greater than 0".to_string());
        }

        if self.manager.cleanup_interval_secs == 0 {
            errors.push("Cleanup interval must be greater than 0".to_string());
        }

        for (task_type, config) in &self.tasks.0 {
            if config.timeout_secs == 0 {
                errors.push(format!("Timeout for {} must be greater than 0", task_type));
            }
        }

        // A live execution must never look orphaned to the stale sweep
        let max_timeout = self.tasks.max_timeout().as_secs();
        if self.manager.stale_after_secs <= max_timeout {
            errors.push(format!(
                "stale_after_secs ({}) must exceed the longest task timeout ({}s)",
                self.manager.stale_after_secs, max_timeout
            ));
        }

        let policies = self
            .retry
            .policies
            .iter()
            .map(|(c, p)| (c.to_string(), p))
            .chain(std::iter::once((
                "default".to_string(),
                &self.retry.default_policy,
            )));
        for (name, policy) in policies {
            if policy.max_delay_ms < policy.base_delay_ms {
                errors.push(format!(
                    "Retry max delay must be greater than or equal to base delay ({})",
                    name
                ));
            }
            if policy.backoff_multiplier < 1.0 {
                errors.push(format!("Backoff multiplier must be at least 1.0 ({})", name));
            }
        }

        if self.notifications.channel_capacity == 0 {
            errors.push("Notification channel capacity must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FableConfig::default();
        assert_eq!(config.manager.max_concurrent_tasks, 3);
        assert_eq!(config.manager.poll_interval_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(FableConfig::development().validate().is_ok());
        assert!(FableConfig::production().validate().is_ok());

        let testing = FableConfig::testing();
        assert!(testing.validate().is_ok());
        assert_eq!(testing.manager.max_concurrent_tasks, 1);
        assert_eq!(testing.tasks.get(TaskType::Export).timeout_secs, 5);
    }

    #[test]
    fn test_retry_table_matches_reference() {
        let retry = RetryConfig::default();

        let db = retry.policy_for(ErrorCategory::Database);
        assert_eq!(db.max_attempts, 3);
        assert_eq!(db.base_delay_ms, 1000);
        assert_eq!(db.max_delay_ms, 10_000);
        assert!(db.jitter);

        let ai = retry.policy_for(ErrorCategory::AiService);
        assert_eq!(ai.base_delay_ms, 3000);
        assert_eq!(ai.max_delay_ms, 6000);
        assert_eq!(ai.backoff_multiplier, 1.5);

        let story = retry.policy_for(ErrorCategory::TaskSpecific);
        assert_eq!(story.max_attempts, 1);
        assert!(!story.jitter);

        // Categories without an entry use the default policy
        assert_eq!(
            retry.policy_for(ErrorCategory::Validation),
            &retry.default_policy
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = FableConfig::default();
        config.manager.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        config.manager.max_concurrent_tasks = 1;
        config.retry.default_policy.max_delay_ms = 10;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max delay")));
    }

    #[test]
    fn test_stale_window_must_exceed_timeouts() {
        let mut config = FableConfig::default();
        config.manager.stale_after_secs = 600;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("stale_after_secs (600)")));

        config.manager.stale_after_secs = 601;
        assert!(config.validate().is_ok());

        config.tasks.set(
            TaskType::Export,
            TaskTypeConfig {
                timeout_secs: 900,
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());

        let result = FableConfig::from_json_str(
            r#"{ "manager": { "stale_after_secs": 60 }, "tasks": { "EXPORT": { "timeout_secs": 120 } } }"#,
        );
        assert!(matches!(result, Err(FableError::ConfigError { .. })));
    }

    #[test]
    fn test_from_json_partial() {
        let config = FableConfig::from_json_str(
            r#"{
                "manager": { "max_concurrent_tasks": 7 },
                "tasks": { "STORY_GENERATION": { "timeout_secs": 90 } },
                "retry": { "policies": { "DATABASE": {
                    "max_attempts": 5, "base_delay_ms": 500, "max_delay_ms": 4000,
                    "backoff_multiplier": 2.0, "jitter": false } } },
                "logging": { "level": "warn" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.manager.max_concurrent_tasks, 7);
        assert_eq!(config.manager.poll_interval_secs, 5);
        assert_eq!(config.tasks.timeout(TaskType::StoryGeneration).as_secs(), 90);
        assert_eq!(
            config.retry.policy_for(ErrorCategory::Database).max_attempts,
            5
        );
        assert!(matches!(config.logging.level, LogLevel::Warn));
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let result = FableConfig::from_json_str(r#"{ "manager": { "poll_interval_secs": 0 } }"#);
        assert!(matches!(result, Err(FableError::ConfigError { .. })));
    }

    #[test]
    fn test_manager_builders() {
        let config = ManagerConfig::default()
            .with_max_concurrent(8)
            .with_poll_interval(1);
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
