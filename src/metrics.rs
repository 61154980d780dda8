//! Prometheus metrics for the task queue.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

use crate::error::FableResult;
use crate::task::TaskType;

/// Queue metrics collector
#[derive(Clone)]
pub struct QueueMetricsCollector {
    registry: Arc<Registry>,
    enqueued: IntCounterVec,
    completed: IntCounterVec,
    failed: IntCounterVec,
    retried: IntCounterVec,
    in_flight: IntGauge,
    processing_seconds: HistogramVec,
}

impl QueueMetricsCollector {
    /// Create a collector with its own registry
    pub fn new() -> FableResult<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create a collector registering into `registry`
    pub fn with_registry(registry: Arc<Registry>) -> FableResult<Self> {
        let counter = |name: &str, help: &str| {
            IntCounterVec::new(Opts::new(name, help).namespace("fableq"), &["task_type"])
        };

        let enqueued = counter("tasks_enqueued_total", "Tasks accepted into the queue")?;
        let completed = counter("tasks_completed_total", "Tasks finished successfully")?;
        let failed = counter("tasks_failed_total", "Tasks finished with an error")?;
        let retried = counter("tasks_retried_total", "Automatic retries scheduled")?;
        let in_flight = IntGauge::with_opts(
            Opts::new("tasks_in_flight", "Tasks currently dispatched").namespace("fableq"),
        )?;
        let processing_seconds = HistogramVec::new(
            HistogramOpts::new("task_processing_seconds", "Task processing time")
                .namespace("fableq")
                .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["task_type"],
        )?;

        registry.register(Box::new(enqueued.clone()))?;
        registry.register(Box::new(completed.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(retried.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(processing_seconds.clone()))?;

        Ok(Self {
            registry,
            enqueued,
            completed,
            failed,
            retried,
            in_flight,
            processing_seconds,
        })
    }

    /// Record an accepted task
    pub fn record_enqueued(&self, task_type: TaskType) {
        self.enqueued.with_label_values(&[task_type.as_str()]).inc();
    }

    /// Record a successful finish
    pub fn record_completed(&self, task_type: TaskType, processing_secs: f64) {
        self.completed.with_label_values(&[task_type.as_str()]).inc();
        self.processing_seconds
            .with_label_values(&[task_type.as_str()])
            .observe(processing_secs);
    }

    /// Record a terminal failure
    pub fn record_failed(&self, task_type: TaskType, processing_secs: f64) {
        self.failed.with_label_values(&[task_type.as_str()]).inc();
        self.processing_seconds
            .with_label_values(&[task_type.as_str()])
            .observe(processing_secs);
    }

    /// Record a scheduled retry
    pub fn record_retried(&self, task_type: TaskType) {
        self.retried.with_label_values(&[task_type.as_str()]).inc();
    }

    /// Set the in-flight gauge
    pub fn set_in_flight(&self, count: usize) {
        self.in_flight.set(count as i64);
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> FableResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
