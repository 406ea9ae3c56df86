//! Structured logging and metric-style events for the queue driver.

use std::time::Instant;
use tracing::{info, instrument, warn, Span};
use tracing_subscriber::EnvFilter;

use crate::queue::JobStatus;

/// Initialize logging. `RUST_LOG` picks the filter; `GRADEQUEUE_LOG_JSON=1`
/// switches to JSON lines.
pub fn init_observability() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let is_json = std::env::var("GRADEQUEUE_LOG_JSON").ok().as_deref() == Some("1");

    // stdout carries command output, so logs go to stderr
    if is_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .try_init()?;
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init()?;
    }

    tracing::debug!("gradequeue observability initialized");
    Ok(())
}

/// Span and metric events for one job's pass through `step`.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub queueid: i64,
    pub runner: String,
    pub start_time: Instant,
}

impl JobContext {
    pub fn new(queueid: i64, runner: &str) -> Self {
        Self {
            queueid,
            runner: runner.to_string(),
            start_time: Instant::now(),
        }
    }

    pub fn span(&self) -> Span {
        tracing::info_span!("job", queueid = self.queueid, runner = %self.runner)
    }

    #[instrument(skip(self))]
    pub fn record_started(&self, runat: i64) {
        let setup_ms = self.start_time.elapsed().as_millis() as u64;
        info!(queueid = self.queueid, runat, setup_ms, "job started");
        info!(
            metric_name = "gradequeue_job_started_total",
            value = 1,
            runner = %self.runner,
            "metric"
        );
    }

    /// `secs` is the wall time between start and observed completion.
    #[instrument(skip(self))]
    pub fn record_completion(&self, status: JobStatus, secs: i64) {
        info!(queueid = self.queueid, status = %status, secs, "job completed");
        info!(
            metric_name = "gradequeue_job_duration_secs",
            value = secs,
            runner = %self.runner,
            "metric"
        );
    }

    #[instrument(skip(self))]
    pub fn record_failure(&self, message: &str) {
        warn!(queueid = self.queueid, message = %message, "job setup failed");
        info!(
            metric_name = "gradequeue_job_failed_total",
            value = 1,
            runner = %self.runner,
            "metric"
        );
    }
}
