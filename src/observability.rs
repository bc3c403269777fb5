//! Logging setup and job lifecycle events for the pipeline binaries.
//!
//! Every binary runs inside a `job` span, so per-stage events from the
//! library carry the job name in structured output.

use std::env;
use std::fmt::Display;
use std::time::Instant;

use thiserror::Error;
use tracing::{error, info, info_span, Span};
use tracing_subscriber::EnvFilter;

const LEVEL_VAR: &str = "TAXI_LOG_LEVEL";
const FORMAT_VAR: &str = "TAXI_LOG_FORMAT";
const TARGET_VAR: &str = "TAXI_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineJob {
    BuildTrainingSet,
    PredictDemand,
    MonitoringReport,
}

impl PipelineJob {
    pub fn name(self) -> &'static str {
        match self {
            Self::BuildTrainingSet => "build_training_set",
            Self::PredictDemand => "predict_demand",
            Self::MonitoringReport => "monitoring_report",
        }
    }

    /// Per-job level override, e.g. `TAXI_PREDICT_DEMAND_LOG_LEVEL`.
    fn level_var(self) -> String {
        format!("TAXI_{}_LOG_LEVEL", self.name().to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Shared `TAXI_LOG_*` settings, with the job's own level variable taking
/// precedence over `TAXI_LOG_LEVEL`. Unparseable values keep the default.
pub fn logging_config_from_env(job: PipelineJob) -> LoggingConfig {
    let defaults = LoggingConfig::default();

    let level = non_empty_var(&job.level_var())
        .or_else(|| non_empty_var(LEVEL_VAR))
        .unwrap_or(defaults.level);
    let format = non_empty_var(FORMAT_VAR)
        .and_then(|raw| LogFormat::parse(&raw))
        .unwrap_or(defaults.format);
    let include_target = non_empty_var(TARGET_VAR)
        .and_then(|raw| parse_flag(&raw))
        .unwrap_or(defaults.include_target);

    LoggingConfig {
        level,
        format,
        include_target,
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(config.format == LogFormat::Pretty);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

/// What a finished job produced, logged as job-specific fields on
/// `job.finish`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    TrainingSet {
        year: i32,
        months_loaded: usize,
        months_missing: Vec<u32>,
        zones: usize,
        examples: usize,
    },
    Predictions {
        as_of_ms_utc: i64,
        zones: usize,
        model: &'static str,
    },
    Monitoring {
        hours: usize,
        matched_rows: usize,
        mean_absolute_error: Option<f64>,
    },
}

/// One running job: its span and start time.
#[derive(Debug)]
pub struct JobRun {
    job: PipelineJob,
    span: Span,
    started: Instant,
}

impl JobRun {
    pub fn start(job: PipelineJob, config: &LoggingConfig) -> Self {
        let span = info_span!("job", job = job.name());
        span.in_scope(|| {
            info!(
                component = job.name(),
                event = "job.start",
                log_level = %config.level,
                log_format = ?config.format
            );
        });
        Self {
            job,
            span,
            started: Instant::now(),
        }
    }

    pub fn job(&self) -> PipelineJob {
        self.job
    }

    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        self.span.in_scope(f)
    }

    pub fn finish(self, outcome: &JobOutcome) {
        let job = self.job.name();
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let _entered = self.span.enter();

        match outcome {
            JobOutcome::TrainingSet {
                year,
                months_loaded,
                months_missing,
                zones,
                examples,
            } => info!(
                component = job,
                event = "job.finish",
                elapsed_ms,
                year,
                months_loaded,
                months_missing = ?months_missing,
                zones,
                examples
            ),
            JobOutcome::Predictions {
                as_of_ms_utc,
                zones,
                model,
            } => info!(
                component = job,
                event = "job.finish",
                elapsed_ms,
                as_of_ms_utc,
                zones,
                model
            ),
            JobOutcome::Monitoring {
                hours,
                matched_rows,
                mean_absolute_error,
            } => info!(
                component = job,
                event = "job.finish",
                elapsed_ms,
                hours,
                matched_rows,
                mean_absolute_error = ?mean_absolute_error
            ),
        }
    }

    pub fn fail(self, err: &dyn Display) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let _entered = self.span.enter();
        error!(
            component = self.job.name(),
            event = "job.failed",
            elapsed_ms,
            error = %err
        );
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
