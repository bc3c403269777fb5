use chrono::Utc;
use taxi_demand::{
    floor_to_hour, format_pickup_hour, hourly_mean_absolute_error, init_logging,
    load_predictions_and_actual_values, logging_config_from_env, mean_absolute_error,
    parse_pickup_hour, pipeline_paths_from_env, FeatureStore, JobOutcome, JobRun, PipelineJob,
    HOUR_MS,
};
use tracing::info;

const JOB: PipelineJob = PipelineJob::MonitoringReport;
const DEFAULT_LOOKBACK_HOURS: i64 = 30 * 24;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env(JOB);
    init_logging(&logging_cfg)?;

    let run = JobRun::start(JOB, &logging_cfg);
    match run.in_scope(monitoring_report) {
        Ok(outcome) => {
            run.finish(&outcome);
            Ok(())
        }
        Err(err) => {
            run.fail(&err);
            Err(err)
        }
    }
}

fn monitoring_report() -> Result<JobOutcome, Box<dyn std::error::Error>> {
    let to = match std::env::var("TAXI_TO") {
        Ok(raw) => parse_pickup_hour(&raw)?,
        Err(_) => floor_to_hour(Utc::now().timestamp_millis()),
    };
    let from = match std::env::var("TAXI_FROM") {
        Ok(raw) => parse_pickup_hour(&raw)?,
        Err(_) => to - DEFAULT_LOOKBACK_HOURS * HOUR_MS,
    };

    let paths = pipeline_paths_from_env();
    let store = FeatureStore::open_default(&paths.store_path)?;
    let rows = load_predictions_and_actual_values(&store, from, to)?;

    let hourly_errors = hourly_mean_absolute_error(&rows);
    for hourly in &hourly_errors {
        let pickup_hour = format_pickup_hour(hourly.pickup_hour_ms_utc)?;
        info!(
            component = JOB.name(),
            event = "monitoring.hour",
            pickup_hour = %pickup_hour,
            mean_absolute_error = hourly.mean_absolute_error,
            zones = hourly.zones
        );
    }

    let (from_text, to_text) = (format_pickup_hour(from)?, format_pickup_hour(to)?);
    info!(
        component = JOB.name(),
        event = "monitoring.range",
        from = %from_text,
        to = %to_text
    );

    Ok(JobOutcome::Monitoring {
        hours: hourly_errors.len(),
        matched_rows: rows.len(),
        mean_absolute_error: mean_absolute_error(&rows),
    })
}
