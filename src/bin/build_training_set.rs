use std::fs::{self, File};
use std::io::BufWriter;

use taxi_demand::{
    build_feature_schema, init_logging, load_raw_rides, location_ids, logging_config_from_env,
    pipeline_paths_from_env, transform_raw_data_into_ts_data,
    transform_ts_data_into_features_and_target, window_config_from_env, write_schema_manifest,
    write_time_series_csv, write_training_set_csv, FeatureStore, JobOutcome, JobRun,
    PipelineJob, RawDataConfig, RawLoadRequest, TrainingManifest,
};
use tracing::info;

const JOB: PipelineJob = PipelineJob::BuildTrainingSet;
const DEFAULT_YEAR: i32 = 2022;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env(JOB);
    init_logging(&logging_cfg)?;

    let run = JobRun::start(JOB, &logging_cfg);
    match run.in_scope(build_training_set) {
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

fn build_training_set() -> Result<JobOutcome, Box<dyn std::error::Error>> {
    let paths = pipeline_paths_from_env();
    let window = window_config_from_env();
    window.validate()?;
    let req = RawLoadRequest {
        year: parse_year()?,
        months: parse_months()?,
    };

    let raw_cfg = RawDataConfig {
        data_root: paths.data_root.clone(),
        ..RawDataConfig::default()
    };
    let raw = load_raw_rides(&req, &raw_cfg)?;
    if raw.events.is_empty() {
        return Err(format!("no rides loaded for {} (months {:?})", req.year, req.months).into());
    }

    let ts_data = transform_raw_data_into_ts_data(&raw.events)?;

    if let Some(parent) = paths.store_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut store = FeatureStore::open_default(&paths.store_path)?;
    store.upsert_hourly_counts(&ts_data)?;

    fs::create_dir_all(&paths.output_dir)?;
    let ts_path = paths.output_dir.join(format!("ts_data_{}.csv", req.year));
    write_time_series_csv(BufWriter::new(File::create(&ts_path)?), &ts_data)?;

    let training = transform_ts_data_into_features_and_target(&ts_data, &window)?;
    let tabular_path = paths
        .output_dir
        .join(format!("tabular_data_{}.csv", req.year));
    write_training_set_csv(BufWriter::new(File::create(&tabular_path)?), &training)?;

    let manifest = TrainingManifest {
        schema: build_feature_schema(window.input_seq_len),
        window,
        examples: training.targets.len(),
    };
    write_schema_manifest(&paths.output_dir.join("feature_schema.json"), &manifest)?;

    info!(
        component = JOB.name(),
        event = "training_set.written",
        ts_path = %ts_path.display(),
        tabular_path = %tabular_path.display(),
        examples = manifest.examples
    );

    Ok(JobOutcome::TrainingSet {
        year: req.year,
        months_loaded: raw.report.months_loaded.len(),
        months_missing: raw.report.months_missing,
        zones: location_ids(&ts_data).len(),
        examples: manifest.examples,
    })
}

fn parse_year() -> Result<i32, Box<dyn std::error::Error>> {
    match std::env::var("TAXI_YEAR") {
        Ok(raw) => Ok(raw
            .trim()
            .parse::<i32>()
            .map_err(|_| format!("TAXI_YEAR must be a year, got '{raw}'"))?),
        Err(_) => Ok(DEFAULT_YEAR),
    }
}

/// `TAXI_MONTHS=1,2,3`; unset or blank means the whole year.
fn parse_months() -> Result<Option<Vec<u32>>, Box<dyn std::error::Error>> {
    let Ok(raw) = std::env::var("TAXI_MONTHS") else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let mut months = Vec::new();
    for part in raw.split(',') {
        let month = part
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("TAXI_MONTHS entry '{part}' is not a month number"))?;
        months.push(month);
    }
    Ok(Some(months))
}
