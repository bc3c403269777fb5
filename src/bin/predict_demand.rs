use std::fs;

use chrono::Utc;
use taxi_demand::{
    assert_schema_compatible, build_feature_schema, floor_to_hour, format_pickup_hour,
    get_model_predictions, init_logging, load_batch_of_features_from_store,
    logging_config_from_env, parse_pickup_hour, pipeline_paths_from_env, read_schema_manifest,
    window_config_from_env, AverageLast4WeeksBaseline, DemandModel, FeatureStore, JobOutcome,
    JobRun, PipelineJob, PreviousHourBaseline, DEFAULT_INPUT_SEQ_LEN,
};
use tracing::{info, warn};

const JOB: PipelineJob = PipelineJob::PredictDemand;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env(JOB);
    init_logging(&logging_cfg)?;

    let run = JobRun::start(JOB, &logging_cfg);
    match run.in_scope(predict_demand) {
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

fn predict_demand() -> Result<JobOutcome, Box<dyn std::error::Error>> {
    let paths = pipeline_paths_from_env();
    let n_features = window_config_from_env().input_seq_len;
    let as_of = match std::env::var("TAXI_AS_OF") {
        Ok(raw) => parse_pickup_hour(&raw)?,
        Err(_) => floor_to_hour(Utc::now().timestamp_millis()),
    };

    let manifest_path = paths.output_dir.join("feature_schema.json");
    if fs::metadata(&manifest_path).is_ok() {
        let manifest = read_schema_manifest(&manifest_path)?;
        assert_schema_compatible(&manifest.schema, &build_feature_schema(n_features))?;
    } else {
        warn!(
            component = JOB.name(),
            event = "schema.manifest.missing",
            path = %manifest_path.display()
        );
    }

    let mut store = FeatureStore::open_default(&paths.store_path)?;
    let features = load_batch_of_features_from_store(&store, as_of, n_features)?;

    let (model, model_name): (Box<dyn DemandModel>, &'static str) =
        if n_features >= DEFAULT_INPUT_SEQ_LEN {
            (Box::new(AverageLast4WeeksBaseline), "average_last_4_weeks")
        } else {
            (Box::new(PreviousHourBaseline), "previous_hour")
        };
    let predictions = get_model_predictions(model.as_ref(), &features)?;
    store.upsert_predictions(&predictions)?;

    let pickup_hour = format_pickup_hour(as_of)?;
    info!(
        component = JOB.name(),
        event = "predictions.stored",
        pickup_hour = %pickup_hour,
        zones = predictions.len()
    );

    Ok(JobOutcome::Predictions {
        as_of_ms_utc: as_of,
        zones: predictions.len(),
        model: model_name,
    })
}
