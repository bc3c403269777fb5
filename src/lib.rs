//! Taxi demand feature pipeline.
//!
//! Current implemented scope:
//! - raw trip ingestion and hourly per-zone aggregation
//! - dense slot filling and sliding-window training examples
//! - serving-time feature vectors, baseline predictions and monitoring
//! - a local SQLite feature store

mod config;
mod feature_store;
mod features;
mod inference;
mod model;
mod monitoring;
mod observability;
mod raw_rides;
mod time_series;

pub use config::{
    pipeline_paths_from_env, window_config_from_env, FeatureGroupConfig, FeatureWindowConfig,
    PipelinePaths, DEFAULT_INPUT_SEQ_LEN, DEFAULT_STEP_SIZE,
};
pub use feature_store::{FeatureStore, MonitoringRow, Prediction, StoreError};
pub use features::{
    assert_schema_compatible, build_feature_schema, cutoff_indices, feature_column_names,
    read_schema_manifest, slice_windows, transform_ts_data_into_features_and_target,
    write_schema_manifest, write_training_set_csv, CutoffIndex, FeatureColumn, FeatureDType,
    FeatureError, FeatureRow, FeatureSchema, FeatureTable, TrainingManifest, TrainingSet,
    WindowSlices, FEATURE_SCHEMA_VERSION, TARGET_COLUMN,
};
pub use inference::{
    build_inference_features, get_model_predictions, inference_window,
    load_batch_of_features_from_store, InferenceError,
};
pub use model::{
    average_rides_last_4_weeks, temporal_features, AverageLast4WeeksBaseline, DemandModel,
    ModelError, PreviousHourBaseline, TemporalFeatures,
};
pub use monitoring::{
    hourly_mean_absolute_error, load_predictions_and_actual_values, mean_absolute_error,
    HourlyError,
};
pub use observability::{
    init_logging, logging_config_from_env, JobOutcome, JobRun, LogFormat, LoggingConfig,
    LoggingInitError, PipelineJob,
};
pub use raw_rides::{
    load_raw_rides, plan_monthly_files, validate_raw_data, RawDataConfig, RawDataError, RawEvent,
    RawLoadReport, RawLoadRequest, RawLoadResult, TripFileRef, TripFileSource,
};
pub use time_series::{
    add_missing_slots, aggregate_hourly_counts, floor_to_hour, format_pickup_hour, location_ids,
    parse_pickup_hour, read_time_series_csv, transform_raw_data_into_ts_data,
    write_time_series_csv, HourlyCount, TimeSeriesError, HOUR_MS, TIME_SERIES_COLUMNS,
};
