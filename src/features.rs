//! Hourly series to supervised (features, target) examples.
//!
//! Each zone's dense series is cut into overlapping windows of
//! `input_seq_len` past hours, each paired with the ride count of the hour
//! that follows the window. The same column layout is rebuilt at serving time
//! by [`crate::inference`].

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::FeatureWindowConfig;
use crate::time_series::{format_pickup_hour, HourlyCount, TimeSeriesError};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const TARGET_COLUMN: &str = "target_rides_next_hour";

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("invalid cutoff ({start}, {split}, {end}) for series of length {series_len}")]
    InvalidCutoff {
        start: usize,
        split: usize,
        end: usize,
        series_len: usize,
    },
    #[error("time-series data is not complete: expected {expected} rows, got {actual}")]
    IncompleteTimeSeries { expected: usize, actual: usize },
    #[error("zone {pickup_location_id} has {actual} hourly rows, expected {expected}")]
    IncompleteZoneWindow {
        pickup_location_id: u32,
        expected: usize,
        actual: usize,
    },
    #[error(
        "zone {pickup_location_id} window has hour {found_hour_ms_utc} where \
         {expected_hour_ms_utc} was expected"
    )]
    ZoneWindowGap {
        pickup_location_id: u32,
        expected_hour_ms_utc: i64,
        found_hour_ms_utc: i64,
    },
    #[error("timestamp {0} is not aligned to a whole hour")]
    UnalignedTimestamp(i64),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error(transparent)]
    TimeSeries(#[from] TimeSeriesError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Row offsets of one example: `start..split` is the input window,
/// `split..end` the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutoffIndex {
    pub start: usize,
    pub split: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub pickup_hour_ms_utc: i64,
    pub pickup_location_id: u32,
    /// Oldest hour first: `values[0]` is `rides_previous_K_hour` and the last
    /// element is `rides_previous_1_hour`.
    pub values: Vec<f32>,
}

impl FeatureRow {
    /// Rides `hours_back` hours before `pickup_hour` (1 = the hour just before).
    pub fn rides_previous_hour(&self, hours_back: usize) -> Option<f32> {
        if hours_back == 0 || hours_back > self.values.len() {
            return None;
        }
        self.values.get(self.values.len() - hours_back).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub input_seq_len: usize,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn column_names(&self) -> Vec<String> {
        feature_column_names(self.input_seq_len)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Positionally aligned features and targets: `targets[i]` belongs to
/// `features.rows[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    pub features: FeatureTable,
    pub targets: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSlices {
    pub features: Vec<Vec<f32>>,
    pub targets: Vec<f32>,
    pub pickup_hours_ms_utc: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

/// `rides_previous_K_hour` down to `rides_previous_1_hour`.
pub fn feature_column_names(input_seq_len: usize) -> Vec<String> {
    (1..=input_seq_len)
        .rev()
        .map(|hours_back| format!("rides_previous_{hours_back}_hour"))
        .collect()
}

/// Window boundaries for a series of `series_len` rows.
///
/// The loop stops once `end` passes `series_len - 1`, so the final row of a
/// series is never used as a target.
pub fn cutoff_indices(
    series_len: usize,
    input_seq_len: usize,
    step_size: usize,
) -> Vec<CutoffIndex> {
    if step_size == 0 {
        return Vec::new();
    }

    let stop_position = series_len.saturating_sub(1);
    let mut start = 0;
    let mut split = input_seq_len;
    let mut end = input_seq_len + 1;
    let mut indices = Vec::new();

    while end <= stop_position {
        indices.push(CutoffIndex { start, split, end });
        start += step_size;
        split += step_size;
        end += step_size;
    }

    indices
}

/// Materializes each cutoff as a float feature vector, its target and the
/// hour the target belongs to. `series` must be one zone in ascending-hour
/// order.
pub fn slice_windows(
    series: &[HourlyCount],
    indices: &[CutoffIndex],
) -> Result<WindowSlices, FeatureError> {
    let mut out = WindowSlices {
        features: Vec::with_capacity(indices.len()),
        targets: Vec::with_capacity(indices.len()),
        pickup_hours_ms_utc: Vec::with_capacity(indices.len()),
    };

    for idx in indices {
        let valid = idx.start < idx.split && idx.end == idx.split + 1 && idx.end <= series.len();
        if !valid {
            return Err(FeatureError::InvalidCutoff {
                start: idx.start,
                split: idx.split,
                end: idx.end,
                series_len: series.len(),
            });
        }

        out.features.push(
            series[idx.start..idx.split]
                .iter()
                .map(|row| row.rides as f32)
                .collect(),
        );
        out.targets.push(series[idx.split].rides as f32);
        out.pickup_hours_ms_utc
            .push(series[idx.split].pickup_hour_ms_utc);
    }

    Ok(out)
}

/// Turns a dense hourly table into a training set.
///
/// Zones are processed in order of first appearance; each zone's rows are
/// ordered by hour before windowing.
pub fn transform_ts_data_into_features_and_target(
    ts_data: &[HourlyCount],
    cfg: &FeatureWindowConfig,
) -> Result<TrainingSet, FeatureError> {
    cfg.validate()?;

    info!(
        component = "features",
        event = "features.transform.start",
        input_rows = ts_data.len(),
        input_seq_len = cfg.input_seq_len,
        step_size = cfg.step_size
    );

    let mut zone_order = Vec::new();
    let mut by_zone: HashMap<u32, Vec<HourlyCount>> = HashMap::new();
    for row in ts_data {
        by_zone
            .entry(row.pickup_location_id)
            .or_insert_with(|| {
                zone_order.push(row.pickup_location_id);
                Vec::new()
            })
            .push(*row);
    }

    let mut per_zone = Vec::with_capacity(zone_order.len());
    for location_id in &zone_order {
        let mut series = by_zone.remove(location_id).unwrap_or_default();
        series.sort_by_key(|row| row.pickup_hour_ms_utc);

        let indices = cutoff_indices(series.len(), cfg.input_seq_len, cfg.step_size);
        let slices = slice_windows(&series, &indices)?;
        debug!(
            component = "features",
            event = "features.transform.zone",
            pickup_location_id = *location_id,
            series_len = series.len(),
            examples = indices.len()
        );
        per_zone.push((*location_id, slices));
    }

    let total: usize = per_zone.iter().map(|(_, s)| s.targets.len()).sum();
    let mut rows = Vec::with_capacity(total);
    let mut targets = Vec::with_capacity(total);
    for (location_id, slices) in per_zone {
        let WindowSlices {
            features,
            targets: zone_targets,
            pickup_hours_ms_utc,
        } = slices;
        rows.extend(
            features
                .into_iter()
                .zip(pickup_hours_ms_utc)
                .map(|(values, pickup_hour_ms_utc)| FeatureRow {
                    pickup_hour_ms_utc,
                    pickup_location_id: location_id,
                    values,
                }),
        );
        targets.extend(zone_targets);
    }

    info!(
        component = "features",
        event = "features.transform.finish",
        zones = zone_order.len(),
        examples = rows.len()
    );

    Ok(TrainingSet {
        features: FeatureTable {
            input_seq_len: cfg.input_seq_len,
            rows,
        },
        targets,
    })
}

pub fn build_feature_schema(input_seq_len: usize) -> FeatureSchema {
    let columns: Vec<FeatureColumn> = feature_column_names(input_seq_len)
        .into_iter()
        .map(|name| FeatureColumn {
            name,
            dtype: FeatureDType::F32,
        })
        .collect();
    let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, &columns);

    debug!(
        component = "features",
        event = "features.schema.built",
        version = FEATURE_SCHEMA_VERSION,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected: &FeatureSchema,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected.version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected.version,
            actual: actual.version,
        });
    }

    if expected.fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected.fingerprint.clone(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Writes features, `pickup_hour`, `pickup_location_id` and the target as one CSV.
pub fn write_training_set_csv<W: Write>(
    writer: W,
    training_set: &TrainingSet,
) -> Result<(), FeatureError> {
    let mut writer = csv::Writer::from_writer(writer);

    let mut header = training_set.features.column_names();
    header.push("pickup_hour".to_string());
    header.push("pickup_location_id".to_string());
    header.push(TARGET_COLUMN.to_string());
    writer.write_record(&header)?;

    for (row, target) in training_set
        .features
        .rows
        .iter()
        .zip(training_set.targets.iter())
    {
        let mut record: Vec<String> = row.values.iter().map(|v| v.to_string()).collect();
        record.push(format_pickup_hour(row.pickup_hour_ms_utc)?);
        record.push(row.pickup_location_id.to_string());
        record.push(target.to_string());
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingManifest {
    pub schema: FeatureSchema,
    pub window: FeatureWindowConfig,
    pub examples: usize,
}

pub fn write_schema_manifest(path: &Path, manifest: &TrainingManifest) -> Result<(), FeatureError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(manifest)?;
    fs::write(path, body)?;
    Ok(())
}

pub fn read_schema_manifest(path: &Path) -> Result<TrainingManifest, FeatureError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn schema_fingerprint(version: u32, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f32;");
    }
    hex::encode(hasher.finalize())
}
