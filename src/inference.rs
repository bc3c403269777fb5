//! Serving-time feature vectors, rebuilt with the training column layout.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::feature_store::{FeatureStore, Prediction, StoreError};
use crate::features::{FeatureError, FeatureRow, FeatureTable};
use crate::model::{DemandModel, ModelError};
use crate::time_series::{HourlyCount, HOUR_MS};

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model returned {actual} predictions for {expected} feature rows")]
    PredictionCountMismatch { expected: usize, actual: usize },
}

/// Inclusive hour range `[as_of - n_features h, as_of - 1 h]` feeding a
/// prediction for `as_of`.
pub fn inference_window(as_of_ms_utc: i64, n_features: usize) -> Result<(i64, i64), FeatureError> {
    if as_of_ms_utc.rem_euclid(HOUR_MS) != 0 {
        return Err(FeatureError::UnalignedTimestamp(as_of_ms_utc));
    }
    if n_features == 0 {
        return Err(FeatureError::InvalidConfig(
            "n_features must be > 0".to_string(),
        ));
    }
    Ok((
        as_of_ms_utc - n_features as i64 * HOUR_MS,
        as_of_ms_utc - HOUR_MS,
    ))
}

/// One feature row per zone from exactly `n_features` hourly rows per zone.
///
/// Each zone must cover the consecutive hours `as_of - n_features h` through
/// `as_of - 1 h`. Any shortfall, duplicate or gap is fatal: a padded or
/// truncated window would feed the model shifted lags. Output rows are
/// ordered by zone id.
pub fn build_inference_features(
    ts_data: &[HourlyCount],
    n_features: usize,
    as_of_ms_utc: i64,
) -> Result<FeatureTable, FeatureError> {
    let mut by_zone: BTreeMap<u32, Vec<&HourlyCount>> = BTreeMap::new();
    for row in ts_data {
        by_zone.entry(row.pickup_location_id).or_default().push(row);
    }

    let expected = n_features * by_zone.len();
    if ts_data.len() != expected {
        warn!(
            component = "inference",
            event = "inference.features.incomplete",
            expected_rows = expected,
            actual_rows = ts_data.len(),
            zones = by_zone.len()
        );
        return Err(FeatureError::IncompleteTimeSeries {
            expected,
            actual: ts_data.len(),
        });
    }

    let mut rows = Vec::with_capacity(by_zone.len());
    for (location_id, mut zone_rows) in by_zone {
        if zone_rows.len() != n_features {
            return Err(FeatureError::IncompleteZoneWindow {
                pickup_location_id: location_id,
                expected: n_features,
                actual: zone_rows.len(),
            });
        }
        zone_rows.sort_by_key(|row| row.pickup_hour_ms_utc);
        check_zone_hours(location_id, &zone_rows, as_of_ms_utc)?;

        rows.push(FeatureRow {
            pickup_hour_ms_utc: as_of_ms_utc,
            pickup_location_id: location_id,
            values: zone_rows.iter().map(|row| row.rides as f32).collect(),
        });
    }

    info!(
        component = "inference",
        event = "inference.features.built",
        zones = rows.len(),
        n_features,
        as_of_ms_utc
    );

    Ok(FeatureTable {
        input_seq_len: n_features,
        rows,
    })
}

fn check_zone_hours(
    location_id: u32,
    zone_rows: &[&HourlyCount],
    as_of_ms_utc: i64,
) -> Result<(), FeatureError> {
    let first_hour = as_of_ms_utc - zone_rows.len() as i64 * HOUR_MS;
    for (offset, row) in zone_rows.iter().enumerate() {
        let expected_hour = first_hour + offset as i64 * HOUR_MS;
        if row.pickup_hour_ms_utc != expected_hour {
            warn!(
                component = "inference",
                event = "inference.features.zone_gap",
                pickup_location_id = location_id,
                expected_hour_ms_utc = expected_hour,
                found_hour_ms_utc = row.pickup_hour_ms_utc
            );
            return Err(FeatureError::ZoneWindowGap {
                pickup_location_id: location_id,
                expected_hour_ms_utc: expected_hour,
                found_hour_ms_utc: row.pickup_hour_ms_utc,
            });
        }
    }
    Ok(())
}

pub fn load_batch_of_features_from_store(
    store: &FeatureStore,
    as_of_ms_utc: i64,
    n_features: usize,
) -> Result<FeatureTable, InferenceError> {
    let (from, to) = inference_window(as_of_ms_utc, n_features)?;
    info!(
        component = "inference",
        event = "inference.fetch.start",
        from_ms_utc = from,
        to_ms_utc_inclusive = to
    );
    let ts_data = store.fetch_hourly_counts(from, to)?;
    Ok(build_inference_features(&ts_data, n_features, as_of_ms_utc)?)
}

/// Runs `model` and pairs each estimate, rounded half-to-even to whole rides,
/// with its zone.
pub fn get_model_predictions(
    model: &dyn DemandModel,
    features: &FeatureTable,
) -> Result<Vec<Prediction>, InferenceError> {
    let estimates = model.predict(features)?;
    if estimates.len() != features.rows.len() {
        return Err(InferenceError::PredictionCountMismatch {
            expected: features.rows.len(),
            actual: estimates.len(),
        });
    }

    Ok(features
        .rows
        .iter()
        .zip(estimates)
        .map(|(row, estimate)| Prediction {
            pickup_hour_ms_utc: row.pickup_hour_ms_utc,
            pickup_location_id: row.pickup_location_id,
            predicted_demand: estimate.round_ties_even(),
        })
        .collect())
}
