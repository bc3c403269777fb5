//! Prediction accuracy over time.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::feature_store::{FeatureStore, MonitoringRow, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourlyError {
    pub pickup_hour_ms_utc: i64,
    pub mean_absolute_error: f64,
    pub zones: usize,
}

pub fn load_predictions_and_actual_values(
    store: &FeatureStore,
    from_ms_utc: i64,
    to_ms_utc_inclusive: i64,
) -> Result<Vec<MonitoringRow>, StoreError> {
    store.fetch_predictions_and_actuals(from_ms_utc, to_ms_utc_inclusive)
}

pub fn mean_absolute_error(rows: &[MonitoringRow]) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    let total: f64 = rows.iter().map(absolute_error).sum();
    Some(total / rows.len() as f64)
}

/// MAE per `pickup_hour`, ascending by hour.
pub fn hourly_mean_absolute_error(rows: &[MonitoringRow]) -> Vec<HourlyError> {
    let mut sorted: Vec<&MonitoringRow> = rows.iter().collect();
    sorted.sort_by_key(|row| row.pickup_hour_ms_utc);

    let mut out: Vec<HourlyError> = Vec::new();
    let mut sum = 0.0;
    for row in sorted {
        let same_hour = out
            .last()
            .map(|current| current.pickup_hour_ms_utc == row.pickup_hour_ms_utc)
            .unwrap_or(false);
        if same_hour {
            if let Some(current) = out.last_mut() {
                current.zones += 1;
            }
        } else {
            finalize(out.last_mut(), sum);
            sum = 0.0;
            out.push(HourlyError {
                pickup_hour_ms_utc: row.pickup_hour_ms_utc,
                mean_absolute_error: 0.0,
                zones: 1,
            });
        }
        sum += absolute_error(row);
    }
    finalize(out.last_mut(), sum);

    info!(
        component = "monitoring",
        event = "monitoring.hourly_mae.computed",
        rows = rows.len(),
        hours = out.len()
    );

    out
}

fn finalize(current: Option<&mut HourlyError>, sum: f64) {
    if let Some(current) = current {
        current.mean_absolute_error = sum / current.zones as f64;
    }
}

fn absolute_error(row: &MonitoringRow) -> f64 {
    (f64::from(row.predicted_demand) - f64::from(row.rides)).abs()
}
