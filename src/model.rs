//! Prediction seam plus the engineered inputs the training pipeline derives.

use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{FeatureRow, FeatureTable};

const HOURS_PER_WEEK: usize = 7 * 24;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model needs rides_previous_{required}_hour but features only go back {available} hours")]
    WindowTooShort { required: usize, available: usize },
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Anything that maps feature rows to one demand estimate per row.
pub trait DemandModel {
    fn predict(&self, features: &FeatureTable) -> Result<Vec<f32>, ModelError>;
}

/// Predicts the rides of the previous hour.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviousHourBaseline;

impl DemandModel for PreviousHourBaseline {
    fn predict(&self, features: &FeatureTable) -> Result<Vec<f32>, ModelError> {
        features
            .rows
            .iter()
            .map(|row| {
                row.rides_previous_hour(1)
                    .ok_or(ModelError::WindowTooShort {
                        required: 1,
                        available: row.values.len(),
                    })
            })
            .collect()
    }
}

/// Predicts the mean of the same hour 1, 2, 3 and 4 weeks earlier.
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageLast4WeeksBaseline;

impl DemandModel for AverageLast4WeeksBaseline {
    fn predict(&self, features: &FeatureTable) -> Result<Vec<f32>, ModelError> {
        features
            .rows
            .iter()
            .map(average_rides_last_4_weeks)
            .collect()
    }
}

pub fn average_rides_last_4_weeks(row: &FeatureRow) -> Result<f32, ModelError> {
    let mut sum = 0.0f32;
    for weeks in 1..=4 {
        let hours_back = weeks * HOURS_PER_WEEK;
        sum += row
            .rides_previous_hour(hours_back)
            .ok_or(ModelError::WindowTooShort {
                required: hours_back,
                available: row.values.len(),
            })?;
    }
    Ok(0.25 * sum)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalFeatures {
    pub hour: u32,
    /// Monday = 0.
    pub day_of_week: u32,
}

pub fn temporal_features(pickup_hour_ms_utc: i64) -> Result<TemporalFeatures, ModelError> {
    let dt = Utc
        .timestamp_millis_opt(pickup_hour_ms_utc)
        .single()
        .ok_or(ModelError::InvalidTimestamp(pickup_hour_ms_utc))?;
    Ok(TemporalFeatures {
        hour: dt.hour(),
        day_of_week: dt.weekday().num_days_from_monday(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_with(len: usize, fill: impl Fn(usize) -> f32) -> FeatureRow {
        FeatureRow {
            pickup_hour_ms_utc: 0,
            pickup_location_id: 1,
            values: (0..len).map(fill).collect(),
        }
    }

    #[test]
    fn previous_hour_baseline_reads_newest_value() {
        let table = FeatureTable {
            input_seq_len: 3,
            rows: vec![row_with(3, |i| i as f32 * 10.0)],
        };
        assert_eq!(PreviousHourBaseline.predict(&table).unwrap(), vec![20.0]);
    }

    #[test]
    fn four_week_average_uses_weekly_lags() {
        // values[i] holds rides (672 - i) hours back.
        let row = row_with(672, |i| match 672 - i {
            168 => 4.0,
            336 => 8.0,
            504 => 12.0,
            672 => 16.0,
            _ => 1000.0,
        });
        assert_eq!(average_rides_last_4_weeks(&row).unwrap(), 10.0);
    }

    #[test]
    fn four_week_average_needs_full_window() {
        let err = average_rides_last_4_weeks(&row_with(24, |_| 1.0)).unwrap_err();
        assert!(matches!(
            err,
            ModelError::WindowTooShort {
                required: 168,
                available: 24
            }
        ));
    }

    #[test]
    fn temporal_features_use_monday_zero() {
        // 2022-01-03T07:00:00Z was a Monday.
        let tf = temporal_features(1_641_193_200_000).unwrap();
        assert_eq!(
            tf,
            TemporalFeatures {
                hour: 7,
                day_of_week: 0
            }
        );
    }
}
