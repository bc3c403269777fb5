//! Local SQLite feature store for hourly counts and model predictions.

use std::path::Path;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::FeatureGroupConfig;
use crate::time_series::HourlyCount;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub pickup_hour_ms_utc: i64,
    pub pickup_location_id: u32,
    pub predicted_demand: f32,
}

/// A prediction joined with the rides actually observed in the same slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringRow {
    pub pickup_hour_ms_utc: i64,
    pub pickup_location_id: u32,
    pub predicted_demand: f32,
    pub rides: u32,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid feature group name: {0}")]
    InvalidGroupName(String),
    #[error("invalid range: from {from_ms_utc} is after to {to_ms_utc}")]
    InvalidRange { from_ms_utc: i64, to_ms_utc: i64 },
}

pub struct FeatureStore {
    conn: Connection,
    time_series_table: String,
    predictions_table: String,
}

impl FeatureStore {
    pub fn open(
        path: &Path,
        time_series: &FeatureGroupConfig,
        predictions: &FeatureGroupConfig,
    ) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?, time_series, predictions)
    }

    pub fn open_default(path: &Path) -> Result<Self, StoreError> {
        Self::open(
            path,
            &FeatureGroupConfig::hourly_time_series(),
            &FeatureGroupConfig::model_predictions(),
        )
    }

    fn from_connection(
        conn: Connection,
        time_series: &FeatureGroupConfig,
        predictions: &FeatureGroupConfig,
    ) -> Result<Self, StoreError> {
        let time_series_table = time_series
            .table_name()
            .ok_or_else(|| StoreError::InvalidGroupName(time_series.name.clone()))?;
        let predictions_table = predictions
            .table_name()
            .ok_or_else(|| StoreError::InvalidGroupName(predictions.name.clone()))?;

        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {time_series_table} (
                pickup_hour_ms INTEGER NOT NULL,
                pickup_location_id INTEGER NOT NULL,
                rides INTEGER NOT NULL,
                PRIMARY KEY (pickup_hour_ms, pickup_location_id)
            );
            CREATE TABLE IF NOT EXISTS {predictions_table} (
                pickup_hour_ms INTEGER NOT NULL,
                pickup_location_id INTEGER NOT NULL,
                predicted_demand REAL NOT NULL,
                PRIMARY KEY (pickup_hour_ms, pickup_location_id)
            );
            "
        ))?;

        Ok(Self {
            conn,
            time_series_table,
            predictions_table,
        })
    }

    pub fn upsert_hourly_counts(&mut self, rows: &[HourlyCount]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {} (pickup_hour_ms, pickup_location_id, rides)
                 VALUES (?1, ?2, ?3)",
                self.time_series_table
            ))?;
            for row in rows {
                stmt.execute(params![
                    row.pickup_hour_ms_utc,
                    row.pickup_location_id,
                    row.rides
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "feature_store",
            event = "store.hourly.upsert",
            table = %self.time_series_table,
            rows = rows.len()
        );
        Ok(rows.len())
    }

    /// Hourly counts with `from <= pickup_hour <= to`, ordered by zone then hour.
    pub fn fetch_hourly_counts(
        &self,
        from_ms_utc: i64,
        to_ms_utc_inclusive: i64,
    ) -> Result<Vec<HourlyCount>, StoreError> {
        check_range(from_ms_utc, to_ms_utc_inclusive)?;
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT pickup_hour_ms, pickup_location_id, rides
            FROM {}
            WHERE pickup_hour_ms >= ?1 AND pickup_hour_ms <= ?2
            ORDER BY pickup_location_id ASC, pickup_hour_ms ASC
            ",
            self.time_series_table
        ))?;

        let rows = stmt
            .query_map(params![from_ms_utc, to_ms_utc_inclusive], |row| {
                Ok(HourlyCount {
                    pickup_hour_ms_utc: row.get(0)?,
                    pickup_location_id: row.get(1)?,
                    rides: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_predictions(&mut self, predictions: &[Prediction]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {} (pickup_hour_ms, pickup_location_id, predicted_demand)
                 VALUES (?1, ?2, ?3)",
                self.predictions_table
            ))?;
            for prediction in predictions {
                stmt.execute(params![
                    prediction.pickup_hour_ms_utc,
                    prediction.pickup_location_id,
                    f64::from(prediction.predicted_demand)
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "feature_store",
            event = "store.predictions.upsert",
            table = %self.predictions_table,
            rows = predictions.len()
        );
        Ok(predictions.len())
    }

    pub fn fetch_predictions(
        &self,
        from_ms_utc: i64,
        to_ms_utc_inclusive: i64,
    ) -> Result<Vec<Prediction>, StoreError> {
        check_range(from_ms_utc, to_ms_utc_inclusive)?;
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT pickup_hour_ms, pickup_location_id, predicted_demand
            FROM {}
            WHERE pickup_hour_ms >= ?1 AND pickup_hour_ms <= ?2
            ORDER BY pickup_hour_ms ASC, pickup_location_id ASC
            ",
            self.predictions_table
        ))?;

        let rows = stmt
            .query_map(params![from_ms_utc, to_ms_utc_inclusive], |row| {
                Ok(Prediction {
                    pickup_hour_ms_utc: row.get(0)?,
                    pickup_location_id: row.get(1)?,
                    predicted_demand: row.get::<_, f64>(2)? as f32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Predictions joined to actual rides on `(pickup_hour, pickup_location_id)`.
    /// Slots without an observed count are left out.
    pub fn fetch_predictions_and_actuals(
        &self,
        from_ms_utc: i64,
        to_ms_utc_inclusive: i64,
    ) -> Result<Vec<MonitoringRow>, StoreError> {
        check_range(from_ms_utc, to_ms_utc_inclusive)?;
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT p.pickup_hour_ms, p.pickup_location_id, p.predicted_demand, a.rides
            FROM {predictions} AS p
            INNER JOIN {actuals} AS a
                ON a.pickup_hour_ms = p.pickup_hour_ms
               AND a.pickup_location_id = p.pickup_location_id
            WHERE p.pickup_hour_ms >= ?1 AND p.pickup_hour_ms <= ?2
            ORDER BY p.pickup_hour_ms ASC, p.pickup_location_id ASC
            ",
            predictions = self.predictions_table,
            actuals = self.time_series_table
        ))?;

        let rows = stmt
            .query_map(params![from_ms_utc, to_ms_utc_inclusive], |row| {
                Ok(MonitoringRow {
                    pickup_hour_ms_utc: row.get(0)?,
                    pickup_location_id: row.get(1)?,
                    predicted_demand: row.get::<_, f64>(2)? as f32,
                    rides: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            component = "feature_store",
            event = "store.monitoring.fetch",
            from_ms_utc,
            to_ms_utc_inclusive,
            rows = rows.len()
        );
        Ok(rows)
    }
}

fn check_range(from_ms_utc: i64, to_ms_utc: i64) -> Result<(), StoreError> {
    if from_ms_utc > to_ms_utc {
        return Err(StoreError::InvalidRange {
            from_ms_utc,
            to_ms_utc,
        });
    }
    Ok(())
}
