//! Hourly per-zone ride counts: aggregation from raw events and dense slot filling.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};

use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::raw_rides::RawEvent;

pub const HOUR_MS: i64 = 3_600_000;

pub const TIME_SERIES_COLUMNS: [&str; 3] = ["pickup_hour", "rides", "pickup_location_id"];

const PICKUP_HOUR_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Ride count for one (hour, zone) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HourlyCount {
    pub pickup_hour_ms_utc: i64,
    pub pickup_location_id: u32,
    pub rides: u32,
}

#[derive(Debug, Error)]
pub enum TimeSeriesError {
    #[error("pickup hour {0} is not aligned to a whole hour")]
    UnalignedHour(i64),
    #[error("invalid pickup_location_id {0}; zone ids start at 1")]
    InvalidLocationId(u32),
    #[error("duplicate slot for zone {pickup_location_id} at {pickup_hour_ms_utc}")]
    DuplicateSlot {
        pickup_hour_ms_utc: i64,
        pickup_location_id: u32,
    },
    #[error("time-series table must have columns {expected:?}, found {found:?}")]
    UnexpectedColumns {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn floor_to_hour(ts_ms_utc: i64) -> i64 {
    ts_ms_utc - ts_ms_utc.rem_euclid(HOUR_MS)
}

/// Counts raw events per (hour, zone). Only observed slots are emitted,
/// ordered by hour then zone.
pub fn aggregate_hourly_counts(events: &[RawEvent]) -> Vec<HourlyCount> {
    let mut counts: BTreeMap<(i64, u32), u32> = BTreeMap::new();
    for event in events {
        let key = (
            floor_to_hour(event.pickup_ts_ms_utc),
            event.pickup_location_id,
        );
        *counts.entry(key).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .map(|((pickup_hour_ms_utc, pickup_location_id), rides)| HourlyCount {
            pickup_hour_ms_utc,
            pickup_location_id,
            rides,
        })
        .collect()
}

/// Expands sparse counts onto the full grid of zones `1..=max observed zone`
/// and hours `min..=max observed hour`, filling absent slots with zero rides.
///
/// The hour axis is global: zones with no events at all still get one zero
/// row per hour. Output is ordered by zone, then hour.
pub fn add_missing_slots(counts: &[HourlyCount]) -> Result<Vec<HourlyCount>, TimeSeriesError> {
    let Some(first) = counts.first() else {
        return Ok(Vec::new());
    };

    let mut min_hour = first.pickup_hour_ms_utc;
    let mut max_hour = first.pickup_hour_ms_utc;
    let mut max_location_id = 0u32;
    let mut by_slot: HashMap<(u32, i64), u32> = HashMap::with_capacity(counts.len());

    for count in counts {
        if count.pickup_hour_ms_utc.rem_euclid(HOUR_MS) != 0 {
            return Err(TimeSeriesError::UnalignedHour(count.pickup_hour_ms_utc));
        }
        if count.pickup_location_id == 0 {
            return Err(TimeSeriesError::InvalidLocationId(count.pickup_location_id));
        }
        let key = (count.pickup_location_id, count.pickup_hour_ms_utc);
        if by_slot.insert(key, count.rides).is_some() {
            return Err(TimeSeriesError::DuplicateSlot {
                pickup_hour_ms_utc: count.pickup_hour_ms_utc,
                pickup_location_id: count.pickup_location_id,
            });
        }
        min_hour = min_hour.min(count.pickup_hour_ms_utc);
        max_hour = max_hour.max(count.pickup_hour_ms_utc);
        max_location_id = max_location_id.max(count.pickup_location_id);
    }

    let hours_in_range = ((max_hour - min_hour) / HOUR_MS + 1) as usize;
    let mut output = Vec::with_capacity(hours_in_range * max_location_id as usize);

    for location_id in 1..=max_location_id {
        let mut observed = 0usize;
        for step in 0..hours_in_range {
            let hour = min_hour + step as i64 * HOUR_MS;
            let rides = match by_slot.get(&(location_id, hour)) {
                Some(rides) => {
                    observed += 1;
                    *rides
                }
                None => 0,
            };
            output.push(HourlyCount {
                pickup_hour_ms_utc: hour,
                pickup_location_id: location_id,
                rides,
            });
        }
        debug!(
            component = "time_series",
            event = "time_series.fill.zone",
            pickup_location_id = location_id,
            observed_slots = observed,
            filled_slots = hours_in_range - observed
        );
    }

    info!(
        component = "time_series",
        event = "time_series.fill.finish",
        sparse_rows = counts.len(),
        dense_rows = output.len(),
        zones = max_location_id,
        hours = hours_in_range,
        first_hour_ms_utc = min_hour,
        last_hour_ms_utc = max_hour
    );

    Ok(output)
}

pub fn transform_raw_data_into_ts_data(
    events: &[RawEvent],
) -> Result<Vec<HourlyCount>, TimeSeriesError> {
    let sparse = aggregate_hourly_counts(events);
    info!(
        component = "time_series",
        event = "time_series.aggregate.finish",
        raw_events = events.len(),
        observed_slots = sparse.len()
    );
    add_missing_slots(&sparse)
}

/// Distinct zone ids in ascending order.
pub fn location_ids(rows: &[HourlyCount]) -> Vec<u32> {
    rows.iter()
        .map(|row| row.pickup_location_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn format_pickup_hour(ts_ms_utc: i64) -> Result<String, TimeSeriesError> {
    let dt = Utc
        .timestamp_millis_opt(ts_ms_utc)
        .single()
        .ok_or(TimeSeriesError::InvalidTimestamp(ts_ms_utc))?;
    Ok(dt.format(PICKUP_HOUR_FORMAT).to_string())
}

pub fn parse_pickup_hour(raw: &str) -> Result<i64, TimeSeriesError> {
    let trimmed = raw.trim();
    let naive = NaiveDateTime::parse_from_str(trimmed, PICKUP_HOUR_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| TimeSeriesError::ParseField {
            field: "pickup_hour",
            value: raw.to_string(),
        })?;
    Ok(naive.and_utc().timestamp_millis())
}

/// Reads a `{pickup_hour, rides, pickup_location_id}` table. Any other column
/// set is rejected before a single row is parsed.
pub fn read_time_series_csv<R: Read>(reader: R) -> Result<Vec<HourlyCount>, TimeSeriesError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);
    let headers = reader.headers()?.clone();

    let found: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
    let found_set: BTreeSet<&str> = found.iter().map(String::as_str).collect();
    let expected_set: BTreeSet<&str> = TIME_SERIES_COLUMNS.iter().copied().collect();
    if found.len() != TIME_SERIES_COLUMNS.len() || found_set != expected_set {
        return Err(TimeSeriesError::UnexpectedColumns {
            expected: TIME_SERIES_COLUMNS.iter().map(|c| c.to_string()).collect(),
            found,
        });
    }

    let position = |name: &str| found.iter().position(|h| h == name).unwrap_or_default();
    let hour_idx = position("pickup_hour");
    let rides_idx = position("rides");
    let location_idx = position("pickup_location_id");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let raw_hour = record.get(hour_idx).unwrap_or_default();
        let raw_rides = record.get(rides_idx).unwrap_or_default();
        let raw_location = record.get(location_idx).unwrap_or_default();

        rows.push(HourlyCount {
            pickup_hour_ms_utc: parse_pickup_hour(raw_hour)?,
            rides: raw_rides
                .trim()
                .parse::<u32>()
                .map_err(|_| TimeSeriesError::ParseField {
                    field: "rides",
                    value: raw_rides.to_string(),
                })?,
            pickup_location_id: raw_location.trim().parse::<u32>().map_err(|_| {
                TimeSeriesError::ParseField {
                    field: "pickup_location_id",
                    value: raw_location.to_string(),
                }
            })?,
        });
    }

    Ok(rows)
}

pub fn write_time_series_csv<W: Write>(
    writer: W,
    rows: &[HourlyCount],
) -> Result<(), TimeSeriesError> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(TIME_SERIES_COLUMNS)?;
    for row in rows {
        writer.write_record([
            format_pickup_hour(row.pickup_hour_ms_utc)?,
            row.rides.to_string(),
            row.pickup_location_id.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H0: i64 = 1_641_013_200_000; // 2022-01-01T05:00:00Z

    fn count(hour: i64, zone: u32, rides: u32) -> HourlyCount {
        HourlyCount {
            pickup_hour_ms_utc: H0 + hour * HOUR_MS,
            pickup_location_id: zone,
            rides,
        }
    }

    #[test]
    fn aggregation_floors_to_the_hour_and_counts() {
        let events = vec![
            RawEvent {
                pickup_ts_ms_utc: H0 + 5 * 60_000,
                pickup_location_id: 2,
            },
            RawEvent {
                pickup_ts_ms_utc: H0 + 59 * 60_000,
                pickup_location_id: 2,
            },
            RawEvent {
                pickup_ts_ms_utc: H0 + HOUR_MS,
                pickup_location_id: 1,
            },
        ];

        let counts = aggregate_hourly_counts(&events);
        assert_eq!(counts, vec![count(0, 2, 2), count(1, 1, 1)]);
    }

    #[test]
    fn floor_handles_pre_epoch_timestamps() {
        assert_eq!(floor_to_hour(-1), -HOUR_MS);
        assert_eq!(floor_to_hour(HOUR_MS + 1), HOUR_MS);
    }

    #[test]
    fn duplicate_slots_are_rejected() {
        let err = add_missing_slots(&[count(0, 1, 3), count(0, 1, 4)]).unwrap_err();
        assert!(matches!(err, TimeSeriesError::DuplicateSlot { .. }));
    }

    #[test]
    fn zone_zero_and_unaligned_hours_are_rejected() {
        assert!(matches!(
            add_missing_slots(&[count(0, 0, 1)]).unwrap_err(),
            TimeSeriesError::InvalidLocationId(0)
        ));

        let unaligned = HourlyCount {
            pickup_hour_ms_utc: H0 + 1,
            pickup_location_id: 1,
            rides: 1,
        };
        assert!(matches!(
            add_missing_slots(&[unaligned]).unwrap_err(),
            TimeSeriesError::UnalignedHour(_)
        ));
    }

    #[test]
    fn empty_input_yields_empty_grid() {
        assert!(add_missing_slots(&[]).unwrap().is_empty());
    }

    #[test]
    fn pickup_hour_text_round_trips() {
        let text = format_pickup_hour(H0).unwrap();
        assert_eq!(text, "2022-01-01 05:00:00");
        assert_eq!(parse_pickup_hour(&text).unwrap(), H0);
        assert_eq!(parse_pickup_hour("2022-01-01T05:00:00").unwrap(), H0);
        assert!(parse_pickup_hour("yesterday").is_err());
    }
}
