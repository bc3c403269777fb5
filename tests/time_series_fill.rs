use std::collections::HashSet;

use taxi_demand::{
    add_missing_slots, read_time_series_csv, transform_raw_data_into_ts_data,
    write_time_series_csv, HourlyCount, RawEvent, TimeSeriesError, HOUR_MS,
};

const START_MS: i64 = 1_640_995_200_000; // 2022-01-01T00:00:00Z

fn count(hour: i64, zone: u32, rides: u32) -> HourlyCount {
    HourlyCount {
        pickup_hour_ms_utc: START_MS + hour * HOUR_MS,
        pickup_location_id: zone,
        rides,
    }
}

fn rides_for_zone(rows: &[HourlyCount], zone: u32) -> Vec<u32> {
    rows.iter()
        .filter(|row| row.pickup_location_id == zone)
        .map(|row| row.rides)
        .collect()
}

#[test]
fn dense_grid_covers_every_hour_and_zone_once() {
    let sparse = vec![count(0, 2, 1), count(4, 4, 3), count(2, 1, 7)];
    let dense = add_missing_slots(&sparse).expect("fill succeeds");

    // 5 hours x zones 1..=4
    assert_eq!(dense.len(), 5 * 4);
    let keys: HashSet<(i64, u32)> = dense
        .iter()
        .map(|row| (row.pickup_hour_ms_utc, row.pickup_location_id))
        .collect();
    assert_eq!(keys.len(), dense.len());
}

#[test]
fn missing_hours_are_zero_filled_in_hour_order() {
    let sparse = vec![count(0, 1, 5), count(2, 1, 2)];
    let dense = add_missing_slots(&sparse).expect("fill succeeds");

    assert_eq!(rides_for_zone(&dense, 1), vec![5, 0, 2]);
}

#[test]
fn unobserved_zone_gets_zero_for_every_hour() {
    let sparse = vec![count(0, 3, 4), count(3, 1, 1)];
    let dense = add_missing_slots(&sparse).expect("fill succeeds");

    assert_eq!(rides_for_zone(&dense, 2), vec![0, 0, 0, 0]);
    assert_eq!(rides_for_zone(&dense, 3), vec![4, 0, 0, 0]);
}

#[test]
fn output_is_ordered_by_zone_then_hour() {
    let sparse = vec![count(1, 2, 1), count(0, 1, 1), count(2, 2, 9)];
    let dense = add_missing_slots(&sparse).expect("fill succeeds");

    let order: Vec<(u32, i64)> = dense
        .iter()
        .map(|row| {
            (
                row.pickup_location_id,
                (row.pickup_hour_ms_utc - START_MS) / HOUR_MS,
            )
        })
        .collect();
    assert_eq!(
        order,
        vec![(1, 0), (1, 1), (1, 2), (2, 0), (2, 1), (2, 2)]
    );
}

#[test]
fn raw_events_become_dense_series() {
    let events = vec![
        RawEvent {
            pickup_ts_ms_utc: START_MS + 10 * 60_000,
            pickup_location_id: 2,
        },
        RawEvent {
            pickup_ts_ms_utc: START_MS + 20 * 60_000,
            pickup_location_id: 2,
        },
        RawEvent {
            pickup_ts_ms_utc: START_MS + 2 * HOUR_MS + 1,
            pickup_location_id: 2,
        },
    ];

    let dense = transform_raw_data_into_ts_data(&events).expect("transform succeeds");
    assert_eq!(rides_for_zone(&dense, 1), vec![0, 0, 0]);
    assert_eq!(rides_for_zone(&dense, 2), vec![2, 0, 1]);
}

#[test]
fn csv_boundary_accepts_any_column_order() {
    let body = "rides,pickup_location_id,pickup_hour\n3,1,2022-01-01 00:00:00\n0,1,2022-01-01 01:00:00\n";
    let rows = read_time_series_csv(body.as_bytes()).expect("csv parses");

    assert_eq!(rows, vec![count(0, 1, 3), count(1, 1, 0)]);

    let mut out = Vec::new();
    write_time_series_csv(&mut out, &rows).expect("csv writes");
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.starts_with("pickup_hour,rides,pickup_location_id\n2022-01-01 00:00:00,3,1\n"));
}

#[test]
fn csv_boundary_rejects_unexpected_columns() {
    let body = "pickup_hour,rides,pickup_location_id,weather\n2022-01-01 00:00:00,3,1,sunny\n";
    let err = read_time_series_csv(body.as_bytes()).expect_err("extra column must fail");

    match err {
        TimeSeriesError::UnexpectedColumns { found, .. } => {
            assert_eq!(found.len(), 4);
            assert_eq!(found[3], "weather");
        }
        other => panic!("unexpected error: {other}"),
    }
}
