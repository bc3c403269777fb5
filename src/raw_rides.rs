//! Monthly yellow-taxi trip files: planning, local caching and parsing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use arrow::array::{Array, ArrayRef, Int64Array, TimestampMillisecondArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const TRIP_DATA_BASE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data";
const PICKUP_DATETIME_COLUMN: &str = "tpep_pickup_datetime";
const PICKUP_LOCATION_COLUMN: &str = "PULocationID";

/// One taxi pickup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawEvent {
    pub pickup_ts_ms_utc: i64,
    pub pickup_location_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripFileRef {
    pub year: i32,
    pub month: u32,
    pub url: String,
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripFileSource {
    Cached,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLoadRequest {
    pub year: i32,
    /// `None` loads the whole year.
    pub months: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLoadReport {
    pub months_loaded: Vec<u32>,
    pub months_missing: Vec<u32>,
    pub rows_read: u64,
    pub rows_outside_year: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLoadResult {
    pub events: Vec<RawEvent>,
    pub report: RawLoadReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDataConfig {
    pub data_root: PathBuf,
    pub base_url: String,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RawDataConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/raw"),
            base_url: TRIP_DATA_BASE_URL.to_string(),
            http_timeout_ms: 60_000,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum RawDataError {
    #[error("invalid raw data request: {0}")]
    InvalidRequest(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("trip file {path} is missing column {column}")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("trip file {path} column {column} has type {found}")]
    UnsupportedColumnType {
        path: PathBuf,
        column: &'static str,
        found: String,
    },
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
}

pub fn plan_monthly_files(
    req: &RawLoadRequest,
    cfg: &RawDataConfig,
) -> Result<Vec<TripFileRef>, RawDataError> {
    let months = match &req.months {
        Some(months) => months.clone(),
        None => (1..=12).collect(),
    };

    let mut out = Vec::with_capacity(months.len());
    for month in months {
        if !(1..=12).contains(&month) {
            return Err(RawDataError::InvalidRequest(format!(
                "month {month} is outside 1..=12"
            )));
        }
        let base = cfg.base_url.trim_end_matches('/');
        out.push(TripFileRef {
            year: req.year,
            month,
            url: format!("{base}/yellow_tripdata_{:04}-{month:02}.parquet", req.year),
            relative_path: PathBuf::from(format!("rides_{:04}-{month:02}.parquet", req.year)),
        });
    }

    Ok(out)
}

/// Loads pickups for the requested months, downloading files that are not
/// cached under `data_root`. Months whose file cannot be fetched are skipped
/// and listed in the report.
pub fn load_raw_rides(
    req: &RawLoadRequest,
    cfg: &RawDataConfig,
) -> Result<RawLoadResult, RawDataError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    load_raw_rides_with_fetcher(req, cfg, &fetcher)
}

fn load_raw_rides_with_fetcher(
    req: &RawLoadRequest,
    cfg: &RawDataConfig,
    fetcher: &dyn HttpFetcher,
) -> Result<RawLoadResult, RawDataError> {
    let files = plan_monthly_files(req, cfg)?;
    info!(
        component = "raw_rides",
        event = "raw.load.start",
        year = req.year,
        file_count = files.len()
    );

    let mut report = RawLoadReport::default();
    let mut events = Vec::new();

    for file in &files {
        let local_path = cfg.data_root.join(&file.relative_path);
        let source = match ensure_local_file(file, &local_path, cfg, fetcher) {
            Ok(source) => source,
            Err(err @ RawDataError::HttpRequest { .. }) => {
                warn!(
                    component = "raw_rides",
                    event = "raw.file.unavailable",
                    year = file.year,
                    month = file.month,
                    error = %err
                );
                report.months_missing.push(file.month);
                continue;
            }
            Err(err) => return Err(err),
        };

        let parsed = parse_trip_file(&local_path)?;
        let read = parsed.len() as u64;
        let mut kept = validate_raw_data(parsed, file.year);
        let outside = read - kept.len() as u64;

        info!(
            component = "raw_rides",
            event = "raw.file.loaded",
            year = file.year,
            month = file.month,
            source = ?source,
            rows_read = read,
            rows_outside_year = outside
        );

        report.rows_read += read;
        report.rows_outside_year += outside;
        report.months_loaded.push(file.month);
        events.append(&mut kept);
    }

    info!(
        component = "raw_rides",
        event = "raw.load.finish",
        year = req.year,
        events = events.len(),
        months_loaded = report.months_loaded.len(),
        months_missing = report.months_missing.len()
    );

    Ok(RawLoadResult { events, report })
}

/// Keeps only pickups that fall inside calendar `year`. A year chrono cannot
/// represent keeps nothing.
pub fn validate_raw_data(events: Vec<RawEvent>, year: i32) -> Vec<RawEvent> {
    let next_year = year.checked_add(1).and_then(year_start_ms);
    let (Some(start), Some(end)) = (year_start_ms(year), next_year) else {
        return Vec::new();
    };
    events
        .into_iter()
        .filter(|event| event.pickup_ts_ms_utc >= start && event.pickup_ts_ms_utc < end)
        .collect()
}

fn ensure_local_file(
    file: &TripFileRef,
    local_path: &Path,
    cfg: &RawDataConfig,
    fetcher: &dyn HttpFetcher,
) -> Result<TripFileSource, RawDataError> {
    if local_path.exists() {
        debug!(
            component = "raw_rides",
            event = "raw.file.cached",
            path = %local_path.display()
        );
        return Ok(TripFileSource::Cached);
    }

    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = retry(cfg, || fetcher.get_bytes(&file.url))?;
    write_atomic(local_path, &bytes)?;

    info!(
        component = "raw_rides",
        event = "raw.file.downloaded",
        year = file.year,
        month = file.month,
        path = %local_path.display(),
        bytes = bytes.len()
    );

    Ok(TripFileSource::Downloaded)
}

/// Reads pickup time and zone from a monthly parquet file. Only the two
/// needed columns are decoded.
fn parse_trip_file(path: &Path) -> Result<Vec<RawEvent>, RawDataError> {
    let file = fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

    let datetime_idx = column_index(builder.schema(), PICKUP_DATETIME_COLUMN, path)?;
    let location_idx = column_index(builder.schema(), PICKUP_LOCATION_COLUMN, path)?;
    let mask = ProjectionMask::roots(builder.parquet_schema(), [datetime_idx, location_idx]);
    let reader = builder.with_projection(mask).build()?;

    let mut events = Vec::new();
    for batch in reader {
        let batch = batch?;
        append_batch_events(&batch, path, &mut events)?;
    }

    Ok(events)
}

fn column_index(
    schema: &Schema,
    column: &'static str,
    path: &Path,
) -> Result<usize, RawDataError> {
    schema.index_of(column).map_err(|_| RawDataError::MissingColumn {
        path: path.to_path_buf(),
        column,
    })
}

fn append_batch_events(
    batch: &RecordBatch,
    path: &Path,
    out: &mut Vec<RawEvent>,
) -> Result<(), RawDataError> {
    let pickups = projected_column(
        batch,
        PICKUP_DATETIME_COLUMN,
        &DataType::Timestamp(TimeUnit::Millisecond, None),
        path,
    )?;
    let pickups = pickups
        .as_any()
        .downcast_ref::<TimestampMillisecondArray>()
        .ok_or_else(|| unsupported_type(path, PICKUP_DATETIME_COLUMN, pickups.data_type()))?;

    let locations = projected_column(batch, PICKUP_LOCATION_COLUMN, &DataType::Int64, path)?;
    let locations = locations
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| unsupported_type(path, PICKUP_LOCATION_COLUMN, locations.data_type()))?;

    out.reserve(batch.num_rows());
    for idx in 0..batch.num_rows() {
        if pickups.is_null(idx) {
            return Err(RawDataError::ParseField {
                field: PICKUP_DATETIME_COLUMN,
                value: "null".to_string(),
            });
        }
        if locations.is_null(idx) {
            return Err(RawDataError::ParseField {
                field: PICKUP_LOCATION_COLUMN,
                value: "null".to_string(),
            });
        }
        let raw_location = locations.value(idx);
        let pickup_location_id =
            u32::try_from(raw_location).map_err(|_| RawDataError::ParseField {
                field: PICKUP_LOCATION_COLUMN,
                value: raw_location.to_string(),
            })?;

        out.push(RawEvent {
            pickup_ts_ms_utc: pickups.value(idx),
            pickup_location_id,
        });
    }

    Ok(())
}

/// Fetches `column` from the batch and casts it to `target`. Trip files have
/// shipped pickups as `timestamp[us]` and `timestamp[ns]`, and zone ids as
/// both 32 and 64 bit integers.
fn projected_column(
    batch: &RecordBatch,
    column: &'static str,
    target: &DataType,
    path: &Path,
) -> Result<ArrayRef, RawDataError> {
    let raw = batch
        .column_by_name(column)
        .ok_or_else(|| RawDataError::MissingColumn {
            path: path.to_path_buf(),
            column,
        })?;
    if raw.data_type() == target {
        return Ok(raw.clone());
    }
    cast(raw.as_ref(), target).map_err(|_| unsupported_type(path, column, raw.data_type()))
}

fn unsupported_type(path: &Path, column: &'static str, found: &DataType) -> RawDataError {
    RawDataError::UnsupportedColumnType {
        path: path.to_path_buf(),
        column,
        found: found.to_string(),
    }
}

fn year_start_ms(year: i32) -> Option<i64> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RawDataError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            RawDataError::InvalidRequest(format!("invalid output path: {}", path.display()))
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, RawDataError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(timeout_ms: u64) -> Result<Self, RawDataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| RawDataError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, RawDataError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| RawDataError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RawDataError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| RawDataError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

fn retry<T>(
    cfg: &RawDataConfig,
    mut f: impl FnMut() -> Result<T, RawDataError>,
) -> Result<T, RawDataError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(_) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::TimestampMicrosecondArray;
    use arrow::datatypes::Field;
    use chrono::NaiveDateTime;
    use parquet::arrow::ArrowWriter;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
        calls: Cell<u32>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.responses.insert(url.to_string(), body.to_vec());
            self
        }
    }

    impl HttpFetcher for MockFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, RawDataError> {
            self.calls.set(self.calls.get() + 1);
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| RawDataError::HttpRequest {
                    url: url.to_string(),
                    message: "missing mock response".to_string(),
                })
        }
    }

    fn micros(raw: &str) -> i64 {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
            .timestamp_micros()
    }

    /// Parquet bytes shaped like a TLC yellow-taxi month: microsecond pickup
    /// timestamps, 64-bit zone ids and an unrelated leading column.
    fn trips_parquet(rows: &[(&str, i64)]) -> Vec<u8> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("VendorID", DataType::Int64, true),
            Field::new(
                PICKUP_DATETIME_COLUMN,
                DataType::Timestamp(TimeUnit::Microsecond, None),
                true,
            ),
            Field::new(PICKUP_LOCATION_COLUMN, DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1_i64; rows.len()])),
                Arc::new(TimestampMicrosecondArray::from(
                    rows.iter().map(|(ts, _)| micros(ts)).collect::<Vec<_>>(),
                )),
                Arc::new(Int64Array::from(
                    rows.iter().map(|(_, zone)| *zone).collect::<Vec<_>>(),
                )),
            ],
        )
        .unwrap();

        let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.into_inner().unwrap()
    }

    fn sample_trips() -> Vec<u8> {
        trips_parquet(&[
            ("2022-01-01 00:35:40", 142),
            ("2022-01-01 00:33:43", 236),
            ("2021-12-31 23:59:59", 142),
        ])
    }

    fn test_cfg(root: &Path) -> RawDataConfig {
        RawDataConfig {
            data_root: root.to_path_buf(),
            base_url: "https://mirror.test/trip-data/".to_string(),
            max_retries: 0,
            retry_backoff_ms: 0,
            ..RawDataConfig::default()
        }
    }

    #[test]
    fn plan_defaults_to_all_months_and_rejects_bad_month() {
        let cfg = RawDataConfig::default();
        let plan = plan_monthly_files(
            &RawLoadRequest {
                year: 2022,
                months: None,
            },
            &cfg,
        )
        .unwrap();
        assert_eq!(plan.len(), 12);
        assert_eq!(
            plan[0].url,
            "https://d37ci6vzurychx.cloudfront.net/trip-data/yellow_tripdata_2022-01.parquet"
        );
        assert_eq!(plan[0].relative_path, PathBuf::from("rides_2022-01.parquet"));
        assert!(plan[11].url.ends_with("/yellow_tripdata_2022-12.parquet"));

        let err = plan_monthly_files(
            &RawLoadRequest {
                year: 2022,
                months: Some(vec![13]),
            },
            &cfg,
        )
        .unwrap_err();
        assert!(matches!(err, RawDataError::InvalidRequest(_)));
    }

    #[test]
    fn downloads_missing_file_and_filters_other_years() {
        let temp = tempdir().unwrap();
        let cfg = test_cfg(temp.path());
        let fetcher = MockFetcher::default().with(
            "https://mirror.test/trip-data/yellow_tripdata_2022-01.parquet",
            &sample_trips(),
        );

        let result = load_raw_rides_with_fetcher(
            &RawLoadRequest {
                year: 2022,
                months: Some(vec![1]),
            },
            &cfg,
            &fetcher,
        )
        .unwrap();

        assert_eq!(result.events.len(), 2);
        assert_eq!(result.events[0].pickup_location_id, 142);
        assert_eq!(result.events[0].pickup_ts_ms_utc, 1_640_997_340_000);
        assert_eq!(result.report.rows_read, 3);
        assert_eq!(result.report.rows_outside_year, 1);
        assert_eq!(result.report.months_loaded, vec![1]);
        assert!(temp.path().join("rides_2022-01.parquet").exists());
    }

    #[test]
    fn unavailable_month_is_skipped_not_fatal() {
        let temp = tempdir().unwrap();
        let cfg = test_cfg(temp.path());
        let fetcher = MockFetcher::default().with(
            "https://mirror.test/trip-data/yellow_tripdata_2022-01.parquet",
            &sample_trips(),
        );

        let result = load_raw_rides_with_fetcher(
            &RawLoadRequest {
                year: 2022,
                months: Some(vec![1, 2]),
            },
            &cfg,
            &fetcher,
        )
        .unwrap();

        assert_eq!(result.report.months_loaded, vec![1]);
        assert_eq!(result.report.months_missing, vec![2]);
        assert_eq!(result.events.len(), 2);
    }

    #[test]
    fn cached_file_skips_download() {
        let temp = tempdir().unwrap();
        let cfg = test_cfg(temp.path());
        fs::write(temp.path().join("rides_2022-03.parquet"), sample_trips()).unwrap();

        let fetcher = MockFetcher::default();
        let result = load_raw_rides_with_fetcher(
            &RawLoadRequest {
                year: 2022,
                months: Some(vec![3]),
            },
            &cfg,
            &fetcher,
        )
        .unwrap();

        assert_eq!(fetcher.calls.get(), 0);
        assert_eq!(result.report.months_loaded, vec![3]);
    }

    #[test]
    fn missing_column_is_reported() {
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                PICKUP_DATETIME_COLUMN,
                DataType::Timestamp(TimeUnit::Microsecond, None),
                true,
            ),
            Field::new("DOLocationID", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(TimestampMicrosecondArray::from(vec![micros(
                    "2022-01-01 00:00:00",
                )])),
                Arc::new(Int64Array::from(vec![1_i64])),
            ],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).unwrap();
        writer.write(&batch).unwrap();

        let temp = tempdir().unwrap();
        let cfg = test_cfg(temp.path());
        fs::write(
            temp.path().join("rides_2022-01.parquet"),
            writer.into_inner().unwrap(),
        )
        .unwrap();

        let err = load_raw_rides_with_fetcher(
            &RawLoadRequest {
                year: 2022,
                months: Some(vec![1]),
            },
            &cfg,
            &MockFetcher::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RawDataError::MissingColumn {
                column: "PULocationID",
                ..
            }
        ));
    }

    #[test]
    fn negative_zone_id_is_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rides_2022-01.parquet");
        fs::write(&path, trips_parquet(&[("2022-01-01 00:00:00", -4)])).unwrap();

        let err = parse_trip_file(&path).unwrap_err();
        assert!(matches!(
            err,
            RawDataError::ParseField {
                field: "PULocationID",
                ..
            }
        ));
    }

    #[test]
    fn year_filter_handles_extreme_years() {
        let events = vec![RawEvent {
            pickup_ts_ms_utc: 0,
            pickup_location_id: 1,
        }];
        assert!(validate_raw_data(events.clone(), i32::MAX).is_empty());
        assert!(validate_raw_data(events.clone(), i32::MIN).is_empty());
        assert_eq!(validate_raw_data(events, 1970).len(), 1);
    }
}
