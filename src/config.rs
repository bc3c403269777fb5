//! Pipeline configuration passed explicitly into each stage.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::features::{FeatureError, FEATURE_SCHEMA_VERSION};

const HOURS_PER_DAY: usize = 24;

pub const DEFAULT_INPUT_SEQ_LEN: usize = 28 * HOURS_PER_DAY;
pub const DEFAULT_STEP_SIZE: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureWindowConfig {
    pub input_seq_len: usize,
    pub step_size: usize,
    pub schema_version: u32,
}

impl Default for FeatureWindowConfig {
    fn default() -> Self {
        Self {
            input_seq_len: DEFAULT_INPUT_SEQ_LEN,
            step_size: DEFAULT_STEP_SIZE,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl FeatureWindowConfig {
    pub fn new(input_seq_len: usize, step_size: usize) -> Self {
        Self {
            input_seq_len,
            step_size,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), FeatureError> {
        if self.input_seq_len == 0 {
            return Err(FeatureError::InvalidConfig(
                "input_seq_len must be > 0".to_string(),
            ));
        }
        if self.step_size == 0 {
            return Err(FeatureError::InvalidConfig(
                "step_size must be > 0".to_string(),
            ));
        }
        if self.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(FeatureError::InvalidConfig(format!(
                "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
            )));
        }
        Ok(())
    }
}

/// Name and version of a stored feature group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGroupConfig {
    pub name: String,
    pub version: u32,
}

impl FeatureGroupConfig {
    pub fn hourly_time_series() -> Self {
        Self {
            name: "time_series_hourly_feature_group".to_string(),
            version: 1,
        }
    }

    pub fn model_predictions() -> Self {
        Self {
            name: "model_predictions_feature_group".to_string(),
            version: 1,
        }
    }

    /// Returns `None` when the name would not be a safe SQL identifier.
    pub fn table_name(&self) -> Option<String> {
        let valid = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !self.name.starts_with(|c: char| c.is_ascii_digit());
        valid.then(|| format!("{}_v{}", self.name, self.version))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePaths {
    pub data_root: PathBuf,
    pub store_path: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PipelinePaths {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/raw"),
            store_path: PathBuf::from("data/feature_store.sqlite"),
            output_dir: PathBuf::from("data/transformed"),
        }
    }
}

pub fn window_config_from_env() -> FeatureWindowConfig {
    let mut config = FeatureWindowConfig::default();

    if let Some(input_seq_len) = env_usize("TAXI_INPUT_SEQ_LEN") {
        config.input_seq_len = input_seq_len;
    }
    if let Some(step_size) = env_usize("TAXI_STEP_SIZE") {
        config.step_size = step_size;
    }

    config
}

pub fn pipeline_paths_from_env() -> PipelinePaths {
    let mut paths = PipelinePaths::default();

    if let Some(data_root) = env_path("TAXI_DATA_ROOT") {
        paths.data_root = data_root;
    }
    if let Some(store_path) = env_path("TAXI_STORE_PATH") {
        paths.store_path = store_path;
    }
    if let Some(output_dir) = env_path("TAXI_OUTPUT_DIR") {
        paths.output_dir = output_dir;
    }

    paths
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => None,
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }

    #[test]
    fn window_defaults_cover_four_weeks() {
        let cfg = with_env_vars(
            &[("TAXI_INPUT_SEQ_LEN", None), ("TAXI_STEP_SIZE", None)],
            window_config_from_env,
        );

        assert_eq!(cfg, FeatureWindowConfig::default());
        assert_eq!(cfg.input_seq_len, 672);
        assert_eq!(cfg.step_size, 23);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_window_and_ignores_garbage() {
        let cfg = with_env_vars(
            &[
                ("TAXI_INPUT_SEQ_LEN", Some("12")),
                ("TAXI_STEP_SIZE", Some("zero")),
            ],
            window_config_from_env,
        );

        assert_eq!(cfg.input_seq_len, 12);
        assert_eq!(cfg.step_size, DEFAULT_STEP_SIZE);
    }

    #[test]
    fn paths_from_env_skip_blank_values() {
        let paths = with_env_vars(
            &[
                ("TAXI_DATA_ROOT", Some("/tmp/raw")),
                ("TAXI_STORE_PATH", Some("   ")),
                ("TAXI_OUTPUT_DIR", None),
            ],
            pipeline_paths_from_env,
        );

        assert_eq!(paths.data_root, PathBuf::from("/tmp/raw"));
        assert_eq!(paths.store_path, PipelinePaths::default().store_path);
        assert_eq!(paths.output_dir, PipelinePaths::default().output_dir);
    }

    #[test]
    fn zero_step_size_is_rejected() {
        let err = FeatureWindowConfig::new(3, 0).validate().unwrap_err();
        assert!(matches!(err, FeatureError::InvalidConfig(_)));
    }

    #[test]
    fn table_name_rejects_unsafe_identifiers() {
        assert_eq!(
            FeatureGroupConfig::hourly_time_series().table_name().as_deref(),
            Some("time_series_hourly_feature_group_v1")
        );
        let bad = FeatureGroupConfig {
            name: "rides; DROP TABLE x".to_string(),
            version: 1,
        };
        assert!(bad.table_name().is_none());
    }
}
