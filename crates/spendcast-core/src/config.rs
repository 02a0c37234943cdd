//! Pipeline configuration
//!
//! ## Configuration Resolution
//!
//! Config is loaded with a two-layer resolution:
//! 1. Check for override in data dir (~/.local/share/spendcast/config/pipeline.toml),
//!    or an explicit path passed by the caller
//! 2. Fall back to embedded defaults (compiled into binary)
//!
//! Keys missing from an override file keep their default value. A couple of
//! environment variables are applied last:
//!
//! - `SPENDCAST_ARTIFACT_DIR`: artifact store root
//! - `SPENDCAST_REFRESH_HOURS`: scheduler interval

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::anomaly::AnomalyMethod;
use crate::error::{Error, Result};
use crate::forecast::ModelChoice;
use crate::models::Period;

/// Embedded default config (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../../../config/pipeline.toml");

/// Environment variable overriding the artifact directory
pub const ARTIFACT_DIR_ENV: &str = "SPENDCAST_ARTIFACT_DIR";

/// Environment variable overriding the refresh interval (hours)
pub const REFRESH_HOURS_ENV: &str = "SPENDCAST_REFRESH_HOURS";

/// Longest accepted refresh interval (one leap year)
pub const MAX_INTERVAL_HOURS: u64 = 366 * 24;

/// Longest accepted expense lookback (about a century)
pub const MAX_LOOKBACK_DAYS: i64 = 36_600;

#[derive(Debug, Clone)]
pub struct SeriesConfig {
    pub period: Period,
    pub min_periods: usize,
    /// Days of history to read; None reads everything
    pub lookback_days: Option<i64>,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            period: Period::Day,
            min_periods: 30,
            lookback_days: Some(730),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForecastConfig {
    pub model: ModelChoice,
    pub window: usize,
    pub horizon: usize,
    pub ridge_lambda: f64,
    pub huber_k: f64,
    pub irls_iterations: usize,
    pub trend_threshold_pct: f64,
    pub holdout_periods: usize,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            model: ModelChoice::WindowedRegression,
            window: 7,
            horizon: 30,
            ridge_lambda: 1e-3,
            huber_k: 1.345,
            irls_iterations: 10,
            trend_threshold_pct: 1.0,
            holdout_periods: 14,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub method: AnomalyMethod,
    /// Deviation quantile an observation must exceed (0.95 = top 5%)
    pub quantile: f64,
    pub min_samples: usize,
    /// Floor on the robust z cutoff
    pub min_robust_z: f64,
    /// Floor on the IQR fence multiplier
    pub iqr_multiplier: f64,
    /// Only report the most recent N observations
    pub evaluation_periods: Option<usize>,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            method: AnomalyMethod::RobustZScore,
            quantile: 0.95,
            min_samples: 10,
            min_robust_z: 3.5,
            iqr_multiplier: 1.5,
            evaluation_periods: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub categories: Vec<String>,
    pub min_training_examples: usize,
    /// Laplace smoothing for token likelihoods
    pub smoothing: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            categories: [
                "Food",
                "Transportation",
                "Housing",
                "Utilities",
                "Entertainment",
                "Healthcare",
                "Shopping",
                "Education",
                "Other",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            min_training_examples: 20,
            smoothing: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub artifact_dir: PathBuf,
    /// Number of past artifacts kept per user
    pub history_limit: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            history_limit: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub interval_hours: u64,
    /// Per-user budget for compute; exceeded runs are discarded
    pub run_timeout: Duration,
    pub max_parallel_users: usize,
    /// Consecutive failures before switching a user to the baseline model
    pub fallback_after_failures: u32,
    pub run_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            run_timeout: Duration::from_secs(300),
            max_parallel_users: 4,
            fallback_after_failures: 3,
            run_on_start: true,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub series: SeriesConfig,
    pub forecast: ForecastConfig,
    pub anomaly: AnomalyConfig,
    pub classifier: ClassifierConfig,
    pub publisher: PublisherConfig,
    pub schedule: ScheduleConfig,
}

impl PipelineConfig {
    /// Load from the default override location or the embedded defaults
    pub fn load() -> Result<Self> {
        load_config(None)
    }

    /// Load from an explicit path (embedded defaults if it doesn't exist)
    pub fn load_from(path: &Path) -> Result<Self> {
        load_config(Some(path))
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        parse_config(content)
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var(ARTIFACT_DIR_ENV) {
            if !dir.is_empty() {
                self.publisher.artifact_dir = PathBuf::from(dir);
            }
        }

        if let Ok(hours) = std::env::var(REFRESH_HOURS_ENV) {
            match hours.parse::<u64>() {
                Ok(h) if (1..=MAX_INTERVAL_HOURS).contains(&h) => {
                    self.schedule.interval_hours = h
                }
                _ => warn!(
                    value = hours.as_str(),
                    "Ignoring invalid {}", REFRESH_HOURS_ENV
                ),
            }
        }

        self
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.forecast.window == 0 {
            return Err(Error::Config("forecast.window must be at least 1".into()));
        }
        if self.forecast.horizon == 0 {
            return Err(Error::Config("forecast.horizon must be at least 1".into()));
        }
        if self.forecast.ridge_lambda < 0.0 || !self.forecast.ridge_lambda.is_finite() {
            return Err(Error::Config("forecast.ridge_lambda must be >= 0".into()));
        }
        if self.forecast.huber_k <= 0.0 {
            return Err(Error::Config("forecast.huber_k must be > 0".into()));
        }
        if !(self.anomaly.quantile > 0.0 && self.anomaly.quantile < 1.0) {
            return Err(Error::Config(
                "anomaly.quantile must be between 0 and 1".into(),
            ));
        }
        if self.classifier.categories.len() < 2 {
            return Err(Error::Config(
                "classifier.categories needs at least two entries".into(),
            ));
        }
        if self.classifier.smoothing <= 0.0 {
            return Err(Error::Config("classifier.smoothing must be > 0".into()));
        }
        if let Some(days) = self.series.lookback_days {
            if !(1..=MAX_LOOKBACK_DAYS).contains(&days) {
                return Err(Error::Config(format!(
                    "series.lookback_days must be between 1 and {} (0 disables the limit)",
                    MAX_LOOKBACK_DAYS
                )));
            }
        }
        if !(1..=MAX_INTERVAL_HOURS).contains(&self.schedule.interval_hours) {
            return Err(Error::Config(format!(
                "schedule.interval_hours must be between 1 and {}",
                MAX_INTERVAL_HOURS
            )));
        }
        if self.schedule.run_timeout.is_zero() {
            return Err(Error::Config(
                "schedule.run_timeout_secs must be at least 1".into(),
            ));
        }
        if self.schedule.max_parallel_users == 0 {
            return Err(Error::Config(
                "schedule.max_parallel_users must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Default artifact store root
pub fn default_artifact_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("spendcast").join("artifacts"))
        .unwrap_or_else(|| PathBuf::from("spendcast-artifacts"))
}

/// Get the default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("spendcast").join("config").join("pipeline.toml"))
}

/// Load configuration (override first, then default)
fn load_config(override_path: Option<&Path>) -> Result<PipelineConfig> {
    let path = override_path
        .map(Path::to_path_buf)
        .or_else(default_config_path);

    let content = match path {
        Some(ref p) if p.exists() => fs::read_to_string(p)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", p.display(), e)))?,
        _ => DEFAULT_CONFIG.to_string(),
    };

    parse_config(&content)
}

/// Raw config structure for TOML parsing
#[derive(Debug, Deserialize)]
struct RawConfig {
    series: Option<RawSeries>,
    forecast: Option<RawForecast>,
    anomaly: Option<RawAnomaly>,
    classifier: Option<RawClassifier>,
    publisher: Option<RawPublisher>,
    schedule: Option<RawSchedule>,
}

#[derive(Debug, Deserialize)]
struct RawSeries {
    period: Option<Period>,
    min_periods: Option<usize>,
    lookback_days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawForecast {
    model: Option<ModelChoice>,
    window: Option<usize>,
    horizon: Option<usize>,
    ridge_lambda: Option<f64>,
    huber_k: Option<f64>,
    irls_iterations: Option<usize>,
    trend_threshold_pct: Option<f64>,
    holdout_periods: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawAnomaly {
    method: Option<AnomalyMethod>,
    quantile: Option<f64>,
    min_samples: Option<usize>,
    min_robust_z: Option<f64>,
    iqr_multiplier: Option<f64>,
    evaluation_periods: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawClassifier {
    categories: Option<Vec<String>>,
    min_training_examples: Option<usize>,
    smoothing: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawPublisher {
    artifact_dir: Option<PathBuf>,
    history_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawSchedule {
    interval_hours: Option<u64>,
    run_timeout_secs: Option<u64>,
    max_parallel_users: Option<usize>,
    fallback_after_failures: Option<u32>,
    run_on_start: Option<bool>,
}

/// Parse config from TOML content
fn parse_config(content: &str) -> Result<PipelineConfig> {
    let raw: RawConfig = toml::from_str(content)
        .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;

    let mut config = PipelineConfig::default();

    if let Some(series) = raw.series {
        let c = &mut config.series;
        if let Some(v) = series.period {
            c.period = v;
        }
        if let Some(v) = series.min_periods {
            c.min_periods = v;
        }
        // 0 disables the lookback limit
        if let Some(v) = series.lookback_days {
            c.lookback_days = (v > 0).then_some(v);
        }
    }

    if let Some(forecast) = raw.forecast {
        let c = &mut config.forecast;
        if let Some(v) = forecast.model {
            c.model = v;
        }
        if let Some(v) = forecast.window {
            c.window = v;
        }
        if let Some(v) = forecast.horizon {
            c.horizon = v;
        }
        if let Some(v) = forecast.ridge_lambda {
            c.ridge_lambda = v;
        }
        if let Some(v) = forecast.huber_k {
            c.huber_k = v;
        }
        if let Some(v) = forecast.irls_iterations {
            c.irls_iterations = v;
        }
        if let Some(v) = forecast.trend_threshold_pct {
            c.trend_threshold_pct = v;
        }
        if let Some(v) = forecast.holdout_periods {
            c.holdout_periods = v;
        }
    }

    if let Some(anomaly) = raw.anomaly {
        let c = &mut config.anomaly;
        if let Some(v) = anomaly.method {
            c.method = v;
        }
        if let Some(v) = anomaly.quantile {
            c.quantile = v;
        }
        if let Some(v) = anomaly.min_samples {
            c.min_samples = v;
        }
        if let Some(v) = anomaly.min_robust_z {
            c.min_robust_z = v;
        }
        if let Some(v) = anomaly.iqr_multiplier {
            c.iqr_multiplier = v;
        }
        if anomaly.evaluation_periods.is_some() {
            c.evaluation_periods = anomaly.evaluation_periods;
        }
    }

    if let Some(classifier) = raw.classifier {
        let c = &mut config.classifier;
        if let Some(v) = classifier.categories {
            c.categories = v;
        }
        if let Some(v) = classifier.min_training_examples {
            c.min_training_examples = v;
        }
        if let Some(v) = classifier.smoothing {
            c.smoothing = v;
        }
    }

    if let Some(publisher) = raw.publisher {
        let c = &mut config.publisher;
        if let Some(v) = publisher.artifact_dir {
            c.artifact_dir = v;
        }
        if let Some(v) = publisher.history_limit {
            c.history_limit = v;
        }
    }

    if let Some(schedule) = raw.schedule {
        let c = &mut config.schedule;
        if let Some(v) = schedule.interval_hours {
            c.interval_hours = v;
        }
        if let Some(v) = schedule.run_timeout_secs {
            c.run_timeout = Duration::from_secs(v);
        }
        if let Some(v) = schedule.max_parallel_users {
            c.max_parallel_users = v;
        }
        if let Some(v) = schedule.fallback_after_failures {
            c.fallback_after_failures = v;
        }
        if let Some(v) = schedule.run_on_start {
            c.run_on_start = v;
        }
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_config() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.series.period, Period::Day);
        assert_eq!(config.series.min_periods, 30);
        assert_eq!(config.forecast.window, 7);
        assert_eq!(config.forecast.model, ModelChoice::WindowedRegression);
        assert_eq!(config.anomaly.method, AnomalyMethod::RobustZScore);
        assert_eq!(config.classifier.categories.len(), 9);
        assert_eq!(config.schedule.run_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let config = parse_config(
            r#"
            [forecast]
            horizon = 1

            [anomaly]
            method = "iqr"
            "#,
        )
        .unwrap();

        assert_eq!(config.forecast.horizon, 1);
        assert_eq!(config.forecast.window, 7);
        assert_eq!(config.anomaly.method, AnomalyMethod::Iqr);
        assert_eq!(config.anomaly.quantile, 0.95);
    }

    #[test]
    fn test_zero_lookback_disables_limit() {
        let config = parse_config("[series]\nlookback_days = 0\n").unwrap();
        assert!(config.series.lookback_days.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse_config("[anomaly]\nquantile = 1.5\n").is_err());
        assert!(parse_config("[forecast]\nwindow = 0\n").is_err());
        assert!(parse_config("[classifier]\ncategories = [\"Only\"]\n").is_err());
        assert!(parse_config("[series]\nperiod = \"fortnight\"\n").is_err());
        assert!(parse_config("not toml [").is_err());
    }

    #[test]
    fn test_schedule_and_lookback_bounds() {
        assert!(parse_config("[schedule]\nrun_timeout_secs = 0\n").is_err());
        assert!(parse_config("[schedule]\ninterval_hours = 0\n").is_err());
        assert!(parse_config("[schedule]\ninterval_hours = 9223372036854775807\n").is_err());
        assert!(parse_config("[series]\nlookback_days = 9223372036854775807\n").is_err());
        assert!(parse_config("[series]\nlookback_days = -5\n").is_ok());

        let config = parse_config("[schedule]\ninterval_hours = 8784\nrun_timeout_secs = 1\n")
            .unwrap();
        assert_eq!(config.schedule.interval_hours, MAX_INTERVAL_HOURS);
    }

    #[test]
    fn test_load_from_missing_path_uses_defaults() {
        let config = PipelineConfig::load_from(Path::new("/nonexistent/pipeline.toml")).unwrap();
        assert_eq!(config.forecast.horizon, 30);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        fs::write(&path, "[publisher]\nhistory_limit = 3\n").unwrap();

        let config = PipelineConfig::load_from(&path).unwrap();
        assert_eq!(config.publisher.history_limit, 3);
    }
}
