//! Spendcast Core Library
//!
//! Shared functionality for the Spendcast spending forecaster:
//! - SQLite expense store and CSV import
//! - Period aggregation of expenses into time series
//! - Robust windowed regression forecaster with a moving-average baseline
//! - Anomaly scoring (robust z-score and IQR)
//! - Naive Bayes category suggestions
//! - Atomic, versioned forecast artifacts
//! - Periodic refresh scheduler with per-user timeouts

pub mod anomaly;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod forecast;
pub mod import;
pub mod models;
pub mod pipeline;
pub mod publish;
pub mod scheduler;
pub mod series;
pub mod source;

/// Expense and series fixtures
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use anomaly::{AnomalyMethod, AnomalyScorer};
pub use classify::CategoryClassifier;
pub use config::{
    AnomalyConfig, ClassifierConfig, ForecastConfig, PipelineConfig, PublisherConfig,
    ScheduleConfig, SeriesConfig,
};
pub use db::{Database, InsertSummary};
pub use error::{Error, Result};
pub use forecast::{
    evaluate_cross_validation, evaluate_holdout, narrative, predict, predict_with_threshold,
    Forecaster, ModelChoice, ModelState, MovingAverage, WindowedRegressor,
};
pub use import::parse_expenses_csv;
pub use models::{
    AccuracyRating, AccuracyReport, AnomalyFlag, AnomalySubject, CategorySuggestion,
    CrossValidationReport, DateRange, ExpenseRecord, ForecastResult, Period, PeriodForecast,
    SeriesPoint, TimeSeries, Trend,
};
pub use pipeline::{Pipeline, RunOutput};
pub use publish::{Artifact, ArtifactHandle, ArtifactStore};
pub use scheduler::{CycleReport, RefreshScheduler, RunOutcome, UserRun};
pub use series::build_series;
pub use source::{ExpenseSource, MemorySource};
