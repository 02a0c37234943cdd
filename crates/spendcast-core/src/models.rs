//! Domain models for Spendcast

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single expense as recorded by the bookkeeping layer
///
/// Read-only to the pipeline: suggestions never write back to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseRecord {
    /// Source transaction id
    pub id: String,
    pub user_id: String,
    pub date: NaiveDate,
    /// Amount spent, always non-negative
    pub amount: f64,
    /// Category label, None until classified
    pub category: Option<String>,
    pub description: String,
}

impl ExpenseRecord {
    /// Create a validated expense record
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        date: NaiveDate,
        amount: f64,
        category: Option<String>,
        description: impl Into<String>,
    ) -> Result<Self> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(Error::InvalidData(format!(
                "Expense amount must be a non-negative number, got {}",
                amount
            )));
        }

        Ok(Self {
            id: id.into(),
            user_id: user_id.into(),
            date,
            amount,
            category: category.filter(|c| !c.trim().is_empty()),
            description: description.into(),
        })
    }
}

/// Calendar bucket used to regularize the expense series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[default]
    Day,
    Month,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// First date of the period containing `date`
    pub fn start_of(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Day => date,
            Self::Month => date.with_day(1).unwrap_or(date),
        }
    }

    /// Start of the period following the one that starts at `start`
    pub fn next(&self, start: NaiveDate) -> NaiveDate {
        match self {
            Self::Day => start + Duration::days(1),
            Self::Month => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(start)
            }
        }
    }

    /// Human label for a run of `count` periods ("next month", "next 7 days")
    pub fn describe(&self, count: usize) -> String {
        match (self, count) {
            (Self::Day, 1) => "tomorrow".to_string(),
            (Self::Month, 1) => "next month".to_string(),
            (Self::Day, n) => format!("over the next {} days", n),
            (Self::Month, n) => format!("over the next {} months", n),
        }
    }
}

impl std::str::FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" | "daily" => Ok(Self::Day),
            "month" | "monthly" => Ok(Self::Month),
            _ => Err(format!("Unknown period: {}", s)),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inclusive date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Smallest range covering every record, None when there are no records
    pub fn spanning(records: &[ExpenseRecord]) -> Option<Self> {
        let start = records.iter().map(|r| r.date).min()?;
        let end = records.iter().map(|r| r.date).max()?;
        Some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// One regularized bucket of the expense series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub start: NaiveDate,
    pub total: f64,
}

/// Gap-free, strictly increasing series of period totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub period: Period,
    pub points: Vec<SeriesPoint>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.total).collect()
    }

    pub fn total(&self) -> f64 {
        self.points.iter().map(|p| p.total).sum()
    }

    pub fn last(&self) -> Option<&SeriesPoint> {
        self.points.last()
    }

    /// Split into (training, holdout) with the last `holdout` points held out
    pub fn split_at(&self, holdout: usize) -> (TimeSeries, TimeSeries) {
        let cut = self.points.len().saturating_sub(holdout);
        (
            TimeSeries {
                period: self.period,
                points: self.points[..cut].to_vec(),
            },
            TimeSeries {
                period: self.period,
                points: self.points[cut..].to_vec(),
            },
        )
    }

    /// Roll a daily series up into a coarser period
    ///
    /// Resampling to the same or a finer period returns a clone.
    pub fn resample(&self, period: Period) -> TimeSeries {
        if self.period == period || period == Period::Day {
            return self.clone();
        }

        let mut points: Vec<SeriesPoint> = Vec::new();
        for point in &self.points {
            let start = period.start_of(point.start);
            match points.last_mut() {
                Some(last) if last.start == start => last.total += point.total,
                _ => points.push(SeriesPoint {
                    start,
                    total: point.total,
                }),
            }
        }

        TimeSeries { period, points }
    }
}

/// Direction of the forecast relative to recent spending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increase,
    Decrease,
    Flat,
}

impl Trend {
    /// Classify a percent change against a symmetric threshold
    pub fn classify(percent_change: f64, threshold_pct: f64) -> Self {
        if percent_change > threshold_pct {
            Self::Increase
        } else if percent_change < -threshold_pct {
            Self::Decrease
        } else {
            Self::Flat
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Increase => "increase",
            Self::Decrease => "decrease",
            Self::Flat => "flat",
        }
    }
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Qualitative rating derived from MAPE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl AccuracyRating {
    pub fn from_mape(mape: f64) -> Self {
        if mape < 10.0 {
            Self::Excellent
        } else if mape < 20.0 {
            Self::Good
        } else if mape < 30.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

/// Held-out accuracy of a forecast model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    /// Mean absolute percentage error over non-zero held-out periods
    pub mape: f64,
    pub mae: f64,
    pub rmse: f64,
    /// Coefficient of determination of predictions against actuals
    pub r2: f64,
    /// MAPE over consecutive 7-period sums, None with fewer than 7 periods
    /// or when every such sum is zero
    pub weekly_error_pct: Option<f64>,
    pub holdout_periods: usize,
    pub rating: AccuracyRating,
}

impl AccuracyReport {
    /// MAPE above which retraining on recent data is suggested
    pub const RETRAIN_MAPE: f64 = 25.0;
    /// R² below which the model is considered to miss the spending pattern
    pub const WEAK_R2: f64 = 0.5;

    /// Suggested follow-ups for a weak model, empty when none apply
    pub fn recommendations(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.mape > Self::RETRAIN_MAPE {
            out.push("Retrain on more recent expenses");
            out.push("Check for seasonal spending the window does not cover");
        }
        if self.r2 < Self::WEAK_R2 {
            out.push("The model is not capturing your spending pattern well");
            out.push("Try a longer window or the moving_average model");
        }
        out
    }
}

/// Accuracy across k folds of a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationReport {
    /// Periods held out per fold
    pub fold_periods: usize,
    /// Per-fold reports, None for folds with nothing to score
    pub folds: Vec<Option<AccuracyReport>>,
    /// Mean of the scored folds
    pub average: AccuracyReport,
}

/// Forecast for one future period
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodForecast {
    pub start: NaiveDate,
    pub amount: f64,
}

/// Output of a forecast run
///
/// Superseded, never mutated, by the next run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub generated_at: DateTime<Utc>,
    /// Name of the model that produced the forecast
    pub model: String,
    pub period: Period,
    pub horizon: usize,
    /// Total predicted spend across the horizon
    pub predicted_amount: f64,
    /// Observed spend over the most recent `horizon` periods
    pub last_observed_amount: f64,
    pub percent_change: f64,
    pub trend: Trend,
    pub per_period: Vec<PeriodForecast>,
    pub accuracy_report: Option<AccuracyReport>,
}

/// What an anomaly flag refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AnomalySubject {
    /// A series period, identified by its start date
    Period(NaiveDate),
    /// A single transaction, identified by its source id
    Transaction(String),
}

impl std::fmt::Display for AnomalySubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Period(date) => write!(f, "{}", date),
            Self::Transaction(id) => write!(f, "tx {}", id),
        }
    }
}

/// Deviation score for one observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub subject: AnomalySubject,
    pub observed_amount: f64,
    pub expected_low: f64,
    pub expected_high: f64,
    /// 0..=1, above 0.5 means the observation passed the cutoff
    pub severity_score: f64,
    pub is_anomaly: bool,
}

/// Advisory re-categorization for one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySuggestion {
    pub transaction_id: String,
    pub current_category: Option<String>,
    pub suggested_category: String,
    pub confidence: f64,
}
