//! Spending forecaster
//!
//! Forecasting is split into a fit step and a predict step:
//!
//! - A [`Forecaster`] turns a [`TimeSeries`] into a [`ModelState`]. The state
//!   carries everything needed to predict (coefficients, the normalization
//!   scaler, and the tail of the observed series), so it can be persisted and
//!   reused without retraining.
//! - [`predict`] rolls a state forward `horizon` periods and derives the
//!   percent change and trend against recent spending.
//!
//! ## Models
//!
//! - **Windowed regression** - autoregressive regressor over sliding windows,
//!   robust to isolated spikes (default)
//! - **Moving average** - mean of the last window, used as a fallback when the
//!   regressor keeps failing

mod baseline;
mod regressor;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ForecastConfig;
use crate::error::{Error, Result};
use crate::models::{
    AccuracyRating, AccuracyReport, CrossValidationReport, ForecastResult, Period, PeriodForecast,
    TimeSeries, Trend,
};

pub use baseline::MovingAverage;
pub use regressor::WindowedRegressor;

/// Trend threshold used by [`predict`]
pub const DEFAULT_TREND_THRESHOLD_PCT: f64 = 1.0;

/// Maximum number of observed values kept in a model state
const TAIL_LIMIT: usize = 366;

/// Shortest series [`evaluate_cross_validation`] accepts
pub const CROSS_VALIDATION_MIN_PERIODS: usize = 90;

/// Periods per bucket for the weekly aggregated error
const WEEK: usize = 7;

/// Which forecasting strategy to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelChoice {
    WindowedRegression,
    MovingAverage,
}

impl ModelChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WindowedRegression => "windowed_regression",
            Self::MovingAverage => "moving_average",
        }
    }

    /// Instantiate the strategy with the configured parameters
    pub fn build(&self, config: &ForecastConfig) -> Box<dyn Forecaster> {
        match self {
            Self::WindowedRegression => Box::new(WindowedRegressor::from_config(config)),
            Self::MovingAverage => Box::new(MovingAverage::new(config.window)),
        }
    }
}

impl std::str::FromStr for ModelChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "windowed_regression" | "regression" => Ok(Self::WindowedRegression),
            "moving_average" | "baseline" => Ok(Self::MovingAverage),
            _ => Err(format!("Unknown model: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trait for forecasting strategies
pub trait Forecaster: Send + Sync {
    /// Model name recorded in states and artifacts
    fn name(&self) -> &'static str;

    /// Number of trailing periods each prediction reads
    fn window(&self) -> usize;

    /// Fit the model to a series
    fn fit(&self, series: &TimeSeries) -> Result<ModelState>;
}

/// Min-max scaler into [0, 1]
///
/// A constant input maps to 0.5 and inverts back to the constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub min: f64,
    pub max: f64,
}

impl MinMaxScaler {
    const EPSILON: f64 = 1e-10;

    pub fn fit(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::identity();
        }
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Self { min, max }
    }

    /// Scaler that leaves values unchanged
    pub fn identity() -> Self {
        Self { min: 0.0, max: 1.0 }
    }

    fn range(&self) -> f64 {
        self.max - self.min
    }

    pub fn transform(&self, value: f64) -> f64 {
        let range = self.range();
        if range.abs() < Self::EPSILON {
            0.5
        } else {
            (value - self.min) / range
        }
    }

    pub fn inverse(&self, value: f64) -> f64 {
        let range = self.range();
        if range.abs() < Self::EPSILON {
            self.min
        } else {
            value * range + self.min
        }
    }
}

/// Fitted model, sufficient to predict without retraining
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub model: String,
    pub period: Period,
    pub window: usize,
    /// One coefficient per window slot, oldest first, in normalized units
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub scaler: MinMaxScaler,
    /// Most recent observed totals, oldest first
    pub tail: Vec<f64>,
    pub last_period_start: NaiveDate,
    /// Weighted mean squared training error in normalized units
    pub training_loss: f64,
}

impl ModelState {
    /// Assemble a state, keeping a bounded tail of the series
    pub(crate) fn new(
        model: &str,
        series: &TimeSeries,
        window: usize,
        coefficients: Vec<f64>,
        intercept: f64,
        scaler: MinMaxScaler,
        training_loss: f64,
    ) -> Result<Self> {
        let last = series
            .last()
            .ok_or(Error::InsufficientData {
                required: window.max(1),
                actual: 0,
            })?
            .start;
        let values = series.values();
        let keep = values.len().min(TAIL_LIMIT.max(window));

        Ok(Self {
            model: model.to_string(),
            period: series.period,
            window,
            coefficients,
            intercept,
            scaler,
            tail: values[values.len() - keep..].to_vec(),
            last_period_start: last,
            training_loss,
        })
    }

    /// One-step prediction from the trailing `window` raw values of `history`
    pub fn step(&self, history: &[f64]) -> Result<f64> {
        if history.len() < self.window {
            return Err(Error::InsufficientData {
                required: self.window,
                actual: history.len(),
            });
        }
        let inputs = &history[history.len() - self.window..];
        let normalized = self.intercept
            + self
                .coefficients
                .iter()
                .zip(inputs)
                .map(|(c, x)| c * self.scaler.transform(*x))
                .sum::<f64>();
        let value = self.scaler.inverse(normalized);

        if !value.is_finite() {
            return Err(Error::ModelFit(format!(
                "{} produced a non-finite prediction",
                self.model
            )));
        }
        Ok(value.max(0.0))
    }
}

/// Percent change from `last_observed` to `predicted`
///
/// When nothing was observed the change is defined as 100% for any positive
/// prediction and 0% otherwise.
pub fn percent_change(predicted: f64, last_observed: f64) -> f64 {
    if last_observed == 0.0 {
        if predicted > 0.0 {
            100.0
        } else {
            0.0
        }
    } else {
        (predicted - last_observed) / last_observed * 100.0
    }
}

/// Forecast `horizon` periods with the default trend threshold
pub fn predict(state: &ModelState, horizon: usize) -> Result<ForecastResult> {
    predict_with_threshold(state, horizon, DEFAULT_TREND_THRESHOLD_PCT)
}

/// Forecast `horizon` periods, feeding each prediction back as input
///
/// `predicted_amount` is the total over the horizon and is compared against
/// the total of the last `horizon` observed periods.
pub fn predict_with_threshold(
    state: &ModelState,
    horizon: usize,
    trend_threshold_pct: f64,
) -> Result<ForecastResult> {
    if horizon == 0 {
        return Err(Error::InvalidData("Forecast horizon must be at least 1".into()));
    }

    let mut history = state.tail.clone();
    let mut per_period = Vec::with_capacity(horizon);
    let mut start = state.last_period_start;

    for _ in 0..horizon {
        let amount = state.step(&history)?;
        start = state.period.next(start);
        per_period.push(PeriodForecast { start, amount });
        history.push(amount);
    }

    let predicted_amount: f64 = per_period.iter().map(|p| p.amount).sum();
    let observed = horizon.min(state.tail.len());
    let last_observed_amount: f64 = state.tail[state.tail.len() - observed..].iter().sum();
    let change = percent_change(predicted_amount, last_observed_amount);

    Ok(ForecastResult {
        generated_at: Utc::now(),
        model: state.model.clone(),
        period: state.period,
        horizon,
        predicted_amount,
        last_observed_amount,
        percent_change: change,
        trend: Trend::classify(change, trend_threshold_pct),
        per_period,
        accuracy_report: None,
    })
}

/// Score a forecaster on the most recent `holdout` periods
///
/// Trains on everything before the holdout, then predicts each held-out
/// period one step ahead from the actual preceding values. MAPE skips
/// periods with zero actual spend; when every held-out period is zero there
/// is nothing to score and `None` is returned.
pub fn evaluate_holdout(
    forecaster: &dyn Forecaster,
    series: &TimeSeries,
    holdout: usize,
) -> Result<Option<AccuracyReport>> {
    if holdout == 0 {
        return Ok(None);
    }

    let (train, test) = series.split_at(holdout);
    let state = forecaster.fit(&train)?;
    let values = series.values();

    let mut predictions = Vec::with_capacity(test.len());
    for i in 0..test.len() {
        predictions.push(state.step(&values[..train.len() + i])?);
    }

    Ok(score(&test.values(), &predictions))
}

/// Score a forecaster with k-fold cross-validation
///
/// The series is cut into `folds` consecutive blocks of `len / folds`
/// periods. Each block is held out in turn while the model trains on the
/// remaining periods joined end to end. Held-out periods are predicted one
/// step ahead, starting from the last `window` training values. Leftover
/// periods past the last block are always trained on.
///
/// Returns `None` when no fold has a non-zero period to score.
pub fn evaluate_cross_validation(
    forecaster: &dyn Forecaster,
    series: &TimeSeries,
    folds: usize,
) -> Result<Option<CrossValidationReport>> {
    if folds < 2 {
        return Err(Error::InvalidData(format!(
            "Cross-validation needs at least 2 folds, got {}",
            folds
        )));
    }
    if series.len() < CROSS_VALIDATION_MIN_PERIODS {
        return Err(Error::InsufficientData {
            required: CROSS_VALIDATION_MIN_PERIODS,
            actual: series.len(),
        });
    }
    let fold_periods = series.len() / folds;
    if fold_periods == 0 {
        return Err(Error::InvalidData(format!(
            "{} folds is more than the {} periods available",
            folds,
            series.len()
        )));
    }

    let window = forecaster.window();
    let mut reports = Vec::with_capacity(folds);
    for fold in 0..folds {
        let (start, end) = (fold * fold_periods, (fold + 1) * fold_periods);
        let train = TimeSeries {
            period: series.period,
            points: series.points[..start]
                .iter()
                .chain(&series.points[end..])
                .copied()
                .collect(),
        };
        let held_out: Vec<f64> = series.points[start..end].iter().map(|p| p.total).collect();

        let state = forecaster.fit(&train)?;
        let train_values = train.values();
        let mut history = train_values[train_values.len().saturating_sub(window)..].to_vec();
        let mut predictions = Vec::with_capacity(held_out.len());
        for actual in &held_out {
            predictions.push(state.step(&history)?);
            history.push(*actual);
        }

        let report = score(&held_out, &predictions);
        debug!(
            fold = fold + 1,
            folds,
            mape = report.as_ref().map(|r| r.mape),
            "Scored cross-validation fold"
        );
        reports.push(report);
    }

    let scored: Vec<&AccuracyReport> = reports.iter().flatten().collect();
    if scored.is_empty() {
        return Ok(None);
    }
    let mean = |f: fn(&AccuracyReport) -> f64| {
        scored.iter().map(|r| f(r)).sum::<f64>() / scored.len() as f64
    };
    let weekly: Vec<f64> = scored.iter().filter_map(|r| r.weekly_error_pct).collect();
    let mape = mean(|r| r.mape);

    let average = AccuracyReport {
        mape,
        mae: mean(|r| r.mae),
        rmse: mean(|r| r.rmse),
        r2: mean(|r| r.r2),
        weekly_error_pct: (!weekly.is_empty())
            .then(|| weekly.iter().sum::<f64>() / weekly.len() as f64),
        holdout_periods: fold_periods,
        rating: AccuracyRating::from_mape(mape),
    };

    Ok(Some(CrossValidationReport {
        fold_periods,
        folds: reports,
        average,
    }))
}

/// Error metrics for one-step predictions
///
/// Percentage errors skip zero actuals. None when every actual is zero.
fn score(actuals: &[f64], predictions: &[f64]) -> Option<AccuracyReport> {
    let pct_errors: Vec<f64> = actuals
        .iter()
        .zip(predictions)
        .filter(|(a, _)| **a > 0.0)
        .map(|(a, p)| (a - p).abs() / a)
        .collect();
    if pct_errors.is_empty() {
        return None;
    }

    let n = actuals.len() as f64;
    let mape = pct_errors.iter().sum::<f64>() / pct_errors.len() as f64 * 100.0;
    let mae = actuals
        .iter()
        .zip(predictions)
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / n;
    let ss_res: f64 = actuals
        .iter()
        .zip(predictions)
        .map(|(a, p)| (a - p) * (a - p))
        .sum();
    let rmse = (ss_res / n).sqrt();

    let mean = actuals.iter().sum::<f64>() / n;
    let ss_tot: f64 = actuals.iter().map(|a| (a - mean) * (a - mean)).sum();
    // Constant actuals: a perfect fit scores 1, anything else 0
    let r2 = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };

    let weekly: Vec<f64> = actuals
        .chunks_exact(WEEK)
        .zip(predictions.chunks_exact(WEEK))
        .map(|(a, p)| (a.iter().sum::<f64>(), p.iter().sum::<f64>()))
        .filter(|(a, _)| *a > 0.0)
        .map(|(a, p)| (a - p).abs() / a)
        .collect();
    let weekly_error_pct =
        (!weekly.is_empty()).then(|| weekly.iter().sum::<f64>() / weekly.len() as f64 * 100.0);

    Some(AccuracyReport {
        mape,
        mae,
        rmse,
        r2,
        weekly_error_pct,
        holdout_periods: actuals.len(),
        rating: AccuracyRating::from_mape(mape),
    })
}

/// User-facing summary of a forecast
pub fn narrative(result: &ForecastResult) -> String {
    let rounded = (result.predicted_amount / 10.0).round() * 10.0;
    let upcoming = result.period.describe(result.horizon);
    let previous = previous_label(result.period, result.horizon);

    let comparison = match result.trend {
        Trend::Flat => format!("about the same as {}", previous),
        Trend::Increase => format!(
            "{:.0}% higher than {}",
            result.percent_change.abs(),
            previous
        ),
        Trend::Decrease => format!(
            "{:.0}% lower than {}",
            result.percent_change.abs(),
            previous
        ),
    };

    format!(
        "Based on your history, you're projected to spend {} {}, which is {}.",
        format_currency(rounded),
        upcoming,
        comparison
    )
}

fn previous_label(period: Period, count: usize) -> String {
    match (period, count) {
        (Period::Day, 1) => "today".to_string(),
        (Period::Month, 1) => "this month".to_string(),
        (Period::Day, n) => format!("the last {} days", n),
        (Period::Month, n) => format!("the last {} months", n),
    }
}

/// Format a whole-dollar amount with thousands separators ("$1,240")
pub fn format_currency(amount: f64) -> String {
    let whole = amount.round().abs() as u64;
    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if amount < 0.0 && whole > 0 {
        format!("-${}", grouped)
    } else {
        format!("${}", grouped)
    }
}
