//! Robust windowed regression
//!
//! Each training row is a sliding window of `window` normalized period totals
//! and the target is the period that follows it. The coefficients are fitted
//! by ridge-regularized least squares and then refined with iteratively
//! reweighted least squares under a Huber loss, so a one-off spike only
//! contributes linearly to the fit instead of quadratically.
//!
//! The fit is closed form and deterministic.

use tracing::debug;

use super::{Forecaster, MinMaxScaler, ModelState};
use crate::config::ForecastConfig;
use crate::error::{Error, Result};
use crate::models::TimeSeries;

/// MAD to standard deviation for normally distributed residuals
const MAD_TO_SIGMA: f64 = 0.6745;

/// Lower bound on the residual scale
const MIN_SCALE: f64 = 1e-6;

/// Lower bound on the residual scale as a fraction of the target spread.
/// A near-perfect fit must not turn ordinary rows into outliers.
const RELATIVE_MIN_SCALE: f64 = 1e-3;

/// Pivots smaller than this are treated as a singular system
const PIVOT_EPSILON: f64 = 1e-12;

/// Autoregressive regressor over sliding windows of the series
#[derive(Debug, Clone)]
pub struct WindowedRegressor {
    pub window: usize,
    pub ridge_lambda: f64,
    pub huber_k: f64,
    pub irls_iterations: usize,
}

impl Default for WindowedRegressor {
    fn default() -> Self {
        Self::from_config(&ForecastConfig::default())
    }
}

impl WindowedRegressor {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    pub fn from_config(config: &ForecastConfig) -> Self {
        Self {
            window: config.window,
            ridge_lambda: config.ridge_lambda,
            huber_k: config.huber_k,
            irls_iterations: config.irls_iterations,
        }
    }

    /// Build (inputs, targets) training rows from normalized values
    fn training_rows(&self, normalized: &[f64]) -> (Vec<Vec<f64>>, Vec<f64>) {
        let rows = normalized.len() - self.window;
        let mut inputs = Vec::with_capacity(rows);
        let mut targets = Vec::with_capacity(rows);
        for i in 0..rows {
            inputs.push(normalized[i..i + self.window].to_vec());
            targets.push(normalized[i + self.window]);
        }
        (inputs, targets)
    }

    /// Huber weights with the residual scale floored at `min_scale`
    fn huber_weights(&self, residuals: &[f64], min_scale: f64) -> Vec<f64> {
        let mut abs: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
        let scale = (median(&mut abs) / MAD_TO_SIGMA).max(min_scale);
        let threshold = self.huber_k * scale;

        residuals
            .iter()
            .map(|r| {
                let a = r.abs();
                if a <= threshold {
                    1.0
                } else {
                    threshold / a
                }
            })
            .collect()
    }
}

impl Forecaster for WindowedRegressor {
    fn name(&self) -> &'static str {
        "windowed_regression"
    }

    fn window(&self) -> usize {
        self.window
    }

    fn fit(&self, series: &TimeSeries) -> Result<ModelState> {
        let values = series.values();
        let required = self.window + 2;
        if self.window == 0 || values.len() < required {
            return Err(Error::InsufficientData {
                required,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::ModelFit(
                "Series contains non-finite totals".to_string(),
            ));
        }

        let scaler = MinMaxScaler::fit(&values);
        let normalized: Vec<f64> = values.iter().map(|v| scaler.transform(*v)).collect();
        let (inputs, targets) = self.training_rows(&normalized);

        let spread = targets.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            - targets.iter().cloned().fold(f64::INFINITY, f64::min);
        let min_scale = (RELATIVE_MIN_SCALE * spread).max(MIN_SCALE);

        let mut weights = vec![1.0; targets.len()];
        let mut beta = solve_weighted_ridge(&inputs, &targets, &weights, self.ridge_lambda)?;
        let mut iterations = 0;

        for _ in 0..self.irls_iterations {
            let residuals = residuals(&inputs, &targets, &beta);
            if residuals.iter().all(|r| r.abs() < PIVOT_EPSILON) {
                break;
            }

            let next = self.huber_weights(&residuals, min_scale);
            let shift = next
                .iter()
                .zip(&weights)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            weights = next;
            beta = solve_weighted_ridge(&inputs, &targets, &weights, self.ridge_lambda)?;
            iterations += 1;

            if shift < 1e-6 {
                break;
            }
        }

        let final_residuals = residuals(&inputs, &targets, &beta);
        let weight_sum: f64 = weights.iter().sum();
        let loss = final_residuals
            .iter()
            .zip(&weights)
            .map(|(r, w)| w * r * r)
            .sum::<f64>()
            / weight_sum.max(PIVOT_EPSILON);

        if !loss.is_finite() || beta.iter().any(|b| !b.is_finite()) {
            return Err(Error::ModelFit(format!(
                "Training diverged (loss = {})",
                loss
            )));
        }

        debug!(
            rows = targets.len(),
            iterations,
            loss,
            "Fitted windowed regressor"
        );

        let intercept = beta[self.window];
        beta.truncate(self.window);
        ModelState::new(self.name(), series, self.window, beta, intercept, scaler, loss)
    }
}

/// Residuals of `targets` against the augmented coefficient vector
fn residuals(inputs: &[Vec<f64>], targets: &[f64], beta: &[f64]) -> Vec<f64> {
    let intercept = beta[beta.len() - 1];
    inputs
        .iter()
        .zip(targets)
        .map(|(x, y)| {
            let predicted = intercept + x.iter().zip(beta).map(|(a, b)| a * b).sum::<f64>();
            y - predicted
        })
        .collect()
}

/// Solve the weighted ridge normal equations
///
/// Returns `window + 1` values with the intercept last. The intercept is not
/// penalized.
fn solve_weighted_ridge(
    inputs: &[Vec<f64>],
    targets: &[f64],
    weights: &[f64],
    lambda: f64,
) -> Result<Vec<f64>> {
    let p = inputs.first().map(|x| x.len()).unwrap_or(0) + 1;
    let mut a = vec![vec![0.0; p]; p];
    let mut b = vec![0.0; p];

    for ((x, y), w) in inputs.iter().zip(targets).zip(weights) {
        for i in 0..p {
            let xi = if i + 1 == p { 1.0 } else { x[i] };
            b[i] += w * xi * y;
            for j in 0..p {
                let xj = if j + 1 == p { 1.0 } else { x[j] };
                a[i][j] += w * xi * xj;
            }
        }
    }
    for (i, row) in a.iter_mut().enumerate().take(p - 1) {
        row[i] += lambda;
    }

    gaussian_solve(a, b)
}

/// Gaussian elimination with partial pivoting
fn gaussian_solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if !a[pivot_row][col].is_finite() || a[pivot_row][col].abs() < PIVOT_EPSILON {
            return Err(Error::ModelFit(
                "Normal equations are singular".to_string(),
            ));
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::predict;
    use crate::test_utils::{alternating_with_spike, daily_series};

    #[test]
    fn test_gaussian_solve() {
        // 2x + y = 5, x + 3y = 10
        let x = gaussian_solve(vec![vec![2.0, 1.0], vec![1.0, 3.0]], vec![5.0, 10.0]).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_gaussian_solve_singular() {
        let result = gaussian_solve(vec![vec![1.0, 2.0], vec![2.0, 4.0]], vec![1.0, 2.0]);
        assert!(matches!(result, Err(Error::ModelFit(_))));
    }

    #[test]
    fn test_fit_requires_window_plus_two() {
        let err = WindowedRegressor::new(7).fit(&daily_series(&[1.0; 8])).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientData {
                required: 9,
                actual: 8
            }
        ));
    }

    #[test]
    fn test_fit_rejects_non_finite() {
        let mut values = vec![10.0; 20];
        values[5] = f64::INFINITY;
        let err = WindowedRegressor::new(3).fit(&daily_series(&values)).unwrap_err();
        assert!(matches!(err, Error::ModelFit(_)));
    }

    #[test]
    fn test_constant_series_predicts_constant() {
        let state = WindowedRegressor::new(7).fit(&daily_series(&[25.0; 40])).unwrap();
        let result = predict(&state, 1).unwrap();
        assert!((result.predicted_amount - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let values: Vec<f64> = (0..60).map(|i| 40.0 + (i % 7) as f64 * 3.0).collect();
        let s = daily_series(&values);
        let a = WindowedRegressor::new(7).fit(&s).unwrap();
        let b = WindowedRegressor::new(7).fit(&s).unwrap();
        assert_eq!(a.coefficients, b.coefficients);
        assert_eq!(a.intercept, b.intercept);
    }

    #[test]
    fn test_weekly_pattern_is_learned() {
        let pattern = [20.0, 20.0, 20.0, 20.0, 20.0, 80.0, 80.0];
        let values: Vec<f64> = (0..70).map(|i| pattern[i % 7]).collect();
        let state = WindowedRegressor::new(7).fit(&daily_series(&values)).unwrap();

        // Next day follows index 70, which is pattern[0]
        let result = predict(&state, 1).unwrap();
        assert!(
            (result.predicted_amount - 20.0).abs() < 5.0,
            "predicted {}",
            result.predicted_amount
        );
    }

    #[test]
    fn test_spike_does_not_dominate() {
        let values = alternating_with_spike();
        let state = WindowedRegressor::new(7).fit(&daily_series(&values)).unwrap();

        let result = predict(&state, 1).unwrap();
        assert!(
            result.predicted_amount > 45.0 && result.predicted_amount < 65.0,
            "predicted {}",
            result.predicted_amount
        );
    }

    #[test]
    fn test_huber_weights_downweight_outliers() {
        let regressor = WindowedRegressor::new(3);
        let residuals = [0.01, -0.02, 0.015, -0.01, 2.0];
        let weights = regressor.huber_weights(&residuals, MIN_SCALE);
        assert_eq!(weights[0], 1.0);
        assert!(weights[4] < 0.1);
    }

    #[test]
    fn test_huber_weights_respect_scale_floor() {
        let regressor = WindowedRegressor::new(3);
        // Near-zero median residual; rows within the floor keep full weight
        let residuals = [0.0, 0.0, 0.0, 1e-4, -2e-4, 0.5];
        let weights = regressor.huber_weights(&residuals, 1e-3);
        assert_eq!(&weights[..5], &[1.0; 5]);
        assert!(weights[5] < 0.01);
    }

    #[test]
    fn test_sparse_weekly_spending_is_reproduced() {
        // Spending only one day a week, 12 weeks
        let values: Vec<f64> = (0..84)
            .map(|i| if i % 7 == 0 { 140.0 } else { 0.0 })
            .collect();
        let state = WindowedRegressor::new(7).fit(&daily_series(&values)).unwrap();

        let result = predict(&state, 30).unwrap();
        let first_week: Vec<f64> = result.per_period[..7].iter().map(|p| p.amount).collect();
        assert!((first_week[0] - 140.0).abs() < 1.0, "first week {:?}", first_week);
        assert!(first_week[1..].iter().all(|v| *v < 1.0), "first week {:?}", first_week);
        // Days 84..=113 hold five spending days
        assert!(
            (result.predicted_amount - 700.0).abs() < 5.0,
            "predicted {}",
            result.predicted_amount
        );
    }
}
