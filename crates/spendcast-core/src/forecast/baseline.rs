//! Moving-average baseline
//!
//! Predicts the mean of the last `window` periods. Expressed as a linear
//! model state (equal coefficients, identity scaler) so it shares the
//! prediction and persistence paths with the regressor.

use super::{Forecaster, MinMaxScaler, ModelState};
use crate::error::{Error, Result};
use crate::models::TimeSeries;

#[derive(Debug, Clone)]
pub struct MovingAverage {
    pub window: usize,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        Self { window }
    }
}

impl Forecaster for MovingAverage {
    fn name(&self) -> &'static str {
        "moving_average"
    }

    fn window(&self) -> usize {
        self.window
    }

    fn fit(&self, series: &TimeSeries) -> Result<ModelState> {
        if self.window == 0 || series.len() < self.window {
            return Err(Error::InsufficientData {
                required: self.window.max(1),
                actual: series.len(),
            });
        }

        let coefficients = vec![1.0 / self.window as f64; self.window];
        ModelState::new(
            self.name(),
            series,
            self.window,
            coefficients,
            0.0,
            MinMaxScaler::identity(),
            0.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Period, SeriesPoint};
    use chrono::NaiveDate;

    #[test]
    fn test_moving_average_step() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let series = TimeSeries {
            period: Period::Day,
            points: [10.0, 20.0, 30.0, 40.0]
                .iter()
                .enumerate()
                .map(|(i, v)| SeriesPoint {
                    start: start + chrono::Duration::days(i as i64),
                    total: *v,
                })
                .collect(),
        };

        let state = MovingAverage::new(2).fit(&series).unwrap();
        assert_eq!(state.model, "moving_average");
        assert!((state.step(&series.values()).unwrap() - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_moving_average_needs_full_window() {
        let series = TimeSeries {
            period: Period::Day,
            points: vec![],
        };
        assert!(MovingAverage::new(3).fit(&series).is_err());
    }
}
