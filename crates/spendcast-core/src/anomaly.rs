//! Anomaly scoring
//!
//! Scores each observation by how far it sits from the user's typical
//! spending. Every call fits a fresh scorer to a single user's data: spending
//! scales vary by orders of magnitude between users, so statistics are never
//! shared across users.
//!
//! ## Methods
//!
//! - **Robust z-score** (default): distance from the median in units of the
//!   scaled median absolute deviation
//! - **IQR**: distance outside the interquartile range in units of the IQR
//!
//! An observation is anomalous when its deviation exceeds the configured
//! quantile of all deviations, never less than a per-method floor. The floor
//! keeps well-behaved series from always flagging their top 5%.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AnomalyConfig;
use crate::models::{AnomalyFlag, AnomalySubject, ExpenseRecord, TimeSeries};

/// MAD scale factor for normally distributed data
const MAD_SCALE: f64 = 1.4826;

/// Mean absolute deviation scale factor for normally distributed data
const MEAN_AD_SCALE: f64 = 1.2533;

/// IQR of a unit normal distribution
const IQR_SIGMAS: f64 = 1.349;

const EPSILON: f64 = 1e-9;

/// Deviation measure used by the scorer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyMethod {
    #[serde(rename = "robust_zscore")]
    RobustZScore,
    #[serde(rename = "iqr")]
    Iqr,
}

impl AnomalyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RobustZScore => "robust_zscore",
            Self::Iqr => "iqr",
        }
    }
}

impl std::str::FromStr for AnomalyMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "robust_zscore" | "zscore" | "mad" => Ok(Self::RobustZScore),
            "iqr" => Ok(Self::Iqr),
            _ => Err(format!("Unknown anomaly method: {}", s)),
        }
    }
}

impl std::fmt::Display for AnomalyMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Location and spread of a user's observations
#[derive(Debug, Clone, Copy)]
struct Spread {
    /// Values between `low` and `high` have zero deviation
    low: f64,
    high: f64,
    scale: f64,
}

impl Spread {
    fn deviation(&self, value: f64) -> f64 {
        if value < self.low {
            (self.low - value) / self.scale
        } else if value > self.high {
            (value - self.high) / self.scale
        } else {
            0.0
        }
    }
}

/// Per-user anomaly scorer
#[derive(Debug, Clone)]
pub struct AnomalyScorer {
    config: AnomalyConfig,
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        Self::new(AnomalyConfig::default())
    }
}

impl AnomalyScorer {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Score every period of a series
    pub fn score_series(&self, series: &TimeSeries) -> Vec<AnomalyFlag> {
        let observations: Vec<(AnomalySubject, f64)> = series
            .points
            .iter()
            .map(|p| (AnomalySubject::Period(p.start), p.total))
            .collect();
        self.score(observations)
    }

    /// Score individual transactions, oldest first
    pub fn score_transactions(&self, records: &[ExpenseRecord]) -> Vec<AnomalyFlag> {
        let mut sorted: Vec<&ExpenseRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));

        let observations: Vec<(AnomalySubject, f64)> = sorted
            .into_iter()
            .map(|r| (AnomalySubject::Transaction(r.id.clone()), r.amount))
            .collect();
        self.score(observations)
    }

    fn score(&self, observations: Vec<(AnomalySubject, f64)>) -> Vec<AnomalyFlag> {
        if observations.len() < self.config.min_samples.max(1) {
            debug!(
                samples = observations.len(),
                min_samples = self.config.min_samples,
                "Too few observations for anomaly scoring"
            );
            return Vec::new();
        }

        let values: Vec<f64> = observations.iter().map(|(_, v)| *v).collect();
        let reported = self
            .config
            .evaluation_periods
            .map(|n| n.min(observations.len()))
            .unwrap_or(observations.len());
        let skip = observations.len() - reported;

        let spread = match self.spread(&values) {
            Some(spread) => spread,
            None => {
                // Constant data has no deviation to score
                return observations
                    .into_iter()
                    .skip(skip)
                    .map(|(subject, value)| AnomalyFlag {
                        subject,
                        observed_amount: value,
                        expected_low: value,
                        expected_high: value,
                        severity_score: 0.0,
                        is_anomaly: false,
                    })
                    .collect();
            }
        };

        let deviations: Vec<f64> = values.iter().map(|v| spread.deviation(*v)).collect();
        let cutoff = quantile(&deviations, self.config.quantile).max(self.floor());
        let expected_low = (spread.low - cutoff * spread.scale).max(0.0);
        let expected_high = spread.high + cutoff * spread.scale;

        let flags: Vec<AnomalyFlag> = observations
            .into_iter()
            .zip(deviations)
            .skip(skip)
            .map(|((subject, value), d)| {
                let severity = if d + cutoff > 0.0 { d / (d + cutoff) } else { 0.0 };
                AnomalyFlag {
                    subject,
                    observed_amount: value,
                    expected_low,
                    expected_high,
                    severity_score: severity,
                    is_anomaly: d > cutoff,
                }
            })
            .collect();

        debug!(
            method = self.config.method.as_str(),
            observations = values.len(),
            cutoff,
            flagged = flags.iter().filter(|f| f.is_anomaly).count(),
            "Scored anomalies"
        );

        flags
    }

    fn floor(&self) -> f64 {
        match self.config.method {
            AnomalyMethod::RobustZScore => self.config.min_robust_z,
            AnomalyMethod::Iqr => self.config.iqr_multiplier,
        }
    }

    /// None when the data has no spread at all
    fn spread(&self, values: &[f64]) -> Option<Spread> {
        let center = quantile(values, 0.5);
        let abs_dev: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
        let mean_ad = abs_dev.iter().sum::<f64>() / abs_dev.len() as f64;

        match self.config.method {
            AnomalyMethod::RobustZScore => {
                let mut scale = quantile(&abs_dev, 0.5) * MAD_SCALE;
                if scale < EPSILON {
                    scale = mean_ad * MEAN_AD_SCALE;
                }
                (scale >= EPSILON).then_some(Spread {
                    low: center,
                    high: center,
                    scale,
                })
            }
            AnomalyMethod::Iqr => {
                let q1 = quantile(values, 0.25);
                let q3 = quantile(values, 0.75);
                let mut scale = q3 - q1;
                if scale < EPSILON {
                    scale = mean_ad * MEAN_AD_SCALE * IQR_SIGMAS;
                }
                (scale >= EPSILON).then_some(Spread {
                    low: q1,
                    high: q3,
                    scale,
                })
            }
        }
    }
}

/// Quantile with linear interpolation between closest ranks
fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{alternating_with_spike, daily_series};
    use chrono::NaiveDate;

    fn scorer(method: AnomalyMethod, quantile: f64) -> AnomalyScorer {
        AnomalyScorer::new(AnomalyConfig {
            method,
            quantile,
            ..AnomalyConfig::default()
        })
    }

    fn spiky() -> TimeSeries {
        daily_series(&alternating_with_spike())
    }

    #[test]
    fn test_quantile_interpolates() {
        assert_eq!(quantile(&[1.0, 2.0, 3.0, 4.0], 0.5), 2.5);
        assert_eq!(quantile(&[4.0, 1.0, 3.0], 0.0), 1.0);
        assert_eq!(quantile(&[4.0, 1.0, 3.0], 1.0), 4.0);
    }

    #[test]
    fn test_constant_series_never_flags() {
        for method in [AnomalyMethod::RobustZScore, AnomalyMethod::Iqr] {
            for q in [0.01, 0.5, 0.95, 0.999] {
                let flags = scorer(method, q).score_series(&daily_series(&[42.0; 30]));
                assert_eq!(flags.len(), 30);
                assert!(flags.iter().all(|f| !f.is_anomaly && f.severity_score == 0.0));
            }
        }
    }

    #[test]
    fn test_too_few_samples_returns_empty() {
        let flags = AnomalyScorer::default().score_series(&daily_series(&[1.0, 500.0, 2.0]));
        assert!(flags.is_empty());
    }

    #[test]
    fn test_robust_zscore_flags_only_spike() {
        let flags = AnomalyScorer::default().score_series(&spiky());

        let flagged: Vec<usize> = flags
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_anomaly)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flagged, vec![45]);
        assert!(flags[45].severity_score > 0.5);
        assert!(flags[44].severity_score < 0.5);
        assert!(flags[45].expected_high < 500.0);
    }

    #[test]
    fn test_iqr_flags_only_spike() {
        let flags = scorer(AnomalyMethod::Iqr, 0.95).score_series(&spiky());
        let flagged: Vec<usize> = flags
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_anomaly)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flagged, vec![45]);
    }

    #[test]
    fn test_mostly_constant_uses_fallback_spread() {
        let mut values = vec![20.0; 30];
        values[10] = 400.0;
        let flags = AnomalyScorer::default().score_series(&daily_series(&values));
        assert!(flags[10].is_anomaly);
        assert_eq!(flags.iter().filter(|f| f.is_anomaly).count(), 1);
    }

    #[test]
    fn test_severity_in_unit_range() {
        let flags = AnomalyScorer::default().score_series(&spiky());
        assert!(flags
            .iter()
            .all(|f| (0.0..=1.0).contains(&f.severity_score)));
        assert!(flags.iter().all(|f| f.expected_low >= 0.0));
    }

    #[test]
    fn test_evaluation_periods_limits_output() {
        let scorer = AnomalyScorer::new(AnomalyConfig {
            evaluation_periods: Some(7),
            ..AnomalyConfig::default()
        });
        let flags = scorer.score_series(&spiky());
        assert_eq!(flags.len(), 7);
        assert_eq!(
            flags[6].subject,
            AnomalySubject::Period(NaiveDate::from_ymd_opt(2024, 3, 30).unwrap())
        );
    }

    #[test]
    fn test_score_transactions() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut records: Vec<ExpenseRecord> = (0..20)
            .map(|i| {
                ExpenseRecord::new(
                    format!("t{:02}", i),
                    "alice",
                    day + chrono::Duration::days(i),
                    12.0 + (i % 3) as f64,
                    None,
                    "COFFEE",
                )
                .unwrap()
            })
            .collect();
        records.push(ExpenseRecord::new("big", "alice", day, 950.0, None, "TV").unwrap());

        let flags = AnomalyScorer::default().score_transactions(&records);
        assert_eq!(flags.len(), 21);
        let anomalous: Vec<&AnomalyFlag> = flags.iter().filter(|f| f.is_anomaly).collect();
        assert_eq!(anomalous.len(), 1);
        assert_eq!(
            anomalous[0].subject,
            AnomalySubject::Transaction("big".to_string())
        );
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("iqr".parse::<AnomalyMethod>().unwrap(), AnomalyMethod::Iqr);
        assert_eq!(
            "robust-zscore".parse::<AnomalyMethod>().unwrap(),
            AnomalyMethod::RobustZScore
        );
        assert!("isolation_forest".parse::<AnomalyMethod>().is_err());
    }
}
