//! Per-user pipeline
//!
//! Extractor, then forecaster, anomaly scorer and classifier, then publisher.
//! [`Pipeline::compute`] is side-effect free so callers (the scheduler in
//! particular) can run it under a timeout and throw the result away;
//! nothing is published until [`Pipeline::publish`] is called.

use std::time::Instant;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::anomaly::AnomalyScorer;
use crate::classify::CategoryClassifier;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::forecast::{evaluate_holdout, predict_with_threshold, ModelChoice, ModelState};
use crate::models::{
    AnomalyFlag, CategorySuggestion, DateRange, ExpenseRecord, ForecastResult, TimeSeries,
};
use crate::publish::{ArtifactHandle, ArtifactStore};
use crate::series::build_series;

/// Everything one run produced for a user
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub user_id: String,
    pub series: TimeSeries,
    pub state: ModelState,
    pub forecast: ForecastResult,
    /// One flag per scored period
    pub anomalies: Vec<AnomalyFlag>,
    pub suggestions: Vec<CategorySuggestion>,
}

impl RunOutput {
    /// Flags that passed the anomaly cutoff
    pub fn flagged(&self) -> Vec<AnomalyFlag> {
        self.anomalies.iter().filter(|f| f.is_anomaly).cloned().collect()
    }
}

/// Pipeline over a configuration and an artifact store
pub struct Pipeline {
    config: PipelineConfig,
    store: ArtifactStore,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: ArtifactStore) -> Self {
        Self { config, store }
    }

    /// Pipeline with the artifact store named in the config
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let store = ArtifactStore::from_config(&config.publisher)?;
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Date range to read for a user, anchored at their latest expense
    ///
    /// None when the user has no expenses.
    pub fn history_range(&self, records: &[ExpenseRecord]) -> Option<DateRange> {
        let span = DateRange::spanning(records)?;
        Some(match self.config.series.lookback_days {
            Some(days) => {
                // Lookbacks reaching past the calendar just keep the full span
                let start = Duration::try_days(days.saturating_sub(1))
                    .and_then(|back| span.end.checked_sub_signed(back))
                    .unwrap_or(span.start);
                DateRange::new(start.max(span.start), span.end)
            }
            None => span,
        })
    }

    /// Run every stage for one user without publishing
    ///
    /// Records belonging to other users are ignored.
    pub fn compute(
        &self,
        user_id: &str,
        records: &[ExpenseRecord],
        model: ModelChoice,
    ) -> Result<RunOutput> {
        let started = Instant::now();
        let records: Vec<ExpenseRecord> = records
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();

        let range = self.history_range(&records).ok_or(Error::InsufficientData {
            required: self.config.series.min_periods.max(1),
            actual: 0,
        })?;
        let in_range: Vec<ExpenseRecord> = records
            .into_iter()
            .filter(|r| range.contains(r.date))
            .collect();

        let series = build_series(
            &in_range,
            self.config.series.period,
            range,
            self.config.series.min_periods,
        )?;

        let forecast_config = &self.config.forecast;
        let forecaster = model.build(forecast_config);
        let state = forecaster.fit(&series)?;

        let accuracy =
            match evaluate_holdout(forecaster.as_ref(), &series, forecast_config.holdout_periods) {
                Ok(report) => report,
                Err(e) => {
                    warn!(user = user_id, error = %e, "Holdout evaluation failed");
                    None
                }
            };

        let mut forecast = predict_with_threshold(
            &state,
            forecast_config.horizon,
            forecast_config.trend_threshold_pct,
        )?;
        forecast.accuracy_report = accuracy;

        let anomalies = AnomalyScorer::new(self.config.anomaly.clone()).score_series(&series);

        let suggestions = match CategoryClassifier::train(&in_range, &self.config.classifier) {
            Ok(classifier) => classifier.suggest_all(&in_range),
            Err(Error::InsufficientData { required, actual }) => {
                debug!(
                    user = user_id,
                    required, actual, "Not enough labelled expenses for suggestions"
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        info!(
            user = user_id,
            model = forecaster.name(),
            periods = series.len(),
            predicted = forecast.predicted_amount,
            trend = %forecast.trend,
            anomalies = anomalies.iter().filter(|f| f.is_anomaly).count(),
            suggestions = suggestions.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Computed forecast"
        );

        Ok(RunOutput {
            user_id: user_id.to_string(),
            series,
            state,
            forecast,
            anomalies,
            suggestions,
        })
    }

    /// Publish a run's artifact and model state
    pub fn publish(&self, output: &RunOutput) -> Result<ArtifactHandle> {
        let handle = self.store.publish(
            &output.user_id,
            &output.forecast,
            &output.flagged(),
            &output.suggestions,
        )?;

        // The artifact is authoritative; a stale model only costs a refit
        if let Err(e) = self.store.save_model_state(&output.user_id, &output.state) {
            warn!(user = %output.user_id, error = %e, "Failed to save model state");
        }

        Ok(handle)
    }

    /// Compute, then publish
    pub fn run_and_publish(
        &self,
        user_id: &str,
        records: &[ExpenseRecord],
        model: ModelChoice,
    ) -> Result<ArtifactHandle> {
        let output = self.compute(user_id, records, model)?;
        self.publish(&output)
    }

    /// Forecast from the saved model state without retraining
    pub fn forecast_saved(&self, user_id: &str, horizon: usize) -> Result<ForecastResult> {
        let state = self.store.load_model_state(user_id)?;
        predict_with_threshold(&state, horizon, self.config.forecast.trend_threshold_pct)
    }
}
