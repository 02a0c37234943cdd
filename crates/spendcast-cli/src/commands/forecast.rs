//! Ad-hoc analysis commands (forecast, anomalies, suggest)
//!
//! These run the pipeline stages against the store without publishing.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use spendcast_core::forecast::format_currency;
use spendcast_core::{
    build_series, evaluate_cross_validation, narrative, predict_with_threshold, AccuracyReport,
    AnomalyScorer, CategoryClassifier, CrossValidationReport, Database, ExpenseRecord,
    ForecastResult, ModelChoice, Period, Pipeline, TimeSeries,
};

use super::truncate;

/// Rows shown before the per-period table is elided
const MAX_PERIOD_ROWS: usize = 14;

/// Flags for `spendcast forecast`
#[derive(Debug, Default)]
pub struct ForecastOptions<'a> {
    /// Periods to forecast, defaults to the configured horizon
    pub horizon: Option<usize>,
    pub model: Option<&'a str>,
    /// Predict from the saved model state instead of refitting
    pub saved: bool,
    /// Run k-fold cross-validation with this many folds
    pub cross_validation_folds: Option<usize>,
}

fn user_expenses(db: &Database, user_id: &str) -> Result<Vec<ExpenseRecord>> {
    let records = db
        .list_expenses(user_id, None)
        .context("Failed to read expenses")?;
    if records.is_empty() {
        return Err(anyhow!(
            "No expenses for {}. Import some with: spendcast import --user {}",
            user_id,
            user_id
        ));
    }
    Ok(records)
}

/// Series over the configured lookback window
fn user_series(pipeline: &Pipeline, records: &[ExpenseRecord]) -> Result<TimeSeries> {
    let config = &pipeline.config().series;
    let range = pipeline
        .history_range(records)
        .ok_or_else(|| anyhow!("No expenses to build a series from"))?;
    let in_range: Vec<ExpenseRecord> = records
        .iter()
        .filter(|r| range.contains(r.date))
        .cloned()
        .collect();
    Ok(build_series(&in_range, config.period, range, config.min_periods)?)
}

fn print_forecast(result: &ForecastResult) {
    println!();
    println!("📈 {}", narrative(result));
    println!();
    println!("   Model: {}", result.model);
    println!(
        "   Predicted: {} ({} {}s)",
        format_currency(result.predicted_amount),
        result.horizon,
        result.period
    );
    println!(
        "   Previous:  {} ({:+.1}%, {})",
        format_currency(result.last_observed_amount),
        result.percent_change,
        result.trend
    );
    if let Some(report) = &result.accuracy_report {
        println!(
            "   Accuracy:  {} (MAPE {:.1}% over {} held-out {}s)",
            report.rating.as_str(),
            report.mape,
            report.holdout_periods,
            result.period
        );
        print_metrics(report);
    }

    println!();
    println!("   {:<12} {:>10}", "Period", "Amount");
    println!("   ─────────────────────────");
    for p in result.per_period.iter().take(MAX_PERIOD_ROWS) {
        println!("   {:<12} {:>10.2}", p.start.to_string(), p.amount);
    }
    if result.per_period.len() > MAX_PERIOD_ROWS {
        println!(
            "   ... {} more",
            result.per_period.len() - MAX_PERIOD_ROWS
        );
    }
}

/// Monthly totals shown under a daily forecast
const RECENT_MONTHS: usize = 3;

/// Last few calendar months of a daily series, for context
fn print_recent_months(series: &TimeSeries) {
    if series.period != Period::Month {
        let monthly = series.resample(Period::Month);
        let skip = monthly.len().saturating_sub(RECENT_MONTHS);
        println!();
        println!("   Recent months:");
        for point in &monthly.points[skip..] {
            println!(
                "   {:<12} {:>10}",
                point.start.format("%b %Y").to_string(),
                format_currency(point.total)
            );
        }
    }
}

/// Error metrics and follow-ups shared by holdout and cross-validation output
fn print_metrics(report: &AccuracyReport) {
    println!(
        "              MAE {}, RMSE {}, R² {:.3}",
        format_currency(report.mae),
        format_currency(report.rmse),
        report.r2
    );
    if let Some(weekly) = report.weekly_error_pct {
        println!("              Weekly totals off by {:.1}%", weekly);
    }
    for recommendation in report.recommendations() {
        println!("   💡 {}", recommendation);
    }
}

fn print_cross_validation(report: &CrossValidationReport) {
    println!();
    println!(
        "🧪 Cross-validation: {} folds of {} periods",
        report.folds.len(),
        report.fold_periods
    );
    for (i, fold) in report.folds.iter().enumerate() {
        match fold {
            Some(r) => println!(
                "   Fold {}: MAPE {:.1}%, R² {:.3}",
                i + 1,
                r.mape,
                r.r2
            ),
            None => println!("   Fold {}: no spending to score", i + 1),
        }
    }
    let average = &report.average;
    println!(
        "   Average:  {} (MAPE {:.1}%)",
        average.rating.as_str(),
        average.mape
    );
    print_metrics(average);
}

/// Forecast a user's spending without publishing an artifact
pub fn cmd_forecast(
    db: &Database,
    pipeline: &Pipeline,
    user_id: &str,
    options: &ForecastOptions<'_>,
) -> Result<()> {
    let config = pipeline.config();
    let horizon = options.horizon.unwrap_or(config.forecast.horizon);

    if options.saved {
        let result = pipeline.forecast_saved(user_id, horizon).with_context(|| {
            format!(
                "No saved model for {}. Run: spendcast run --user {}",
                user_id, user_id
            )
        })?;
        print_forecast(&result);
        return Ok(());
    }

    let model: ModelChoice = match options.model {
        Some(m) => m.parse().map_err(|e: String| anyhow!(e))?,
        None => config.forecast.model,
    };

    let records = user_expenses(db, user_id)?;
    let output = pipeline
        .compute(user_id, &records, model)
        .with_context(|| format!("Failed to forecast for {}", user_id))?;

    let mut result = output.forecast;
    if horizon != result.horizon {
        let accuracy = result.accuracy_report.take();
        result =
            predict_with_threshold(&output.state, horizon, config.forecast.trend_threshold_pct)?;
        result.accuracy_report = accuracy;
    }

    print_forecast(&result);
    print_recent_months(&output.series);

    if let Some(folds) = options.cross_validation_folds {
        let forecaster = model.build(&config.forecast);
        match evaluate_cross_validation(forecaster.as_ref(), &output.series, folds)
            .context("Cross-validation failed")?
        {
            Some(report) => print_cross_validation(&report),
            None => {
                println!();
                println!("🧪 Cross-validation: no spending to score");
            }
        }
    }
    Ok(())
}

/// Score a user's period totals or individual expenses
pub fn cmd_anomalies(
    db: &Database,
    pipeline: &Pipeline,
    user_id: &str,
    transactions: bool,
    all: bool,
) -> Result<()> {
    let records = user_expenses(db, user_id)?;
    let scorer = AnomalyScorer::new(pipeline.config().anomaly.clone());

    let flags = if transactions {
        scorer.score_transactions(&records)
    } else {
        scorer.score_series(&user_series(pipeline, &records)?)
    };

    let shown: Vec<_> = flags.iter().filter(|f| all || f.is_anomaly).collect();
    let flagged = flags.iter().filter(|f| f.is_anomaly).count();

    println!();
    println!(
        "🔎 {} scored, {} unusual ({})",
        flags.len(),
        flagged,
        scorer.config().method
    );
    if shown.is_empty() {
        println!();
        println!("✅ Nothing unusual. Your spending looks steady!");
        return Ok(());
    }

    println!();
    println!(
        "   {:<24} {:>10} {:>21} {:>8}",
        "Subject", "Observed", "Expected", "Severity"
    );
    println!("   ─────────────────────────────────────────────────────────────────");
    for flag in shown {
        let marker = if flag.is_anomaly { "⚠️ " } else { "  " };
        println!(
            "{} {:<24} {:>10.2} {:>10.2} - {:<8.2} {:>8.2}",
            marker,
            truncate(&flag.subject.to_string(), 24),
            flag.observed_amount,
            flag.expected_low,
            flag.expected_high,
            flag.severity_score
        );
    }

    Ok(())
}

/// Suggest categories for a user's uncategorized or mislabelled expenses
pub fn cmd_suggest(db: &Database, pipeline: &Pipeline, user_id: &str) -> Result<()> {
    let records = user_expenses(db, user_id)?;
    let classifier = CategoryClassifier::train(&records, &pipeline.config().classifier)
        .with_context(|| format!("Not enough categorized expenses for {}", user_id))?;

    let by_id: HashMap<&str, &ExpenseRecord> =
        records.iter().map(|r| (r.id.as_str(), r)).collect();
    let suggestions = classifier.suggest_all(&records);

    println!();
    println!(
        "🏷️  {} suggestions across {} categories",
        suggestions.len(),
        classifier.categories().len()
    );
    if suggestions.is_empty() {
        return Ok(());
    }

    println!();
    println!(
        "   {:<10} {:<30} {:<15} {:<15} {:>6}",
        "Date", "Description", "Current", "Suggested", "Conf"
    );
    println!("   ─────────────────────────────────────────────────────────────────────────────");
    for s in &suggestions {
        let (date, description) = by_id
            .get(s.transaction_id.as_str())
            .map(|r| (r.date.to_string(), r.description.as_str()))
            .unwrap_or_default();
        println!(
            "   {:<10} {:<30} {:<15} {:<15} {:>5.0}%",
            date,
            truncate(description, 30),
            s.current_category.as_deref().unwrap_or("-"),
            s.suggested_category,
            s.confidence * 100.0
        );
    }

    Ok(())
}
