//! Test utilities for spendcast-core
//!
//! Expense and series fixtures shared by unit tests, and by the CLI tests
//! through the `test-utils` feature.

use chrono::{Duration, NaiveDate};

use crate::models::{ExpenseRecord, Period, SeriesPoint, TimeSeries};

/// First day of every fixture
pub fn fixture_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

/// One uncategorized expense per day with the given amounts
pub fn daily_records(user_id: &str, values: &[f64]) -> Vec<ExpenseRecord> {
    values
        .iter()
        .enumerate()
        .map(|(i, amount)| {
            ExpenseRecord::new(
                format!("{}-{}", user_id, i),
                user_id,
                fixture_start() + Duration::days(i as i64),
                *amount,
                None,
                "GROCERY",
            )
            .unwrap()
        })
        .collect()
}

/// Daily series with the given totals
pub fn daily_series(values: &[f64]) -> TimeSeries {
    TimeSeries {
        period: Period::Day,
        points: values
            .iter()
            .enumerate()
            .map(|(i, total)| SeriesPoint {
                start: fixture_start() + Duration::days(i as i64),
                total: *total,
            })
            .collect(),
    }
}

/// `days` daily totals alternating 50 and 60
pub fn alternating(days: usize) -> Vec<f64> {
    (0..days)
        .map(|i| if i % 2 == 0 { 50.0 } else { 60.0 })
        .collect()
}

/// 90 days alternating 50/60 with a 500 spike at index 45
pub fn alternating_with_spike() -> Vec<f64> {
    let mut values = alternating(90);
    values[45] = 500.0;
    values
}

const MERCHANTS: [(&str, f64, &str); 6] = [
    ("STARBUCKS COFFEE", 5.75, "Food"),
    ("WHOLE FOODS MARKET", 62.10, "Food"),
    ("UBER TRIP", 17.40, "Transportation"),
    ("SHELL OIL", 41.00, "Transportation"),
    ("NETFLIX.COM", 15.49, "Entertainment"),
    ("AMC THEATRES", 24.00, "Entertainment"),
];

/// Categorized expenses, one per day, cycling through a few merchants
pub fn labelled_records(user_id: &str, count: usize) -> Vec<ExpenseRecord> {
    (0..count)
        .map(|i| {
            let (description, amount, category) = MERCHANTS[i % MERCHANTS.len()];
            ExpenseRecord::new(
                format!("{}-l{}", user_id, i),
                user_id,
                fixture_start() + Duration::days(i as i64),
                amount,
                Some(category.to_string()),
                description,
            )
            .unwrap()
        })
        .collect()
}

/// Render records as an import CSV (`date,amount,description,category,id`)
pub fn expenses_csv(records: &[ExpenseRecord]) -> String {
    let mut csv = String::from("date,amount,description,category,id\n");
    for r in records {
        csv.push_str(&format!(
            "{},{:.2},{},{},{}\n",
            r.date,
            r.amount,
            r.description,
            r.category.as_deref().unwrap_or(""),
            r.id
        ));
    }
    csv
}
