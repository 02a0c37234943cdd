//! Expense history extraction
//!
//! Turns raw expense records into a regularly spaced series of period totals.
//! Downstream models read the series as fixed-stride input, so every period
//! in the range is present, with zero for periods without expenses.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{DateRange, ExpenseRecord, Period, SeriesPoint, TimeSeries};

/// Build a gap-filled series of period totals
///
/// Records dated outside `range` are ignored. The range is aligned to period
/// boundaries, so a monthly series over `2024-01-15..=2024-03-02` covers
/// January through March.
pub fn build_series(
    records: &[ExpenseRecord],
    period: Period,
    range: DateRange,
    min_periods: usize,
) -> Result<TimeSeries> {
    if range.start > range.end {
        return Err(Error::InvalidData(format!(
            "Series range starts after it ends ({} > {})",
            range.start, range.end
        )));
    }

    let first = period.start_of(range.start);
    let last = period.start_of(range.end);

    let mut totals: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    let mut used = 0usize;
    for record in records {
        if !range.contains(record.date) {
            continue;
        }
        *totals.entry(period.start_of(record.date)).or_insert(0.0) += record.amount;
        used += 1;
    }

    let mut points = Vec::new();
    let mut cursor = first;
    while cursor <= last {
        points.push(SeriesPoint {
            start: cursor,
            total: totals.get(&cursor).copied().unwrap_or(0.0),
        });
        cursor = period.next(cursor);
    }

    debug!(
        period = period.as_str(),
        records = used,
        periods = points.len(),
        "Built expense series"
    );

    if points.len() < min_periods {
        return Err(Error::InsufficientData {
            required: min_periods,
            actual: points.len(),
        });
    }

    Ok(TimeSeries { period, points })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(id: &str, day: NaiveDate, amount: f64) -> ExpenseRecord {
        ExpenseRecord::new(id, "alice", day, amount, None, "TEST").unwrap()
    }

    #[test]
    fn test_build_series_fills_gaps_with_zero() {
        let records = vec![
            record("1", date(2024, 1, 1), 10.0),
            record("2", date(2024, 1, 1), 5.0),
            record("3", date(2024, 1, 4), 20.0),
        ];
        let range = DateRange::new(date(2024, 1, 1), date(2024, 1, 5));

        let series = build_series(&records, Period::Day, range, 1).unwrap();

        assert_eq!(series.values(), vec![15.0, 0.0, 0.0, 20.0, 0.0]);
        assert_eq!(series.points[4].start, date(2024, 1, 5));
    }

    #[test]
    fn test_build_series_one_point_per_period_and_total_preserved() {
        // Sparse spending over 40 days
        let records: Vec<ExpenseRecord> = (0..40)
            .filter(|i| i % 3 == 0)
            .map(|i| {
                record(
                    &i.to_string(),
                    date(2024, 3, 1) + chrono::Duration::days(i),
                    i as f64 + 0.25,
                )
            })
            .collect();
        let raw_total: f64 = records.iter().map(|r| r.amount).sum();
        let range = DateRange::new(date(2024, 3, 1), date(2024, 4, 9));

        let series = build_series(&records, Period::Day, range, 30).unwrap();

        assert_eq!(series.len(), 40);
        for pair in series.points.windows(2) {
            assert_eq!(Period::Day.next(pair[0].start), pair[1].start);
        }
        assert!((series.total() - raw_total).abs() < 1e-9);
    }

    #[test]
    fn test_build_series_monthly_alignment() {
        let records = vec![
            record("1", date(2024, 1, 15), 100.0),
            record("2", date(2024, 3, 2), 50.0),
            record("3", date(2024, 3, 30), 25.0),
        ];
        let range = DateRange::new(date(2024, 1, 15), date(2024, 3, 30));

        let series = build_series(&records, Period::Month, range, 1).unwrap();

        assert_eq!(series.len(), 3);
        assert_eq!(series.points[0].start, date(2024, 1, 1));
        assert_eq!(series.values(), vec![100.0, 0.0, 75.0]);
    }

    #[test]
    fn test_build_series_ignores_out_of_range() {
        let records = vec![
            record("1", date(2023, 12, 31), 999.0),
            record("2", date(2024, 1, 2), 10.0),
        ];
        let range = DateRange::new(date(2024, 1, 1), date(2024, 1, 3));

        let series = build_series(&records, Period::Day, range, 1).unwrap();
        assert_eq!(series.total(), 10.0);
    }

    #[test]
    fn test_build_series_insufficient_periods() {
        let records = vec![record("1", date(2024, 1, 1), 10.0)];
        let range = DateRange::new(date(2024, 1, 1), date(2024, 1, 10));

        let err = build_series(&records, Period::Day, range, 30).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientData {
                required: 30,
                actual: 10
            }
        ));
    }

    #[test]
    fn test_build_series_rejects_inverted_range() {
        let range = DateRange::new(date(2024, 2, 1), date(2024, 1, 1));
        let err = build_series(&[], Period::Day, range, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }
}
