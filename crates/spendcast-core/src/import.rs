//! CSV import for expense exports
//!
//! Expected header (case-insensitive, any column order):
//! `date,amount,description,category[,id]`
//!
//! Rows without an `id` get a content hash id, so re-importing the same file
//! never creates duplicates. Negative amounts are credits (refunds, payments)
//! and are skipped.

use std::collections::HashMap;
use std::io::Read;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::ExpenseRecord;

/// Column positions resolved from the header row
struct Columns {
    date: usize,
    amount: usize,
    description: Option<usize>,
    category: Option<usize>,
    id: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Result<Self> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };

        Ok(Self {
            date: find("date")
                .ok_or_else(|| Error::InvalidData("CSV is missing a date column".into()))?,
            amount: find("amount")
                .ok_or_else(|| Error::InvalidData("CSV is missing an amount column".into()))?,
            description: find("description"),
            category: find("category"),
            id: find("id"),
        })
    }
}

/// Parse an expense CSV for one user
pub fn parse_expenses_csv<R: Read>(reader: R, user_id: &str) -> Result<Vec<ExpenseRecord>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let columns = Columns::from_headers(rdr.headers()?)?;
    let mut records = Vec::new();
    let mut occurrences: HashMap<String, usize> = HashMap::new();
    let mut credits = 0usize;

    for (line, result) in rdr.records().enumerate() {
        let row = result?;
        // Header is line 1
        let line = line + 2;

        let date = parse_date(field(&row, Some(columns.date)).unwrap_or(""))
            .map_err(|e| Error::InvalidData(format!("Line {}: {}", line, e)))?;
        let amount = parse_amount(field(&row, Some(columns.amount)).unwrap_or(""))
            .map_err(|e| Error::InvalidData(format!("Line {}: {}", line, e)))?;
        if amount < 0.0 {
            credits += 1;
            continue;
        }

        let description = field(&row, columns.description).unwrap_or("").to_string();
        let category = field(&row, columns.category).map(String::from);

        let id = match field(&row, columns.id) {
            Some(id) => id.to_string(),
            None => {
                let hash = content_hash(&date, &description, amount);
                let seen = occurrences.entry(hash.clone()).or_insert(0);
                *seen += 1;
                // Identical rows in one file are separate purchases
                if *seen == 1 {
                    hash
                } else {
                    format!("{}-{}", hash, seen)
                }
            }
        };

        records.push(ExpenseRecord::new(
            id,
            user_id,
            date,
            amount,
            category,
            description,
        )?);
    }

    debug!(
        user = user_id,
        parsed = records.len(),
        credits,
        "Parsed expense CSV"
    );
    Ok(records)
}

/// Non-empty field at an optional column
fn field(row: &StringRecord, column: Option<usize>) -> Option<&str> {
    column
        .and_then(|c| row.get(c))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Stable id from the row content
fn content_hash(date: &NaiveDate, description: &str, amount: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(date.to_string().as_bytes());
    hasher.update(description.as_bytes());
    hasher.update(amount.to_be_bytes());
    hex::encode(&hasher.finalize()[..16])
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();

    // Try common date formats
    let formats = [
        "%Y-%m-%d", // 2024-01-15
        "%m/%d/%Y", // 01/15/2024
        "%m/%d/%y", // 01/15/24
        "%m-%d-%Y", // 01-15-2024
    ];

    for fmt in formats {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(date);
        }
    }

    Err(Error::InvalidData(format!("Unable to parse date: {:?}", s)))
}

/// Parse an amount string, handling currency symbols and commas
fn parse_amount(s: &str) -> Result<f64> {
    let cleaned: String = s
        .trim()
        .replace(['$', ',', ' '], "")
        .replace('(', "-")
        .replace(')', "");

    let amount = cleaned
        .parse::<f64>()
        .map_err(|_| Error::InvalidData(format!("Unable to parse amount: {:?}", s)))?;
    if !amount.is_finite() {
        return Err(Error::InvalidData(format!("Unable to parse amount: {:?}", s)));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(parse_date("2024-01-15").unwrap(), expected);
        assert_eq!(parse_date("01/15/2024").unwrap(), expected);
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("$1,234.56").unwrap(), 1234.56);
        assert_eq!(parse_amount("(12.00)").unwrap(), -12.0);
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount("NaN").is_err());
    }

    #[test]
    fn test_parse_expenses_csv() {
        let csv = "\
date,amount,description,category,id
2024-01-02,12.50,STARBUCKS,Food,tx-1
2024-01-03,$40.00,SHELL OIL,Transportation,tx-2
2024-01-04,-20.00,REFUND,,tx-3
2024-01-05,8.00,MYSTERY,,tx-4
";
        let records = parse_expenses_csv(csv.as_bytes(), "alice").unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, "tx-1");
        assert_eq!(records[0].user_id, "alice");
        assert_eq!(records[1].amount, 40.0);
        assert_eq!(records[1].category.as_deref(), Some("Transportation"));
        assert!(records[2].category.is_none());
    }

    #[test]
    fn test_missing_ids_are_stable_hashes() {
        let csv = "\
Date,Description,Amount,Category
2024-02-01,COFFEE,4.50,Food
2024-02-01,COFFEE,4.50,Food
2024-02-02,COFFEE,4.50,Food
";
        let first = parse_expenses_csv(csv.as_bytes(), "bob").unwrap();
        let second = parse_expenses_csv(csv.as_bytes(), "bob").unwrap();

        let ids: Vec<&str> = first.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[2]);
        assert!(ids[1].ends_with("-2"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_required_column() {
        let csv = "when,amount\n2024-01-01,5\n";
        let err = parse_expenses_csv(csv.as_bytes(), "alice").unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn test_bad_row_reports_line() {
        let csv = "date,amount\n2024-01-01,5\nnot-a-date,5\n";
        let err = parse_expenses_csv(csv.as_bytes(), "alice").unwrap_err();
        assert!(err.to_string().contains("Line 3"));
    }
}
