//! Expense operations

use chrono::NaiveDate;
use rusqlite::params;

use super::Database;
use crate::error::{Error, Result};
use crate::models::{DateRange, ExpenseRecord};

/// Outcome of a bulk insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    pub inserted: usize,
    /// Rows whose (user, id) already existed
    pub skipped: usize,
}

/// Raw row before date parsing
type ExpenseRow = (String, String, String, f64, Option<String>, String);

impl Database {
    /// Insert an expense, returning false if the id already exists for the user
    pub fn insert_expense(&self, record: &ExpenseRecord) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO expenses (id, user_id, date, amount, category, description)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.id,
                record.user_id,
                record.date.to_string(),
                record.amount,
                record.category,
                record.description,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Insert many expenses in one transaction, skipping duplicates
    pub fn insert_expenses(&self, records: &[ExpenseRecord]) -> Result<InsertSummary> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut summary = InsertSummary::default();
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO expenses (id, user_id, date, amount, category, description)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )?;
            for record in records {
                let changed = stmt.execute(params![
                    record.id,
                    record.user_id,
                    record.date.to_string(),
                    record.amount,
                    record.category,
                    record.description,
                ])?;
                if changed > 0 {
                    summary.inserted += 1;
                } else {
                    summary.skipped += 1;
                }
            }
        }
        tx.commit()?;
        Ok(summary)
    }

    /// A user's expenses ordered by date, optionally within a range
    pub fn list_expenses(
        &self,
        user_id: &str,
        range: Option<DateRange>,
    ) -> Result<Vec<ExpenseRecord>> {
        let conn = self.conn()?;
        let (start, end) = match range {
            Some(r) => (r.start.to_string(), r.end.to_string()),
            None => ("0000-01-01".to_string(), "9999-12-31".to_string()),
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, date, amount, category, description
            FROM expenses
            WHERE user_id = ? AND date >= ? AND date <= ?
            ORDER BY date, id
            "#,
        )?;
        let rows: Vec<ExpenseRow> = stmt
            .query_map(params![user_id, start, end], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Users with at least one expense, sorted
    pub fn list_users(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM expenses ORDER BY user_id")?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(users)
    }

    /// Number of expenses stored for a user
    pub fn count_expenses(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM expenses WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_record(row: ExpenseRow) -> Result<ExpenseRecord> {
    let (id, user_id, date, amount, category, description) = row;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|e| Error::InvalidData(format!("Bad date {:?} on expense {}: {}", date, id, e)))?;
    ExpenseRecord::new(id, user_id, date, amount, category, description)
}
