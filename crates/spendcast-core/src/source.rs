//! Expense sources
//!
//! The pipeline reads expenses through [`ExpenseSource`] and never writes
//! back. [`crate::db::Database`] is the production implementation;
//! [`MemorySource`] serves embedded use and tests.

use crate::error::Result;
use crate::models::{DateRange, ExpenseRecord};

/// Read-only access to per-user expense history
pub trait ExpenseSource: Send + Sync {
    /// Users with at least one expense, sorted
    fn users(&self) -> Result<Vec<String>>;

    /// A user's expenses, oldest first, optionally limited to a date range
    fn records(&self, user_id: &str, range: Option<DateRange>) -> Result<Vec<ExpenseRecord>>;
}

/// Expense source backed by a vector of records
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    records: Vec<ExpenseRecord>,
}

impl MemorySource {
    pub fn new(records: Vec<ExpenseRecord>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: ExpenseRecord) {
        self.records.push(record);
    }
}

impl ExpenseSource for MemorySource {
    fn users(&self) -> Result<Vec<String>> {
        let mut users: Vec<String> = self.records.iter().map(|r| r.user_id.clone()).collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    fn records(&self, user_id: &str, range: Option<DateRange>) -> Result<Vec<ExpenseRecord>> {
        let mut records: Vec<ExpenseRecord> = self
            .records
            .iter()
            .filter(|r| r.user_id == user_id)
            .filter(|r| range.map_or(true, |range| range.contains(r.date)))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }
}
