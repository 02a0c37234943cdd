//! Import command implementation

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use spendcast_core::{parse_expenses_csv, Database};

pub fn cmd_import(db: &Database, file: &Path, user_id: &str) -> Result<()> {
    let csv_file =
        File::open(file).with_context(|| format!("Failed to open file: {}", file.display()))?;

    println!("📥 Importing expenses for {} from {}...", user_id, file.display());

    let records = parse_expenses_csv(csv_file, user_id).context("Failed to parse CSV")?;
    let summary = db
        .insert_expenses(&records)
        .context("Failed to store expenses")?;

    println!();
    println!("✅ Import complete!");
    println!("   Imported: {}", summary.inserted);
    println!("   Skipped (duplicates): {}", summary.skipped);

    let total = db.count_expenses(user_id)?;
    println!("   Expenses on file for {}: {}", user_id, total);

    Ok(())
}
