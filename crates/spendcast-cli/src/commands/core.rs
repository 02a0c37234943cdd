//! Core command implementations and shared utilities
//!
//! This module contains:
//! - `open_db` - Shared utility to open the database
//! - `load_config` / `open_pipeline` - Resolve the pipeline config and artifact store
//! - `cmd_init` - Initialize the database

use std::path::Path;

use anyhow::{Context, Result};
use spendcast_core::{Database, Pipeline, PipelineConfig};

/// Open the expense database, creating the schema if needed
pub fn open_db(db_path: &Path) -> Result<Database> {
    let path_str = db_path
        .to_str()
        .with_context(|| format!("Database path is not valid UTF-8: {}", db_path.display()))?;
    Database::new(path_str).context("Failed to open database")
}

/// Load the pipeline config from an explicit path or the default locations
pub fn load_config(config_path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match config_path {
        Some(path) => PipelineConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::load().context("Failed to load config")?,
    };
    Ok(config.with_env_overrides())
}

pub fn open_pipeline(config_path: Option<&Path>) -> Result<Pipeline> {
    let config = load_config(config_path)?;
    tracing::debug!(
        artifact_dir = %config.publisher.artifact_dir.display(),
        model = %config.forecast.model,
        "Loaded pipeline config"
    );
    Pipeline::from_config(config).context("Failed to open artifact store")
}

pub fn cmd_init(db_path: &Path) -> Result<()> {
    println!("🔧 Initializing database at {}...", db_path.display());

    open_db(db_path)?;

    println!("✅ Database initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Import expenses: spendcast import --file expenses.csv --user alice");
    println!("  2. Publish forecasts: spendcast run");
    println!("  3. Keep them fresh: spendcast schedule");

    Ok(())
}
