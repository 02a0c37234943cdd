//! Spendcast CLI - Spending forecaster
//!
//! Usage:
//!   spendcast init                          Initialize database
//!   spendcast import --file CSV --user ID   Import expenses
//!   spendcast run                           Refresh and publish every forecast once
//!   spendcast schedule                      Refresh on the configured interval
//!   spendcast show --user ID                Show the latest published forecast

mod cli;
mod commands;


use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db),
        Commands::Import { file, user } => {
            let db = commands::open_db(&cli.db)?;
            commands::cmd_import(&db, &file, &user)
        }
        Commands::Users => {
            let db = commands::open_db(&cli.db)?;
            let pipeline = commands::open_pipeline(cli.config.as_deref())?;
            commands::cmd_users(&db, pipeline.store())
        }
        Commands::Run { user } => {
            let db = commands::open_db(&cli.db)?;
            let pipeline = commands::open_pipeline(cli.config.as_deref())?;
            commands::cmd_run(&db, Arc::new(pipeline), user.as_deref()).await
        }
        Commands::Schedule => {
            let db = commands::open_db(&cli.db)?;
            let pipeline = commands::open_pipeline(cli.config.as_deref())?;
            commands::cmd_schedule(&db, Arc::new(pipeline)).await
        }
        Commands::Forecast {
            user,
            horizon,
            model,
            saved,
            cross_validation,
            folds,
        } => {
            let db = commands::open_db(&cli.db)?;
            let pipeline = commands::open_pipeline(cli.config.as_deref())?;
            let options = commands::ForecastOptions {
                horizon,
                model: model.as_deref(),
                saved,
                cross_validation_folds: cross_validation.then_some(folds),
            };
            commands::cmd_forecast(&db, &pipeline, &user, &options)
        }
        Commands::Anomalies {
            user,
            transactions,
            all,
        } => {
            let db = commands::open_db(&cli.db)?;
            let pipeline = commands::open_pipeline(cli.config.as_deref())?;
            commands::cmd_anomalies(&db, &pipeline, &user, transactions, all)
        }
        Commands::Suggest { user } => {
            let db = commands::open_db(&cli.db)?;
            let pipeline = commands::open_pipeline(cli.config.as_deref())?;
            commands::cmd_suggest(&db, &pipeline, &user)
        }
        Commands::Show { user, json } => {
            let pipeline = commands::open_pipeline(cli.config.as_deref())?;
            commands::cmd_show(pipeline.store(), &user, json)
        }
        Commands::History { user } => {
            let pipeline = commands::open_pipeline(cli.config.as_deref())?;
            commands::cmd_history(pipeline.store(), &user)
        }
    }
}
