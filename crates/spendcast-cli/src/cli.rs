//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Spendcast - Forecast where your spending is headed
#[derive(Parser)]
#[command(name = "spendcast")]
#[command(about = "Spending forecaster with anomaly flags and category suggestions", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, env = "SPENDCAST_DB", default_value = "spendcast.db", global = true)]
    pub db: PathBuf,

    /// Pipeline config file
    ///
    /// Defaults to ~/.local/share/spendcast/config/pipeline.toml when present,
    /// otherwise the built-in defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database
    Init,

    /// Import expenses from CSV
    Import {
        /// CSV file to import (date,amount,description,category[,id])
        #[arg(short, long)]
        file: PathBuf,

        /// User the expenses belong to
        #[arg(short, long)]
        user: String,
    },

    /// List users with stored expenses
    Users,

    /// Refresh and publish forecasts once
    Run {
        /// Only refresh this user
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Refresh forecasts on the configured interval until Ctrl-C
    Schedule,

    /// Forecast spending for a user without publishing
    Forecast {
        /// User to forecast
        #[arg(short, long)]
        user: String,

        /// Periods to forecast (defaults to forecast.horizon)
        #[arg(long)]
        horizon: Option<usize>,

        /// Model: windowed_regression, moving_average
        #[arg(short, long)]
        model: Option<String>,

        /// Predict from the last published model state instead of refitting
        #[arg(long, conflicts_with = "cross_validation")]
        saved: bool,

        /// Also score the model with k-fold cross-validation (needs 90 periods)
        #[arg(long)]
        cross_validation: bool,

        /// Number of cross-validation folds
        #[arg(long, default_value_t = 3)]
        folds: usize,
    },

    /// Show unusual spending for a user
    Anomalies {
        /// User to score
        #[arg(short, long)]
        user: String,

        /// Score individual expenses instead of period totals
        #[arg(long)]
        transactions: bool,

        /// Include observations that were not flagged
        #[arg(long)]
        all: bool,
    },

    /// Suggest categories for a user's expenses
    Suggest {
        /// User to classify
        #[arg(short, long)]
        user: String,
    },

    /// Show the latest published artifact
    Show {
        /// User whose artifact to show
        #[arg(short, long)]
        user: String,

        /// Print the raw JSON artifact
        #[arg(long)]
        json: bool,
    },

    /// List archived artifact versions
    History {
        /// User whose history to list
        #[arg(short, long)]
        user: String,
    },
}
