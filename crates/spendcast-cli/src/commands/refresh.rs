//! Refresh command implementations (run, schedule)

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use spendcast_core::{CycleReport, Database, Pipeline, RefreshScheduler, RunOutcome, UserRun};

fn scheduler(db: &Database, pipeline: Arc<Pipeline>) -> RefreshScheduler {
    RefreshScheduler::new(pipeline, Arc::new(db.clone()))
}

fn print_run(run: &UserRun) {
    match &run.outcome {
        RunOutcome::Published { version } => println!(
            "   ✅ {}: published v{} ({})",
            run.user_id, version, run.model
        ),
        RunOutcome::Skipped { reason } => println!("   ⏭️  {}: skipped ({})", run.user_id, reason),
        RunOutcome::Failed { error } => println!("   ❌ {}: {}", run.user_id, error),
        RunOutcome::TimedOut => println!("   ⏱️  {}: timed out", run.user_id),
    }
}

fn print_report(report: &CycleReport) {
    for run in &report.runs {
        print_run(run);
    }

    let elapsed = report.finished_at - report.started_at;
    println!();
    println!(
        "📊 {} published, {} skipped, {} failed in {:.1}s",
        report.published(),
        report.skipped(),
        report.failed(),
        elapsed.num_milliseconds() as f64 / 1000.0
    );
}

/// Refresh one user, or every user, and publish
pub async fn cmd_run(db: &Database, pipeline: Arc<Pipeline>, user_id: Option<&str>) -> Result<()> {
    let scheduler = scheduler(db, pipeline);

    match user_id {
        Some(user_id) => {
            println!("🔄 Refreshing forecast for {}...", user_id);
            let run = scheduler.run_user(user_id).await;
            print_run(&run);
            match run.outcome {
                RunOutcome::Failed { error } => bail!("Refresh failed for {}: {}", user_id, error),
                RunOutcome::TimedOut => bail!("Refresh timed out for {}", user_id),
                _ => Ok(()),
            }
        }
        None => {
            println!("🔄 Refreshing forecasts for all users...");
            let report = scheduler.run_cycle().await;
            if let Some(error) = &report.error {
                bail!("Failed to list users: {}", error);
            }
            if report.runs.is_empty() {
                println!("   No users yet. Import expenses with: spendcast import");
                return Ok(());
            }
            print_report(&report);
            Ok(())
        }
    }
}

/// Run the refresh scheduler until Ctrl-C
pub async fn cmd_schedule(db: &Database, pipeline: Arc<Pipeline>) -> Result<()> {
    let schedule = pipeline.config().schedule.clone();
    println!("⏰ Starting refresh scheduler...");
    println!("   Interval: every {}h", schedule.interval_hours);
    println!("   Parallel users: {}", schedule.max_parallel_users);
    println!("   Run timeout: {}s", schedule.run_timeout.as_secs());
    println!("   Artifacts: {}", pipeline.store().root().display());
    println!();
    println!("   Press Ctrl-C to stop");

    let handle = scheduler(db, pipeline).start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    handle.abort();

    println!();
    println!("👋 Scheduler stopped");
    Ok(())
}
