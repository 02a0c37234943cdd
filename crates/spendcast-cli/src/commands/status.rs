//! Status-related command implementations (users, show, history)

use anyhow::{Context, Result};
use chrono::Local;
use spendcast_core::forecast::format_currency;
use spendcast_core::{Artifact, ArtifactStore, Database, Error};

fn print_artifact(artifact: &Artifact) {
    println!();
    println!("📊 Forecast for {} (v{})", artifact.user_id, artifact.version);
    println!("   ─────────────────────────────────────────────────────────────");
    println!("   {}", artifact.narrative_text);
    println!();
    println!(
        "   Generated: {}",
        artifact
            .generated_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M")
    );
    println!("   Model: {}", artifact.model);
    println!(
        "   Predicted: {} over {} {}s ({})",
        format_currency(artifact.predicted_amount),
        artifact.horizon,
        artifact.period,
        artifact.trend
    );
    if let Some(accuracy) = &artifact.accuracy {
        println!("   Holdout MAPE: {:.1}%", accuracy.mape);
    }

    if !artifact.anomalies.is_empty() {
        println!();
        println!("   ⚠️  Unusual spending:");
        for flag in &artifact.anomalies {
            println!(
                "      {}: {} (expected {} - {})",
                flag.subject,
                format_currency(flag.observed_amount),
                format_currency(flag.expected_low),
                format_currency(flag.expected_high)
            );
        }
    }

    if !artifact.suggestions.is_empty() {
        println!();
        println!(
            "   🏷️  {} category suggestions (see: spendcast suggest --user {})",
            artifact.suggestions.len(),
            artifact.user_id
        );
    }
}

/// List users with stored expenses and their latest published version
pub fn cmd_users(db: &Database, store: &ArtifactStore) -> Result<()> {
    let mut users = db.list_users().context("Failed to list users")?;
    // Artifacts can outlive their expenses (e.g. after switching databases)
    users.extend(
        store
            .published_users()
            .context("Failed to list published artifacts")?,
    );
    users.sort();
    users.dedup();

    if users.is_empty() {
        println!("No users yet. Import expenses with: spendcast import --file CSV --user ID");
        return Ok(());
    }

    println!();
    println!("   {:<24} {:>10} {:>10}", "User", "Expenses", "Published");
    println!("   ─────────────────────────────────────────────");
    for user in &users {
        let count = db.count_expenses(user)?;
        let published = match store.read_latest(user) {
            Ok(artifact) => format!("v{}", artifact.version),
            Err(Error::NotFound(_)) => "-".to_string(),
            Err(e) => format!("error: {}", e),
        };
        println!("   {:<24} {:>10} {:>10}", user, count, published);
    }

    Ok(())
}

/// Show the latest published artifact
pub fn cmd_show(store: &ArtifactStore, user_id: &str, json: bool) -> Result<()> {
    let artifact = store
        .read_latest(user_id)
        .with_context(|| format!("No published forecast for {}", user_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&artifact)?);
    } else {
        print_artifact(&artifact);
    }

    Ok(())
}

/// List archived artifact versions, oldest first
pub fn cmd_history(store: &ArtifactStore, user_id: &str) -> Result<()> {
    let history = store
        .read_history(user_id)
        .with_context(|| format!("Failed to read history for {}", user_id))?;

    if history.is_empty() {
        println!("No published forecasts for {}", user_id);
        return Ok(());
    }

    println!();
    println!(
        "   {:>7} {:<17} {:<22} {:>12} {:>8}",
        "Version", "Generated", "Model", "Predicted", "Change"
    );
    println!("   ─────────────────────────────────────────────────────────────────────");
    for artifact in &history {
        println!(
            "   {:>7} {:<17} {:<22} {:>12} {:>+7.1}%",
            artifact.version,
            artifact
                .generated_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
            artifact.model,
            format_currency(artifact.predicted_amount),
            artifact.percent_change
        );
    }

    Ok(())
}
