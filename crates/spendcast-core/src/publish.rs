//! Forecast artifact publishing
//!
//! Each user gets a directory under the store root:
//!
//! ```text
//! <root>/<user>/latest.json                    current artifact
//! <root>/<user>/model.json                     fitted model state
//! <root>/<user>/history/forecast-00000042.json  past artifacts
//! ```
//!
//! Every file is written to a temp file in the destination directory, synced,
//! then renamed over the target, so readers see either the old artifact or
//! the new one and never a partial write. Publishing is serialized per user,
//! across threads by an in-process mutex and across processes by an exclusive
//! lock on `<root>/<user>/.lock`. Different users never wait on each other.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::PublisherConfig;
use crate::error::{Error, Result};
use crate::forecast::{narrative, ModelState};
use crate::models::{AnomalyFlag, CategorySuggestion, ForecastResult, Period, Trend};

/// Artifact layout version, bumped on incompatible changes
pub const SCHEMA_VERSION: u32 = 1;

const LATEST_FILE: &str = "latest.json";
const MODEL_FILE: &str = "model.json";
const HISTORY_DIR: &str = "history";
const HISTORY_PREFIX: &str = "forecast-";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactAccuracy {
    pub mape: f64,
}

/// Published per-user result, the only thing external readers consume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub schema_version: u32,
    /// Increases by one with every publish for the user
    pub version: u64,
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub model: String,
    pub period: Period,
    pub horizon: usize,
    pub predicted_amount: f64,
    pub last_observed_amount: f64,
    pub percent_change: f64,
    pub trend: Trend,
    pub narrative_text: String,
    pub accuracy: Option<ArtifactAccuracy>,
    pub anomalies: Vec<AnomalyFlag>,
    pub suggestions: Vec<CategorySuggestion>,
}

impl Artifact {
    pub fn new(
        user_id: &str,
        version: u64,
        result: &ForecastResult,
        anomalies: &[AnomalyFlag],
        suggestions: &[CategorySuggestion],
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            version,
            user_id: user_id.to_string(),
            generated_at: result.generated_at,
            model: result.model.clone(),
            period: result.period,
            horizon: result.horizon,
            predicted_amount: result.predicted_amount,
            last_observed_amount: result.last_observed_amount,
            percent_change: result.percent_change,
            trend: result.trend,
            narrative_text: narrative(result),
            accuracy: result
                .accuracy_report
                .as_ref()
                .map(|r| ArtifactAccuracy { mape: r.mape }),
            anomalies: anomalies.to_vec(),
            suggestions: suggestions.to_vec(),
        }
    }
}

/// Where a publish landed
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactHandle {
    pub user_id: String,
    pub version: u64,
    pub path: PathBuf,
}

/// Filesystem store for per-user artifacts
pub struct ArtifactStore {
    root: PathBuf,
    history_limit: usize,
    user_pattern: Regex,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, history_limit: usize) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            history_limit,
            user_pattern: Regex::new(r"^[A-Za-z0-9_-]+$")?,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &PublisherConfig) -> Result<Self> {
        Self::new(&config.artifact_dir, config.history_limit)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Publish the next artifact version for a user
    pub fn publish(
        &self,
        user_id: &str,
        result: &ForecastResult,
        anomalies: &[AnomalyFlag],
        suggestions: &[CategorySuggestion],
    ) -> Result<ArtifactHandle> {
        let dir = self.user_dir(user_id)?;
        let lock = self.user_lock(user_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| Error::Publish(format!("Publish lock poisoned for {}", user_id)))?;

        let history = dir.join(HISTORY_DIR);
        fs::create_dir_all(&history).map_err(|e| {
            Error::Publish(format!(
                "Failed to create artifact directory {}: {}",
                history.display(),
                e
            ))
        })?;
        let _dir_lock = lock_dir(&dir)?;

        let version = self.current_version(user_id, &dir) + 1;
        let artifact = Artifact::new(user_id, version, result, anomalies, suggestions);
        let bytes = serde_json::to_vec_pretty(&artifact)?;

        let latest = dir.join(LATEST_FILE);
        write_atomic(&latest, |file| file.write_all(&bytes))?;
        info!(user = user_id, version, "Published forecast artifact");

        // History is best-effort once latest.json is in place
        let archived = history.join(history_file_name(version));
        match write_atomic(&archived, |file| file.write_all(&bytes)) {
            Ok(()) => {
                if let Err(e) = self.prune_history(&history) {
                    warn!(user = user_id, error = %e, "Failed to prune artifact history");
                }
            }
            Err(e) => warn!(user = user_id, error = %e, "Failed to archive artifact"),
        }

        Ok(ArtifactHandle {
            user_id: user_id.to_string(),
            version,
            path: latest,
        })
    }

    /// Read the current artifact for a user
    pub fn read_latest(&self, user_id: &str) -> Result<Artifact> {
        let path = self.user_dir(user_id)?.join(LATEST_FILE);
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "No forecast published for {}",
                user_id
            )));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Retained artifacts, oldest first
    pub fn read_history(&self, user_id: &str) -> Result<Vec<Artifact>> {
        let history = self.user_dir(user_id)?.join(HISTORY_DIR);
        let mut artifacts = Vec::new();
        for path in history_files(&history)? {
            let content = fs::read_to_string(&path)?;
            artifacts.push(serde_json::from_str(&content)?);
        }
        Ok(artifacts)
    }

    /// Persist a fitted model so later runs can predict without retraining
    pub fn save_model_state(&self, user_id: &str, state: &ModelState) -> Result<PathBuf> {
        let dir = self.user_dir(user_id)?;
        let lock = self.user_lock(user_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| Error::Publish(format!("Publish lock poisoned for {}", user_id)))?;

        fs::create_dir_all(&dir).map_err(|e| {
            Error::Publish(format!(
                "Failed to create artifact directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let _dir_lock = lock_dir(&dir)?;

        let bytes = serde_json::to_vec_pretty(state)?;
        let path = dir.join(MODEL_FILE);
        write_atomic(&path, |file| file.write_all(&bytes))?;
        debug!(user = user_id, model = %state.model, "Saved model state");
        Ok(path)
    }

    pub fn load_model_state(&self, user_id: &str) -> Result<ModelState> {
        let path = self.user_dir(user_id)?.join(MODEL_FILE);
        if !path.exists() {
            return Err(Error::NotFound(format!("No saved model for {}", user_id)));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Users with a published artifact, sorted
    pub fn published_users(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut users = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(LATEST_FILE).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    users.push(name.to_string());
                }
            }
        }
        users.sort();
        Ok(users)
    }

    fn user_dir(&self, user_id: &str) -> Result<PathBuf> {
        if !self.user_pattern.is_match(user_id) {
            return Err(Error::InvalidData(format!(
                "Invalid user id for artifact path: {:?}",
                user_id
            )));
        }
        Ok(self.root.join(user_id))
    }

    fn user_lock(&self, user_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Publish("Publish lock table poisoned".to_string()))?;
        Ok(locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Latest published version, recovering from history if latest.json is unreadable
    fn current_version(&self, user_id: &str, dir: &Path) -> u64 {
        match self.read_latest(user_id) {
            Ok(artifact) => return artifact.version,
            Err(Error::NotFound(_)) => {}
            Err(e) => warn!(user = user_id, error = %e, "Unreadable latest artifact"),
        }

        history_files(&dir.join(HISTORY_DIR))
            .unwrap_or_default()
            .iter()
            .filter_map(|p| parse_history_version(p))
            .max()
            .unwrap_or(0)
    }

    fn prune_history(&self, history: &Path) -> Result<usize> {
        let files = history_files(history)?;
        let excess = files.len().saturating_sub(self.history_limit);
        for path in &files[..excess] {
            fs::remove_file(path)?;
        }
        if excess > 0 {
            debug!(removed = excess, "Pruned artifact history");
        }
        Ok(excess)
    }
}

/// Block until this process holds the exclusive lock on a user directory
///
/// The lock is released when the returned file is dropped.
fn lock_dir(dir: &Path) -> Result<File> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| Error::Publish(format!("Failed to open {}: {}", path.display(), e)))?;
    file.lock()
        .map_err(|e| Error::Publish(format!("Failed to lock {}: {}", path.display(), e)))?;
    Ok(file)
}

/// Replace `path` with whatever `write` produces, or leave it untouched
fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let dir = path
        .parent()
        .ok_or_else(|| Error::Publish(format!("No parent directory for {}", path.display())))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| Error::Publish(format!("Failed to create temp file in {}: {}", dir.display(), e)))?;
    write(tmp.as_file_mut())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::Publish(format!("Failed to write {}: {}", path.display(), e)))?;
    tmp.persist(path)
        .map_err(|e| Error::Publish(format!("Failed to replace {}: {}", path.display(), e.error)))?;
    Ok(())
}

fn history_file_name(version: u64) -> String {
    format!("{}{:08}.json", HISTORY_PREFIX, version)
}

fn parse_history_version(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(HISTORY_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// History artifact paths ordered by version
fn history_files(history: &Path) -> Result<Vec<PathBuf>> {
    if !history.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<(u64, PathBuf)> = fs::read_dir(history)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter_map(|path| parse_history_version(&path).map(|v| (v, path)))
        .collect();
    files.sort_by_key(|(v, _)| *v);
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnomalySubject, PeriodForecast};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn result(amount: f64) -> ForecastResult {
        ForecastResult {
            generated_at: Utc::now(),
            model: "windowed_regression".to_string(),
            period: Period::Month,
            horizon: 1,
            predicted_amount: amount,
            last_observed_amount: 1000.0,
            percent_change: (amount - 1000.0) / 10.0,
            trend: Trend::classify((amount - 1000.0) / 10.0, 1.0),
            per_period: vec![PeriodForecast {
                start: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
                amount,
            }],
            accuracy_report: None,
        }
    }

    fn store(limit: usize) -> (TempDir, ArtifactStore) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), limit).unwrap();
        (dir, store)
    }

    #[test]
    fn test_publish_and_read_latest() {
        let (_dir, store) = store(5);
        let flag = AnomalyFlag {
            subject: AnomalySubject::Period(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()),
            observed_amount: 900.0,
            expected_low: 100.0,
            expected_high: 300.0,
            severity_score: 0.8,
            is_anomaly: true,
        };

        let handle = store.publish("alice", &result(1120.0), &[flag.clone()], &[]).unwrap();
        assert_eq!(handle.version, 1);
        assert!(handle.path.ends_with("alice/latest.json"));

        let artifact = store.read_latest("alice").unwrap();
        assert_eq!(artifact.schema_version, SCHEMA_VERSION);
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.trend, Trend::Increase);
        assert_eq!(artifact.anomalies, vec![flag]);
        assert!(artifact.narrative_text.contains("$1,120 next month"));
        assert!(artifact.narrative_text.contains("12% higher than this month"));
    }

    #[test]
    fn test_versions_increase() {
        let (_dir, store) = store(5);
        for expected in 1..=3 {
            let handle = store.publish("alice", &result(1000.0), &[], &[]).unwrap();
            assert_eq!(handle.version, expected);
        }
        assert_eq!(store.read_latest("alice").unwrap().version, 3);
    }

    #[test]
    fn test_read_latest_not_found() {
        let (_dir, store) = store(5);
        assert!(matches!(store.read_latest("nobody"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_history_pruned_to_limit() {
        let (_dir, store) = store(2);
        for _ in 0..4 {
            store.publish("alice", &result(1000.0), &[], &[]).unwrap();
        }

        let history = store.read_history("alice").unwrap();
        let versions: Vec<u64> = history.iter().map(|a| a.version).collect();
        assert_eq!(versions, vec![3, 4]);
    }

    #[test]
    fn test_failed_write_leaves_latest_untouched() {
        let (_dir, store) = store(5);
        store.publish("alice", &result(1000.0), &[], &[]).unwrap();
        let before = store.read_latest("alice").unwrap();

        let latest = store.root().join("alice").join(LATEST_FILE);
        let err = write_atomic(&latest, |file| {
            file.write_all(b"{\"schema_version\": 1, \"vers")?;
            Err(std::io::Error::other("disk full"))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Publish(_)));

        assert_eq!(store.read_latest("alice").unwrap(), before);
        // Temp file is cleaned up on failure
        let leftovers: Vec<_> = fs::read_dir(store.root().join("alice"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file() && e.file_name() != LOCK_FILE)
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_rejects_path_like_user_ids() {
        let (_dir, store) = store(5);
        for user in ["../etc", "a/b", "", "bob smith"] {
            let err = store.publish(user, &result(1.0), &[], &[]).unwrap_err();
            assert!(matches!(err, Error::InvalidData(_)), "accepted {:?}", user);
        }
    }

    #[test]
    fn test_users_are_isolated() {
        let (_dir, store) = store(5);
        store.publish("alice", &result(1000.0), &[], &[]).unwrap();
        store.publish("alice", &result(1000.0), &[], &[]).unwrap();
        let bob = store.publish("bob", &result(500.0), &[], &[]).unwrap();

        assert_eq!(bob.version, 1);
        assert_eq!(store.published_users().unwrap(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_concurrent_publishes_get_distinct_versions() {
        let (_dir, store) = store(50);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    store.publish("alice", &result(1000.0), &[], &[]).unwrap();
                });
            }
        });

        let versions: Vec<u64> = store
            .read_history("alice")
            .unwrap()
            .iter()
            .map(|a| a.version)
            .collect();
        assert_eq!(versions, (1..=8).collect::<Vec<u64>>());
        assert_eq!(store.read_latest("alice").unwrap().version, 8);
    }

    #[test]
    fn test_publishes_through_separate_stores_are_serialized() {
        // Two stores over one root stand in for two processes
        let dir = TempDir::new().unwrap();
        let stores = [
            ArtifactStore::new(dir.path(), 50).unwrap(),
            ArtifactStore::new(dir.path(), 50).unwrap(),
        ];
        std::thread::scope(|scope| {
            for i in 0..16 {
                let store = &stores[i % 2];
                scope.spawn(move || {
                    store.publish("alice", &result(1000.0), &[], &[]).unwrap();
                });
            }
        });

        let versions: Vec<u64> = stores[0]
            .read_history("alice")
            .unwrap()
            .iter()
            .map(|a| a.version)
            .collect();
        assert_eq!(versions, (1..=16).collect::<Vec<u64>>());
        assert_eq!(stores[1].read_latest("alice").unwrap().version, 16);
    }

    #[test]
    fn test_lock_file_does_not_count_as_history() {
        let (_dir, store) = store(5);
        store.publish("alice", &result(1000.0), &[], &[]).unwrap();

        assert!(store.root().join("alice").join(LOCK_FILE).exists());
        assert_eq!(store.read_history("alice").unwrap().len(), 1);
        assert_eq!(store.published_users().unwrap(), vec!["alice"]);
    }

    #[test]
    fn test_model_state_round_trip() {
        use crate::forecast::{Forecaster, MovingAverage};
        use crate::models::{SeriesPoint, TimeSeries};

        let (_dir, store) = store(5);
        assert!(matches!(store.load_model_state("alice"), Err(Error::NotFound(_))));

        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let series = TimeSeries {
            period: Period::Day,
            points: (0..10)
                .map(|i| SeriesPoint {
                    start: start + chrono::Duration::days(i),
                    total: 10.0 + i as f64,
                })
                .collect(),
        };
        let state = MovingAverage::new(3).fit(&series).unwrap();
        store.save_model_state("alice", &state).unwrap();

        assert_eq!(store.load_model_state("alice").unwrap(), state);
    }
}
