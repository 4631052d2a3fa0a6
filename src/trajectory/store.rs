//! Persistent run records
//!
//! Saves finished runs to disk so their trajectories can be inspected later.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::Trajectory;

/// A saved run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Session ID
    pub id: String,
    /// Unix time (ms) the record was created
    pub created_at_ms: u64,
    /// Signature the run was started with
    pub signature: String,
    /// Terminal status ("completed", "budget_exhausted", ...)
    pub status: String,
    /// Submitted outputs (empty when the run failed)
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Reasoning preceding the accepted submission
    pub closing_reasoning: Option<String>,
    pub llm_calls: usize,
    pub trajectory: Trajectory,
}

impl RunRecord {
    pub fn new(
        id: impl Into<String>,
        signature: impl Into<String>,
        status: impl Into<String>,
        trajectory: Trajectory,
    ) -> Self {
        Self {
            id: id.into(),
            created_at_ms: unix_millis(),
            signature: signature.into(),
            status: status.into(),
            outputs: BTreeMap::new(),
            closing_reasoning: None,
            llm_calls: 0,
            trajectory,
        }
    }
}

/// Summary of a run for listing
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub signature: String,
    pub status: String,
    pub created_at_ms: u64,
    pub iterations: usize,
}

/// Run storage manager
pub struct TrajectoryStore {
    /// Base directory for run files
    base_dir: PathBuf,
}

impl TrajectoryStore {
    /// Create a new store, creating the directory if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Save a run, returning the file it was written to
    pub fn save(&self, record: &RunRecord) -> std::io::Result<PathBuf> {
        let path = self.record_path(&record.id);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Load a run by session ID
    pub fn load(&self, id: &str) -> std::io::Result<RunRecord> {
        Self::load_from_path(&self.record_path(id))
    }

    /// List all runs, newest first
    pub fn list(&self) -> std::io::Result<Vec<RunSummary>> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(record) = Self::load_from_path(&path) {
                    runs.push(RunSummary {
                        id: record.id,
                        signature: record.signature,
                        status: record.status,
                        created_at_ms: record.created_at_ms,
                        iterations: record.trajectory.len(),
                    });
                }
            }
        }
        // Session IDs are UUIDv7, so they break ties in creation order
        runs.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(runs)
    }

    /// Delete a run
    pub fn delete(&self, id: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.record_path(id))
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", id))
    }

    fn load_from_path(path: &Path) -> std::io::Result<RunRecord> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

fn unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
