//! Run storage backends
//!
//! One snapshot record and one append-only event log per run id, nothing
//! shared between runs. Backends perform whole-record writes; serializing
//! writers of the same run is the registry's job.

use async_trait::async_trait;
use quarry_core::{QuarryError, Result, RunEvent, RunSnapshot};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const SNAPSHOT_FILE: &str = "snapshot.json";
const EVENTS_FILE: &str = "events.jsonl";

/// Persistence for run snapshots and event logs
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn read_snapshot(&self, run_id: &str) -> Result<Option<RunSnapshot>>;

    /// Replace the stored snapshot for `snapshot.run_id`
    async fn write_snapshot(&self, snapshot: &RunSnapshot) -> Result<()>;

    async fn append_event(&self, run_id: &str, event: &RunEvent) -> Result<()>;

    /// Events in append order; empty if the run has none
    async fn read_events(&self, run_id: &str) -> Result<Vec<RunEvent>>;

    async fn list_snapshots(&self) -> Result<Vec<RunSnapshot>>;
}

/// Filesystem store: `<root>/<run_id>/snapshot.json` and `<root>/<run_id>/events.jsonl`
///
/// Snapshots are written to a temp file and renamed over the old one, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.root.join(run_id))
    }
}

/// Run ids double as directory names
fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(QuarryError::InvalidRunId(run_id.to_string()))
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn read_snapshot(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        let path = self.run_dir(run_id)?.join(SNAPSHOT_FILE);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_snapshot(&self, snapshot: &RunSnapshot) -> Result<()> {
        let dir = self.run_dir(&snapshot.run_id)?;
        fs::create_dir_all(&dir).await?;

        let content = serde_json::to_vec_pretty(snapshot)?;
        let tmp = dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, dir.join(SNAPSHOT_FILE)).await?;

        debug!("Wrote snapshot for run {}", snapshot.run_id);
        Ok(())
    }

    async fn append_event(&self, run_id: &str, event: &RunEvent) -> Result<()> {
        let dir = self.run_dir(run_id)?;
        fs::create_dir_all(&dir).await?;

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let path = self.run_dir(run_id)?.join(EVENTS_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }

    async fn list_snapshots(&self) -> Result<Vec<RunSnapshot>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(run_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.read_snapshot(&run_id).await {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable run {}: {}", run_id, e),
            }
        }
        Ok(snapshots)
    }
}

#[derive(Default)]
struct MemoryRun {
    snapshot: Option<RunSnapshot>,
    events: Vec<RunEvent>,
}

/// In-process store for tests and throwaway runs
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, MemoryRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn read_snapshot(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.get(run_id).and_then(|r| r.snapshot.clone()))
    }

    async fn write_snapshot(&self, snapshot: &RunSnapshot) -> Result<()> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        runs.entry(snapshot.run_id.clone()).or_default().snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn append_event(&self, run_id: &str, event: &RunEvent) -> Result<()> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        runs.entry(run_id.to_string())
            .or_default()
            .events
            .push(event.clone());
        Ok(())
    }

    async fn read_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.get(run_id).map(|r| r.events.clone()).unwrap_or_default())
    }

    async fn list_snapshots(&self) -> Result<Vec<RunSnapshot>> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.values().filter_map(|r| r.snapshot.clone()).collect())
    }
}
