//! Run registry
//!
//! Every mutation is a full read-modify-write of the run snapshot performed
//! while holding that run's lock, so concurrent agent completions cannot lose
//! each other's updates. Runs never share a lock.
//!
//! Run status: `queued` -> `running` -> `completed` | `failed`.
//! Agent status: `pending` -> `running` -> `completed` | `failed` | `timeout`.
//! Terminal states on both levels are sticky.

use chrono::Utc;
use quarry_core::fail_open::fail_open;
use quarry_core::{
    event_types, AgentRunResult, ProviderState, ProviderStatus, QuarryError, Result, RunEvent,
    RunId, RunSnapshot, RunStatus,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::store::{FileRunStore, MemoryRunStore, RunStore};

/// Change to one agent's status within a run
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderUpdate {
    pub status: ProviderState,
    pub items_found: Option<usize>,
    pub cost: Option<f64>,
    pub error: Option<String>,
}

impl ProviderUpdate {
    pub fn new(status: ProviderState) -> Self {
        Self {
            status,
            items_found: None,
            cost: None,
            error: None,
        }
    }

    pub fn running() -> Self {
        Self::new(ProviderState::Running)
    }

    pub fn with_items_found(mut self, items: usize) -> Self {
        self.items_found = Some(items);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Terminal update describing a finished agent run
    pub fn from_result(result: &AgentRunResult) -> Self {
        let mut update = Self::new(result.status.provider_state())
            .with_items_found(result.items_found())
            .with_cost(result.cost());
        update.error = result.error_summary();
        update
    }
}

/// Per-run lock; also caches the next event sequence number
#[derive(Default)]
struct RunSlot {
    next_seq: Option<u64>,
}

type SlotHandle = Arc<tokio::sync::Mutex<RunSlot>>;

/// Durable record of run progress
pub struct RunRegistry {
    store: Arc<dyn RunStore>,
    slots: Mutex<HashMap<RunId, SlotHandle>>,
}

impl RunRegistry {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registry persisting under `state_dir`
    pub fn file(state_dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileRunStore::new(state_dir)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRunStore::new()))
    }

    fn slot(&self, run_id: &str) -> SlotHandle {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(run_id.to_string()).or_default())
    }

    /// Forget a finished run's lock
    ///
    /// Once a run is terminal its snapshot only changes through event-pointer
    /// updates, so a later caller may safely start from a fresh slot.
    fn release_slot(&self, run_id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(run_id);
    }

    #[cfg(test)]
    fn tracked_runs(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn require_snapshot(&self, run_id: &str) -> Result<RunSnapshot> {
        self.store
            .read_snapshot(run_id)
            .await?
            .ok_or_else(|| QuarryError::RunNotFound(run_id.to_string()))
    }

    /// Append an event while the run's lock is held
    async fn push_event(
        &self,
        run_id: &str,
        slot: &mut RunSlot,
        event_type: &str,
        payload: Value,
    ) -> Result<RunEvent> {
        let seq = match slot.next_seq {
            Some(seq) => seq,
            None => {
                let existing = self.store.read_events(run_id).await?;
                existing.last().map(|e| e.seq + 1).unwrap_or(1)
            }
        };

        let event = RunEvent {
            seq,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            payload,
        };
        self.store.append_event(run_id, &event).await?;
        slot.next_seq = Some(seq + 1);
        Ok(event)
    }

    /// Append `event_type` to the snapshot's log and write the snapshot
    async fn commit(
        &self,
        slot: &mut RunSlot,
        snapshot: &mut RunSnapshot,
        event_type: &str,
        payload: Value,
    ) -> Result<()> {
        let run_id = snapshot.run_id.clone();
        if let Some(event) = fail_open("registry::push_event", || {
            self.push_event(&run_id, slot, event_type, payload)
        })
        .await
        {
            snapshot.last_event = Some(event.pointer());
        }
        self.store.write_snapshot(snapshot).await
    }

    /// Create a `queued` run, allocating an id when none is given
    pub async fn create_run(
        &self,
        project_id: &str,
        config_ref: Option<String>,
        params: Map<String, Value>,
        run_id: Option<RunId>,
    ) -> Result<RunSnapshot> {
        let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let slot = self.slot(&run_id);
        let mut slot = slot.lock().await;

        if self.store.read_snapshot(&run_id).await?.is_some() {
            return Err(QuarryError::RunExists(run_id));
        }

        let mut snapshot = RunSnapshot::new(&run_id, project_id, config_ref, params);
        let payload = json!({
            "project_id": snapshot.project_id,
            "config_ref": snapshot.config_ref,
            "params": snapshot.params,
        });
        self.commit(&mut slot, &mut snapshot, event_types::RUN_CREATED, payload)
            .await?;

        info!("Created run {} for project {}", run_id, project_id);
        Ok(snapshot)
    }

    /// Ensure a status entry exists for every name; existing entries are untouched
    pub async fn register_providers(&self, run_id: &str, names: &[String]) -> Result<RunSnapshot> {
        let slot = self.slot(run_id);
        let mut slot = slot.lock().await;
        let mut snapshot = self.require_snapshot(run_id).await?;
        if snapshot.status.is_terminal() {
            warn!("Not registering agents: run {} already {}", run_id, snapshot.status);
            return Ok(snapshot);
        }

        for name in names {
            snapshot
                .providers
                .entry(name.clone())
                .or_insert_with(|| ProviderStatus::pending(name));
        }

        let payload = json!({ "providers": names });
        self.commit(
            &mut slot,
            &mut snapshot,
            event_types::PROVIDERS_REGISTERED,
            payload,
        )
        .await?;
        Ok(snapshot)
    }

    /// Apply `update` to agent `name`
    ///
    /// Updates that would move the agent backwards (out of a terminal state,
    /// or from `running` back to `pending`) are ignored and the stored
    /// snapshot is returned unchanged, as are updates to a finished run.
    pub async fn set_provider_status(
        &self,
        run_id: &str,
        name: &str,
        update: ProviderUpdate,
    ) -> Result<RunSnapshot> {
        let slot = self.slot(run_id);
        let mut slot = slot.lock().await;
        let mut snapshot = self.require_snapshot(run_id).await?;

        if snapshot.status.is_terminal() {
            warn!(
                "Ignoring {} update for agent {}: run {} already {}",
                update.status, name, run_id, snapshot.status
            );
            return Ok(snapshot);
        }

        let now = Utc::now();
        let provider = snapshot
            .providers
            .entry(name.to_string())
            .or_insert_with(|| ProviderStatus::pending(name));

        if !provider.status.can_move_to(update.status) {
            warn!(
                "Ignoring {} update for agent {} in run {}: already {}",
                update.status, name, run_id, provider.status
            );
            return Ok(snapshot);
        }

        provider.status = update.status;
        if update.status == ProviderState::Running {
            provider.started_at.get_or_insert(now);
        }
        if update.status.is_terminal() {
            provider.completed_at = Some(now);
        }
        if let Some(items) = update.items_found {
            provider.items_found = items;
        }
        if let Some(cost) = update.cost {
            provider.cost = cost;
        }
        if update.error.is_some() {
            provider.error = update.error.clone();
        }

        if update.status == ProviderState::Running {
            snapshot.mark_started();
        }
        snapshot.recompute_cost();

        let payload = json!({
            "provider": name,
            "status": update.status,
            "items_found": update.items_found,
            "cost": update.cost,
            "error": update.error,
        });
        self.commit(&mut slot, &mut snapshot, event_types::PROVIDER_STATUS, payload)
            .await?;

        debug!("Run {} agent {} -> {}", run_id, name, update.status);
        Ok(snapshot)
    }

    /// Record the current phase; a queued run becomes running
    ///
    /// Progress never moves backwards: a lower `percent` than the stored one
    /// keeps the stored value.
    pub async fn mark_phase(&self, run_id: &str, phase: &str, percent: u8) -> Result<RunSnapshot> {
        let slot = self.slot(run_id);
        let mut slot = slot.lock().await;
        let mut snapshot = self.require_snapshot(run_id).await?;

        if snapshot.status.is_terminal() {
            warn!(
                "Ignoring phase {} for run {}: already {}",
                phase, run_id, snapshot.status
            );
            return Ok(snapshot);
        }

        snapshot.mark_started();
        snapshot.phase = Some(phase.to_string());
        snapshot.percent_complete = snapshot.percent_complete.max(percent.min(100));

        let payload = json!({ "phase": phase, "percent": snapshot.percent_complete });
        self.commit(&mut slot, &mut snapshot, event_types::RUN_PHASE, payload)
            .await?;
        Ok(snapshot)
    }

    /// Append an event to the run's log
    ///
    /// The snapshot's last-event pointer is updated best-effort; a missing or
    /// unwritable snapshot does not fail the append.
    pub async fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<RunEvent> {
        let slot = self.slot(run_id);
        let mut slot = slot.lock().await;
        let event = self.push_event(run_id, &mut slot, event_type, payload).await?;

        fail_open("registry::update_last_event", || async {
            if let Some(mut snapshot) = self.store.read_snapshot(run_id).await? {
                snapshot.last_event = Some(event.pointer());
                self.store.write_snapshot(&snapshot).await?;
            }
            Ok::<(), QuarryError>(())
        })
        .await;

        Ok(event)
    }

    /// Move the run to its terminal status
    ///
    /// `failed` when `error` is given, else `completed` with 100% progress.
    /// Completing an already-terminal run returns it unchanged.
    pub async fn complete_run(
        &self,
        run_id: &str,
        report_path: Option<String>,
        error: Option<String>,
    ) -> Result<RunSnapshot> {
        let slot = self.slot(run_id);
        let mut slot = slot.lock().await;
        let mut snapshot = self.require_snapshot(run_id).await?;

        if snapshot.status.is_terminal() {
            debug!("Run {} already {}", run_id, snapshot.status);
            return Ok(snapshot);
        }

        let now = Utc::now();
        snapshot.started_at.get_or_insert(now);
        snapshot.completed_at = Some(now);
        if report_path.is_some() {
            snapshot.report_path = report_path;
        }
        snapshot.recompute_cost();

        let event_type = match error {
            Some(message) => {
                snapshot.status = RunStatus::Failed;
                snapshot.error = Some(message);
                event_types::RUN_FAILED
            }
            None => {
                snapshot.status = RunStatus::Completed;
                snapshot.percent_complete = 100;
                event_types::RUN_COMPLETED
            }
        };

        let payload = json!({
            "status": snapshot.status,
            "report_path": snapshot.report_path,
            "error": snapshot.error,
            "total_cost": snapshot.total_cost,
        });
        self.commit(&mut slot, &mut snapshot, event_type, payload)
            .await?;
        self.release_slot(run_id);

        info!("Run {} {}", run_id, snapshot.status);
        Ok(snapshot)
    }

    pub async fn load_snapshot(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        self.store.read_snapshot(run_id).await
    }

    /// Most recently started runs first (creation time for runs never started)
    pub async fn list_snapshots(&self, limit: usize) -> Result<Vec<RunSnapshot>> {
        let mut snapshots = self.store.list_snapshots().await?;
        snapshots.sort_by(|a, b| {
            b.started_or_created()
                .cmp(&a.started_or_created())
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        snapshots.truncate(limit);
        Ok(snapshots)
    }

    pub async fn load_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        self.store.read_events(run_id).await
    }
}
