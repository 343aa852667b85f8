//! Applying room state changes to the path table
//!
//! Record changes follow last-writer-wins: a change is applied only when
//! its timestamp is strictly newer than the entry held for that path, so
//! replays and out-of-order deliveries are harmless. Power-level changes
//! reopen or close the mount's write gate.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthDefaults, PowerLevels, WriteGate};
use crate::debounce::Debouncer;
use crate::entry::{Entry, EntryKind, StateRecord, RECORD_TYPE};
use crate::fragments;
use crate::path::{self, ROOT};
use crate::remote::{RecordChange, RemoteError, RoomEvent, RoomStateProvider};
use crate::table::PathTable;

/// Pause before polling again after the remote failed
const POLL_BACKOFF: Duration = Duration::from_secs(5);

/// How many of our own event ids are remembered for echo suppression
const ECHO_CAPACITY: usize = 4096;

/// Ids of events this mount produced itself
///
/// The room echoes every write back on the live feed. The table already
/// holds what those events carry, and applying a late echo could undo a
/// local change made after the write, so they are skipped.
#[derive(Debug, Default)]
pub struct EchoFilter {
    inner: Mutex<EchoIds>,
}

#[derive(Debug, Default)]
struct EchoIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl EchoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, event_id: Option<&str>) {
        let Some(event_id) = event_id else {
            return;
        };
        let mut inner = self.inner.lock();
        if inner.ids.insert(event_id.to_string()) {
            inner.order.push_back(event_id.to_string());
        }
        while inner.order.len() > ECHO_CAPACITY {
            if let Some(oldest) = inner.order.pop_front() {
                inner.ids.remove(&oldest);
            }
        }
    }

    /// True when `event_id` is one of ours; forgets it either way
    pub fn take(&self, event_id: Option<&str>) -> bool {
        let Some(event_id) = event_id else {
            return false;
        };
        let mut inner = self.inner.lock();
        if !inner.ids.remove(event_id) {
            return false;
        }
        inner.order.retain(|id| id != event_id);
        true
    }
}

/// What applying one event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Deleted,
    /// Not newer than what the table holds
    Stale,
    /// Echo of this mount's own write
    Echo,
    /// Not a path record, or nothing to act on
    Ignored,
    /// Malformed, unknown or conflicting record; dropped
    Rejected,
    Permissions { writable: bool },
}

/// Counts from the initial synchronization
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpStats {
    pub applied: usize,
    pub rejected: usize,
    pub writable: bool,
}

#[derive(Debug)]
pub struct SyncEngine<P> {
    provider: Arc<P>,
    table: Arc<PathTable>,
    gate: Arc<WriteGate>,
    debouncer: Debouncer,
    echoes: Arc<EchoFilter>,
    defaults: AuthDefaults,
}

impl<P: RoomStateProvider> SyncEngine<P> {
    pub fn new(
        provider: Arc<P>,
        table: Arc<PathTable>,
        gate: Arc<WriteGate>,
        debouncer: Debouncer,
        echoes: Arc<EchoFilter>,
        defaults: AuthDefaults,
    ) -> Self {
        Self {
            provider,
            table,
            gate,
            debouncer,
            echoes,
            defaults,
        }
    }

    pub async fn apply(&self, event: RoomEvent) -> SyncOutcome {
        match event {
            RoomEvent::Record(change) => self.apply_record(change).await,
            RoomEvent::PowerLevels(levels) => self.apply_power_levels(&levels),
        }
    }

    pub fn apply_power_levels(&self, levels: &PowerLevels) -> SyncOutcome {
        let actor = self.provider.actor();
        let writable = levels.can_send(actor, RECORD_TYPE, &self.defaults);
        let was = self.gate.set(writable);
        if was != writable {
            tracing::info!(
                "write access for {} is now {}",
                actor,
                if writable { "granted" } else { "revoked" }
            );
        }
        SyncOutcome::Permissions { writable }
    }

    pub async fn apply_record(&self, change: RecordChange) -> SyncOutcome {
        if change.event_type != RECORD_TYPE {
            return SyncOutcome::Ignored;
        }
        if self.echoes.take(change.meta.event_id.as_deref()) {
            return SyncOutcome::Echo;
        }
        let is_fragment = is_fragment_key(&change.key);
        let key = match path::validate(&change.key) {
            Ok(key) if key == change.key && key != ROOT => key,
            _ if is_fragment => change.key.clone(),
            _ => {
                tracing::warn!("ignoring record with unusable key {:?}", change.key);
                return SyncOutcome::Ignored;
            }
        };

        let record = match StateRecord::from_content(&change.content) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!("dropping malformed record for {}: {}", key, err);
                return SyncOutcome::Rejected;
            }
        };
        if let Some(record) = &record {
            // Fragments live only under fragment keys and nothing else does
            if (record.kind == EntryKind::Fragment.tag()) != is_fragment {
                tracing::warn!("dropping {:?} record under key {}", record.kind, key);
                return SyncOutcome::Rejected;
            }
        }

        match record {
            Some(record) => self.upsert(&key, record, &change).await,
            None => self.remove(&key, change.meta.timestamp).await,
        }
    }

    async fn upsert(&self, key: &str, record: StateRecord, change: &RecordChange) -> SyncOutcome {
        let mut record = Some(record);
        loop {
            if let Some(cell) = self.table.get(key) {
                let mut entry = cell.lock().await;
                if cell.is_retired() {
                    continue;
                }
                if change.meta.timestamp <= entry.timestamp() {
                    tracing::debug!(
                        "discarding stale record for {} ({} <= {})",
                        key,
                        change.meta.timestamp,
                        entry.timestamp()
                    );
                    return SyncOutcome::Stale;
                }
                let Some(record) = record.take() else {
                    return SyncOutcome::Ignored;
                };
                return match entry.merge_record(record, &change.meta) {
                    Ok(()) => {
                        // Remote attributes replace any unsaved local ones
                        self.debouncer.cancel(key);
                        tracing::debug!("updated {} from {:?}", key, change.meta.sender);
                        SyncOutcome::Updated
                    }
                    Err(err) => {
                        tracing::warn!("dropping record: {}", err);
                        SyncOutcome::Rejected
                    }
                };
            }

            let Some(incoming) = record.take() else {
                return SyncOutcome::Ignored;
            };
            let entry = match Entry::from_record(key, incoming.clone(), &change.meta) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("dropping record: {}", err);
                    return SyncOutcome::Rejected;
                }
            };
            match self.table.insert_new(entry) {
                Ok(_) => {
                    tracing::debug!("created {} from {:?}", key, change.meta.sender);
                    return SyncOutcome::Created;
                }
                // Someone inserted it meanwhile; compare against theirs
                Err(_) => record = Some(incoming),
            }
        }
    }

    async fn remove(&self, key: &str, timestamp: i64) -> SyncOutcome {
        let Some(cell) = self.table.get(key) else {
            return SyncOutcome::Ignored;
        };
        let entry = cell.lock().await;
        if cell.is_retired() {
            return SyncOutcome::Ignored;
        }
        if timestamp <= entry.timestamp() {
            tracing::debug!("discarding stale delete of {}", key);
            return SyncOutcome::Stale;
        }
        self.debouncer.cancel(key);
        self.table.remove(key);
        tracing::debug!("deleted {}", key);
        SyncOutcome::Deleted
    }

    /// Load the room's current state; runs once before the mount serves calls
    pub async fn catch_up(&self) -> Result<CatchUpStats, RemoteError> {
        let events = self.provider.catch_up().await?;
        let mut stats = CatchUpStats::default();
        let mut saw_levels = false;

        for event in events {
            match self.apply(event).await {
                SyncOutcome::Rejected => stats.rejected += 1,
                SyncOutcome::Permissions { .. } => saw_levels = true,
                SyncOutcome::Created | SyncOutcome::Updated | SyncOutcome::Deleted => {
                    stats.applied += 1
                }
                SyncOutcome::Stale | SyncOutcome::Echo | SyncOutcome::Ignored => {}
            }
        }

        if !saw_levels {
            let levels = self.provider.power_levels().await?.unwrap_or_default();
            self.apply_power_levels(&levels);
        }

        stats.writable = self.gate.allowed();
        tracing::info!(
            "caught up: {} entries, {} rejected, writable: {}",
            stats.applied,
            stats.rejected,
            stats.writable
        );
        Ok(stats)
    }

    /// Apply live changes until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("listening for room changes");
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.provider.poll() => batch,
            };

            match batch {
                Ok(events) => {
                    for event in events {
                        self.apply(event).await;
                    }
                }
                Err(err) => {
                    tracing::warn!("polling room failed: {}", err);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::info!("listener stopped");
    }
}

/// A well-formed fragment key under a valid owning file path
fn is_fragment_key(key: &str) -> bool {
    let Some((owner, index)) = fragments::parse_fragment_path(key) else {
        return false;
    };
    fragments::fragment_path(owner, index) == key
        && matches!(path::validate(owner), Ok(valid) if valid == owner && valid != ROOT)
}
