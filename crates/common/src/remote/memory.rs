//! In-process room state
//!
//! Behaves like a single room on a homeserver: records are keyed by path,
//! every change gets a fresh event id and a server timestamp, and every
//! change (including the mount's own writes) is echoed to the live feed.
//! Tests use the extra handles to play other users, change power levels,
//! make writes fail and inspect which requests were made.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{RecordChange, RemoteError, RemoteRecord, RoomEvent, RoomStateProvider};
use crate::auth::PowerLevels;
use crate::entry::{now_millis, RecordMeta, StateRecord, RECORD_TYPE};

/// Requests the provider served, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    pub puts: Vec<String>,
    pub deletes: Vec<String>,
    pub gets: Vec<String>,
}

#[derive(Debug, Default)]
struct RoomState {
    records: BTreeMap<String, (StateRecord, RecordMeta)>,
    power_levels: Option<PowerLevels>,
    clock: i64,
    next_event: u64,
    fail_writes: bool,
    journal: Journal,
}

impl RoomState {
    /// Next server timestamp; strictly increasing even within a millisecond
    fn tick(&mut self) -> i64 {
        self.clock = (self.clock + 1).max(now_millis());
        self.clock
    }

    fn meta(&mut self, sender: &str, timestamp: i64) -> RecordMeta {
        self.next_event += 1;
        RecordMeta {
            event_id: Some(format!("$memory{}", self.next_event)),
            sender: Some(sender.to_string()),
            timestamp,
        }
    }
}

#[derive(Debug)]
struct Inner {
    actor: String,
    state: Mutex<RoomState>,
    events_tx: flume::Sender<RoomEvent>,
    events_rx: flume::Receiver<RoomEvent>,
}

/// Cheap to clone; clones share the same room
#[derive(Debug, Clone)]
pub struct MemoryRoomState {
    inner: Arc<Inner>,
}

impl MemoryRoomState {
    pub fn new(actor: impl Into<String>) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            inner: Arc::new(Inner {
                actor: actor.into(),
                state: Mutex::new(RoomState::default()),
                events_tx,
                events_rx,
            }),
        }
    }

    /// A room in which `actor` holds enough power to write records
    pub fn writable(actor: impl Into<String>) -> Self {
        let actor = actor.into();
        let room = Self::new(actor.clone());
        let mut levels = PowerLevels::default();
        levels.users.insert(actor, 100);
        room.inner.state.lock().power_levels = Some(levels);
        room
    }

    /// Replace the power levels and announce the change
    pub fn set_power_levels(&self, levels: PowerLevels) {
        self.inner.state.lock().power_levels = Some(levels.clone());
        self.emit(RoomEvent::PowerLevels(levels));
    }

    /// Write a record as another user at a chosen timestamp
    pub fn inject(&self, key: &str, record: StateRecord, sender: &str, timestamp: i64) {
        self.inject_content(key, record.to_content(), sender, timestamp);
    }

    /// Write raw content as another user; empty content clears the record
    pub fn inject_content(&self, key: &str, content: serde_json::Value, sender: &str, timestamp: i64) {
        let meta = {
            let mut state = self.inner.state.lock();
            state.clock = state.clock.max(timestamp);
            let meta = state.meta(sender, timestamp);
            match StateRecord::from_content(&content) {
                Ok(Some(record)) => {
                    state.records.insert(key.to_string(), (record, meta.clone()));
                }
                Ok(None) => {
                    state.records.remove(key);
                }
                Err(err) => {
                    tracing::debug!("injecting malformed record at {}: {}", key, err);
                }
            }
            meta
        };
        self.emit(RoomEvent::Record(RecordChange {
            event_type: RECORD_TYPE.to_string(),
            key: key.to_string(),
            content,
            meta,
        }));
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn fail_writes(&self, fail: bool) {
        self.inner.state.lock().fail_writes = fail;
    }

    /// The stored record under `key`, if any
    pub fn record(&self, key: &str) -> Option<StateRecord> {
        self.inner
            .state
            .lock()
            .records
            .get(key)
            .map(|(record, _)| record.clone())
    }

    /// Every key currently holding a record
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().records.keys().cloned().collect()
    }

    pub fn journal(&self) -> Journal {
        self.inner.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.inner.state.lock().journal = Journal::default();
    }

    /// Drop every undelivered event from the live feed
    pub fn drain_events(&self) -> usize {
        self.inner.events_rx.drain().count()
    }

    fn emit(&self, event: RoomEvent) {
        // The receiver lives in `inner`, so the channel never disconnects
        let _ = self.inner.events_tx.send(event);
    }

    fn check_writable(&self, state: &RoomState) -> Result<(), RemoteError> {
        if state.fail_writes {
            return Err(RemoteError::Transport("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomStateProvider for MemoryRoomState {
    fn actor(&self) -> &str {
        &self.inner.actor
    }

    async fn put_record(&self, key: &str, record: &StateRecord) -> Result<Option<String>, RemoteError> {
        let meta = {
            let mut state = self.inner.state.lock();
            self.check_writable(&state)?;
            state.journal.puts.push(key.to_string());
            let timestamp = state.tick();
            let meta = state.meta(&self.inner.actor, timestamp);
            state
                .records
                .insert(key.to_string(), (record.clone(), meta.clone()));
            meta
        };
        let event_id = meta.event_id.clone();
        self.emit(RoomEvent::Record(RecordChange {
            event_type: RECORD_TYPE.to_string(),
            key: key.to_string(),
            content: record.to_content(),
            meta,
        }));
        Ok(event_id)
    }

    async fn delete_record(&self, key: &str) -> Result<Option<String>, RemoteError> {
        let meta = {
            let mut state = self.inner.state.lock();
            self.check_writable(&state)?;
            state.journal.deletes.push(key.to_string());
            let timestamp = state.tick();
            state.records.remove(key);
            state.meta(&self.inner.actor, timestamp)
        };
        let event_id = meta.event_id.clone();
        self.emit(RoomEvent::Record(RecordChange {
            event_type: RECORD_TYPE.to_string(),
            key: key.to_string(),
            content: serde_json::json!({}),
            meta,
        }));
        Ok(event_id)
    }

    async fn get_record(&self, key: &str) -> Result<Option<RemoteRecord>, RemoteError> {
        let mut state = self.inner.state.lock();
        state.journal.gets.push(key.to_string());
        Ok(state.records.get(key).map(|(record, meta)| RemoteRecord {
            record: record.clone(),
            meta: meta.clone(),
        }))
    }

    async fn power_levels(&self) -> Result<Option<PowerLevels>, RemoteError> {
        Ok(self.inner.state.lock().power_levels.clone())
    }

    async fn catch_up(&self) -> Result<Vec<RoomEvent>, RemoteError> {
        // Everything queued so far is part of the snapshot
        self.drain_events();

        let state = self.inner.state.lock();
        let mut events: Vec<RoomEvent> = state
            .records
            .iter()
            .map(|(key, (record, meta))| {
                RoomEvent::Record(RecordChange {
                    event_type: RECORD_TYPE.to_string(),
                    key: key.clone(),
                    content: record.to_content(),
                    meta: meta.clone(),
                })
            })
            .collect();
        if let Some(levels) = &state.power_levels {
            events.push(RoomEvent::PowerLevels(levels.clone()));
        }
        Ok(events)
    }

    async fn poll(&self) -> Result<Vec<RoomEvent>, RemoteError> {
        let first = self
            .inner
            .events_rx
            .recv_async()
            .await
            .map_err(|_| RemoteError::Closed)?;
        let mut batch = vec![first];
        batch.extend(self.inner.events_rx.try_iter());
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_record(data: &str) -> StateRecord {
        StateRecord {
            kind: "f".to_string(),
            data: Some(data.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let room = MemoryRoomState::writable("@me:local");
        let event_id = room.put_record("/a", &file_record("hi")).await.unwrap();
        assert!(event_id.is_some());

        let fetched = room.get_record("/a").await.unwrap().unwrap();
        assert_eq!(fetched.record.data.as_deref(), Some("hi"));
        assert_eq!(fetched.meta.sender.as_deref(), Some("@me:local"));
        assert_eq!(fetched.meta.event_id, event_id);
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let room = MemoryRoomState::writable("@me:local");
        room.put_record("/a", &file_record("1")).await.unwrap();
        let first = room.get_record("/a").await.unwrap().unwrap().meta.timestamp;
        room.put_record("/a", &file_record("2")).await.unwrap();
        let second = room.get_record("/a").await.unwrap().unwrap().meta.timestamp;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_writes_are_echoed() {
        let room = MemoryRoomState::writable("@me:local");
        room.put_record("/a", &file_record("hi")).await.unwrap();
        room.delete_record("/a").await.unwrap();

        let batch = room.poll().await.unwrap();
        assert_eq!(batch.len(), 2);
        let RoomEvent::Record(cleared) = &batch[1] else {
            panic!("expected a record change");
        };
        assert_eq!(cleared.content, serde_json::json!({}));
        assert!(room.get_record("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let room = MemoryRoomState::writable("@me:local");
        room.fail_writes(true);
        assert!(matches!(
            room.put_record("/a", &file_record("x")).await,
            Err(RemoteError::Transport(_))
        ));
        assert!(room.keys().is_empty());
        room.fail_writes(false);
        room.put_record("/a", &file_record("x")).await.unwrap();
        assert_eq!(room.keys(), vec!["/a".to_string()]);
    }

    #[tokio::test]
    async fn test_catch_up_snapshot() {
        let room = MemoryRoomState::writable("@me:local");
        room.inject("/b", file_record("b"), "@other:remote", 10);
        room.inject("/a", file_record("a"), "@other:remote", 20);

        let events = room.catch_up().await.unwrap();
        // Two records plus the power levels
        assert_eq!(events.len(), 3);
        assert!(matches!(events.last(), Some(RoomEvent::PowerLevels(_))));
        assert_eq!(room.drain_events(), 0);
    }
}
