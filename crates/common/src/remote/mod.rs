//! The remote side of a mount: a room's shared state
//!
//! The engine never talks to a homeserver directly. Everything it needs
//! (writing and clearing records, fetching one, the catch-up snapshot and
//! the live feed) goes through [`RoomStateProvider`], so a mount can run
//! against a real homeserver or against [`MemoryRoomState`] in tests.

mod memory;

pub use memory::{Journal, MemoryRoomState};

use async_trait::async_trait;

use crate::auth::PowerLevels;
use crate::entry::{RecordMeta, StateRecord};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("remote connection closed")]
    Closed,
}

/// A record fetched by key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub record: StateRecord,
    pub meta: RecordMeta,
}

/// A raw state change as delivered by the room
///
/// Content is kept undecoded so a malformed record can be reported and
/// skipped without failing the rest of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    pub event_type: String,
    pub key: String,
    pub content: serde_json::Value,
    pub meta: RecordMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Record(RecordChange),
    PowerLevels(PowerLevels),
}

#[async_trait]
pub trait RoomStateProvider: Send + Sync + std::fmt::Debug + 'static {
    /// User id the mount acts as
    fn actor(&self) -> &str;

    /// Store a record under `key`; returns the id of the resulting event
    /// when the remote reports one
    async fn put_record(&self, key: &str, record: &StateRecord) -> Result<Option<String>, RemoteError>;

    /// Clear the record under `key`; returns the id of the resulting event
    /// when the remote reports one
    async fn delete_record(&self, key: &str) -> Result<Option<String>, RemoteError>;

    /// Fetch the current record under `key`; `None` when absent or cleared
    async fn get_record(&self, key: &str) -> Result<Option<RemoteRecord>, RemoteError>;

    /// Current power levels of the room, if it has any
    async fn power_levels(&self) -> Result<Option<PowerLevels>, RemoteError>;

    /// Snapshot of the room state, used once when mounting
    async fn catch_up(&self) -> Result<Vec<RoomEvent>, RemoteError>;

    /// Wait for the next batch of state changes
    async fn poll(&self) -> Result<Vec<RoomEvent>, RemoteError>;
}
