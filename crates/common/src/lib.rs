//! Path-state engine for matrixfs
//!
//! A room's state is a set of records keyed by path. This crate keeps an
//! in-memory table of those paths, turns filesystem operations into record
//! writes (splitting and encoding content as needed), applies incoming
//! changes with last-writer-wins, and evicts idle content in the
//! background. The OS integration and the homeserver client live in the
//! daemon crate.

pub mod auth;
pub mod codec;
pub mod debounce;
pub mod entry;
pub mod fragments;
pub mod fs;
pub mod mount;
pub mod path;
pub mod reclaim;
pub mod remote;
pub mod sync;
pub mod table;
pub mod xattr;

pub mod prelude {
    pub use crate::auth::{AuthDefaults, PowerLevels};
    pub use crate::entry::{EntryKind, RECORD_TYPE};
    pub use crate::fs::{FsError, MatrixFs, Stat, Timestamps};
    pub use crate::mount::{Mount, MountError, MountOptions};
    pub use crate::remote::{
        MemoryRoomState, RecordChange, RemoteError, RemoteRecord, RoomEvent, RoomStateProvider,
    };
}
