//! FUSE integration
//!
//! - `RoomFs`: the `fuser` filesystem, one per mounted room
//! - `InodeTable`: inode numbers for room paths
//! - `errno`: engine errors as kernel error numbers

mod errno;
mod inode_table;
mod room_fs;

use std::path::Path;

use fuser::{BackgroundSession, MountOption};
use tokio::runtime::Handle;

use common::prelude::{MatrixFs, RoomStateProvider};

pub use errno::{errno, NO_ATTRIBUTE};
pub use inode_table::InodeTable;
pub use room_fs::RoomFs;

/// Mount `fs` on `mount_point` and serve it from a background thread
///
/// Must be called from within a tokio runtime; filesystem callbacks run
/// their engine calls on it. Dropping the session unmounts.
pub fn spawn<P: RoomStateProvider>(
    fs: MatrixFs<P>,
    mount_point: &Path,
    allow_other: bool,
) -> std::io::Result<BackgroundSession> {
    let runtime = Handle::try_current().map_err(std::io::Error::other)?;

    let mut options = vec![
        MountOption::FSName("matrixfs".to_string()),
        MountOption::Subtype("matrixfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoDev,
        MountOption::NoSuid,
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
    }

    tracing::info!("mounting on {}", mount_point.display());
    fuser::spawn_mount2(RoomFs::new(fs, runtime), mount_point, &options)
}
