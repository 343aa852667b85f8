//! Running a mounted room until shutdown
//!
//! [`run`] starts the engine, attaches the kernel filesystem when a mount
//! point is given and blocks until ctrl-c. Without a mount point the room
//! is only kept in sync, which is how `--memory` runs are smoke tested.

use std::future::Future;
use std::path::{Path, PathBuf};

use common::prelude::{Mount, MountError, MountOptions, RoomStateProvider};
use common::sync::CatchUpStats;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error("failed to mount on {path}: {source}")]
    Fuse {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("built without FUSE support; cannot mount on {0}")]
    FuseUnavailable(PathBuf),
    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

/// What a finished run looked like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub catch_up: CatchUpStats,
    /// Paths known when the mount was taken down
    pub paths: usize,
}

/// Serve the room until ctrl-c
pub async fn run<P: RoomStateProvider>(
    provider: P,
    options: MountOptions,
    mount_point: Option<&Path>,
    allow_other: bool,
) -> Result<RunSummary, DaemonError> {
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = signal_tx.send(tokio::signal::ctrl_c().await);
    });

    let mut result = Ok(());
    let summary = run_until(provider, options, mount_point, allow_other, async {
        if let Ok(Err(err)) = signal_rx.await {
            result = Err(DaemonError::Signal(err));
        }
    })
    .await?;
    result.map(|()| summary)
}

/// Serve the room until `shutdown` completes
pub async fn run_until<P, F>(
    provider: P,
    options: MountOptions,
    mount_point: Option<&Path>,
    allow_other: bool,
    shutdown: F,
) -> Result<RunSummary, DaemonError>
where
    P: RoomStateProvider,
    F: Future<Output = ()>,
{
    let mount = Mount::start(provider, options).await?;
    let catch_up = mount.catch_up_stats();

    let session = match mount_point {
        Some(path) => match attach(&mount, path, allow_other) {
            Ok(session) => Some(session),
            Err(err) => {
                mount.unmount().await;
                return Err(err);
            }
        },
        None => {
            tracing::info!("no mount point; keeping the room in sync only");
            None
        }
    };

    shutdown.await;
    tracing::info!("shutting down");

    // Unmount from the kernel before the engine stops
    #[cfg(feature = "fuse")]
    drop(session);
    #[cfg(not(feature = "fuse"))]
    let _ = session;
    let paths = mount.fs().table().len();
    mount.unmount().await;

    Ok(RunSummary { catch_up, paths })
}

#[cfg(feature = "fuse")]
fn attach<P: RoomStateProvider>(
    mount: &Mount<P>,
    path: &Path,
    allow_other: bool,
) -> Result<fuser::BackgroundSession, DaemonError> {
    crate::fuse::spawn(mount.fs().clone(), path, allow_other).map_err(|source| DaemonError::Fuse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(not(feature = "fuse"))]
fn attach<P: RoomStateProvider>(
    _mount: &Mount<P>,
    path: &Path,
    _allow_other: bool,
) -> Result<(), DaemonError> {
    Err(DaemonError::FuseUnavailable(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::entry::StateRecord;
    use common::prelude::MemoryRoomState;

    #[tokio::test]
    async fn test_headless_run_returns_summary() {
        let room = MemoryRoomState::writable("@me:example.org");
        let dir = StateRecord {
            kind: "d".to_string(),
            ..Default::default()
        };
        room.inject("/docs", dir, "@other:example.org", 10);
        let options = MountOptions {
            listen: false,
            retention_secs: -1,
            ..Default::default()
        };

        let summary = run_until(room, options, None, false, async {}).await.unwrap();
        assert!(summary.catch_up.writable);
        assert_eq!(summary.catch_up.applied, 1);
        assert_eq!(summary.paths, 1);
    }
}
