//! Behaviour of builds without the `fuse` feature.
//!
//! Such builds can still keep a room in sync but refuse a mount point, and
//! a visible message is emitted so the skipped kernel tests are not hidden.

#[cfg(not(feature = "fuse"))]
#[test]
fn fuse_tests_skipped_warning() {
    eprintln!(
        "\n\x1b[33mwarning\x1b[0m: Skipping FUSE mount tests: built without `fuse` feature.\n\
         To run FUSE tests, build with: cargo test --features fuse\n"
    );
}

#[cfg(not(feature = "fuse"))]
#[tokio::test]
async fn mount_point_without_fuse_is_refused() {
    use common::prelude::{MemoryRoomState, MountOptions};
    use matrixfs_daemon::{run_until, DaemonError};

    let options = MountOptions {
        listen: false,
        ..Default::default()
    };
    let target = std::path::Path::new("/mnt/matrixfs");
    let err = run_until(
        MemoryRoomState::writable("@me:example.org"),
        options,
        Some(target),
        false,
        async {},
    )
    .await
    .unwrap_err();

    assert!(matches!(err, DaemonError::FuseUnavailable(path) if path == target));
}

#[cfg(not(feature = "fuse"))]
#[tokio::test]
async fn headless_run_without_fuse_shuts_down() {
    use common::prelude::{MemoryRoomState, MountOptions};
    use matrixfs_daemon::run_until;

    let options = MountOptions {
        listen: false,
        ..Default::default()
    };
    let summary = run_until(
        MemoryRoomState::writable("@me:example.org"),
        options,
        None,
        false,
        async {},
    )
    .await
    .unwrap();

    assert!(summary.catch_up.writable);
    assert_eq!(summary.paths, 0);
}
