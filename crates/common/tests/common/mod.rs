//! Shared harness for the engine integration tests

#![allow(dead_code)]

use std::time::Duration;

use ::common::prelude::*;

pub const ME: &str = "@me:example.org";
pub const OTHER: &str = "@other:example.org";

/// Install a subscriber once so `RUST_LOG` works in tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options for deterministic tests: no listener, no reclaimer
pub fn quiet_options() -> MountOptions {
    MountOptions {
        listen: false,
        retention_secs: -1,
        debounce: Duration::from_millis(200),
        ..Default::default()
    }
}

/// A mount over a room in which the local user may write
pub async fn setup_mount() -> (Mount<MemoryRoomState>, MemoryRoomState) {
    setup_mount_with(MemoryRoomState::writable(ME), quiet_options()).await
}

pub async fn setup_mount_with(
    room: MemoryRoomState,
    options: MountOptions,
) -> (Mount<MemoryRoomState>, MemoryRoomState) {
    init_tracing();
    let mount = Mount::start(room.clone(), options).await.unwrap();
    // Catch-up covered everything queued so far
    room.drain_events();
    (mount, room)
}

/// Deliver every queued room event to the mount, as the listener would
pub async fn deliver(mount: &Mount<MemoryRoomState>, room: &MemoryRoomState) {
    loop {
        let mut delivered = false;
        if let Ok(Ok(batch)) =
            tokio::time::timeout(Duration::from_millis(10), room.poll()).await
        {
            for event in batch {
                mount.sync().apply(event).await;
                delivered = true;
            }
        }
        if !delivered {
            break;
        }
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

pub fn ascii_text(len: usize) -> Vec<u8> {
    b"the quick brown fox jumps over the lazy dog\n"
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}
