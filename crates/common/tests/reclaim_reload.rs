//! Evicting idle content and fetching it back on demand

mod common;

use std::sync::Arc;
use std::time::Duration;

use ::common::entry::{now_millis, StateRecord};
use ::common::fragments::fragment_path;
use ::common::prelude::*;
use ::common::reclaim::CacheReclaimer;

const AN_HOUR: i64 = 60 * 60 * 1000;

/// Another user rewrites `path` as two fragments, without the mount hearing of it
fn rewrite_as_fragments(room: &MemoryRoomState, path: &str, at: i64) {
    for (index, chunk) in ["hello ", "world"].into_iter().enumerate() {
        room.inject(
            &fragment_path(path, index),
            StateRecord {
                kind: "F".to_string(),
                data: Some(chunk.to_string()),
                ..Default::default()
            },
            common::OTHER,
            at,
        );
    }
    room.inject(
        path,
        StateRecord {
            kind: "f".to_string(),
            fragmented: true,
            fragments: Some(2),
            size: Some(11),
            ..Default::default()
        },
        common::OTHER,
        at,
    );
}

#[tokio::test]
async fn test_inline_file_reloads_after_eviction() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();
    let text = common::ascii_text(4 * 1024);
    fs.write("/notes.txt", &text).await.unwrap();

    let reclaimer = CacheReclaimer::new(fs.table().clone(), 60).unwrap();
    let stats = reclaimer.sweep_at(now_millis() + AN_HOUR);
    assert_eq!(stats.evicted_files, 1);

    // Metadata is still served without the room
    room.clear_journal();
    assert_eq!(fs.size("/notes.txt").await.unwrap(), text.len() as u64);
    assert_eq!(fs.list_children("/").unwrap(), vec!["notes.txt".to_string()]);
    assert!(room.journal().gets.is_empty());

    assert_eq!(fs.read("/notes.txt").await.unwrap(), text);
    assert_eq!(room.journal().gets, vec!["/notes.txt".to_string()]);
}

#[tokio::test]
async fn test_fragmented_file_reloads_after_eviction() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();
    let binary = common::random_bytes(100 * 1024);
    fs.write("/blob", &binary).await.unwrap();

    let reclaimer = CacheReclaimer::new(fs.table().clone(), 60).unwrap();
    let stats = reclaimer.sweep_at(now_millis() + AN_HOUR);
    assert_eq!(stats.evicted_fragments, 3);

    room.clear_journal();
    assert_eq!(fs.read("/blob").await.unwrap(), binary);
    assert_eq!(room.journal().gets.len(), 3);

    // The read refreshed the access time: a sweep right after keeps it
    let stats = reclaimer.sweep_at(now_millis() + 1_000);
    assert_eq!(stats.evicted_fragments, 0);
}

#[tokio::test]
async fn test_sweep_skips_entry_being_reloaded() {
    let (mount, _room) = common::setup_mount().await;
    let fs = mount.fs();
    fs.write("/f", b"payload").await.unwrap();

    let reclaimer = CacheReclaimer::new(fs.table().clone(), 0).unwrap();
    let cell = fs.table().get("/f").unwrap();
    let guard = cell.lock().await;
    let stats = reclaimer.sweep_at(now_millis() + AN_HOUR);
    assert_eq!(stats.skipped_busy, 1);
    drop(guard);

    assert_eq!(fs.read("/f").await.unwrap(), b"payload");
}

#[tokio::test]
async fn test_metadata_save_of_evicted_file_keeps_content() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();
    fs.write("/script.sh", b"#!/bin/sh\necho hi\n").await.unwrap();

    CacheReclaimer::new(fs.table().clone(), 0)
        .unwrap()
        .sweep_at(now_millis() + AN_HOUR);
    fs.set_executable("/script.sh", true).await.unwrap();

    let record = room.record("/script.sh").unwrap();
    assert!(record.executable);
    assert_eq!(record.data.as_deref(), Some("#!/bin/sh\necho hi\n"));
    assert!(fs.is_executable("/script.sh").await);
}

#[tokio::test]
async fn test_metadata_save_keeps_remotely_fragmented_content() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();
    fs.write("/doc", b"hello").await.unwrap();
    CacheReclaimer::new(fs.table().clone(), 0)
        .unwrap()
        .sweep_at(now_millis() + AN_HOUR);

    rewrite_as_fragments(&room, "/doc", now_millis());
    fs.set_executable("/doc", true).await.unwrap();

    let record = room.record("/doc").unwrap();
    assert!(record.fragmented);
    assert_eq!(record.fragments, Some(2));
    assert!(record.data.is_none());
    assert!(record.executable);
    assert!(room.record(&fragment_path("/doc", 1)).is_some());
    assert_eq!(fs.read("/doc").await.unwrap(), b"hello world");
}

#[tokio::test]
async fn test_reload_follows_remote_layout_change() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();
    fs.write("/doc", b"hello").await.unwrap();
    CacheReclaimer::new(fs.table().clone(), 0)
        .unwrap()
        .sweep_at(now_millis() + AN_HOUR);

    // Behind our clock, but the inline content we evicted no longer exists
    rewrite_as_fragments(&room, "/doc", 1);
    assert_eq!(fs.read("/doc").await.unwrap(), b"hello world");
    assert_eq!(fs.size("/doc").await.unwrap(), 11);
}

#[tokio::test]
async fn test_background_reclaimer_runs_and_stops() {
    let room = MemoryRoomState::writable(common::ME);
    let options = MountOptions {
        listen: false,
        retention_secs: 0,
        reclaim_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let (mount, _room) = common::setup_mount_with(room, options).await;
    mount.fs().write("/f", b"payload").await.unwrap();

    let table: Arc<_> = mount.fs().table().clone();
    let mut evicted = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cell = table.get("/f").unwrap();
        if !cell.lock().await.is_clean() {
            evicted = true;
            break;
        }
    }
    assert!(evicted);
    assert_eq!(mount.fs().read("/f").await.unwrap(), b"payload");
    mount.unmount().await;
}
