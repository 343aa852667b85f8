//! Extended attributes and their debounced persistence

mod common;

use std::time::Duration;

use ::common::prelude::*;
use ::common::xattr::AttributeError;

#[tokio::test(start_paused = true)]
async fn test_attribute_writes_coalesce_into_one_save() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();
    fs.write("/f", b"data").await.unwrap();
    room.clear_journal();

    fs.set_attribute("/f", "user.a", "1".to_string()).await.unwrap();
    fs.set_attribute("/f", "user.b", "2".to_string()).await.unwrap();
    fs.set_attribute("/f", "user.a", "3".to_string()).await.unwrap();
    assert!(room.journal().puts.is_empty());

    tokio::time::sleep(Duration::from_millis(500)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(room.journal().puts, vec!["/f".to_string()]);
    let record = room.record("/f").unwrap();
    assert_eq!(record.xattr.get("user.a").map(String::as_str), Some("3"));
    assert_eq!(record.xattr.get("user.b").map(String::as_str), Some("2"));
    // Content survived the metadata save
    assert_eq!(record.data.as_deref(), Some("data"));
}

#[tokio::test(start_paused = true)]
async fn test_explicit_save_cancels_pending_attribute_save() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();
    fs.write("/f", b"one").await.unwrap();

    fs.set_attribute("/f", "user.k", "v".to_string()).await.unwrap();
    fs.write("/f", b"two").await.unwrap();
    assert!(!fs.debouncer().is_pending("/f"));
    room.clear_journal();

    tokio::time::sleep(Duration::from_secs(1)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    // The write already carried the attribute; no second save
    assert!(room.journal().puts.is_empty());
    assert_eq!(
        room.record("/f").unwrap().xattr.get("user.k").map(String::as_str),
        Some("v")
    );
}

#[tokio::test(start_paused = true)]
async fn test_unmount_drops_pending_saves() {
    let (mount, room) = common::setup_mount().await;
    mount.fs().write("/f", b"x").await.unwrap();
    mount
        .fs()
        .set_attribute("/f", "user.k", "v".to_string())
        .await
        .unwrap();
    room.clear_journal();

    mount.unmount().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(room.journal().puts.is_empty());
    assert!(room.record("/f").unwrap().xattr.is_empty());
}

#[tokio::test]
async fn test_flush_saves_immediately() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();
    fs.create_dir("/d").await.unwrap();
    fs.set_attribute("/d", "user.owner", "me".to_string()).await.unwrap();

    assert!(fs.flush_attributes("/d").await.unwrap());
    assert!(!fs.flush_attributes("/d").await.unwrap());
    assert_eq!(
        room.record("/d").unwrap().xattr.get("user.owner").map(String::as_str),
        Some("me")
    );
}

#[tokio::test]
async fn test_reserved_namespace_is_read_only() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();
    fs.write("/f", b"x").await.unwrap();

    let err = fs
        .set_attribute("/f", "matrixfs.sender", "@mallory:evil".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::Attribute(AttributeError::Reserved(_))));
    assert!(matches!(
        fs.remove_attribute("/f", "matrixfs.eventid").await,
        Err(FsError::Attribute(AttributeError::Reserved(_)))
    ));

    let names = fs.list_attribute_names("/f").await.unwrap();
    assert!(names.contains(&"matrixfs.eventid".to_string()));
    assert!(names.contains(&"matrixfs.sender".to_string()));
    assert!(names.contains(&"matrixfs.fragmented".to_string()));
    assert!(room.record("/f").unwrap().xattr.is_empty());
}

#[tokio::test]
async fn test_remove_attribute() {
    let (mount, _room) = common::setup_mount().await;
    let fs = mount.fs();
    fs.write("/f", b"x").await.unwrap();
    fs.set_attribute("/f", "user.k", "v".to_string()).await.unwrap();
    fs.remove_attribute("/f", "user.k").await.unwrap();

    assert!(fs.get_attribute("/f", "user.k").await.unwrap().is_none());
    assert!(matches!(
        fs.remove_attribute("/f", "user.k").await,
        Err(FsError::Attribute(AttributeError::NotFound(_)))
    ));
    let all = fs.get_attributes("/f").await.unwrap();
    assert!(!all.contains_key("user.k"));
    assert_eq!(all.get("matrixfs.fragmented").map(String::as_str), Some("false"));
}
