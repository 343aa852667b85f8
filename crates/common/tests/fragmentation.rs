//! Writing, reading and shrinking fragmented files

mod common;

use ::common::entry::{EntryKind, StateRecord};
use ::common::fragments::{fragment_path, MAX_FRAGMENT_SIZE};
use ::common::prelude::*;

fn fragment_count_for(bytes: &[u8]) -> usize {
    let encoded = ::common::codec::encode(bytes);
    encoded.content.len().div_ceil(MAX_FRAGMENT_SIZE)
}

/// 100 KiB of binary data, then 10 KiB of text over the same path
#[tokio::test]
async fn test_binary_then_text_scenario() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();

    let binary = common::random_bytes(100 * 1024);
    fs.write("/blob.bin", &binary).await.unwrap();

    // 102400 bytes encode to 136536 Base64 characters: three 56 KiB chunks
    let expected = fragment_count_for(&binary);
    assert_eq!(expected, 3);
    let record = room.record("/blob.bin").unwrap();
    assert!(record.fragmented);
    assert_eq!(record.fragments, Some(expected));
    assert_eq!(record.size, Some(binary.len() as u64));
    assert!(record.data.is_none());
    for index in 0..expected {
        let fragment = room.record(&fragment_path("/blob.bin", index)).unwrap();
        assert_eq!(fragment.kind, "F");
        assert!(fragment.data.unwrap().len() <= MAX_FRAGMENT_SIZE);
    }

    assert_eq!(fs.read("/blob.bin").await.unwrap(), binary);
    assert_eq!(fs.size("/blob.bin").await.unwrap(), 100 * 1024);
    assert_eq!(
        fs.get_attribute("/blob.bin", "matrixfs.fragmented").await.unwrap().as_deref(),
        Some("true")
    );

    let text = common::ascii_text(10 * 1024);
    fs.write("/blob.bin", &text).await.unwrap();

    let record = room.record("/blob.bin").unwrap();
    assert!(!record.fragmented);
    assert_eq!(record.data.as_deref().map(str::len), Some(10 * 1024));
    for index in 0..expected {
        let path = fragment_path("/blob.bin", index);
        assert!(room.record(&path).is_none(), "{} should be gone", path);
        assert!(!mount.fs().table().contains(&path));
    }
    assert!(room.journal().deletes.len() >= expected);
    assert_eq!(fs.read("/blob.bin").await.unwrap(), text);
}

#[tokio::test]
async fn test_shrinking_prunes_only_excess_fragments() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();

    let large = common::random_bytes(150 * 1024);
    fs.write("/data", &large).await.unwrap();
    let before = fragment_count_for(&large);
    assert_eq!(before, 4);

    let smaller = common::random_bytes(70 * 1024);
    fs.write("/data", &smaller).await.unwrap();
    let after = fragment_count_for(&smaller);
    assert_eq!(after, 2);

    assert_eq!(room.record("/data").unwrap().fragments, Some(after));
    for index in 0..after {
        assert!(room.record(&fragment_path("/data", index)).is_some());
    }
    for index in after..before {
        assert!(room.record(&fragment_path("/data", index)).is_none());
        assert!(!fs.table().contains(&fragment_path("/data", index)));
    }
    assert_eq!(fs.read("/data").await.unwrap(), smaller);
}

#[tokio::test]
async fn test_fragments_are_hidden_from_listings() {
    let (mount, _room) = common::setup_mount().await;
    let fs = mount.fs();

    fs.create_dir("/dir").await.unwrap();
    fs.write("/dir/big", &common::random_bytes(80 * 1024)).await.unwrap();
    fs.write("/dir/small", b"hi").await.unwrap();

    assert_eq!(
        fs.list_children("/dir").unwrap(),
        vec!["big".to_string(), "small".to_string()]
    );
    assert!(fs.kind("/dir/big/.fragments/0").is_none());
    assert!(matches!(
        fs.read("/dir/big/.fragments/0").await,
        Err(FsError::InvalidPath(_))
    ));
    assert_eq!(fs.kind("/dir/big"), Some(EntryKind::File));
}

#[tokio::test]
async fn test_delete_removes_every_fragment() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();

    fs.write("/big", &common::random_bytes(120 * 1024)).await.unwrap();
    fs.delete("/big").await.unwrap();

    assert!(room.keys().is_empty());
    assert!(fs.table().is_empty());
    assert!(!fs.is_file("/big"));
}

#[tokio::test]
async fn test_multibyte_text_splits_on_character_boundaries() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();

    let text = "héllo wörld ✓ ".repeat(6000).into_bytes();
    fs.write("/unicode.txt", &text).await.unwrap();

    let record = room.record("/unicode.txt").unwrap();
    assert!(record.fragmented);
    assert!(record.encoding.is_raw());
    assert_eq!(fs.read("/unicode.txt").await.unwrap(), text);
}

#[tokio::test]
async fn test_failed_write_leaves_previous_content() {
    let (mount, room) = common::setup_mount().await;
    let fs = mount.fs();

    fs.write("/f", b"first").await.unwrap();
    room.fail_writes(true);
    let err = fs.write("/f", &common::random_bytes(90 * 1024)).await.unwrap_err();
    assert!(matches!(err, FsError::Remote(_)));

    room.fail_writes(false);
    assert_eq!(fs.read("/f").await.unwrap(), b"first");
    assert_eq!(fs.size("/f").await.unwrap(), 5);
    assert!(fs.table().fragments_of("/f").is_empty());
}

#[tokio::test]
async fn test_failed_create_leaves_no_entry() {
    let (mount, room) = common::setup_mount().await;
    room.fail_writes(true);
    assert!(mount.fs().write("/new", b"x").await.is_err());
    assert!(!mount.fs().exists("/new"));
}

#[tokio::test]
async fn test_missing_fragment_read_adds_no_entry() {
    let room = MemoryRoomState::writable(common::ME);
    room.inject(
        &fragment_path("/big", 0),
        StateRecord {
            kind: "F".to_string(),
            data: Some("hello ".to_string()),
            ..Default::default()
        },
        common::OTHER,
        10,
    );
    room.inject(
        "/big",
        StateRecord {
            kind: "f".to_string(),
            fragmented: true,
            fragments: Some(2),
            size: Some(11),
            ..Default::default()
        },
        common::OTHER,
        11,
    );
    let (mount, _room) = common::setup_mount_with(room, common::quiet_options()).await;
    let fs = mount.fs();
    assert_eq!(fs.table().len(), 2);

    let err = fs.read("/big").await.unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)));
    assert_eq!(fs.table().len(), 2);
    assert!(!fs.table().contains(&fragment_path("/big", 1)));
}

#[tokio::test]
async fn test_rewrite_stamps_fragments_with_save_time() {
    let (mount, _room) = common::setup_mount().await;
    let fs = mount.fs();

    // 60 KiB of binary encodes to two chunks
    fs.write("/big", &common::random_bytes(60 * 1024)).await.unwrap();
    let before = ::common::entry::now_millis();
    fs.write("/big", &common::random_bytes(60 * 1024)).await.unwrap();

    let fragments = fs.table().fragments_of("/big");
    assert_eq!(fragments.len(), 2);
    for (_, cell) in fragments {
        assert!(cell.lock().await.timestamp() >= before);
    }
}
