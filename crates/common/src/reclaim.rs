//! Background eviction of file content nobody has touched in a while
//!
//! Only bulk content goes: the inline buffer of a file, or the chunks of
//! its fragments. Entries, sizes, fragment counts and attributes stay so
//! listings and `stat` never need the room. Evicted content is fetched
//! again on the next read.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::entry::now_millis;
use crate::fragments;
use crate::table::PathTable;

/// Default retention window
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);
/// Default pause between sweeps
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub scanned: usize,
    pub evicted_files: usize,
    pub evicted_fragments: usize,
    /// Entries locked by an in-flight operation; retried next sweep
    pub skipped_busy: usize,
}

#[derive(Debug, Clone)]
pub struct CacheReclaimer {
    table: Arc<PathTable>,
    retention: Duration,
}

impl CacheReclaimer {
    /// `None` when `retention_secs` is negative, which disables reclaiming
    pub fn new(table: Arc<PathTable>, retention_secs: i64) -> Option<Self> {
        let retention = u64::try_from(retention_secs).ok()?;
        Some(Self {
            table,
            retention: Duration::from_secs(retention),
        })
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn sweep(&self) -> ReclaimStats {
        self.sweep_at(now_millis())
    }

    /// One pass over every file, as if the clock read `now`
    pub fn sweep_at(&self, now: i64) -> ReclaimStats {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention_ms);
        let mut stats = ReclaimStats::default();

        for cell in self.table.files() {
            stats.scanned += 1;
            let Some(mut entry) = cell.try_lock() else {
                stats.skipped_busy += 1;
                continue;
            };
            let Some(file) = entry.file() else {
                continue;
            };
            if file.access_time >= cutoff || entry.timestamp() >= cutoff {
                continue;
            }
            let fragment_count = file.fragment_count;

            match fragment_count {
                Some(count) => {
                    // The file lock is held, so taking fragment locks is in order
                    for index in 0..count {
                        let path = fragments::fragment_path(cell.path(), index);
                        let Some(fragment_cell) = self.table.get(&path) else {
                            continue;
                        };
                        match fragment_cell.try_lock() {
                            Some(mut fragment) if fragment.is_clean() => {
                                fragment.evict();
                                stats.evicted_fragments += 1;
                            }
                            Some(_) => {}
                            None => stats.skipped_busy += 1,
                        };
                    }
                    // Reads must go back to the fragments from now on
                    entry.evict();
                }
                None if entry.is_clean() => {
                    if entry.evict() {
                        stats.evicted_files += 1;
                    }
                }
                None => {}
            }
        }

        if stats.evicted_files + stats.evicted_fragments > 0 {
            tracing::debug!(
                "reclaimed {} files and {} fragments ({} scanned, {} busy)",
                stats.evicted_files,
                stats.evicted_fragments,
                stats.scanned,
                stats.skipped_busy
            );
        }
        stats
    }

    /// Sweep every `interval` until cancelled
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(
            "cache reclaimer running every {:?}, retention {:?}",
            interval,
            self.retention
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        tracing::info!("cache reclaimer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{ContentLayout, Entry, RecordMeta, StateRecord};

    fn table_with_file(path: &str, content: &[u8], at: i64) -> Arc<PathTable> {
        let table = Arc::new(PathTable::new());
        let mut entry = Entry::new_file(path, at);
        entry.apply_content(content, 1024).unwrap();
        entry.touch_access(at);
        table.insert_new(entry).unwrap();
        table
    }

    #[test]
    fn test_negative_retention_disables() {
        let table = Arc::new(PathTable::new());
        assert!(CacheReclaimer::new(table.clone(), -1).is_none());
        assert!(CacheReclaimer::new(table, 0).is_some());
    }

    #[tokio::test]
    async fn test_evicts_idle_file() {
        let table = table_with_file("/idle", b"payload", 1_000);
        let reclaimer = CacheReclaimer::new(table.clone(), 10).unwrap();

        let stats = reclaimer.sweep_at(1_000 + 11_000);
        assert_eq!(stats.evicted_files, 1);

        let cell = table.get("/idle").unwrap();
        let entry = cell.lock().await;
        assert!(!entry.is_clean());
        assert!(entry.file().unwrap().content.is_empty());
        assert_eq!(entry.file().unwrap().size, 7);
    }

    #[tokio::test]
    async fn test_recent_access_keeps_content() {
        let table = table_with_file("/warm", b"payload", 1_000);
        {
            let cell = table.get("/warm").unwrap();
            cell.lock().await.touch_access(9_000);
        }
        let reclaimer = CacheReclaimer::new(table.clone(), 10).unwrap();

        let stats = reclaimer.sweep_at(12_000);
        assert_eq!(stats.evicted_files, 0);
        let cell = table.get("/warm").unwrap();
        assert!(cell.lock().await.is_clean());
    }

    #[tokio::test]
    async fn test_busy_entries_are_skipped() {
        let table = table_with_file("/busy", b"payload", 1_000);
        let reclaimer = CacheReclaimer::new(table.clone(), 0).unwrap();

        let cell = table.get("/busy").unwrap();
        let guard = cell.lock().await;
        let stats = reclaimer.sweep_at(100_000);
        assert_eq!(stats.skipped_busy, 1);
        assert_eq!(stats.evicted_files, 0);
        drop(guard);

        assert_eq!(reclaimer.sweep_at(100_000).evicted_files, 1);
    }

    #[tokio::test]
    async fn test_evicts_fragments_not_file_metadata() {
        let table = Arc::new(PathTable::new());
        let record = StateRecord {
            kind: "f".to_string(),
            fragmented: true,
            fragments: Some(2),
            size: Some(10),
            ..Default::default()
        };
        let meta = RecordMeta {
            timestamp: 1_000,
            ..Default::default()
        };
        table
            .insert_new(Entry::from_record("/big", record, &meta).unwrap())
            .unwrap();
        table
            .insert_new(Entry::new_fragment("/big/.fragments/0", "abcde".to_string(), 1_000))
            .unwrap();
        table
            .insert_new(Entry::new_fragment("/big/.fragments/1", "fghij".to_string(), 1_000))
            .unwrap();

        let reclaimer = CacheReclaimer::new(table.clone(), 1).unwrap();
        let stats = reclaimer.sweep_at(10_000);
        assert_eq!(stats.evicted_fragments, 2);
        assert_eq!(stats.evicted_files, 0);

        let fragment = table.get("/big/.fragments/1").unwrap();
        assert!(!fragment.lock().await.is_clean());
        let file = table.get("/big").unwrap();
        assert_eq!(file.lock().await.file().unwrap().fragment_count, Some(2));

        // Already evicted: nothing left to do
        assert_eq!(reclaimer.sweep_at(20_000), ReclaimStats {
            scanned: 1,
            ..Default::default()
        });
    }

    #[tokio::test]
    async fn test_locally_written_fragmented_file_is_marked_evicted() {
        let table = Arc::new(PathTable::new());
        let mut entry = Entry::new_file("/local", 1_000);
        let layout = entry.apply_content(b"0123456789abcdef", 8).unwrap();
        let ContentLayout::Fragmented(chunks) = layout else {
            panic!("expected a fragmented layout");
        };
        assert!(entry.is_clean());
        table.insert_new(entry).unwrap();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let path = fragments::fragment_path("/local", index);
            table
                .insert_new(Entry::new_fragment(path, chunk, 1_000))
                .unwrap();
        }

        let reclaimer = CacheReclaimer::new(table.clone(), 1).unwrap();
        let stats = reclaimer.sweep_at(10_000);
        assert!(stats.evicted_fragments > 0);

        let file = table.get("/local").unwrap();
        assert!(!file.lock().await.is_clean());
    }

    #[tokio::test]
    async fn test_directories_are_not_scanned() {
        let table = Arc::new(PathTable::new());
        table.insert_new(Entry::new_directory("/d", 0)).unwrap();
        let reclaimer = CacheReclaimer::new(table, 0).unwrap();
        assert_eq!(reclaimer.sweep_at(1_000_000).scanned, 0);
    }
}
