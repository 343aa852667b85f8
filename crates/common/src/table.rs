//! The authoritative path → entry mapping of a mount
//!
//! Structural operations (insert, remove, scans) take one short-lived
//! lock on an ordered map, so a listing never observes half an insert.
//! Each entry then has its own async mutex, held for the full
//! read-modify-write of a path including its remote round trips.
//!
//! Lock order: a file's cell before any of its fragment cells.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};

use crate::entry::{Entry, EntryKind};
use crate::fragments;
use crate::path::ROOT;

/// A table slot: the entry plus the facts that never change for a path
#[derive(Debug)]
pub struct EntryCell {
    path: String,
    kind: EntryKind,
    retired: AtomicBool,
    entry: Mutex<Entry>,
}

impl EntryCell {
    fn new(entry: Entry) -> Self {
        Self {
            path: entry.path().to_string(),
            kind: entry.kind(),
            retired: AtomicBool::new(false),
            entry: Mutex::new(entry),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// True once the cell has been removed from the table. A task that
    /// was waiting on the lock must not act on a retired cell.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub async fn lock(&self) -> MutexGuard<'_, Entry> {
        self.entry.lock().await
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, Entry>> {
        self.entry.try_lock().ok()
    }
}

#[derive(Debug, Default)]
pub struct PathTable {
    entries: RwLock<BTreeMap<String, Arc<EntryCell>>>,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Arc<EntryCell>> {
        self.entries.read().get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        path == ROOT || self.entries.read().contains_key(path)
    }

    /// Kind of the entry at `path`; the root is always a directory
    pub fn kind_of(&self, path: &str) -> Option<EntryKind> {
        if path == ROOT {
            return Some(EntryKind::Directory);
        }
        self.entries.read().get(path).map(|cell| cell.kind())
    }

    /// Get the cell at `path`, creating it with `ctor` when absent
    ///
    /// Returns the cell and whether it was created by this call.
    pub fn ensure<F>(&self, path: &str, ctor: F) -> (Arc<EntryCell>, bool)
    where
        F: FnOnce() -> Entry,
    {
        if let Some(cell) = self.get(path) {
            return (cell, false);
        }

        let mut entries = self.entries.write();
        if let Some(cell) = entries.get(path) {
            return (cell.clone(), false);
        }
        let cell = Arc::new(EntryCell::new(ctor()));
        entries.insert(path.to_string(), cell.clone());
        (cell, true)
    }

    /// Insert an entry unless its path is taken; hands the entry back
    /// when it is
    pub fn insert_new(&self, entry: Entry) -> Result<Arc<EntryCell>, Entry> {
        let mut entries = self.entries.write();
        if entries.contains_key(entry.path()) {
            return Err(entry);
        }
        let cell = Arc::new(EntryCell::new(entry));
        entries.insert(cell.path().to_string(), cell.clone());
        Ok(cell)
    }

    pub fn remove(&self, path: &str) -> Option<Arc<EntryCell>> {
        let cell = self.entries.write().remove(path)?;
        cell.retired.store(true, Ordering::SeqCst);
        Some(cell)
    }

    /// Names of the direct children of `dir`, fragments excluded, sorted
    pub fn list_children(&self, dir: &str) -> Vec<String> {
        let prefix = child_prefix(dir);
        let entries = self.entries.read();
        entries
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(_, cell)| cell.kind() != EntryKind::Fragment)
            .filter_map(|(path, _)| {
                let name = &path[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
            })
            .collect()
    }

    pub fn has_children(&self, dir: &str) -> bool {
        let prefix = child_prefix(dir);
        let entries = self.entries.read();
        let mut under = entries
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix));
        under.any(|(path, cell)| {
            cell.kind() != EntryKind::Fragment && !path[prefix.len()..].contains('/')
        })
    }

    /// Fragment cells currently held for `owner`, ordered by index
    pub fn fragments_of(&self, owner: &str) -> Vec<(usize, Arc<EntryCell>)> {
        let prefix = fragments::fragment_prefix(owner);
        let entries = self.entries.read();
        let mut found: Vec<(usize, Arc<EntryCell>)> = entries
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, cell)| {
                let (parent, index) = fragments::parse_fragment_path(path)?;
                (parent == owner).then(|| (index, cell.clone()))
            })
            .collect();
        found.sort_by_key(|(index, _)| *index);
        found
    }

    /// Snapshot of every file cell
    pub fn files(&self) -> Vec<Arc<EntryCell>> {
        self.entries
            .read()
            .values()
            .filter(|cell| cell.kind() == EntryKind::File)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn child_prefix(dir: &str) -> String {
    if dir == ROOT {
        ROOT.to_string()
    } else {
        format!("{}/", dir)
    }
}
