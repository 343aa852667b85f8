//! Filesystem operations over the path table
//!
//! [`MatrixFs`] is what the OS integration layer talks to. Every mutation
//! takes the entry's lock, changes the entry, and holds the lock until the
//! remote write has been acknowledged, so a caller never sees success for
//! state the room does not have yet.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::auth::WriteGate;
use crate::codec::{self, CodecError};
use crate::debounce::{Debouncer, Expired};
use crate::entry::{now_millis, ContentLayout, Entry, EntryKind, ModelError, RecordOrigin};
use crate::fragments;
use crate::path::{self, PathError, ROOT};
use crate::remote::{RemoteError, RemoteRecord, RoomStateProvider};
use crate::sync::EchoFilter;
use crate::table::{EntryCell, PathTable};
use tokio::sync::MutexGuard;
use crate::xattr::AttributeError;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("file name too long: {0}")]
    NameTooLong(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("operation not permitted: {0}")]
    NotPermitted(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error(transparent)]
    Attribute(#[from] AttributeError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<PathError> for FsError {
    fn from(err: PathError) -> Self {
        match err {
            PathError::TooLong(_) => FsError::NameTooLong(err.to_string()),
            PathError::Reserved(path) => FsError::InvalidPath(path),
        }
    }
}

/// Times reported for a path, in milliseconds since the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub accessed: i64,
    pub modified: i64,
    pub changed: i64,
}

/// Everything `getattr` needs, read under one lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub kind: EntryKind,
    pub size: u64,
    pub executable: bool,
    pub times: Timestamps,
}

/// What a save has to push besides the entry's own record
#[derive(Debug, Clone, Copy)]
enum Save {
    /// Attributes, flags or times changed; content untouched
    Metadata,
    /// Content was replaced; fragments must be written and the previous
    /// revision's excess fragments pruned
    Content { previous_fragments: usize },
}

#[derive(Debug)]
struct Inner<P> {
    provider: Arc<P>,
    table: Arc<PathTable>,
    gate: Arc<WriteGate>,
    debouncer: Debouncer,
    echoes: Arc<EchoFilter>,
    fragment_size: usize,
    mounted_at: i64,
}

/// Handle to a mounted room; cheap to clone
#[derive(Debug)]
pub struct MatrixFs<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for MatrixFs<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: RoomStateProvider> MatrixFs<P> {
    pub fn new(
        provider: Arc<P>,
        table: Arc<PathTable>,
        gate: Arc<WriteGate>,
        debouncer: Debouncer,
        echoes: Arc<EchoFilter>,
        fragment_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                table,
                gate,
                debouncer,
                echoes,
                fragment_size,
                mounted_at: now_millis(),
            }),
        }
    }

    /* Getters */

    pub fn provider(&self) -> &Arc<P> {
        &self.inner.provider
    }

    pub fn table(&self) -> &Arc<PathTable> {
        &self.inner.table
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.inner.debouncer
    }

    /* Predicates */

    /// Kind of the entry at `path`, `None` for missing or refused paths
    pub fn kind(&self, path: &str) -> Option<EntryKind> {
        let path = path::validate(path).ok()?;
        self.inner.table.kind_of(&path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.kind(path).is_some()
    }

    pub fn is_directory(&self, path: &str) -> bool {
        self.kind(path) == Some(EntryKind::Directory)
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.kind(path) == Some(EntryKind::File)
    }

    pub async fn is_executable(&self, path: &str) -> bool {
        match self.file_cell(path) {
            Ok(cell) => cell
                .lock()
                .await
                .file()
                .map(|file| file.executable)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Whether this mount may write to the room at all
    pub fn can_write_any(&self) -> bool {
        self.inner.gate.allowed()
    }

    /// An existing file, or a new one whose parent directory exists
    pub fn can_write(&self, path: &str) -> bool {
        let Ok(path) = path::validate(path) else {
            return false;
        };
        if !self.can_write_any() {
            return false;
        }
        match self.inner.table.kind_of(&path) {
            Some(EntryKind::File) => true,
            Some(_) => false,
            None => self.check_parent(&path).is_ok(),
        }
    }

    pub fn can_delete(&self, path: &str) -> bool {
        self.can_write_any() && self.is_file(path)
    }

    pub fn can_create_dir(&self, path: &str) -> bool {
        let Ok(path) = path::validate(path) else {
            return false;
        };
        self.can_write_any()
            && !self.inner.table.contains(&path)
            && self.check_parent(&path).is_ok()
    }

    pub fn can_remove_dir(&self, path: &str) -> bool {
        let Ok(path) = path::validate(path) else {
            return false;
        };
        self.can_write_any()
            && path != ROOT
            && self.inner.table.kind_of(&path) == Some(EntryKind::Directory)
            && !self.inner.table.has_children(&path)
    }

    /* Queries */

    pub fn list_children(&self, path: &str) -> Result<Vec<String>, FsError> {
        let path = path::validate(path)?;
        match self.inner.table.kind_of(&path) {
            Some(EntryKind::Directory) => Ok(self.inner.table.list_children(&path)),
            Some(_) => Err(FsError::NotDirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    pub async fn stat(&self, path: &str) -> Result<Stat, FsError> {
        let path = path::validate(path)?;
        if path == ROOT {
            let at = self.inner.mounted_at;
            return Ok(Stat {
                kind: EntryKind::Directory,
                size: 0,
                executable: false,
                times: Timestamps {
                    accessed: at,
                    modified: at,
                    changed: at,
                },
            });
        }

        let cell = self.cell(&path)?;
        let entry = cell.lock().await;
        let modified = entry.timestamp();
        let stat = match entry.file() {
            Some(file) => Stat {
                kind: EntryKind::File,
                size: file.size,
                executable: file.executable,
                times: Timestamps {
                    accessed: file.access_time.max(modified),
                    modified,
                    changed: modified,
                },
            },
            None => Stat {
                kind: entry.kind(),
                size: 0,
                executable: false,
                times: Timestamps {
                    accessed: modified,
                    modified,
                    changed: modified,
                },
            },
        };
        Ok(stat)
    }

    pub async fn size(&self, path: &str) -> Result<u64, FsError> {
        Ok(self.stat(path).await?.size)
    }

    pub async fn timestamps(&self, path: &str) -> Result<Timestamps, FsError> {
        Ok(self.stat(path).await?.times)
    }

    /// Full content of a file, reloading it from the room when evicted
    pub async fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let cell = self.file_cell(path)?;
        let mut entry = cell.lock().await;
        if cell.is_retired() {
            return Err(FsError::NotFound(cell.path().to_string()));
        }
        self.read_content(&mut entry).await
    }

    /* Mutations */

    /// Replace the content of a file, creating it when absent
    pub async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), FsError> {
        let path = path::validate(path)?;
        self.check_writable(&path)?;

        loop {
            let (cell, created) = self.file_for_write(&path)?;
            let mut entry = cell.lock().await;
            if cell.is_retired() {
                // Deleted while we waited; start over with a fresh entry
                continue;
            }

            let result = self.store_content(&mut entry, bytes).await;
            if result.is_err() && created {
                self.inner.table.remove(&path);
            }
            return result;
        }
    }

    /// Create an empty file, or bump the timestamp of an existing entry
    pub async fn touch(&self, path: &str) -> Result<(), FsError> {
        let path = path::validate(path)?;
        self.check_writable(&path)?;
        if path == ROOT {
            return Ok(());
        }
        if !self.inner.table.contains(&path) {
            self.check_parent(&path)?;
        }

        let now = now_millis();
        let (cell, created) = self
            .inner
            .table
            .ensure(&path, || Entry::new_file(path.clone(), now));
        let mut entry = cell.lock().await;
        if cell.is_retired() {
            return Err(FsError::NotFound(path));
        }

        let result = self.save_locked(&mut entry, Save::Metadata, &mut []).await;
        if result.is_err() && created {
            self.inner.table.remove(&path);
        }
        result
    }

    pub async fn set_executable(&self, path: &str, executable: bool) -> Result<(), FsError> {
        let path = path::validate(path)?;
        self.check_writable(&path)?;
        let cell = self.file_cell(&path)?;
        let mut entry = cell.lock().await;
        if cell.is_retired() {
            return Err(FsError::NotFound(path));
        }

        let file = entry
            .file_mut()
            .ok_or_else(|| FsError::IsDirectory(path.clone()))?;
        if file.executable == executable {
            return Ok(());
        }
        file.executable = executable;

        if let Err(err) = self.save_locked(&mut entry, Save::Metadata, &mut []).await {
            if let Some(file) = entry.file_mut() {
                file.executable = !executable;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Delete a file together with all of its fragments
    pub async fn delete(&self, path: &str) -> Result<(), FsError> {
        let path = path::validate(path)?;
        self.check_writable(&path)?;
        let cell = self.file_cell(&path)?;
        let entry = cell.lock().await;
        if cell.is_retired() {
            return Err(FsError::NotFound(path));
        }

        let fragment_count = entry
            .file()
            .and_then(|file| file.fragment_count)
            .unwrap_or(0);

        self.inner.debouncer.cancel(&path);
        self.clear_record(&path).await?;
        self.inner.table.remove(&path);
        tracing::debug!("deleted {}", path);

        self.prune_fragments(&path, 0, fragment_count).await
    }

    pub async fn create_dir(&self, path: &str) -> Result<(), FsError> {
        let path = path::validate(path)?;
        self.check_writable(&path)?;
        if self.inner.table.contains(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        self.check_parent(&path)?;

        let cell = self
            .inner
            .table
            .insert_new(Entry::new_directory(path.clone(), now_millis()))
            .map_err(|_| FsError::AlreadyExists(path.clone()))?;
        let mut entry = cell.lock().await;

        if let Err(err) = self.save_locked(&mut entry, Save::Metadata, &mut []).await {
            self.inner.table.remove(&path);
            return Err(err);
        }
        Ok(())
    }

    pub async fn remove_dir(&self, path: &str) -> Result<(), FsError> {
        let path = path::validate(path)?;
        self.check_writable(&path)?;
        if path == ROOT {
            return Err(FsError::NotPermitted(path));
        }

        let cell = self.cell(&path)?;
        if cell.kind() != EntryKind::Directory {
            return Err(FsError::NotDirectory(path));
        }
        if self.inner.table.has_children(&path) {
            return Err(FsError::NotEmpty(path));
        }

        let _entry = cell.lock().await;
        if cell.is_retired() {
            return Err(FsError::NotFound(path));
        }
        self.inner.debouncer.cancel(&path);
        self.clear_record(&path).await?;
        self.inner.table.remove(&path);
        tracing::debug!("removed directory {}", path);
        Ok(())
    }

    /* Attributes */

    /// Every attribute of a path, reserved ones included
    pub async fn get_attributes(&self, path: &str) -> Result<BTreeMap<String, String>, FsError> {
        let path = path::validate(path)?;
        if path == ROOT {
            return Ok(BTreeMap::new());
        }
        let cell = self.cell(&path)?;
        let entry = cell.lock().await;
        Ok(entry.attribute_map())
    }

    pub async fn get_attribute(&self, path: &str, key: &str) -> Result<Option<String>, FsError> {
        let path = path::validate(path)?;
        if path == ROOT {
            return Ok(None);
        }
        let cell = self.cell(&path)?;
        let entry = cell.lock().await;
        Ok(entry.attribute(key))
    }

    pub async fn list_attribute_names(&self, path: &str) -> Result<Vec<String>, FsError> {
        let path = path::validate(path)?;
        if path == ROOT {
            return Ok(Vec::new());
        }
        let cell = self.cell(&path)?;
        let entry = cell.lock().await;
        Ok(entry.attribute_names())
    }

    /// Set a user attribute; persisted after the debounce delay
    pub async fn set_attribute(&self, path: &str, key: &str, value: String) -> Result<(), FsError> {
        let path = path::validate(path)?;
        self.check_writable(&path)?;
        let cell = self.attribute_cell(&path)?;
        let mut entry = cell.lock().await;
        if cell.is_retired() {
            return Err(FsError::NotFound(path));
        }
        entry.attributes_mut().set(key, value)?;
        self.inner.debouncer.schedule(&path);
        Ok(())
    }

    /// Remove a user attribute; persisted after the debounce delay
    pub async fn remove_attribute(&self, path: &str, key: &str) -> Result<(), FsError> {
        let path = path::validate(path)?;
        self.check_writable(&path)?;
        let cell = self.attribute_cell(&path)?;
        let mut entry = cell.lock().await;
        if cell.is_retired() {
            return Err(FsError::NotFound(path));
        }
        entry.attributes_mut().remove(key)?;
        self.inner.debouncer.schedule(&path);
        Ok(())
    }

    /// Run a pending attribute save right away; returns whether one was pending
    pub async fn flush_attributes(&self, path: &str) -> Result<bool, FsError> {
        let path = path::validate(path)?;
        if path == ROOT {
            return Ok(false);
        }
        let cell = self.cell(&path)?;
        let mut entry = cell.lock().await;
        if cell.is_retired() || !self.inner.debouncer.cancel(&path) {
            return Ok(false);
        }
        if let Err(err) = self.save_locked(&mut entry, Save::Metadata, &mut []).await {
            self.inner.debouncer.schedule(&path);
            return Err(err);
        }
        Ok(true)
    }

    /// Save an entry whose debounce timer ran out
    pub(crate) async fn save_expired(&self, expired: Expired) {
        let Some(cell) = self.inner.table.get(&expired.path) else {
            return;
        };
        let mut entry = cell.lock().await;
        if cell.is_retired() || !self.inner.debouncer.claim(&expired) {
            return;
        }
        match self.save_locked(&mut entry, Save::Metadata, &mut []).await {
            Ok(()) => tracing::debug!("saved attributes of {}", expired.path),
            Err(err) => tracing::warn!("saving attributes of {} failed: {}", expired.path, err),
        }
    }

    /* Internals */

    fn check_writable(&self, path: &str) -> Result<(), FsError> {
        if !self.inner.gate.allowed() {
            return Err(FsError::NotPermitted(path.to_string()));
        }
        Ok(())
    }

    fn check_parent(&self, path: &str) -> Result<(), FsError> {
        let parent = path::parent(path);
        match self.inner.table.kind_of(parent) {
            Some(EntryKind::Directory) => Ok(()),
            Some(_) => Err(FsError::NotDirectory(parent.to_string())),
            None => Err(FsError::NotFound(parent.to_string())),
        }
    }

    fn cell(&self, path: &str) -> Result<Arc<EntryCell>, FsError> {
        self.inner
            .table
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    fn file_cell(&self, path: &str) -> Result<Arc<EntryCell>, FsError> {
        let path = path::validate(path)?;
        if path == ROOT {
            return Err(FsError::IsDirectory(path));
        }
        let cell = self.cell(&path)?;
        match cell.kind() {
            EntryKind::File => Ok(cell),
            EntryKind::Directory => Err(FsError::IsDirectory(path)),
            EntryKind::Fragment => Err(FsError::NotFound(path)),
        }
    }

    fn attribute_cell(&self, path: &str) -> Result<Arc<EntryCell>, FsError> {
        if path == ROOT {
            return Err(FsError::NotPermitted(path.to_string()));
        }
        self.cell(path)
    }

    fn file_for_write(&self, path: &str) -> Result<(Arc<EntryCell>, bool), FsError> {
        if path == ROOT {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        match self.inner.table.kind_of(path) {
            Some(EntryKind::File) => {}
            Some(_) => return Err(FsError::IsDirectory(path.to_string())),
            None => self.check_parent(path)?,
        }

        let now = now_millis();
        let (cell, created) = self
            .inner
            .table
            .ensure(path, || Entry::new_file(path.to_string(), now));
        if cell.kind() != EntryKind::File {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        Ok((cell, created))
    }

    async fn put_record(&self, key: &str, entry: &Entry) -> Result<Option<String>, FsError> {
        let event_id = self.inner.provider.put_record(key, &entry.to_record()).await?;
        self.inner.echoes.remember(event_id.as_deref());
        Ok(event_id)
    }

    async fn clear_record(&self, key: &str) -> Result<(), FsError> {
        let event_id = self.inner.provider.delete_record(key).await?;
        self.inner.echoes.remember(event_id.as_deref());
        Ok(())
    }

    fn origin(&self, event_id: Option<String>) -> RecordOrigin {
        RecordOrigin {
            event_id,
            sender: Some(self.inner.provider.actor().to_string()),
        }
    }

    /// Serve a file's content, fetching whatever is not materialized
    async fn read_content(&self, entry: &mut Entry) -> Result<Vec<u8>, FsError> {
        let fragmented = entry.file().map(|file| file.fragmented()).unwrap_or(false);
        if !fragmented && !entry.is_clean() {
            self.reload(entry).await?;
        }

        let path = entry.path().to_string();
        let file = entry
            .file()
            .ok_or_else(|| FsError::IsDirectory(path.clone()))?;
        let bytes = match file.fragment_count {
            Some(count) => {
                let encoding = file.encoding;
                let text = self.collect_fragments(&path, count).await?;
                codec::decode(&text, encoding)?
            }
            None => file.content.clone(),
        };

        entry.touch_access(now_millis());
        Ok(bytes)
    }

    /// Refetch an entry's record; adopts it wholesale when the room has
    /// moved on since the entry was built
    async fn reload(&self, entry: &mut Entry) -> Result<(), FsError> {
        let remote = self.fetch(entry.path()).await?;
        let ours = entry.origin().and_then(|origin| origin.event_id.as_deref())
            == remote.meta.event_id.as_deref();
        let newer = remote.meta.timestamp > entry.timestamp();

        // A changed layout means the content we evicted is gone remotely
        if !ours && (newer || !entry.holds_layout_of(&remote.record)) {
            entry.merge_record(remote.record, &remote.meta)?;
        } else {
            entry.restore(remote.record)?;
        }
        tracing::debug!("reloaded {}", entry.path());
        Ok(())
    }

    /// Refill evicted content only; local metadata stays as is
    async fn refill(&self, entry: &mut Entry) -> Result<(), FsError> {
        let remote = self.fetch(entry.path()).await?;
        if entry.holds_layout_of(&remote.record) {
            entry.restore(remote.record)?;
        } else {
            tracing::debug!("{} was rewritten remotely, taking its content", entry.path());
            entry.adopt_content(remote.record, &remote.meta)?;
        }
        Ok(())
    }

    async fn fetch(&self, path: &str) -> Result<RemoteRecord, FsError> {
        self.inner
            .provider
            .get_record(path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    async fn collect_fragments(&self, owner: &str, count: usize) -> Result<String, FsError> {
        let mut text = String::new();
        for index in 0..count {
            let fragment_path = fragments::fragment_path(owner, index);
            let cell = match self.inner.table.get(&fragment_path) {
                Some(cell) => cell,
                None => self.fetch_fragment(&fragment_path).await?,
            };

            let mut fragment = cell.lock().await;
            if !fragment.is_clean() {
                self.reload(&mut fragment).await?;
            }
            if let Some(body) = fragment.fragment() {
                text.push_str(&body.data);
            }
        }
        Ok(text)
    }

    /// Fetch a fragment the table does not hold; it enters the table
    /// only once the room has produced it
    async fn fetch_fragment(&self, fragment_path: &str) -> Result<Arc<EntryCell>, FsError> {
        let remote = self.fetch(fragment_path).await?;
        let fetched = Entry::from_record(fragment_path, remote.record, &remote.meta)?;
        if fetched.kind() != EntryKind::Fragment {
            return Err(ModelError::TypeConflict {
                path: fragment_path.to_string(),
                held: EntryKind::Fragment,
                incoming: fetched.kind(),
            }
            .into());
        }
        let (cell, _) = self.inner.table.ensure(fragment_path, || fetched);
        Ok(cell)
    }

    /// Replace content and persist it; on failure the entry goes back to
    /// what it was
    async fn store_content(&self, entry: &mut Entry, bytes: &[u8]) -> Result<(), FsError> {
        let previous = entry.clone();
        let previous_fragments = previous
            .file()
            .and_then(|file| file.fragment_count)
            .unwrap_or(0);

        let layout = entry.apply_content(bytes, self.inner.fragment_size)?;
        let chunks = match layout {
            ContentLayout::Fragmented(chunks) => chunks,
            ContentLayout::Inline => Vec::new(),
        };
        let now = now_millis();
        let cells = self.stage_fragments(entry.path(), &chunks, now);
        let result = self
            .persist_content(entry, &chunks, &cells, now, previous_fragments)
            .await;

        if let Err(err) = result {
            tracing::warn!("writing {} failed: {}", entry.path(), err);
            self.roll_back(entry, previous).await;
            return Err(err);
        }
        Ok(())
    }

    /// Materialize fresh chunks as fragment entries; nothing is sent yet
    fn stage_fragments(&self, owner: &str, chunks: &[String], now: i64) -> Vec<Arc<EntryCell>> {
        chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let fragment_path = fragments::fragment_path(owner, index);
                let (cell, _) = self.inner.table.ensure(&fragment_path, || {
                    Entry::new_fragment(fragment_path.clone(), chunk.clone(), now)
                });
                cell
            })
            .collect()
    }

    /// Fill the staged fragments and save, holding every fragment lock
    /// until the file record is out
    async fn persist_content(
        &self,
        entry: &mut Entry,
        chunks: &[String],
        cells: &[Arc<EntryCell>],
        now: i64,
        previous_fragments: usize,
    ) -> Result<(), FsError> {
        let mut staged = Vec::with_capacity(cells.len());
        for (cell, chunk) in cells.iter().zip(chunks) {
            let mut fragment = cell.lock().await;
            fragment.replace_fragment(chunk.clone(), now)?;
            staged.push(fragment);
        }
        self.save_locked(entry, Save::Content { previous_fragments }, &mut staged)
            .await
    }

    async fn roll_back(&self, entry: &mut Entry, previous: Entry) {
        let path = previous.path().to_string();
        let keep = previous
            .file()
            .and_then(|file| file.fragment_count)
            .unwrap_or(0);
        *entry = previous;

        // Staged chunks may or may not have reached the room
        for (index, cell) in self.inner.table.fragments_of(&path) {
            if index < keep {
                cell.lock().await.evict();
            } else {
                self.inner.table.remove(cell.path());
            }
        }
    }

    /// Push an entry to the room while its lock is held
    ///
    /// Order: fragments, then the entry's own record, then stale fragments
    /// are cleared. A reader in between sees either the old or the new
    /// fragment count, never a record pointing at chunks not yet written.
    ///
    /// `staged` holds the locked fragments of a content save, in order.
    async fn save_locked(
        &self,
        entry: &mut Entry,
        save: Save,
        staged: &mut [MutexGuard<'_, Entry>],
    ) -> Result<(), FsError> {
        let path = entry.path().to_string();
        self.inner.debouncer.cancel(&path);

        if !entry.is_clean() {
            // Re-encoding an evicted buffer would wipe the stored content
            self.refill(entry).await?;
        }

        let now = now_millis();
        let fragment_count = entry
            .file()
            .and_then(|file| file.fragment_count)
            .unwrap_or(0);

        for fragment in staged.iter_mut() {
            let fragment_path = fragment.path().to_string();
            let event_id = self.put_record(&fragment_path, &**fragment).await?;
            fragment.set_timestamp(now);
            fragment.set_origin(self.origin(event_id));
        }

        let event_id = self.put_record(&path, entry).await?;
        entry.set_timestamp(now);
        entry.set_origin(self.origin(event_id));
        tracing::debug!("saved {} ({} fragments)", path, fragment_count);

        match save {
            Save::Content { previous_fragments } => {
                self.prune_fragments(&path, fragment_count, previous_fragments)
                    .await
            }
            Save::Metadata => Ok(()),
        }
    }

    /// Clear every fragment of `owner` at index `keep` or above
    ///
    /// Covers both the fragments held in the table and the previous
    /// revision's count, since evicted or never-seen fragments may exist
    /// only in the room.
    async fn prune_fragments(&self, owner: &str, keep: usize, previous: usize) -> Result<(), FsError> {
        let mut stale: BTreeSet<usize> = (keep..previous).collect();
        stale.extend(
            self.inner
                .table
                .fragments_of(owner)
                .into_iter()
                .map(|(index, _)| index)
                .filter(|index| *index >= keep),
        );

        for index in stale {
            let fragment_path = fragments::fragment_path(owner, index);
            self.clear_record(&fragment_path).await?;
            self.inner.table.remove(&fragment_path);
        }
        Ok(())
    }
}
