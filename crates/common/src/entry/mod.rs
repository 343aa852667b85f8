//! In-memory model of a path: directory, file or file fragment
//!
//! Entries are built either from a local intent (`Entry::new_file`,
//! `Entry::new_directory`) or from a decoded remote record
//! ([`Entry::from_record`]). A path's kind is fixed for its lifetime;
//! a remote record that declares a different kind is rejected.

mod record;

pub use record::{RecordMeta, StateRecord, RECORD_TYPE};

use std::collections::BTreeMap;

use crate::codec::{self, CodecError, Encoding};
use crate::fragments;
use crate::xattr::{self, AttributeStore};

/// Milliseconds since the unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The three kinds of path a mount knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Directory,
    File,
    Fragment,
}

impl EntryKind {
    /// Tag used in the record `type` field
    pub fn tag(&self) -> &'static str {
        match self {
            EntryKind::Directory => "d",
            EntryKind::File => "f",
            EntryKind::Fragment => "F",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "d" => Some(EntryKind::Directory),
            "f" => Some(EntryKind::File),
            "F" => Some(EntryKind::Fragment),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Directory => write!(f, "directory"),
            EntryKind::File => write!(f, "file"),
            EntryKind::Fragment => write!(f, "fragment"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("{path}: held as {held}, record declares {incoming}")]
    TypeConflict {
        path: String,
        held: EntryKind,
        incoming: EntryKind,
    },
    #[error("{path}: unknown record type {tag:?}")]
    UnknownType { path: String, tag: String },
    #[error("{path}: record is missing required field {field}")]
    MissingField { path: String, field: &'static str },
    #[error("{path}: undecodable content: {source}")]
    Content {
        path: String,
        #[source]
        source: CodecError,
    },
    #[error("{0} is not a file")]
    NotAFile(String),
    #[error("{0}: stored record no longer matches the held content layout")]
    LayoutChanged(String),
}

/// Where the remote record behind an entry came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordOrigin {
    pub event_id: Option<String>,
    pub sender: Option<String>,
}

/// File payload and metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBody {
    /// Length of the decoded content
    pub size: u64,
    pub executable: bool,
    pub encoding: Encoding,
    /// Number of fragment records when the content is fragmented
    pub fragment_count: Option<usize>,
    /// Decoded content; empty while fragmented or evicted
    pub content: Vec<u8>,
    /// Last read, local only
    pub access_time: i64,
}

impl FileBody {
    fn empty(now: i64) -> Self {
        Self {
            size: 0,
            executable: false,
            encoding: Encoding::Raw,
            fragment_count: None,
            content: Vec::new(),
            access_time: now,
        }
    }

    pub fn fragmented(&self) -> bool {
        self.fragment_count.is_some()
    }
}

/// One encoded chunk of a fragmented file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentBody {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    Directory,
    File(FileBody),
    Fragment(FragmentBody),
}

/// How freshly written content has to be laid out remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentLayout {
    /// Content fits in the file record itself
    Inline,
    /// Content must be stored as these encoded chunks, in order
    Fragmented(Vec<String>),
}

impl ContentLayout {
    pub fn fragment_count(&self) -> usize {
        match self {
            ContentLayout::Inline => 0,
            ContentLayout::Fragmented(chunks) => chunks.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    path: String,
    /// Last modification, the authority for last-writer-wins
    timestamp: i64,
    attributes: AttributeStore,
    origin: Option<RecordOrigin>,
    /// Content is materialized and can be served without a refetch
    clean: bool,
    body: EntryBody,
}

impl Entry {
    pub fn new_directory(path: impl Into<String>, now: i64) -> Self {
        Self {
            path: path.into(),
            timestamp: now,
            attributes: AttributeStore::new(),
            origin: None,
            clean: true,
            body: EntryBody::Directory,
        }
    }

    pub fn new_file(path: impl Into<String>, now: i64) -> Self {
        Self {
            path: path.into(),
            timestamp: now,
            attributes: AttributeStore::new(),
            origin: None,
            clean: true,
            body: EntryBody::File(FileBody::empty(now)),
        }
    }

    pub fn new_fragment(path: impl Into<String>, data: String, now: i64) -> Self {
        Self {
            path: path.into(),
            timestamp: now,
            attributes: AttributeStore::new(),
            origin: None,
            clean: true,
            body: EntryBody::Fragment(FragmentBody { data }),
        }
    }

    /// Build an entry from a remote record
    pub fn from_record(
        path: impl Into<String>,
        record: StateRecord,
        meta: &RecordMeta,
    ) -> Result<Self, ModelError> {
        let path = path.into();
        let kind = EntryKind::from_tag(&record.kind).ok_or_else(|| ModelError::UnknownType {
            path: path.clone(),
            tag: record.kind.clone(),
        })?;

        let (body, clean) = match kind {
            EntryKind::Directory => (EntryBody::Directory, true),
            EntryKind::File if record.fragmented => {
                let size = record.size.ok_or_else(|| ModelError::MissingField {
                    path: path.clone(),
                    field: "size",
                })?;
                let count = record.fragments.ok_or_else(|| ModelError::MissingField {
                    path: path.clone(),
                    field: "fragments",
                })?;
                let body = FileBody {
                    size,
                    executable: record.executable,
                    encoding: record.encoding,
                    fragment_count: Some(count),
                    content: Vec::new(),
                    access_time: meta.timestamp,
                };
                // Content lives in the fragment records
                (EntryBody::File(body), false)
            }
            EntryKind::File => {
                let data = record.data.as_deref().unwrap_or_default();
                let content = codec::decode(data, record.encoding).map_err(|source| {
                    ModelError::Content {
                        path: path.clone(),
                        source,
                    }
                })?;
                let body = FileBody {
                    size: content.len() as u64,
                    executable: record.executable,
                    encoding: record.encoding,
                    fragment_count: None,
                    content,
                    access_time: meta.timestamp,
                };
                (EntryBody::File(body), true)
            }
            EntryKind::Fragment => {
                let data = record.data.ok_or_else(|| ModelError::MissingField {
                    path: path.clone(),
                    field: "data",
                })?;
                (EntryBody::Fragment(FragmentBody { data }), true)
            }
        };

        Ok(Self {
            path,
            timestamp: meta.timestamp,
            attributes: AttributeStore::from_map(record.xattr),
            origin: Some(RecordOrigin {
                event_id: meta.event_id.clone(),
                sender: meta.sender.clone(),
            }),
            clean,
            body,
        })
    }

    /// Replace this entry's state with a newer remote record
    ///
    /// The caller decides whether the record is newer; this only guards the
    /// kind of the path, which never changes.
    pub fn merge_record(&mut self, record: StateRecord, meta: &RecordMeta) -> Result<(), ModelError> {
        if let Some(incoming) = EntryKind::from_tag(&record.kind) {
            if incoming != self.kind() {
                return Err(ModelError::TypeConflict {
                    path: self.path.clone(),
                    held: self.kind(),
                    incoming,
                });
            }
        }

        let mut merged = Self::from_record(self.path.clone(), record, meta)?;
        if let (EntryBody::File(old), EntryBody::File(new)) = (&self.body, &mut merged.body) {
            new.access_time = new.access_time.max(old.access_time);
        }
        *self = merged;
        Ok(())
    }

    /// Whether `record` describes content laid out the way this entry
    /// holds it: same kind and, for files, the same fragment count
    pub fn holds_layout_of(&self, record: &StateRecord) -> bool {
        if EntryKind::from_tag(&record.kind) != Some(self.kind()) {
            return false;
        }
        match &self.body {
            EntryBody::File(file) => {
                let incoming = if record.fragmented { record.fragments } else { None };
                record.fragmented == file.fragmented() && incoming == file.fragment_count
            }
            _ => true,
        }
    }

    /// Take the content of a remote record while keeping local metadata
    ///
    /// Used when a metadata change is about to be saved over a record
    /// whose content was replaced remotely since this entry was evicted.
    pub fn adopt_content(&mut self, record: StateRecord, meta: &RecordMeta) -> Result<(), ModelError> {
        let mut adopted = Self::from_record(self.path.clone(), record, meta)?;
        let incoming = adopted.kind();
        match (&self.body, &mut adopted.body) {
            (EntryBody::File(old), EntryBody::File(new)) => {
                new.executable = old.executable;
                new.access_time = new.access_time.max(old.access_time);
            }
            (EntryBody::Directory, EntryBody::Directory)
            | (EntryBody::Fragment(_), EntryBody::Fragment(_)) => {}
            _ => {
                return Err(ModelError::TypeConflict {
                    path: self.path.clone(),
                    held: self.kind(),
                    incoming,
                })
            }
        }
        adopted.timestamp = self.timestamp;
        adopted.attributes = self.attributes.clone();
        *self = adopted;
        Ok(())
    }

    /// Serialize to the remote record shape
    pub fn to_record(&self) -> StateRecord {
        let mut record = StateRecord {
            kind: self.kind().tag().to_string(),
            xattr: self.attributes.as_map().clone(),
            ..Default::default()
        };
        match &self.body {
            EntryBody::Directory => {}
            EntryBody::File(file) => {
                record.encoding = file.encoding;
                record.executable = file.executable;
                match file.fragment_count {
                    Some(count) => {
                        record.fragmented = true;
                        record.fragments = Some(count);
                        record.size = Some(file.size);
                    }
                    None => {
                        // Re-encoding reproduces the stored representation exactly
                        let encoded = codec::encode(&file.content);
                        record.encoding = encoded.encoding;
                        record.data = Some(encoded.content);
                    }
                }
            }
            EntryBody::Fragment(fragment) => {
                record.data = Some(fragment.data.clone());
            }
        }
        record
    }

    /// Replace a file's content (steps 1-3 of a write)
    ///
    /// Encodes `bytes`, keeps them inline when the encoded form fits under
    /// `threshold`, otherwise marks the file fragmented and hands back the
    /// encoded chunks. Nothing is persisted here.
    pub fn apply_content(&mut self, bytes: &[u8], threshold: usize) -> Result<ContentLayout, ModelError> {
        let path = self.path.clone();
        let file = self.file_mut().ok_or(ModelError::NotAFile(path))?;
        let encoded = codec::encode(bytes);

        file.size = bytes.len() as u64;
        file.encoding = encoded.encoding;

        let layout = if encoded.content.len() <= threshold {
            file.fragment_count = None;
            file.content = bytes.to_vec();
            ContentLayout::Inline
        } else {
            let chunks: Vec<String> = fragments::split_text(&encoded.content, threshold)
                .into_iter()
                .map(str::to_string)
                .collect();
            file.fragment_count = Some(chunks.len());
            file.content = Vec::new();
            ContentLayout::Fragmented(chunks)
        };
        self.clean = true;
        Ok(layout)
    }

    /// Drop materialized content, keeping every piece of metadata
    ///
    /// Returns true when something was actually released.
    pub fn evict(&mut self) -> bool {
        let released = match &mut self.body {
            EntryBody::Directory => return false,
            EntryBody::File(file) => {
                let had = !file.content.is_empty() || self.clean;
                file.content = Vec::new();
                had && !file.fragmented()
            }
            EntryBody::Fragment(fragment) => {
                let had = self.clean;
                fragment.data = String::new();
                had
            }
        };
        self.clean = false;
        released
    }

    /* Getters */

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> EntryKind {
        match self.body {
            EntryBody::Directory => EntryKind::Directory,
            EntryBody::File(_) => EntryKind::File,
            EntryBody::Fragment(_) => EntryKind::Fragment,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_clean(&self) -> bool {
        self.clean
    }

    pub fn body(&self) -> &EntryBody {
        &self.body
    }

    pub fn origin(&self) -> Option<&RecordOrigin> {
        self.origin.as_ref()
    }

    pub fn file(&self) -> Option<&FileBody> {
        match &self.body {
            EntryBody::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileBody> {
        match &mut self.body {
            EntryBody::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn fragment(&self) -> Option<&FragmentBody> {
        match &self.body {
            EntryBody::Fragment(fragment) => Some(fragment),
            _ => None,
        }
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut AttributeStore {
        &mut self.attributes
    }

    /// Look up an attribute, serving the reserved namespace from metadata
    pub fn attribute(&self, key: &str) -> Option<String> {
        if !xattr::is_reserved(key) {
            return self.attributes.get(key).cloned();
        }
        match key {
            xattr::EVENT_ID_KEY => self.origin.as_ref()?.event_id.clone(),
            xattr::SENDER_KEY => self.origin.as_ref()?.sender.clone(),
            xattr::FRAGMENTED_KEY => self.file().map(|f| f.fragmented().to_string()),
            _ => None,
        }
    }

    /// Every attribute name this entry answers, reserved ones first
    pub fn attribute_names(&self) -> Vec<String> {
        let reserved = [xattr::EVENT_ID_KEY, xattr::SENDER_KEY, xattr::FRAGMENTED_KEY];
        reserved
            .iter()
            .filter(|key| self.attribute(key).is_some())
            .map(|key| key.to_string())
            .chain(self.attributes.list().map(str::to_string))
            .collect()
    }

    /// All attributes, reserved ones included
    pub fn attribute_map(&self) -> BTreeMap<String, String> {
        self.attribute_names()
            .into_iter()
            .filter_map(|key| self.attribute(&key).map(|value| (key, value)))
            .collect()
    }

    /* Setters */

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    pub fn set_origin(&mut self, origin: RecordOrigin) {
        self.origin = Some(origin);
    }

    /// Overwrite a fragment's chunk with data written at `now`
    pub fn replace_fragment(&mut self, data: String, now: i64) -> Result<(), ModelError> {
        match &mut self.body {
            EntryBody::Fragment(fragment) => {
                fragment.data = data;
                self.timestamp = now;
                self.clean = true;
                Ok(())
            }
            _ => Err(ModelError::TypeConflict {
                path: self.path.clone(),
                held: self.kind(),
                incoming: EntryKind::Fragment,
            }),
        }
    }

    /// Install remotely fetched content into an evicted entry
    ///
    /// The record must have the layout the entry already holds; anything
    /// else goes through [`Entry::merge_record`] or [`Entry::adopt_content`].
    pub fn restore(&mut self, record: StateRecord) -> Result<(), ModelError> {
        let path = self.path.clone();
        if !self.holds_layout_of(&record) {
            return Err(ModelError::LayoutChanged(path));
        }
        match &mut self.body {
            EntryBody::Directory => {}
            EntryBody::File(file) if !file.fragmented() => {
                let data = record.data.as_deref().unwrap_or_default();
                file.content = codec::decode(data, record.encoding)
                    .map_err(|source| ModelError::Content { path, source })?;
            }
            EntryBody::File(_) => return Ok(()),
            EntryBody::Fragment(fragment) => {
                fragment.data = record.data.ok_or(ModelError::MissingField {
                    path,
                    field: "data",
                })?;
            }
        }
        self.clean = true;
        Ok(())
    }

    /// Record a read; only files track access time
    pub fn touch_access(&mut self, now: i64) {
        if let Some(file) = self.file_mut() {
            file.access_time = now;
        }
    }
}
