//! Extended attributes attached to an entry
//!
//! User attributes are persisted in the record's `xattr` map. Keys in the
//! `matrixfs.` namespace are never stored: they are synthesized from the
//! record metadata on read (see [`crate::entry::Entry::attribute`]).

use std::collections::BTreeMap;

/// Namespace owned by matrixfs itself
pub const RESERVED_PREFIX: &str = "matrixfs.";

/// Id of the remote record the entry was last built from
pub const EVENT_ID_KEY: &str = "matrixfs.eventid";
/// Author of the remote record the entry was last built from
pub const SENDER_KEY: &str = "matrixfs.sender";
/// Whether a file is stored as fragments
pub const FRAGMENTED_KEY: &str = "matrixfs.fragmented";

pub fn is_reserved(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributeError {
    #[error("attribute {0} is read-only")]
    Reserved(String),
    #[error("attribute {0} not found")]
    NotFound(String),
}

/// User-writable attribute map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeStore {
    values: BTreeMap<String, String>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a persisted map, dropping anything in the reserved namespace
    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        let values = values
            .into_iter()
            .filter(|(key, _)| {
                let reserved = is_reserved(key);
                if reserved {
                    tracing::debug!("dropping reserved attribute {} from record", key);
                }
                !reserved
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: String) -> Result<(), AttributeError> {
        if is_reserved(key) {
            return Err(AttributeError::Reserved(key.to_string()));
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<String, AttributeError> {
        if is_reserved(key) {
            return Err(AttributeError::Reserved(key.to_string()));
        }
        self.values
            .remove(key)
            .ok_or_else(|| AttributeError::NotFound(key.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}
