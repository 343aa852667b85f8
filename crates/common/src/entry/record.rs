//! Wire shape of a path record in room state

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::Encoding;

/// State event type under which every path record is stored
pub const RECORD_TYPE: &str = "matrixfs.entry";

/// One record per path, as stored in the room
///
/// ```text
/// { type: "d"|"f"|"F", xattr: {..}?,
///   data: <string>?, encoding: "base64"?,
///   fragmented: true?, fragments: <int>?, size: <int>?, executable: true? }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Type tag, kept as a string so unknown tags can be reported
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattr: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Encoding::is_raw")]
    pub encoding: Encoding,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fragmented: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragments: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub executable: bool,
}

impl StateRecord {
    /// Parse record content; `Ok(None)` means the record was cleared
    /// (empty content is how a path is deleted).
    pub fn from_content(content: &serde_json::Value) -> Result<Option<Self>, serde_json::Error> {
        match content {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Object(map) if map.is_empty() => Ok(None),
            other => Ok(Some(Self::deserialize(other)?)),
        }
    }

    pub fn to_content(&self) -> serde_json::Value {
        // A struct of strings, maps and integers always serializes
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}

/// Metadata of the remote event a record arrived in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordMeta {
    pub event_id: Option<String>,
    pub sender: Option<String>,
    /// Server timestamp in milliseconds since the epoch
    pub timestamp: i64,
}
