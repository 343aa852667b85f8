//! Path normalization shared by the table, the engine and the FUSE layer

use crate::fragments;

/// Paths of this many characters or more are refused
pub const MAX_PATH_LEN: usize = 255;

pub const ROOT: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path too long: {0} characters")]
    TooLong(usize),
    #[error("path uses reserved component: {0}")]
    Reserved(String),
}

/// Normalize a path to a consistent key: leading slash, no trailing
/// slash, no empty or `.` components
pub fn normalize(path: &str) -> String {
    let components: Vec<&str> = path
        .trim()
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    if components.is_empty() {
        return ROOT.to_string();
    }
    format!("/{}", components.join("/"))
}

/// Normalize and check a path handed in by the filesystem layer
pub fn validate(path: &str) -> Result<String, PathError> {
    let length = path.chars().count();
    if length >= MAX_PATH_LEN {
        return Err(PathError::TooLong(length));
    }
    let normalized = normalize(path);
    if fragments::is_fragment_path(&normalized) {
        return Err(PathError::Reserved(normalized));
    }
    Ok(normalized)
}

/// Parent of a normalized path; the root is its own parent
pub fn parent(path: &str) -> &str {
    if path == ROOT {
        return ROOT;
    }
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(pos) => &path[..pos],
    }
}

/// Final component of a normalized path; empty for the root
pub fn file_name(path: &str) -> &str {
    if path == ROOT || path.is_empty() {
        return "";
    }
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Join a normalized directory path and a child name
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}
