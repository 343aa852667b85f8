//! Splitting oversized payloads into bounded fragments
//!
//! A state record tops out at 64 KiB, so encoded content larger than
//! [`MAX_FRAGMENT_SIZE`] is stored as a sequence of fragment records under
//! `<file>/.fragments/<index>`. Chunk boundaries are a pure function of the
//! buffer length, which lets a later save compare fragment counts across
//! revisions and prune the excess.

/// Largest chunk stored in a single fragment record (56 KiB)
pub const MAX_FRAGMENT_SIZE: usize = 56 * 1024;

/// Path component under which a file's fragments live
pub const FRAGMENTS_DIR: &str = ".fragments";

/// Split a buffer into chunks of at most `max` bytes
///
/// Yields `ceil(len / max)` chunks; an empty buffer yields none.
pub fn split(buf: &[u8], max: usize) -> Vec<&[u8]> {
    assert!(max > 0, "fragment size must be positive");
    buf.chunks(max).collect()
}

/// Split encoded text into chunks of at most `max` bytes
///
/// Chunk ends are moved back to the nearest character boundary so every
/// chunk is itself valid UTF-8. For ASCII text (which includes Base64)
/// the boundaries are identical to [`split`].
pub fn split_text(text: &str, max: usize) -> Vec<&str> {
    assert!(max >= 4, "fragment size must fit any UTF-8 character");
    let mut chunks = Vec::with_capacity(text.len().div_ceil(max));
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest.len().min(max);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// Concatenate chunks in index order
pub fn reassemble<T: AsRef<[u8]>>(chunks: &[T]) -> Vec<u8> {
    let total = chunks.iter().map(|c| c.as_ref().len()).sum();
    let mut buf = Vec::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(chunk.as_ref());
    }
    buf
}

/// Path of fragment `index` belonging to `owner`
pub fn fragment_path(owner: &str, index: usize) -> String {
    if owner == "/" {
        format!("/{}/{}", FRAGMENTS_DIR, index)
    } else {
        format!("{}/{}/{}", owner, FRAGMENTS_DIR, index)
    }
}

/// Prefix shared by every fragment path of `owner`
pub fn fragment_prefix(owner: &str) -> String {
    format!("{}/{}/", owner.trim_end_matches('/'), FRAGMENTS_DIR)
}

/// Split a fragment path into its owning file path and index
pub fn parse_fragment_path(path: &str) -> Option<(&str, usize)> {
    let (prefix, index) = path.rsplit_once('/')?;
    let owner = prefix.strip_suffix(FRAGMENTS_DIR)?.strip_suffix('/')?;
    if owner.is_empty() {
        return None;
    }
    let index = index.parse().ok()?;
    Some((owner, index))
}

/// True when any component of `path` is the reserved fragments directory
pub fn is_fragment_path(path: &str) -> bool {
    path.split('/').any(|component| component == FRAGMENTS_DIR)
}
