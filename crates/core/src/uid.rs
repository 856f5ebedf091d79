//! Staged-UID codec
//!
//! Events imported into the managed user layer keep their original UID
//! behind a ten-hex-character prefix derived from the source calendar id:
//! `sha1(calendar_id)[..10] + ":" + uid`. Legal managed depth is exactly
//! one; deeper prefixes are leftovers from earlier releases and collapse to
//! the right-most namespace.

use sha1::{Digest, Sha1};

const PREFIX_LEN: usize = 10;

/// Ten-hex namespace prefix for a calendar id.
pub fn calendar_prefix(calendar_id: &str) -> String {
    let digest = Sha1::digest(calendar_id.as_bytes());
    hex::encode(digest)[..PREFIX_LEN].to_string()
}

/// Namespace a raw UID under its source calendar.
pub fn staged_uid(calendar_id: &str, uid: &str) -> String {
    format!("{}:{}", calendar_prefix(calendar_id), uid)
}

fn leading_prefix(uid: &str) -> Option<&str> {
    let (head, rest) = uid.split_at_checked(PREFIX_LEN)?;
    if rest.starts_with(':') && head.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        Some(&rest[1..])
    } else {
        None
    }
}

/// Number of leading `<10-hex>:` namespace segments.
pub fn prefix_depth(uid: &str) -> usize {
    let mut depth = 0;
    let mut rest = uid;
    while let Some(tail) = leading_prefix(rest) {
        depth += 1;
        rest = tail;
    }
    depth
}

/// Collapse a nested managed UID to its right-most namespace. Idempotent;
/// UIDs at depth zero or one come back unchanged.
pub fn collapse_nested_uid(uid: &str) -> String {
    let mut rest = uid;
    while prefix_depth(rest) > 1 {
        match leading_prefix(rest) {
            Some(tail) => rest = tail,
            None => break,
        }
    }
    rest.to_string()
}
