//! Opaque pagination cursor: `base64url(JSON({"offset": n}))`.
//!
//! Same `base64` + `serde_json` composition as `resource_uri`, applied to a
//! plain integer offset instead of a `(server, uri)` pair.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::McpError;

#[derive(Serialize, Deserialize)]
struct CursorPayload {
    offset: u64,
}

/// Encode a non-negative offset as an opaque cursor string.
pub fn encode(offset: u64) -> String {
    let payload = CursorPayload { offset };
    let json = serde_json::to_vec(&payload).expect("cursor payload always serializes");
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode a cursor string back to its offset. The empty cursor denotes
/// offset 0; callers should treat an absent cursor as the empty case
/// before calling this.
pub fn decode(cursor: &str) -> Result<u64, McpError> {
    if cursor.is_empty() {
        return Ok(0);
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| McpError::Transport(format!("malformed cursor: {e}")))?;
    let payload: CursorPayload = serde_json::from_slice(&bytes)
        .map_err(|e| McpError::Transport(format!("malformed cursor payload: {e}")))?;
    Ok(payload.offset)
}

/// Slice `items` to `[offset, offset+limit)` and compute the `nextCursor`
/// for the remainder.
pub fn paginate<T: Clone>(items: &[T], offset: u64, limit: Option<usize>) -> (Vec<T>, Option<String>) {
    let offset = offset as usize;
    if offset >= items.len() {
        return (Vec::new(), None);
    }
    let end = match limit {
        Some(limit) => (offset + limit).min(items.len()),
        None => items.len(),
    };
    let page = items[offset..end].to_vec();
    let next_cursor = if end < items.len() {
        Some(encode(end as u64))
    } else {
        None
    };
    (page, next_cursor)
}
