//! Resource URI codec: `proxy://resource/<base64url(JSON({server, uri}))>`.
//! Same construction as `cursor`, reused for a different payload shape.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::McpError;

pub const SCHEME_PREFIX: &str = "proxy://resource/";

#[derive(Serialize, Deserialize)]
struct UriPayload {
    server: String,
    uri: String,
}

/// Encode an upstream's own resource URI into one opaque proxy-facing URI.
pub fn encode(server_id: &str, original_uri: &str) -> String {
    let payload = UriPayload {
        server: server_id.to_string(),
        uri: original_uri.to_string(),
    };
    let json = serde_json::to_vec(&payload).expect("uri payload always serializes");
    format!("{SCHEME_PREFIX}{}", URL_SAFE_NO_PAD.encode(json))
}

/// Decode a proxy-facing resource URI back to `(server_id, original_uri)`.
pub fn decode(proxy_uri: &str) -> Result<(String, String), McpError> {
    let encoded = proxy_uri.strip_prefix(SCHEME_PREFIX).ok_or_else(|| {
        McpError::Transport(format!("resource uri `{proxy_uri}` is not a proxy-issued uri"))
    })?;
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| McpError::Transport(format!("malformed resource uri: {e}")))?;
    let payload: UriPayload = serde_json::from_slice(&bytes)
        .map_err(|e| McpError::Transport(format!("malformed resource uri payload: {e}")))?;
    Ok((payload.server, payload.uri))
}
