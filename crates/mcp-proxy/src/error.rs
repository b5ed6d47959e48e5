use std::{io, time::Duration};

use serde_json::Value;
use thiserror::Error;

/// Standard JSON-RPC 2.0 error codes, plus the proxy-specific extensions
/// (auth, rate limiting, upstream transport failures).
pub mod code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const UNAUTHORIZED: i64 = -32001;
    pub const RATE_LIMITED: i64 = -32002;
    pub const UPSTREAM_TRANSPORT: i64 = -32010;
    pub const UPSTREAM_TIMEOUT: i64 = -32011;
}

/// Errors surfaced while driving a single upstream or a single in-flight
/// request against it. Mirrors the shape of `crates/codex/src/mcp.rs`'s
/// error enum, generalized from "the Codex child" to "any configured
/// upstream."
#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("upstream did not respond to initialize: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("request was cancelled")]
    Cancelled,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("transport channel closed unexpectedly")]
    ChannelClosed,
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limit exceeded")]
    RateLimited,
}

impl McpError {
    /// Maps this error onto a `(code, message)` pair suitable for a
    /// JSON-RPC error response.
    pub fn as_rpc_error(&self) -> (i64, String) {
        match self {
            McpError::Rpc { code, message, .. } => (*code, message.clone()),
            McpError::Timeout(_) => (code::UPSTREAM_TIMEOUT, self.to_string()),
            McpError::Unauthorized => (code::UNAUTHORIZED, self.to_string()),
            McpError::RateLimited => (code::RATE_LIMITED, self.to_string()),
            McpError::Serialization(_) => (code::PARSE_ERROR, self.to_string()),
            McpError::Spawn { .. }
            | McpError::Handshake(_)
            | McpError::Transport(_)
            | McpError::Cancelled
            | McpError::ChannelClosed => (code::UPSTREAM_TRANSPORT, self.to_string()),
        }
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            McpError::Rpc { data, .. } => data.clone(),
            _ => None,
        }
    }
}

/// Errors surfaced while loading and validating `ProxyConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Process-fatal errors, handled only at the boundary in `main`.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind process stdio: {0}")]
    Bind(#[source] io::Error),
}
