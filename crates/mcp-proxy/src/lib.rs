//! Aggregating proxy runtime for the Model Context Protocol.
//!
//! A [`Router`] owns one client connection and a set of [`UpstreamServer`]
//! processes, merging their tools, resources and prompts into a single
//! namespaced view.

pub mod auth;
pub mod config;
pub mod cursor;
pub mod error;
pub mod frame;
pub mod logging;
pub mod message;
pub mod ratelimit;
pub mod resource_uri;
pub mod router;
pub mod upstream;

pub use config::{ProxyConfig, ServerConfig};
pub use error::{McpError, ProxyError};
pub use frame::{Frame, FrameStream, StdioMode};
pub use router::Router;
pub use upstream::UpstreamServer;
