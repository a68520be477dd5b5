//! Error types for the hub.
//!
//! Only configuration failures abort a reconciliation pass. Connect failures
//! are scoped to one server and travel inside a [`ServerFailure`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{ServerName, ToolName};

/// The configuration document could not be read or understood.
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration for server `{server}`: {reason}")]
    Invalid { server: String, reason: String },

    #[error("could not find mcp.json (set MCP_HUB_CONFIG or create ./mcp.json)")]
    NotFound,
}

/// A single server could not be brought up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The server's configuration lacks what its transport needs.
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    /// The transport or the protocol handshake failed.
    #[error("failed to establish connection: {0}")]
    Establish(String),

    /// Connected, but the tool list or capabilities could not be read.
    #[error("failed to inspect server: {0}")]
    Inspect(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection attempt cancelled")]
    Cancelled,
}

/// One server's failed outcome inside a batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFailure {
    pub server: ServerName,
    pub error: ConnectError,
}

impl ServerFailure {
    pub fn new(server: ServerName, error: ConnectError) -> Self {
        Self { server, error }
    }
}

impl std::fmt::Display for ServerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.server, self.error)
    }
}

/// Errors returned by the hub's public operations.
#[derive(Error, Debug)]
pub enum HubError {
    #[error(transparent)]
    ConfigLoad(#[from] ConfigLoadError),

    #[error("tool not found: {0}")]
    ToolNotFound(ToolName),

    #[error("tool `{tool}` failed on server `{server}`: {source}")]
    ToolCall {
        tool: ToolName,
        server: ServerName,
        #[source]
        source: anyhow::Error,
    },
}

pub type HubResult<T> = Result<T, HubError>;
