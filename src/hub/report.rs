//! Results handed back by the hub's lifecycle operations.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client::AdvertisedTool;
use crate::config::TransportKind;
use crate::error::{ConnectError, ServerFailure};
use crate::types::ServerName;

/// Outcome of a reconciliation pass.
///
/// Per-server failures are collected here instead of failing the pass;
/// partial success is a normal result.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Servers connected for the first time in this pass.
    pub connected: Vec<ServerName>,
    pub disconnected: Vec<ServerName>,
    /// Servers torn down and reconnected because their configuration drifted.
    pub restarted: Vec<ServerName>,
    /// Servers whose enabled projection was flipped without reconnecting.
    pub toggled: Vec<ServerName>,
    pub failures: Vec<ServerFailure>,
}

impl ReconcileReport {
    /// `true` when the pass neither changed anything nor failed.
    pub fn is_noop(&self) -> bool {
        self.connected.is_empty()
            && self.disconnected.is_empty()
            && self.restarted.is_empty()
            && self.toggled.is_empty()
            && self.failures.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failure_for(&self, server: &str) -> Option<&ConnectError> {
        self.failures
            .iter()
            .find(|f| f.server.as_str() == server)
            .map(|f| &f.error)
    }
}

impl std::fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} connected, {} restarted, {} disconnected, {} toggled, {} failed",
            self.connected.len(),
            self.restarted.len(),
            self.disconnected.len(),
            self.toggled.len(),
            self.failures.len()
        )
    }
}

/// Result of flipping a server's enabled state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Tools were merged into the registry.
    Enabled { tools: usize },
    /// Tools were removed from the registry.
    Disabled { tools: usize },
    /// The server already had the requested state.
    Unchanged,
    /// No live connection with that name.
    UnknownServer,
}

/// A connected server with its advertised tools and metadata. Disabled
/// servers are listed too; their tools are just not routable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerToolInfo {
    pub name: ServerName,
    pub transport: TransportKind,
    pub enabled: bool,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub tools: Vec<AdvertisedTool>,
    pub connected_at: DateTime<Utc>,
}

/// One-line status of a connected server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub name: ServerName,
    pub transport: TransportKind,
    pub enabled: bool,
    pub tool_count: usize,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl From<&ServerToolInfo> for ServerStatus {
    fn from(info: &ServerToolInfo) -> Self {
        Self {
            name: info.name.clone(),
            transport: info.transport,
            enabled: info.enabled,
            tool_count: info.tools.len(),
            description: info.description.clone(),
            icon: info.icon.clone(),
            connected_at: info.connected_at,
        }
    }
}
