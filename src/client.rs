//! Contracts between the hub and the things it connects to.
//!
//! The hub never talks MCP itself: a [`ConnectionEstablisher`] turns a
//! [`ServerConfig`] into a [`Connection`], and the hub only drives the
//! resulting [`ClientHandle`] and [`TransportHandle`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::{ServerConfig, TransportKind};
use crate::error::ConnectError;
use crate::types::{ServerName, ToolName};

/// JSON object as used for tool arguments and schemas.
pub type JsonObject = serde_json::Map<String, Value>;

/// A tool as advertised by a server's tool list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvertisedTool {
    pub name: ToolName,
    pub description: Option<String>,
    pub input_schema: JsonObject,
}

impl AdvertisedTool {
    pub fn new(name: impl Into<ToolName>, description: Option<String>) -> Self {
        Self {
            name: name.into(),
            description,
            input_schema: JsonObject::new(),
        }
    }
}

/// Descriptive metadata a server reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerCapabilities {
    pub description: Option<String>,
    pub icon: Option<String>,
}

/// A live protocol session with one server.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<AdvertisedTool>>;

    async fn server_capabilities(&self) -> Result<ServerCapabilities>;

    async fn call_tool(&self, tool: &str, args: JsonObject) -> Result<Value>;

    /// End the session. Calling it twice is harmless.
    async fn close(&self) -> Result<()>;
}

/// Something that must be released when a server is disconnected:
/// a child process, a socket, a background task.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn release(&mut self) -> Result<()>;
}

/// Everything the establisher hands back for one server.
pub struct Connection {
    pub client: Arc<dyn ClientHandle>,
    pub transport: Box<dyn TransportHandle>,
    pub auxiliary: Option<Box<dyn TransportHandle>>,
}

/// Turns a configuration record into a live connection.
#[async_trait]
pub trait ConnectionEstablisher: Send + Sync {
    /// `env` is the merged environment the server should run with; the hub
    /// has already resolved `config.transport` to a concrete kind.
    async fn connect(
        &self,
        name: &ServerName,
        config: &ServerConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Connection, ConnectError>;
}
