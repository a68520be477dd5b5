// Core modules
mod client;
mod config;
mod error;
mod hub;
mod mcp_client;
mod tools;
mod types;

// Re-export key types
pub use client::{
    AdvertisedTool, ClientHandle, Connection, ConnectionEstablisher, JsonObject,
    ServerCapabilities, TransportHandle,
};
pub use config::{
    CONFIG_PATH_ENV, ConfigLoader, ConnectionParams, HubSettings, JsonConfigLoader,
    McpJsonConfig, McpServerEntry, ServerConfig, ServerConfigs, TransportKind, parse_servers,
    resolve_config_path,
};
pub use error::{ConfigLoadError, ConnectError, HubError, HubResult, ServerFailure};
pub use hub::diff::{SyncPlan, env_for, has_changed, plan_sync, shared_env};
pub use hub::{McpHub, ReconcileReport, ServerStatus, ServerToolInfo, ToggleOutcome};
pub use mcp_client::{RmcpClient, RmcpEstablisher};
pub use tools::{Route, Tool, ToolRegistry};
pub use types::{ServerName, ToolName};
