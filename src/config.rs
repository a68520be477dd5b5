//! Server configuration: the `mcp.json` document and the typed records the
//! hub reconciles against.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fmt};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConfigLoadError;
use crate::types::ServerName;

/// Environment variable that points at the configuration file.
pub const CONFIG_PATH_ENV: &str = "MCP_HUB_CONFIG";

#[derive(Debug, Deserialize)]
pub struct McpJsonConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, McpServerEntry>,
}

/// One entry of the `mcpServers` object, as written by the user.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct McpServerEntry {
    #[serde(default, rename = "type", alias = "transport")]
    pub transport: Option<TransportKind>,

    // stdio server
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    // remote server
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    // flags
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// How the hub reaches a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking over stdin/stdout.
    #[default]
    Stdio,
    /// Remote server streaming responses as server-sent events.
    Sse,
    #[serde(alias = "ws")]
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::WebSocket => "websocket",
        };
        f.pad(s)
    }
}

/// Transport-specific parameters. Only the establisher interprets them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A configured server, compared field by field across reconciliation
/// cycles to detect drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: ServerName,
    /// `None` when the document did not name a transport.
    pub transport: Option<TransportKind>,
    pub params: ConnectionParams,
    pub env: BTreeMap<String, String>,
    pub enabled: bool,
}

impl ServerConfig {
    /// A stdio server running `command`, enabled, with no overrides.
    pub fn stdio(name: impl Into<ServerName>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: None,
            params: ConnectionParams {
                command: Some(command.into()),
                ..Default::default()
            },
            env: BTreeMap::new(),
            enabled: true,
        }
    }

    /// A remote server at `url` using `transport`, enabled, with no overrides.
    pub fn remote(
        name: impl Into<ServerName>,
        transport: TransportKind,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            transport: Some(transport),
            params: ConnectionParams {
                url: Some(url.into()),
                ..Default::default()
            },
            env: BTreeMap::new(),
            enabled: true,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The transport to use, defaulting to stdio.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.unwrap_or_default()
    }

    pub fn from_entry(name: String, entry: McpServerEntry) -> Result<Self, ConfigLoadError> {
        if name.trim().is_empty() {
            return Err(ConfigLoadError::Invalid {
                server: name,
                reason: "server name must not be empty".to_string(),
            });
        }

        let enabled = entry.enabled.unwrap_or(!entry.disabled);

        Ok(Self {
            name: ServerName::new(name),
            transport: entry.transport,
            params: ConnectionParams {
                command: entry.command,
                args: entry.args,
                cwd: entry.cwd,
                url: entry.url,
                headers: entry.headers,
            },
            env: entry.env,
            enabled,
        })
    }
}

/// Configured servers keyed (and therefore ordered) by name.
pub type ServerConfigs = BTreeMap<ServerName, ServerConfig>;

/// Source of the server configuration.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<ServerConfigs, ConfigLoadError>;
}

/// Reads `mcp.json`-style documents from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConfigLoader;

#[async_trait]
impl ConfigLoader for JsonConfigLoader {
    async fn load(&self, path: &Path) -> Result<ServerConfigs, ConfigLoadError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigLoadError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        parse_servers(&raw, path)
    }
}

/// Parse a configuration document. `path` is only used in error messages.
pub fn parse_servers(raw: &str, path: &Path) -> Result<ServerConfigs, ConfigLoadError> {
    let cfg: McpJsonConfig =
        serde_json::from_str(raw).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let mut servers = ServerConfigs::new();
    for (name, entry) in cfg.mcp_servers {
        let server = ServerConfig::from_entry(name, expand_entry(entry))?;
        servers.insert(server.name.clone(), server);
    }

    Ok(servers)
}

pub fn resolve_config_path() -> Result<PathBuf, ConfigLoadError> {
    if let Ok(p) = env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("mcp").join("mcp.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from("mcp.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(ConfigLoadError::NotFound)
}

/// Replace `${NAME}` with the value of the environment variable `NAME`.
/// Unset variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) if closed => out.push_str(&val),
                _ => {
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_entry(mut entry: McpServerEntry) -> McpServerEntry {
    for val in entry.env.values_mut() {
        *val = expand_env_vars(val);
    }
    for val in entry.headers.values_mut() {
        *val = expand_env_vars(val);
    }
    for field in [&mut entry.command, &mut entry.url, &mut entry.cwd] {
        if let Some(s) = field.as_mut() {
            *s = expand_env_vars(s);
        }
    }
    entry.args = entry.args.iter().map(|a| expand_env_vars(a)).collect();

    entry
}

/// Runtime knobs of the hub itself.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Upper bound for establishing and inspecting one server.
    pub connect_timeout: Duration,
    /// Upper bound for each close/release step of a disconnect.
    pub disconnect_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}
