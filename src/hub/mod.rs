//! The reconciliation engine.
//!
//! [`McpHub`] owns every live server connection and drives that set toward
//! what the configuration says should be connected. Whole passes (full
//! connect, sync, force sync, single-server operations) are serialized on one
//! mutex; the tool registry sits behind its own lock so readers are only ever
//! held up by short merge/remove calls.

pub mod diff;
mod report;

mod integration_tests;

pub use report::{ReconcileReport, ServerStatus, ServerToolInfo, ToggleOutcome};

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{
    AdvertisedTool, ClientHandle, Connection, ConnectionEstablisher, JsonObject,
    ServerCapabilities, TransportHandle,
};
use crate::config::{ConfigLoader, HubSettings, JsonConfigLoader, ServerConfig, ServerConfigs};
use crate::error::{ConnectError, HubError, HubResult, ServerFailure};
use crate::mcp_client::RmcpEstablisher;
use crate::tools::{Tool, ToolRegistry};
use crate::types::{ServerName, ToolName};

/// A live connection and everything derived from it.
struct ConnectedServer {
    config: ServerConfig,
    client: Arc<dyn ClientHandle>,
    transport: Box<dyn TransportHandle>,
    auxiliary: Option<Box<dyn TransportHandle>>,
    tools: Vec<AdvertisedTool>,
    capabilities: ServerCapabilities,
    /// Whether the tools are projected into the registry.
    enabled: bool,
    connected_at: DateTime<Utc>,
}

impl ConnectedServer {
    fn info(&self) -> ServerToolInfo {
        ServerToolInfo {
            name: self.config.name.clone(),
            transport: self.transport.kind(),
            enabled: self.enabled,
            description: self.capabilities.description.clone(),
            icon: self.capabilities.icon.clone(),
            tools: self.tools.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// State only touched while a pass holds the lock.
struct HubState {
    config_path: PathBuf,
    servers: BTreeMap<ServerName, ConnectedServer>,
    /// Configuration applied by the last completed pass; drift detection only.
    snapshot: Option<ServerConfigs>,
    initialized: bool,
}

/// What readers see: routable tools plus per-server metadata.
#[derive(Default)]
struct HubView {
    registry: ToolRegistry,
    servers: BTreeMap<ServerName, ServerToolInfo>,
}

/// Keeps live MCP server connections in line with the configuration.
pub struct McpHub {
    loader: Arc<dyn ConfigLoader>,
    establisher: Arc<dyn ConnectionEstablisher>,
    settings: HubSettings,
    state: Mutex<HubState>,
    view: RwLock<HubView>,
    shutdown: RwLock<CancellationToken>,
}

impl McpHub {
    pub fn new(
        config_path: impl Into<PathBuf>,
        loader: Arc<dyn ConfigLoader>,
        establisher: Arc<dyn ConnectionEstablisher>,
        settings: HubSettings,
    ) -> Self {
        Self {
            loader,
            establisher,
            settings,
            state: Mutex::new(HubState {
                config_path: config_path.into(),
                servers: BTreeMap::new(),
                snapshot: None,
                initialized: false,
            }),
            view: RwLock::new(HubView::default()),
            shutdown: RwLock::new(CancellationToken::new()),
        }
    }

    /// A hub reading `mcp.json` from `config_path` and connecting through rmcp.
    pub fn with_rmcp(config_path: impl Into<PathBuf>, settings: HubSettings) -> Self {
        Self::new(
            config_path,
            Arc::new(JsonConfigLoader),
            Arc::new(RmcpEstablisher),
            settings,
        )
    }

    pub async fn config_path(&self) -> PathBuf {
        self.state.lock().await.config_path.clone()
    }

    /// Point the hub at another configuration file. Takes effect on the next
    /// pass; live connections are left alone until then.
    pub async fn set_config_path(&self, path: impl Into<PathBuf>) {
        self.state.lock().await.config_path = path.into();
    }

    /// Cancelling this token fails every outstanding connect attempt with
    /// [`ConnectError::Cancelled`], and every later one until the token is
    /// renewed.
    pub async fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.read().await.clone()
    }

    /// Install a fresh token so later passes can connect again. Attempts
    /// already running keep the token they started with.
    pub async fn renew_shutdown_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.shutdown.write().await = token.clone();
        token
    }

    /// Connect every enabled server the first time it is called; later calls
    /// do nothing.
    pub async fn initialize(&self) -> HubResult<ReconcileReport> {
        let mut state = self.state.lock().await;
        if state.initialized {
            debug!("Hub already initialized");
            return Ok(ReconcileReport::default());
        }
        self.full_connect(&mut state).await
    }

    /// Reload the configuration, drop every live connection and connect all
    /// enabled servers concurrently.
    ///
    /// The configuration is read first: if it fails to load, the error is
    /// returned and the existing connections keep running.
    pub async fn connect_all_servers(&self) -> HubResult<ReconcileReport> {
        let mut state = self.state.lock().await;
        self.full_connect(&mut state).await
    }

    /// Reload the configuration and apply the minimal set of changes.
    ///
    /// Only a configuration load failure fails the call; per-server failures
    /// land in [`ReconcileReport::failures`].
    pub async fn sync_servers_with_config(&self) -> HubResult<ReconcileReport> {
        let mut state = self.state.lock().await;

        let configs = match self.loader.load(&state.config_path).await {
            Ok(configs) => configs,
            Err(e) => {
                error!("Sync aborted, could not load {}: {e}", state.config_path.display());
                return Err(e.into());
            }
        };

        let live: BTreeMap<ServerName, bool> = state
            .servers
            .iter()
            .map(|(name, server)| (name.clone(), server.enabled))
            .collect();
        let plan = diff::plan_sync(&live, &configs, state.snapshot.as_ref());
        if plan.is_empty() {
            debug!("MCP servers already match the configuration");
        } else {
            info!(
                "Syncing MCP servers: {} to remove, {} to connect, {} to restart, {} to toggle",
                plan.remove.len(),
                plan.connect.len(),
                plan.restart.len(),
                plan.toggle.len()
            );
        }

        let mut report = ReconcileReport::default();

        for name in &plan.remove {
            if let Some(name) = self.disconnect_locked(&mut state, name.as_str()).await {
                report.disconnected.push(name);
            }
        }

        for name in &plan.restart {
            info!("Configuration of `{name}` changed, restarting");
            self.disconnect_locked(&mut state, name.as_str()).await;
        }

        for (name, enabled) in &plan.toggle {
            self.set_enabled_locked(&mut state, name.as_str(), *enabled)
                .await;
            report.toggled.push(name.clone());
        }

        let pending: BTreeSet<&ServerName> =
            plan.connect.iter().chain(plan.restart.iter()).collect();
        let to_connect: Vec<&ServerConfig> =
            pending.into_iter().filter_map(|name| configs.get(name)).collect();
        let shared = diff::shared_env(&configs);

        let succeeded = self
            .connect_batch(&mut state, to_connect, &shared, &mut report)
            .await;
        for name in succeeded {
            if plan.restart.contains(&name) {
                report.restarted.push(name);
            } else {
                report.connected.push(name);
            }
        }

        state.snapshot = Some(configs);
        Ok(report)
    }

    /// Tear everything down and connect from scratch, ignoring drift.
    pub async fn sync_servers_with_config_force(&self) -> HubResult<ReconcileReport> {
        let mut state = self.state.lock().await;
        let disconnected = self.disconnect_all_locked(&mut state).await;
        let mut report = self.full_connect(&mut state).await?;
        report.disconnected = disconnected;
        Ok(report)
    }

    pub async fn disconnect_all_servers(&self) -> ReconcileReport {
        let mut state = self.state.lock().await;
        ReconcileReport {
            disconnected: self.disconnect_all_locked(&mut state).await,
            ..Default::default()
        }
    }

    /// Disconnect one server. Returns `false` if it was not connected.
    pub async fn disconnect_single_server(&self, name: &str) -> bool {
        let mut state = self.state.lock().await;
        self.disconnect_locked(&mut state, name).await.is_some()
    }

    /// Connect a single server, replacing any live connection with the same
    /// name. Nothing is registered if the attempt fails.
    pub async fn connect_server(
        &self,
        config: &ServerConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<(), ConnectError> {
        let mut state = self.state.lock().await;
        self.disconnect_locked(&mut state, config.name.as_str()).await;

        let server = self.establish(config, env).await.inspect_err(|e| {
            warn!("Failed to connect MCP server `{}`: {e}", config.name);
        })?;
        self.register(&mut state, server).await;
        Ok(())
    }

    /// Project a server's tools into (or out of) the registry without
    /// touching its connection.
    pub async fn update_server_enabled_state(&self, name: &str, enabled: bool) -> ToggleOutcome {
        let mut state = self.state.lock().await;
        self.set_enabled_locked(&mut state, name, enabled).await
    }

    /// Snapshot of the tools of all enabled servers.
    pub async fn get_available_tools(&self) -> Vec<Tool> {
        self.view.read().await.registry.query()
    }

    /// Every connected server with its tools and metadata.
    pub async fn get_tool_infos(&self) -> Vec<ServerToolInfo> {
        self.view.read().await.servers.values().cloned().collect()
    }

    /// Status rows for every connected server, sorted by name.
    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        self.view
            .read()
            .await
            .servers
            .values()
            .map(ServerStatus::from)
            .collect()
    }

    pub async fn get_tool_to_server_map(&self) -> BTreeMap<ToolName, ServerName> {
        self.view.read().await.registry.tool_to_server_map()
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.view.read().await.servers.contains_key(name)
    }

    /// Invoke a tool on whichever enabled server owns it.
    pub async fn call_tool(&self, tool: &str, args: JsonObject) -> HubResult<Value> {
        let route = self
            .view
            .read()
            .await
            .registry
            .route(tool)
            .ok_or_else(|| HubError::ToolNotFound(ToolName::new(tool)))?;

        debug!("Calling tool `{tool}` on server `{}`", route.server);
        route
            .client
            .call_tool(tool, args)
            .await
            .map_err(|source| HubError::ToolCall {
                tool: ToolName::new(tool),
                server: route.server.clone(),
                source,
            })
    }

    async fn full_connect(&self, state: &mut HubState) -> HubResult<ReconcileReport> {
        let configs = self.loader.load(&state.config_path).await?;

        let mut report = ReconcileReport {
            disconnected: self.disconnect_all_locked(state).await,
            ..Default::default()
        };

        let shared = diff::shared_env(&configs);
        let enabled: Vec<&ServerConfig> = configs.values().filter(|c| c.enabled).collect();
        info!(
            "Connecting {} of {} configured MCP servers",
            enabled.len(),
            configs.len()
        );

        let connected = self
            .connect_batch(state, enabled, &shared, &mut report)
            .await;
        report.connected = connected;

        state.snapshot = Some(configs);
        state.initialized = true;
        Ok(report)
    }

    /// Establish all `configs` concurrently, then register the successes in
    /// the given (alphabetical) order so tool-name collisions resolve the same
    /// way every time. Returns the names that connected.
    async fn connect_batch(
        &self,
        state: &mut HubState,
        configs: Vec<&ServerConfig>,
        shared: &BTreeMap<String, String>,
        report: &mut ReconcileReport,
    ) -> Vec<ServerName> {
        let attempts = configs.into_iter().map(|config| {
            let env = diff::env_for(shared, config);
            async move {
                let outcome = self.establish(config, &env).await;
                (config.name.clone(), outcome)
            }
        });
        let outcomes = join_all(attempts).await;

        let mut connected = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(server) => {
                    self.register(state, server).await;
                    connected.push(name);
                }
                Err(error) => {
                    warn!("Failed to connect MCP server `{name}`: {error}");
                    report.failures.push(ServerFailure::new(name, error));
                }
            }
        }
        connected
    }

    /// Connect and inspect one server without touching hub state.
    ///
    /// Both steps share one deadline and are cut short by shutdown. A
    /// connection that was established but not inspected in time is
    /// released before the error is returned.
    async fn establish(
        &self,
        config: &ServerConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<ConnectedServer, ConnectError> {
        let name = &config.name;
        let mut resolved = config.clone();
        resolved.transport = Some(config.transport_kind());

        let shutdown = self.shutdown.read().await.clone();
        let deadline = Instant::now() + self.settings.connect_timeout;

        let connection = self
            .guarded(&shutdown, deadline, self.establisher.connect(name, &resolved, env))
            .await??;

        let inspect = async {
            let tools = connection
                .client
                .list_tools()
                .await
                .map_err(|e| ConnectError::Inspect(format!("{e:#}")))?;
            let capabilities = connection
                .client
                .server_capabilities()
                .await
                .unwrap_or_else(|e| {
                    warn!("Could not read capabilities of `{name}`: {e:#}");
                    ServerCapabilities::default()
                });
            Ok::<_, ConnectError>((tools, capabilities))
        };
        let inspected = self
            .guarded(&shutdown, deadline, inspect)
            .await
            .and_then(|outcome| outcome);

        let (tools, capabilities) = match inspected {
            Ok(found) => found,
            Err(e) => {
                self.release_connection(name, connection).await;
                return Err(e);
            }
        };

        Ok(ConnectedServer {
            config: config.clone(),
            client: connection.client,
            transport: connection.transport,
            auxiliary: connection.auxiliary,
            tools,
            capabilities,
            enabled: config.enabled,
            connected_at: Utc::now(),
        })
    }

    /// Run one step of a connect, failing on `deadline` or shutdown.
    async fn guarded<T>(
        &self,
        shutdown: &CancellationToken,
        deadline: Instant,
        step: impl Future<Output = T>,
    ) -> Result<T, ConnectError> {
        tokio::select! {
            _ = shutdown.cancelled() => Err(ConnectError::Cancelled),
            outcome = tokio::time::timeout_at(deadline, step) => {
                outcome.map_err(|_| ConnectError::Timeout(self.settings.connect_timeout))
            }
        }
    }

    async fn register(&self, state: &mut HubState, server: ConnectedServer) {
        let name = server.config.name.clone();
        if let Some(existing) = state.servers.remove(&name) {
            warn!("Replacing live connection for `{name}`");
            self.teardown(&name, existing).await;
        }

        {
            let mut view = self.view.write().await;
            if server.enabled {
                view.registry
                    .merge_tools(&name, server.client.clone(), server.tools.clone());
            }
            view.servers.insert(name.clone(), server.info());
            debug!("Registry now routes {} tools", view.registry.len());
        }

        info!(
            "Connected to MCP server `{name}` over {} ({} tools{})",
            server.transport.kind(),
            server.tools.len(),
            if server.enabled { "" } else { ", disabled" }
        );
        state.servers.insert(name, server);
    }

    async fn disconnect_locked(&self, state: &mut HubState, name: &str) -> Option<ServerName> {
        let (name, server) = state.servers.remove_entry(name)?;
        self.teardown(&name, server).await;
        Some(name)
    }

    /// Remove a server's tools from the view and release its handles.
    ///
    /// The current tool list is queried so tools advertised after connect are
    /// removed too; an unreachable server only costs the query timeout.
    async fn teardown(&self, name: &ServerName, server: ConnectedServer) {
        let mut names: BTreeSet<ToolName> = server.tools.iter().map(|t| t.name.clone()).collect();
        let timeout = self.settings.disconnect_timeout;
        if let Some(current) = self
            .bounded("list tools", name, timeout, server.client.list_tools())
            .await
        {
            names.extend(current.into_iter().map(|t| t.name));
        }

        {
            let mut view = self.view.write().await;
            view.registry.remove_tools(name, names.iter());
            view.servers.remove(name);
            if view.registry.is_empty() {
                debug!("Registry is empty");
            }
        }

        self.release_handles(name, server.client, server.transport, server.auxiliary)
            .await;
        info!("Disconnected MCP server `{name}`");
    }

    async fn disconnect_all_locked(&self, state: &mut HubState) -> Vec<ServerName> {
        let servers = std::mem::take(&mut state.servers);
        {
            let mut view = self.view.write().await;
            view.registry.clear();
            view.servers.clear();
        }

        let names: Vec<ServerName> = servers.keys().cloned().collect();
        join_all(servers.into_iter().map(|(name, server)| async move {
            self.release_handles(&name, server.client, server.transport, server.auxiliary)
                .await;
        }))
        .await;

        if !names.is_empty() {
            info!("Disconnected {} MCP servers", names.len());
        }
        names
    }

    async fn set_enabled_locked(
        &self,
        state: &mut HubState,
        name: &str,
        enabled: bool,
    ) -> ToggleOutcome {
        let Some(server) = state.servers.get_mut(name) else {
            warn!("Cannot change enabled state of unknown MCP server `{name}`");
            return ToggleOutcome::UnknownServer;
        };
        if server.enabled == enabled {
            return ToggleOutcome::Unchanged;
        }

        let server_name = server.config.name.clone();
        if enabled {
            let timeout = self.settings.connect_timeout;
            match self
                .bounded("list tools", &server_name, timeout, server.client.list_tools())
                .await
            {
                Some(tools) => server.tools = tools,
                None => warn!("Enabling `{server_name}` with its last known tool list"),
            }
        }
        server.enabled = enabled;

        let mut view = self.view.write().await;
        if enabled {
            view.registry
                .merge_tools(&server_name, server.client.clone(), server.tools.clone());
        } else {
            view.registry.remove_server(&server_name);
        }
        if let Some(info) = view.servers.get_mut(&server_name) {
            info.enabled = enabled;
            info.tools = server.tools.clone();
        }

        let tools = server.tools.len();
        if enabled {
            info!("Enabled MCP server `{server_name}` ({tools} tools)");
            ToggleOutcome::Enabled { tools }
        } else {
            info!("Disabled MCP server `{server_name}`");
            ToggleOutcome::Disabled { tools }
        }
    }

    async fn release_connection(&self, name: &ServerName, connection: Connection) {
        self.release_handles(name, connection.client, connection.transport, connection.auxiliary)
            .await;
    }

    /// Close the client and release both transport handles. Each step is
    /// attempted even if an earlier one failed.
    async fn release_handles(
        &self,
        name: &ServerName,
        client: Arc<dyn ClientHandle>,
        mut transport: Box<dyn TransportHandle>,
        auxiliary: Option<Box<dyn TransportHandle>>,
    ) {
        let timeout = self.settings.disconnect_timeout;
        self.bounded("close client", name, timeout, client.close())
            .await;
        self.bounded("release transport", name, timeout, transport.release())
            .await;
        if let Some(mut auxiliary) = auxiliary {
            self.bounded("release auxiliary handle", name, timeout, auxiliary.release())
                .await;
        }
    }

    /// Run a best-effort call, logging instead of failing.
    async fn bounded<T>(
        &self,
        what: &str,
        name: &ServerName,
        timeout: Duration,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Option<T> {
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Failed to {what} for `{name}`: {e:#}");
                None
            }
            Err(_) => {
                warn!("Timed out after {timeout:?} trying to {what} for `{name}`");
                None
            }
        }
    }
}
