//! Scenario tests for the hub.
//!
//! These drive [`McpHub`] against an in-memory config loader and a scripted
//! establisher that records every connect and every released handle.

#![cfg(test)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};

use super::*;
use crate::client::{AdvertisedTool, ClientHandle, Connection, ConnectionEstablisher};
use crate::config::{ConfigLoader, HubSettings, ServerConfig, ServerConfigs, TransportKind};
use crate::error::{ConfigLoadError, ConnectError, HubError};

/// Config loader whose document the test rewrites between passes.
#[derive(Default)]
struct ScriptedLoader {
    configs: StdMutex<Option<ServerConfigs>>,
}

impl ScriptedLoader {
    fn set(&self, configs: Vec<ServerConfig>) {
        *self.configs.lock().unwrap() = Some(to_map(configs));
    }

    fn break_config(&self) {
        *self.configs.lock().unwrap() = None;
    }
}

#[async_trait]
impl ConfigLoader for ScriptedLoader {
    async fn load(&self, path: &Path) -> Result<ServerConfigs, ConfigLoadError> {
        self.configs
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ConfigLoadError::Read {
                path: path.to_path_buf(),
                source: std::io::Error::other("config unreadable"),
            })
    }
}

/// How a fake server behaves. Shared with its client so tests can change it
/// after connecting.
#[derive(Default)]
struct FakeScript {
    tools: Vec<String>,
    fail_connect: Option<String>,
    fail_list: bool,
    delay: Option<Duration>,
    list_delay: Option<Duration>,
}

type SharedScript = Arc<StdMutex<FakeScript>>;
type Events = Arc<StdMutex<Vec<String>>>;

struct FakeClient {
    name: String,
    script: SharedScript,
    events: Events,
}

#[async_trait]
impl ClientHandle for FakeClient {
    async fn list_tools(&self) -> Result<Vec<AdvertisedTool>> {
        let list_delay = self.script.lock().unwrap().list_delay;
        if let Some(delay) = list_delay {
            tokio::time::sleep(delay).await;
        }

        let script = self.script.lock().unwrap();
        if script.fail_list {
            return Err(anyhow!("server `{}` unreachable", self.name));
        }
        Ok(script
            .tools
            .iter()
            .map(|t| AdvertisedTool::new(t.as_str(), Some(format!("{t} from {}", self.name))))
            .collect())
    }

    async fn server_capabilities(&self) -> Result<ServerCapabilities> {
        Ok(ServerCapabilities {
            description: Some(format!("{} server", self.name)),
            icon: None,
        })
    }

    async fn call_tool(&self, tool: &str, args: JsonObject) -> Result<Value> {
        Ok(json!({ "server": self.name, "tool": tool, "args": args }))
    }

    async fn close(&self) -> Result<()> {
        self.events.lock().unwrap().push(format!("close:{}", self.name));
        Ok(())
    }
}

struct FakeTransport {
    name: String,
    label: &'static str,
    events: Events,
}

#[async_trait]
impl TransportHandle for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn release(&mut self) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, self.name));
        Ok(())
    }
}

#[derive(Default)]
struct MockEstablisher {
    scripts: StdMutex<HashMap<String, SharedScript>>,
    connects: StdMutex<Vec<String>>,
    envs: StdMutex<HashMap<String, BTreeMap<String, String>>>,
    events: Events,
}

impl MockEstablisher {
    fn script(&self, name: &str) -> SharedScript {
        self.scripts
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn serve(&self, name: &str, tools: &[&str]) {
        self.script(name).lock().unwrap().tools = tools.iter().map(|t| t.to_string()).collect();
    }

    fn refuse(&self, name: &str, reason: &str) {
        self.script(name).lock().unwrap().fail_connect = Some(reason.to_string());
    }

    fn stall(&self, name: &str, delay: Duration) {
        self.script(name).lock().unwrap().delay = Some(delay);
    }

    fn slow_listing(&self, name: &str, delay: Duration) {
        self.script(name).lock().unwrap().list_delay = Some(delay);
    }

    fn make_unreachable(&self, name: &str) {
        self.script(name).lock().unwrap().fail_list = true;
    }

    fn connects(&self, name: &str) -> usize {
        self.connects
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.as_str() == name)
            .count()
    }

    fn total_connects(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    fn env_of(&self, name: &str) -> BTreeMap<String, String> {
        self.envs.lock().unwrap().get(name).cloned().unwrap_or_default()
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionEstablisher for MockEstablisher {
    async fn connect(
        &self,
        name: &ServerName,
        config: &ServerConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Connection, ConnectError> {
        assert!(config.transport.is_some(), "transport must be resolved before connect");

        self.connects.lock().unwrap().push(name.to_string());
        self.envs
            .lock()
            .unwrap()
            .insert(name.to_string(), env.clone());

        let script = self.script(name.as_str());
        let (fail, delay) = {
            let s = script.lock().unwrap();
            (s.fail_connect.clone(), s.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = fail {
            return Err(ConnectError::Establish(reason));
        }

        let transport = |label| FakeTransport {
            name: name.to_string(),
            label,
            events: self.events.clone(),
        };
        Ok(Connection {
            client: Arc::new(FakeClient {
                name: name.to_string(),
                script,
                events: self.events.clone(),
            }),
            transport: Box::new(transport("transport")),
            auxiliary: Some(Box::new(transport("aux"))),
        })
    }
}

struct Harness {
    hub: McpHub,
    loader: Arc<ScriptedLoader>,
    establisher: Arc<MockEstablisher>,
}

fn to_map(configs: Vec<ServerConfig>) -> ServerConfigs {
    configs.into_iter().map(|c| (c.name.clone(), c)).collect()
}

fn harness_with(settings: HubSettings, configs: Vec<ServerConfig>) -> Harness {
    let loader = Arc::new(ScriptedLoader::default());
    loader.set(configs);
    let establisher = Arc::new(MockEstablisher::default());
    let hub = McpHub::new("mcp.json", loader.clone(), establisher.clone(), settings);
    Harness {
        hub,
        loader,
        establisher,
    }
}

fn harness(configs: Vec<ServerConfig>) -> Harness {
    harness_with(HubSettings::default(), configs)
}

fn server(name: &str) -> ServerConfig {
    ServerConfig::stdio(name, format!("{name}-mcp"))
}

fn names(list: &[&str]) -> Vec<ServerName> {
    list.iter().map(|n| ServerName::new(*n)).collect()
}

/// Flattened registry as sorted (tool, server) pairs.
async fn registry_pairs(hub: &McpHub) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = hub
        .get_available_tools()
        .await
        .into_iter()
        .map(|t| (t.name.into_inner(), t.server.into_inner()))
        .collect();
    pairs.sort();
    pairs
}

fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter()
        .map(|(t, s)| (t.to_string(), s.to_string()))
        .collect()
}

#[tokio::test]
async fn test_full_connect_registers_enabled_successful_servers_only() {
    let h = harness(vec![
        server("alpha"),
        server("beta").with_enabled(false),
        server("gamma"),
    ]);
    h.establisher.serve("alpha", &["read", "write"]);
    h.establisher.serve("beta", &["search"]);
    h.establisher.refuse("gamma", "connection refused");

    let report = h.hub.connect_all_servers().await.unwrap();

    assert_eq!(report.connected, names(&["alpha"]));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(
        report.failure_for("gamma"),
        Some(&ConnectError::Establish("connection refused".into()))
    );
    assert_eq!(
        registry_pairs(&h.hub).await,
        pairs(&[("read", "alpha"), ("write", "alpha")])
    );
    assert_eq!(h.establisher.connects("beta"), 0);
    assert!(h.hub.is_connected("alpha").await);

    let servers = h.hub.list_servers().await;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].name, ServerName::new("alpha"));
    assert_eq!(servers[0].tool_count, 2);
    assert!(servers[0].enabled);
    assert!(!h.hub.is_connected("gamma").await);
}

#[tokio::test]
async fn test_sync_without_changes_is_idempotent() {
    let h = harness(vec![server("alpha"), server("beta")]);
    h.establisher.serve("alpha", &["read"]);
    h.establisher.serve("beta", &["search"]);

    h.hub.connect_all_servers().await.unwrap();
    let connects = h.establisher.total_connects();

    let first = h.hub.sync_servers_with_config().await.unwrap();
    let second = h.hub.sync_servers_with_config().await.unwrap();

    assert!(first.is_noop(), "unexpected work: {first}");
    assert!(second.is_noop(), "unexpected work: {second}");
    assert_eq!(h.establisher.total_connects(), connects);
    assert!(h.establisher.events().is_empty());
}

#[tokio::test]
async fn test_changing_one_field_restarts_only_that_server() {
    let h = harness(vec![server("alpha"), server("beta")]);
    h.establisher.serve("alpha", &["read"]);
    h.establisher.serve("beta", &["search"]);
    h.hub.connect_all_servers().await.unwrap();

    h.loader
        .set(vec![server("alpha"), server("beta").with_env("LOG_LEVEL", "debug")]);
    let report = h.hub.sync_servers_with_config().await.unwrap();

    assert_eq!(report.restarted, names(&["beta"]));
    assert!(report.connected.is_empty());
    assert!(report.failures.is_empty());
    assert_eq!(h.establisher.connects("alpha"), 1);
    assert_eq!(h.establisher.connects("beta"), 2);

    let events = h.establisher.events();
    assert_eq!(events, vec!["close:beta", "transport:beta", "aux:beta"]);
    assert_eq!(
        registry_pairs(&h.hub).await,
        pairs(&[("read", "alpha"), ("search", "beta")])
    );
}

#[tokio::test]
async fn test_toggle_enabled_does_not_reconnect() {
    let h = harness(vec![server("alpha")]);
    h.establisher.serve("alpha", &["read", "write"]);
    h.hub.connect_all_servers().await.unwrap();

    let outcome = h.hub.update_server_enabled_state("alpha", false).await;
    assert_eq!(outcome, ToggleOutcome::Disabled { tools: 2 });
    assert!(h.hub.get_available_tools().await.is_empty());
    assert!(h.hub.get_tool_to_server_map().await.is_empty());
    // Still connected, just hidden.
    assert!(h.hub.is_connected("alpha").await);

    let outcome = h.hub.update_server_enabled_state("alpha", true).await;
    assert_eq!(outcome, ToggleOutcome::Enabled { tools: 2 });
    assert_eq!(
        registry_pairs(&h.hub).await,
        pairs(&[("read", "alpha"), ("write", "alpha")])
    );
    assert_eq!(
        h.hub.get_tool_to_server_map().await.get("read"),
        Some(&ServerName::new("alpha"))
    );
    assert_eq!(h.establisher.connects("alpha"), 1);
    assert!(h.establisher.events().is_empty());

    assert_eq!(
        h.hub.update_server_enabled_state("alpha", true).await,
        ToggleOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_enabling_picks_up_new_tools() {
    let h = harness(vec![server("alpha")]);
    h.establisher.serve("alpha", &["read"]);
    h.hub.connect_all_servers().await.unwrap();

    h.hub.update_server_enabled_state("alpha", false).await;
    h.establisher.serve("alpha", &["read", "grep"]);
    h.hub.update_server_enabled_state("alpha", true).await;

    assert_eq!(
        registry_pairs(&h.hub).await,
        pairs(&[("grep", "alpha"), ("read", "alpha")])
    );
}

#[tokio::test]
async fn test_toggle_unknown_server_is_warning_only() {
    let h = harness(vec![]);
    h.hub.connect_all_servers().await.unwrap();

    assert_eq!(
        h.hub.update_server_enabled_state("ghost", true).await,
        ToggleOutcome::UnknownServer
    );
}

#[tokio::test]
async fn test_one_failure_does_not_contaminate_others() {
    let h = harness(vec![server("alpha"), server("beta"), server("gamma")]);
    h.establisher.serve("alpha", &["a"]);
    h.establisher.refuse("beta", "boom");
    h.establisher.serve("gamma", &["g"]);
    // Slow peers must not be cut short by a fast failure.
    h.establisher.stall("alpha", Duration::from_millis(30));
    h.establisher.stall("gamma", Duration::from_millis(10));

    let report = h.hub.connect_all_servers().await.unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].server, ServerName::new("beta"));
    assert_eq!(report.connected, names(&["alpha", "gamma"]));
    assert!(report.failure_for("alpha").is_none());
    assert!(report.failure_for("gamma").is_none());
    assert_eq!(
        registry_pairs(&h.hub).await,
        pairs(&[("a", "alpha"), ("g", "gamma")])
    );
}

#[tokio::test]
async fn test_disconnect_all_empties_registry_and_connections() {
    let h = harness(vec![server("alpha"), server("beta")]);
    h.establisher.serve("alpha", &["read"]);
    h.establisher.serve("beta", &["search"]);
    h.hub.connect_all_servers().await.unwrap();

    let report = h.hub.disconnect_all_servers().await;

    assert_eq!(report.disconnected, names(&["alpha", "beta"]));
    assert!(h.hub.get_available_tools().await.is_empty());
    assert!(h.hub.get_tool_to_server_map().await.is_empty());
    assert!(h.hub.get_tool_infos().await.is_empty());

    let mut events = h.establisher.events();
    events.sort();
    assert_eq!(
        events,
        vec![
            "aux:alpha",
            "aux:beta",
            "close:alpha",
            "close:beta",
            "transport:alpha",
            "transport:beta"
        ]
    );
}

#[tokio::test]
async fn test_enabling_a_server_in_config_connects_only_it() {
    let h = harness(vec![server("a"), server("b").with_enabled(false)]);
    h.establisher.serve("a", &["fetch"]);
    h.establisher.serve("b", &["store"]);

    let report = h.hub.connect_all_servers().await.unwrap();
    assert_eq!(report.connected, names(&["a"]));
    assert!(report.failures.is_empty());
    assert_eq!(registry_pairs(&h.hub).await, pairs(&[("fetch", "a")]));

    h.loader.set(vec![server("a"), server("b")]);
    let report = h.hub.sync_servers_with_config().await.unwrap();

    assert_eq!(report.connected, names(&["b"]));
    assert!(report.restarted.is_empty());
    assert!(report.failures.is_empty());
    assert_eq!(h.establisher.connects("a"), 1);
    assert_eq!(
        registry_pairs(&h.hub).await,
        pairs(&[("fetch", "a"), ("store", "b")])
    );
}

#[tokio::test]
async fn test_sync_disconnects_removed_and_disabled_servers() {
    let h = harness(vec![server("a"), server("b"), server("c")]);
    h.establisher.serve("a", &["ta"]);
    h.establisher.serve("b", &["tb"]);
    h.establisher.serve("c", &["tc"]);
    h.hub.connect_all_servers().await.unwrap();

    h.loader.set(vec![server("a"), server("c").with_enabled(false)]);
    let report = h.hub.sync_servers_with_config().await.unwrap();

    assert_eq!(report.disconnected, names(&["b", "c"]));
    assert_eq!(registry_pairs(&h.hub).await, pairs(&[("ta", "a")]));
    assert!(!h.hub.is_connected("b").await);
    assert!(!h.hub.is_connected("c").await);
}

#[tokio::test]
async fn test_config_load_failure_propagates_and_keeps_snapshot() {
    let configs = vec![server("alpha")];
    let h = harness(configs.clone());
    h.establisher.serve("alpha", &["read"]);
    h.hub.connect_all_servers().await.unwrap();

    h.loader.break_config();
    let err = h.hub.sync_servers_with_config().await.unwrap_err();
    assert!(matches!(err, HubError::ConfigLoad(ConfigLoadError::Read { .. })));
    assert_eq!(registry_pairs(&h.hub).await, pairs(&[("read", "alpha")]));

    h.loader.set(configs);
    let report = h.hub.sync_servers_with_config().await.unwrap();
    assert!(report.is_noop());
    assert_eq!(h.establisher.connects("alpha"), 1);
}

#[tokio::test]
async fn test_full_connect_with_broken_config_keeps_live_servers() {
    let h = harness(vec![server("alpha")]);
    h.establisher.serve("alpha", &["read"]);
    h.hub.connect_all_servers().await.unwrap();

    h.loader.break_config();
    assert!(h.hub.connect_all_servers().await.is_err());
    assert!(h.hub.is_connected("alpha").await);
}

#[tokio::test]
async fn test_tool_name_collision_resolves_alphabetically() {
    let h = harness(vec![server("zeta"), server("alpha")]);
    h.establisher.serve("alpha", &["search", "only_alpha"]);
    h.establisher.serve("zeta", &["search"]);
    // Make the alphabetically last server finish first.
    h.establisher.stall("alpha", Duration::from_millis(20));

    h.hub.connect_all_servers().await.unwrap();

    let map = h.hub.get_tool_to_server_map().await;
    assert_eq!(map.get("search"), Some(&ServerName::new("zeta")));

    assert!(h.hub.disconnect_single_server("zeta").await);
    let map = h.hub.get_tool_to_server_map().await;
    assert_eq!(map.get("search"), Some(&ServerName::new("alpha")));
    assert_eq!(map.len(), 2);
}

#[tokio::test]
async fn test_disconnect_releases_handles_when_tool_query_fails() {
    let h = harness(vec![server("alpha")]);
    h.establisher.serve("alpha", &["read"]);
    h.hub.connect_all_servers().await.unwrap();

    h.establisher.make_unreachable("alpha");
    assert!(h.hub.disconnect_single_server("alpha").await);

    assert_eq!(
        h.establisher.events(),
        vec!["close:alpha", "transport:alpha", "aux:alpha"]
    );
    assert!(h.hub.get_available_tools().await.is_empty());
    assert!(h.hub.get_tool_to_server_map().await.is_empty());

    // Idempotent.
    assert!(!h.hub.disconnect_single_server("alpha").await);
}

#[tokio::test]
async fn test_connect_timeout_is_reported_per_server() {
    let settings = HubSettings {
        connect_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let h = harness_with(settings, vec![server("slow"), server("fast")]);
    h.establisher.serve("fast", &["quick"]);
    h.establisher.stall("slow", Duration::from_secs(10));

    let report = h.hub.connect_all_servers().await.unwrap();

    assert_eq!(report.connected, names(&["fast"]));
    assert_eq!(
        report.failure_for("slow"),
        Some(&ConnectError::Timeout(Duration::from_millis(50)))
    );
}

#[tokio::test]
async fn test_shutdown_token_cancels_connects() {
    let h = harness(vec![server("alpha")]);
    h.establisher.stall("alpha", Duration::from_secs(10));
    h.hub.shutdown_token().await.cancel();

    let report = h.hub.connect_all_servers().await.unwrap();

    assert_eq!(report.failure_for("alpha"), Some(&ConnectError::Cancelled));
    assert!(!h.hub.is_connected("alpha").await);
}

#[tokio::test]
async fn test_inspection_timeout_releases_connection() {
    let settings = HubSettings {
        connect_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let h = harness_with(settings, vec![server("alpha")]);
    h.establisher.serve("alpha", &["read"]);
    h.establisher.slow_listing("alpha", Duration::from_secs(10));

    let report = h.hub.connect_all_servers().await.unwrap();

    assert_eq!(
        report.failure_for("alpha"),
        Some(&ConnectError::Timeout(Duration::from_millis(50)))
    );
    assert_eq!(
        h.establisher.events(),
        vec!["close:alpha", "transport:alpha", "aux:alpha"]
    );
    assert!(!h.hub.is_connected("alpha").await);
}

#[tokio::test]
async fn test_shutdown_during_inspection_releases_connection() {
    let h = harness(vec![server("alpha")]);
    h.establisher.serve("alpha", &["read"]);
    h.establisher.slow_listing("alpha", Duration::from_secs(10));

    let token = h.hub.shutdown_token().await;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let report = h.hub.connect_all_servers().await.unwrap();

    assert_eq!(report.failure_for("alpha"), Some(&ConnectError::Cancelled));
    assert_eq!(
        h.establisher.events(),
        vec!["close:alpha", "transport:alpha", "aux:alpha"]
    );
}

#[tokio::test]
async fn test_renewed_shutdown_token_allows_connecting_again() {
    let h = harness(vec![server("alpha")]);
    h.establisher.serve("alpha", &["read"]);
    h.establisher.stall("alpha", Duration::from_millis(20));

    let old = h.hub.shutdown_token().await;
    old.cancel();
    let report = h.hub.connect_all_servers().await.unwrap();
    assert_eq!(report.failure_for("alpha"), Some(&ConnectError::Cancelled));

    let fresh = h.hub.renew_shutdown_token().await;
    assert!(!fresh.is_cancelled());
    assert!(!h.hub.shutdown_token().await.is_cancelled());

    let report = h.hub.connect_all_servers().await.unwrap();
    assert_eq!(report.connected, names(&["alpha"]));
    assert_eq!(registry_pairs(&h.hub).await, pairs(&[("read", "alpha")]));
}

#[tokio::test]
async fn test_failed_inspection_releases_connection() {
    let h = harness(vec![server("alpha")]);
    h.establisher.make_unreachable("alpha");

    let report = h.hub.connect_all_servers().await.unwrap();

    assert!(matches!(
        report.failure_for("alpha"),
        Some(ConnectError::Inspect(_))
    ));
    assert_eq!(
        h.establisher.events(),
        vec!["close:alpha", "transport:alpha", "aux:alpha"]
    );
    assert!(h.hub.get_tool_infos().await.is_empty());
}

#[tokio::test]
async fn test_every_server_receives_the_merged_environment() {
    let h = harness(vec![
        server("a").with_env("A_TOKEN", "1").with_env("SHARED", "a"),
        server("b").with_env("B_TOKEN", "2").with_env("SHARED", "b"),
        server("c").with_env("C_TOKEN", "3").with_enabled(false),
    ]);

    h.hub.connect_all_servers().await.unwrap();

    let env_a = h.establisher.env_of("a");
    assert_eq!(env_a.get("A_TOKEN").map(String::as_str), Some("1"));
    assert_eq!(env_a.get("B_TOKEN").map(String::as_str), Some("2"));
    assert_eq!(env_a.get("SHARED").map(String::as_str), Some("a"));
    assert!(!env_a.contains_key("C_TOKEN"));

    let env_b = h.establisher.env_of("b");
    assert_eq!(env_b.get("A_TOKEN").map(String::as_str), Some("1"));
    assert_eq!(env_b.get("SHARED").map(String::as_str), Some("b"));
}

#[tokio::test]
async fn test_sync_reprojects_manually_disabled_server() {
    let h = harness(vec![server("alpha")]);
    h.establisher.serve("alpha", &["read"]);
    h.hub.connect_all_servers().await.unwrap();
    h.hub.update_server_enabled_state("alpha", false).await;

    let report = h.hub.sync_servers_with_config().await.unwrap();

    assert_eq!(report.toggled, names(&["alpha"]));
    assert_eq!(registry_pairs(&h.hub).await, pairs(&[("read", "alpha")]));
    assert_eq!(h.establisher.connects("alpha"), 1);
}

#[tokio::test]
async fn test_force_sync_reconnects_everything() {
    let h = harness(vec![server("alpha"), server("beta")]);
    h.establisher.serve("alpha", &["read"]);
    h.establisher.serve("beta", &["search"]);
    h.hub.connect_all_servers().await.unwrap();

    let report = h.hub.sync_servers_with_config_force().await.unwrap();

    assert_eq!(report.disconnected, names(&["alpha", "beta"]));
    assert_eq!(report.connected, names(&["alpha", "beta"]));
    assert_eq!(h.establisher.connects("alpha"), 2);
    assert_eq!(h.establisher.connects("beta"), 2);
    assert_eq!(
        registry_pairs(&h.hub).await,
        pairs(&[("read", "alpha"), ("search", "beta")])
    );
}

#[tokio::test]
async fn test_initialize_runs_once() {
    let h = harness(vec![server("alpha")]);
    h.establisher.serve("alpha", &["read"]);

    let first = h.hub.initialize().await.unwrap();
    let second = h.hub.initialize().await.unwrap();

    assert_eq!(first.connected, names(&["alpha"]));
    assert!(second.is_noop());
    assert_eq!(h.establisher.connects("alpha"), 1);
}

#[tokio::test]
async fn test_connect_server_replaces_existing_connection() {
    let h = harness(vec![]);
    h.establisher.serve("alpha", &["read"]);
    let config = server("alpha");
    let env = BTreeMap::new();

    h.hub.connect_server(&config, &env).await.unwrap();
    h.hub.connect_server(&config, &env).await.unwrap();

    assert_eq!(h.establisher.connects("alpha"), 2);
    assert_eq!(
        h.establisher.events(),
        vec!["close:alpha", "transport:alpha", "aux:alpha"]
    );
    assert_eq!(h.hub.get_tool_infos().await.len(), 1);
    assert_eq!(registry_pairs(&h.hub).await, pairs(&[("read", "alpha")]));
}

#[tokio::test]
async fn test_connect_server_failure_registers_nothing() {
    let h = harness(vec![]);
    h.establisher.refuse("alpha", "nope");

    let err = h
        .hub
        .connect_server(&server("alpha"), &BTreeMap::new())
        .await
        .unwrap_err();

    assert_eq!(err, ConnectError::Establish("nope".into()));
    assert!(!h.hub.is_connected("alpha").await);
    assert!(h.hub.get_available_tools().await.is_empty());
}

#[tokio::test]
async fn test_disabled_connect_server_hides_tools() {
    let h = harness(vec![]);
    h.establisher.serve("alpha", &["read"]);

    h.hub
        .connect_server(&server("alpha").with_enabled(false), &BTreeMap::new())
        .await
        .unwrap();

    let infos = h.hub.get_tool_infos().await;
    assert_eq!(infos.len(), 1);
    assert!(!infos[0].enabled);
    assert_eq!(infos[0].tools.len(), 1);
    assert_eq!(infos[0].description.as_deref(), Some("alpha server"));
    assert!(h.hub.get_available_tools().await.is_empty());
}

#[tokio::test]
async fn test_call_tool_routes_to_owner() {
    let h = harness(vec![server("alpha"), server("beta")]);
    h.establisher.serve("alpha", &["read"]);
    h.establisher.serve("beta", &["search"]);
    h.hub.connect_all_servers().await.unwrap();

    let mut args = JsonObject::new();
    args.insert("q".into(), json!("rust"));
    let result = h.hub.call_tool("search", args).await.unwrap();
    assert_eq!(result["server"], json!("beta"));
    assert_eq!(result["args"]["q"], json!("rust"));

    let err = h.hub.call_tool("missing", JsonObject::new()).await.unwrap_err();
    assert!(matches!(err, HubError::ToolNotFound(name) if name.as_str() == "missing"));
}

#[tokio::test]
async fn test_set_config_path_is_used_by_next_pass() {
    let h = harness(vec![]);
    h.hub.set_config_path("/etc/mcp/other.json").await;
    assert_eq!(h.hub.config_path().await, Path::new("/etc/mcp/other.json"));

    h.loader.break_config();
    let err = h.hub.connect_all_servers().await.unwrap_err();
    assert!(err.to_string().contains("/etc/mcp/other.json"));
}
