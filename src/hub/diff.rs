//! Drift detection and sync planning.
//!
//! Everything here is pure: it looks at the live set, the freshly loaded
//! configuration and the snapshot from the previous cycle, and decides what
//! to do. The hub applies the plan.

use std::collections::BTreeMap;

use crate::config::{ServerConfig, ServerConfigs};
use crate::types::ServerName;

/// Whether `config` differs from what the previous cycle applied.
///
/// A server missing from the snapshot counts as changed. Otherwise the whole
/// record is compared, so any field (env, args, the enabled flag) forces a
/// restart.
pub fn has_changed(snapshot: Option<&ServerConfigs>, config: &ServerConfig) -> bool {
    match snapshot.and_then(|s| s.get(&config.name)) {
        Some(previous) => previous != config,
        None => true,
    }
}

/// Union of the env overrides of every enabled server. On key collisions the
/// alphabetically last server wins.
pub fn shared_env(configs: &ServerConfigs) -> BTreeMap<String, String> {
    configs
        .values()
        .filter(|c| c.enabled)
        .flat_map(|c| c.env.iter().map(|(k, v)| (k.clone(), v.clone())))
        .collect()
}

/// The environment handed to one server: the shared union with the server's
/// own overrides on top.
pub fn env_for(shared: &BTreeMap<String, String>, config: &ServerConfig) -> BTreeMap<String, String> {
    let mut env = shared.clone();
    env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// What an incremental sync has to do. Every list is sorted by name.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Connected servers that are gone from the config or now disabled.
    pub remove: Vec<ServerName>,
    /// Enabled servers with no live connection.
    pub connect: Vec<ServerName>,
    /// Connected servers whose configuration drifted.
    pub restart: Vec<ServerName>,
    /// Connected, unchanged servers whose enabled projection must flip.
    pub toggle: Vec<(ServerName, bool)>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty()
            && self.connect.is_empty()
            && self.restart.is_empty()
            && self.toggle.is_empty()
    }
}

/// Plan a sync. `live` maps each connected server to whether its tools are
/// currently projected into the registry.
pub fn plan_sync(
    live: &BTreeMap<ServerName, bool>,
    configs: &ServerConfigs,
    snapshot: Option<&ServerConfigs>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for name in live.keys() {
        match configs.get(name) {
            Some(config) if config.enabled => {}
            _ => plan.remove.push(name.clone()),
        }
    }

    for (name, config) in configs.iter().filter(|(_, c)| c.enabled) {
        match live.get(name) {
            None => plan.connect.push(name.clone()),
            Some(_) if has_changed(snapshot, config) => plan.restart.push(name.clone()),
            Some(&projected) if projected != config.enabled => {
                plan.toggle.push((name.clone(), config.enabled));
            }
            Some(_) => {}
        }
    }

    plan
}
