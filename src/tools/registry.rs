//! Flattened, routable view of the tools exposed by enabled servers.
//!
//! Each enabled server contributes its advertised tools. Tool names are
//! global: when two servers advertise the same name the most recent merge
//! owns the route, and removing that owner hands the route back to the next
//! most recent server still advertising it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::client::{AdvertisedTool, ClientHandle, JsonObject};
use crate::types::{ServerName, ToolName};

/// A tool annotated with the server that provides it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tool {
    pub name: ToolName,
    pub description: Option<String>,
    pub input_schema: JsonObject,
    pub server: ServerName,
}

/// Where to send an invocation of a tool.
#[derive(Clone)]
pub struct Route {
    pub server: ServerName,
    pub client: Arc<dyn ClientHandle>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route").field("server", &self.server).finish_non_exhaustive()
    }
}

struct Contribution {
    client: Arc<dyn ClientHandle>,
    tools: Vec<AdvertisedTool>,
    /// Merge order; later merges win routes.
    seq: u64,
}

/// Registry of tools from enabled servers plus the name -> server routing index.
#[derive(Default)]
pub struct ToolRegistry {
    contributions: BTreeMap<ServerName, Contribution>,
    routes: HashMap<ToolName, ServerName>,
    next_seq: u64,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `server`'s tools, replacing anything it contributed before, and
    /// point each tool name's route at it.
    pub fn merge_tools(
        &mut self,
        server: &ServerName,
        client: Arc<dyn ClientHandle>,
        tools: Vec<AdvertisedTool>,
    ) {
        self.remove_server(server);

        for tool in &tools {
            self.routes.insert(tool.name.clone(), server.clone());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.contributions
            .insert(server.clone(), Contribution { client, tools, seq });
    }

    /// Remove the named tools contributed by `server`. Names it does not
    /// contribute are ignored.
    pub fn remove_tools<'a>(
        &mut self,
        server: &ServerName,
        names: impl IntoIterator<Item = &'a ToolName>,
    ) {
        let Some(contribution) = self.contributions.get_mut(server) else {
            return;
        };

        let names: HashSet<&ToolName> = names.into_iter().collect();
        contribution.tools.retain(|tool| !names.contains(&tool.name));
        if contribution.tools.is_empty() {
            self.contributions.remove(server);
        }

        for name in names {
            if self.routes.get(name) == Some(server) {
                self.reroute(name);
            }
        }
    }

    /// Remove everything `server` contributed.
    pub fn remove_server(&mut self, server: &ServerName) {
        let Some(contribution) = self.contributions.remove(server) else {
            return;
        };

        for tool in &contribution.tools {
            if self.routes.get(&tool.name) == Some(server) {
                self.reroute(&tool.name);
            }
        }
    }

    /// Point `name` at the most recently merged server still advertising it,
    /// or drop the route.
    fn reroute(&mut self, name: &ToolName) {
        let owner = self
            .contributions
            .iter()
            .filter(|(_, c)| c.tools.iter().any(|t| &t.name == name))
            .max_by_key(|(_, c)| c.seq)
            .map(|(server, _)| server.clone());

        match owner {
            Some(server) => {
                self.routes.insert(name.clone(), server);
            }
            None => {
                self.routes.remove(name);
            }
        }
    }

    pub fn clear(&mut self) {
        self.contributions.clear();
        self.routes.clear();
    }

    /// Snapshot of every registered tool, in merge order.
    pub fn query(&self) -> Vec<Tool> {
        let mut contributions: Vec<(&ServerName, &Contribution)> =
            self.contributions.iter().collect();
        contributions.sort_by_key(|(_, c)| c.seq);

        contributions
            .into_iter()
            .flat_map(|(server, c)| {
                c.tools.iter().map(move |tool| Tool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                    server: server.clone(),
                })
            })
            .collect()
    }

    /// Find the connection that owns `name`.
    pub fn route(&self, name: &str) -> Option<Route> {
        let server = self.routes.get(name)?;
        let contribution = self.contributions.get(server)?;
        Some(Route {
            server: server.clone(),
            client: contribution.client.clone(),
        })
    }

    pub fn tool_to_server_map(&self) -> BTreeMap<ToolName, ServerName> {
        self.routes
            .iter()
            .map(|(tool, server)| (tool.clone(), server.clone()))
            .collect()
    }

    /// Return the number of entries in the flattened view.
    pub fn len(&self) -> usize {
        self.contributions.values().map(|c| c.tools.len()).sum()
    }

    /// Return `true` if no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.contributions.values().all(|c| c.tools.is_empty())
    }
}
