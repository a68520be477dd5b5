use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcp_hub::{HubSettings, JsonObject, McpHub, ReconcileReport, resolve_config_path};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcp-hub")]
#[command(about = "Keeps MCP tool-server connections in sync with mcp.json")]
struct Cli {
    /// Path to mcp.json (defaults to $XDG_CONFIG_HOME/mcp/mcp.json, then ./mcp.json)
    #[arg(long, global = true, env = "MCP_HUB_CONFIG")]
    config: Option<PathBuf>,
    /// Seconds allowed to connect and inspect one server
    #[arg(long, global = true, default_value_t = 30)]
    connect_timeout_secs: u64,
    /// Seconds allowed for each step of a disconnect
    #[arg(long, global = true, default_value_t = 5)]
    disconnect_timeout_secs: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every enabled server once and list the tools they expose
    Connect,
    /// Connect, then re-sync with the config file on an interval until Ctrl-C
    Watch {
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,
        /// Reconnect everything on each tick instead of applying only changes
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Print which server each tool routes to
    Tools,
    /// Call a tool on whichever server owns it
    Call {
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mcp_hub=info".parse()?)
                .add_directive("rmcp=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => resolve_config_path()?,
    };
    let settings = HubSettings {
        connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
        disconnect_timeout: Duration::from_secs(cli.disconnect_timeout_secs),
    };
    info!("Using MCP config at {}", config_path.display());
    let hub = McpHub::with_rmcp(config_path, settings);

    match cli.command {
        Commands::Connect => {
            let report = hub.initialize().await?;
            print_report(&report);
            println!();

            println!(
                "{:<20} {:<10} {:<10} {:<6} {:<25}",
                "SERVER", "TRANSPORT", "STATUS", "TOOLS", "CONNECTED"
            );
            println!("{}", "-".repeat(75));
            for status in hub.list_servers().await {
                let state = if status.enabled { "enabled" } else { "disabled" };
                println!(
                    "{:<20} {:<10} {:<10} {:<6} {:<25}",
                    status.name,
                    status.transport,
                    state,
                    status.tool_count,
                    status.connected_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            println!();

            for server in hub.get_tool_infos().await {
                println!("{}", server.name);
                if let Some(description) = &server.description {
                    println!("  {}", description);
                }
                for tool in &server.tools {
                    match &tool.description {
                        Some(d) => println!("    {} - {}", tool.name, d),
                        None => println!("    {}", tool.name),
                    }
                }
            }

            hub.disconnect_all_servers().await;
        }
        Commands::Watch {
            interval_secs,
            force,
        } => {
            let report = hub.initialize().await?;
            print_report(&report);

            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            // The first tick fires immediately; initialize already covered it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let result = if force {
                            hub.sync_servers_with_config_force().await
                        } else {
                            hub.sync_servers_with_config().await
                        };
                        match result {
                            Ok(report) if report.is_noop() => {}
                            Ok(report) => print_report(&report),
                            Err(e) => warn!("Sync failed, keeping current connections: {e}"),
                        }
                    }
                }
            }

            hub.shutdown_token().await.cancel();
            let report = hub.disconnect_all_servers().await;
            info!("Disconnected {} servers", report.disconnected.len());
        }
        Commands::Tools => {
            hub.initialize().await?;

            let routes = hub.get_tool_to_server_map().await;
            if routes.is_empty() {
                println!("No tools available.");
            } else {
                println!("{:<40} {:<20}", "TOOL", "SERVER");
                println!("{}", "-".repeat(60));
                for (tool, server) in routes {
                    println!("{:<40} {:<20}", tool, server);
                }
            }

            hub.disconnect_all_servers().await;
        }
        Commands::Call { tool, args } => {
            let args: JsonObject =
                serde_json::from_str(&args).context("--args must be a JSON object")?;

            hub.initialize().await?;
            let result = hub.call_tool(&tool, args).await;
            hub.disconnect_all_servers().await;

            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
    }

    Ok(())
}

fn print_report(report: &ReconcileReport) {
    println!("{}", report);
    if report.has_failures() {
        warn!("{} servers failed to connect", report.failures.len());
        for failure in &report.failures {
            println!("  failed: {}", failure);
        }
    }
}
