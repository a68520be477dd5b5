// MCP client implementation backed by rmcp

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use rmcp::{
    ServiceExt,
    model::{CallToolRequestParams, Tool as McpTool},
    service::{RoleClient, RunningService, RxJsonRpcMessage, TxJsonRpcMessage},
    transport::{
        ConfigureCommandExt, StreamableHttpClientTransport, TokioChildProcess,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::client::{
    AdvertisedTool, ClientHandle, Connection, ConnectionEstablisher, JsonObject,
    ServerCapabilities, TransportHandle,
};
use crate::config::{ServerConfig, TransportKind};
use crate::error::ConnectError;
use crate::types::ServerName;

type RmcpService = RunningService<RoleClient, ()>;

/// The rmcp session, shared by the client handle and the transport handle so
/// whichever is torn down first ends it.
type ServiceSlot = Arc<RwLock<Option<RmcpService>>>;

async fn cancel_slot(slot: &ServiceSlot) -> Result<()> {
    let service = slot.write().await.take();
    if let Some(service) = service {
        let _reason = service.cancel().await?;
    }
    Ok(())
}

/// [`ClientHandle`] over an rmcp client session.
pub struct RmcpClient {
    server: ServerName,
    slot: ServiceSlot,
}

impl RmcpClient {
    fn closed(&self) -> anyhow::Error {
        anyhow!("session with `{}` is closed", self.server)
    }
}

fn to_advertised(tool: McpTool) -> AdvertisedTool {
    AdvertisedTool {
        name: tool.name.to_string().into(),
        description: tool.description.as_ref().map(|d| d.to_string()),
        input_schema: (*tool.input_schema).clone(),
    }
}

#[async_trait]
impl ClientHandle for RmcpClient {
    async fn list_tools(&self) -> Result<Vec<AdvertisedTool>> {
        let guard = self.slot.read().await;
        let service = guard.as_ref().ok_or_else(|| self.closed())?;

        // Follows `next_cursor` until the server reports the last page.
        let tools = service.list_all_tools().await?;
        if tools.is_empty() {
            warn!("Server `{}` reported no tools", self.server);
        }

        Ok(tools.into_iter().map(to_advertised).collect())
    }

    async fn server_capabilities(&self) -> Result<ServerCapabilities> {
        let guard = self.slot.read().await;
        let service = guard.as_ref().ok_or_else(|| self.closed())?;

        // `peer_info` is only unset if the handshake never completed.
        let Some(info) = service.peer_info() else {
            return Ok(ServerCapabilities::default());
        };

        let description = info
            .instructions
            .clone()
            .or_else(|| info.server_info.title.clone());
        let icon = info
            .server_info
            .icons
            .as_ref()
            .and_then(|icons| icons.first())
            .map(|icon| icon.src.clone());

        Ok(ServerCapabilities { description, icon })
    }

    async fn call_tool(&self, tool: &str, args: JsonObject) -> Result<Value> {
        let guard = self.slot.read().await;
        let service = guard.as_ref().ok_or_else(|| self.closed())?;

        let request = CallToolRequestParams {
            meta: None,
            name: Cow::from(tool.to_string()),
            arguments: Some(args),
            task: None,
        };

        let resp = service.call_tool(request).await?;
        Ok(serde_json::to_value(resp)?)
    }

    async fn close(&self) -> Result<()> {
        cancel_slot(&self.slot).await
    }
}

/// Primary transport handle: ends the rmcp session, which drops the child
/// process or the remote stream with it.
struct SessionTransport {
    kind: TransportKind,
    slot: ServiceSlot,
}

#[async_trait]
impl TransportHandle for SessionTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn release(&mut self) -> Result<()> {
        cancel_slot(&self.slot).await
    }
}

/// Auxiliary handle for a background task tied to one connection.
struct BackgroundTask {
    kind: TransportKind,
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl TransportHandle for BackgroundTask {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn release(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        Ok(())
    }
}

fn forward_stderr(server: ServerName, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(server = %server, "{line}");
        }
    })
}

/// Establishes connections with rmcp: child processes for stdio, streamable
/// HTTP for SSE and a tungstenite socket for websocket servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmcpEstablisher;

impl RmcpEstablisher {
    async fn start_stdio(
        &self,
        name: &ServerName,
        config: &ServerConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<(RmcpService, Option<Box<dyn TransportHandle>>), ConnectError> {
        let command = config.params.command.as_deref().ok_or_else(|| {
            ConnectError::InvalidConfig(format!("stdio server `{name}` has no `command`"))
        })?;

        info!("Starting MCP stdio server `{name}` via rmcp");

        let cmd = Command::new(command).configure(|cmd| {
            cmd.args(&config.params.args).envs(env);
            if let Some(cwd) = &config.params.cwd {
                cmd.current_dir(cwd);
            }
        });

        let (child, stderr) = TokioChildProcess::builder(cmd)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ConnectError::Establish(format!("spawn `{command}`: {e}")))?;

        let auxiliary = stderr.map(|stderr| {
            Box::new(BackgroundTask {
                kind: TransportKind::Stdio,
                handle: Some(forward_stderr(name.clone(), stderr)),
            }) as Box<dyn TransportHandle>
        });

        match ().serve(child).await {
            Ok(service) => Ok((service, auxiliary)),
            Err(e) => {
                if let Some(mut aux) = auxiliary {
                    let _ = aux.release().await;
                }
                Err(ConnectError::Establish(format!("initialize stdio client: {e}")))
            }
        }
    }

    async fn start_sse(
        &self,
        name: &ServerName,
        config: &ServerConfig,
    ) -> Result<RmcpService, ConnectError> {
        let url = remote_url(name, config, &["http", "https"])?;

        info!("Starting MCP SSE server `{name}` at `{url}` via rmcp streamable HTTP");

        let mut cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
        for (header, value) in &config.params.headers {
            if header.eq_ignore_ascii_case("authorization") {
                let token = value.strip_prefix("Bearer ").unwrap_or(value);
                cfg.auth_header = Some(token.to_string());
            } else {
                warn!("Ignoring unsupported header `{header}` for server `{name}`");
            }
        }

        let transport = StreamableHttpClientTransport::from_config(cfg);
        ().serve(transport)
            .await
            .map_err(|e| ConnectError::Establish(format!("initialize SSE client: {e}")))
    }

    async fn start_websocket(
        &self,
        name: &ServerName,
        config: &ServerConfig,
    ) -> Result<RmcpService, ConnectError> {
        let url = remote_url(name, config, &["ws", "wss"])?;
        if !config.params.headers.is_empty() {
            warn!("Headers are not sent on websocket connections (server `{name}`)");
        }

        info!("Starting MCP websocket server `{name}` at `{url}`");

        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ConnectError::Establish(format!("websocket connect: {e}")))?;
        let (sink, stream) = socket.split();

        let sink =
            sink.with(|msg: TxJsonRpcMessage<RoleClient>| future::ready(encode_frame(&msg)));
        let stream = stream.filter_map(|frame| future::ready(decode_frame(frame)));

        ().serve((sink, stream))
            .await
            .map_err(|e| ConnectError::Establish(format!("initialize websocket client: {e}")))
    }
}

fn remote_url(
    name: &ServerName,
    config: &ServerConfig,
    schemes: &[&str],
) -> Result<Url, ConnectError> {
    let raw = config.params.url.as_deref().ok_or_else(|| {
        ConnectError::InvalidConfig(format!(
            "{} server `{name}` has no `url`",
            config.transport_kind()
        ))
    })?;
    let url = Url::parse(raw)
        .map_err(|e| ConnectError::InvalidConfig(format!("bad url `{raw}`: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConnectError::InvalidConfig(format!(
            "url `{raw}` must use one of {schemes:?} for {} transport",
            config.transport_kind()
        )));
    }
    Ok(url)
}

#[derive(Error, Debug)]
enum WsFrameError {
    #[error(transparent)]
    Socket(#[from] tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn encode_frame(msg: &TxJsonRpcMessage<RoleClient>) -> Result<Message, WsFrameError> {
    Ok(Message::Text(serde_json::to_string(msg)?))
}

fn decode_frame(
    frame: Result<Message, tungstenite::Error>,
) -> Option<RxJsonRpcMessage<RoleClient>> {
    let payload = match frame {
        Ok(Message::Text(text)) => text.into_bytes(),
        Ok(Message::Binary(bytes)) => bytes,
        Ok(_) => return None,
        Err(e) => {
            warn!("websocket read failed: {e}");
            return None;
        }
    };
    match serde_json::from_slice(&payload) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("dropping malformed websocket frame: {e}");
            None
        }
    }
}

#[async_trait]
impl ConnectionEstablisher for RmcpEstablisher {
    async fn connect(
        &self,
        name: &ServerName,
        config: &ServerConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Connection, ConnectError> {
        let kind = config.transport_kind();
        let (service, auxiliary) = match kind {
            TransportKind::Stdio => self.start_stdio(name, config, env).await?,
            TransportKind::Sse => (self.start_sse(name, config).await?, None),
            TransportKind::WebSocket => (self.start_websocket(name, config).await?, None),
        };

        let slot: ServiceSlot = Arc::new(RwLock::new(Some(service)));
        Ok(Connection {
            client: Arc::new(RmcpClient {
                server: name.clone(),
                slot: slot.clone(),
            }),
            transport: Box::new(SessionTransport { kind, slot }),
            auxiliary,
        })
    }
}
