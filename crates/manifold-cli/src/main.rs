//! Manifold host shell.
//!
//! Loads the configuration, builds the proxy, and serves the upstream MCP
//! client over stdio: newline-delimited JSON-RPC on stdin/stdout, logs on
//! stderr. The proxy core does the real work; this binary is the wiring.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use manifold_auth::FlowRegistry;
use manifold_core::{JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcResponse};
use manifold_proxy::{McpProxy, ProxyConfig, ProxyError, ProxyEvent};
use manifold_transport::TransportError;

#[derive(Debug, Parser)]
#[command(name = "manifold", version, about = "Aggregating MCP proxy")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log filter, e.g. `info` or `manifold_proxy=debug`
    #[arg(long, env = "MANIFOLD_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let config = ProxyConfig::load_str(&raw).context("loading configuration")?;
    info!(servers = config.servers.len(), "configuration loaded");

    let registry = FlowRegistry::new();
    let proxy = McpProxy::from_config(&config, registry)
        .await
        .context("constructing proxy")?;
    proxy.connect_all().await;

    serve_stdio(&proxy).await?;

    proxy.shutdown().await;
    Ok(())
}

/// Serve the upstream client over stdin/stdout until EOF or shutdown.
async fn serve_stdio(proxy: &McpProxy) -> Result<()> {
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    // single writer task owns stdout
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    // forward catalog changes as upstream notifications
    let notifier = {
        let mut events = proxy.subscribe();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProxyEvent::ToolListChanged) => {
                        let notification = JsonRpcNotification::new(
                            "notifications/tools/list_changed",
                            None,
                        );
                        if let Ok(line) = serde_json::to_string(&notification) {
                            let _ = out_tx.send(line).await;
                        }
                    }
                    Ok(ProxyEvent::Status(event)) => {
                        debug!(server = %event.server, status = ?event.status, "status change");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        };
        let Some(line) = line else {
            debug!("upstream closed stdin");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                warn!("unparseable upstream line: {e}");
                let response = JsonRpcResponse::error(
                    None,
                    JsonRpcError { code: -32700, message: format!("Parse error: {e}"), data: None },
                );
                let _ = out_tx.send(serde_json::to_string(&response)?).await;
                continue;
            }
        };

        match JsonRpcMessage::classify(value) {
            Ok(JsonRpcMessage::Request(request)) => {
                if request.method == "shutdown" {
                    let response = JsonRpcResponse::success(request.id, json!(null));
                    let _ = out_tx.send(serde_json::to_string(&response)?).await;
                    break;
                }
                let response = handle_request(proxy, &request.method, request.params).await;
                let response = match response {
                    Ok(result) => JsonRpcResponse::success(request.id, result),
                    Err(error) => JsonRpcResponse::error(Some(request.id), error),
                };
                let _ = out_tx.send(serde_json::to_string(&response)?).await;
            }
            Ok(JsonRpcMessage::Notification(notification)) => {
                debug!(method = %notification.method, "upstream notification");
            }
            Ok(JsonRpcMessage::Response(_)) => {
                debug!("ignoring unsolicited response from upstream");
            }
            Err(e) => warn!("unclassifiable upstream message: {e}"),
        }
    }

    // the notifier holds a sender clone; stop it so the writer can drain out
    notifier.abort();
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_request(
    proxy: &McpProxy,
    method: &str,
    params: Option<Value>,
) -> std::result::Result<Value, JsonRpcError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2025-03-26",
            "serverInfo": {"name": "manifold", "version": env!("CARGO_PKG_VERSION")},
            "capabilities": {"tools": {"listChanged": true}}
        })),
        "ping" => Ok(json!({})),
        "tools/list" => {
            let tools = proxy.list_tools().await;
            Ok(json!({"tools": tools}))
        }
        "tools/call" => {
            let params = params.unwrap_or_else(|| json!({}));
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| JsonRpcError::invalid_params("missing tool name"))?;
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

            proxy.call_tool(name, arguments).await.map_err(|e| match e {
                ProxyError::ToolNotFound(_) | ProxyError::ServerNotConnected(_) => {
                    JsonRpcError::invalid_params(e.to_string())
                }
                // downstream JSON-RPC errors pass through verbatim
                ProxyError::Transport(TransportError::JsonRpc { code, message }) => {
                    JsonRpcError { code, message, data: None }
                }
                other => {
                    error!("tool call failed: {other}");
                    JsonRpcError::internal(other.to_string())
                }
            })
        }
        other => Err(JsonRpcError::method_not_found(other)),
    }
}
