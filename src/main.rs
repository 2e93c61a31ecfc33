//! Bridge endpoint: drives a [`Session`] from line-delimited JSON.
//!
//! Each stdin line is a command such as `{"id": 7, "command": "toggle-stream"}`.
//! Stdout carries one JSON object per line: either a reply
//! `{"id": 7, "reply": {"success": true, "data": "on"}}` or an event
//! `{"channel": "drone:stream-status", "payload": {"live": true}}`.
//! Logs go to stderr.

use anyhow::Context;
use clap::Parser;
use dronelink::{BridgeCommand, Session, SessionConfig, SessionEvent};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for photos and recordings (overrides the configuration)
    #[arg(short, long)]
    media_root: Option<PathBuf>,

    /// Drone address (overrides the configuration)
    #[arg(short, long)]
    device: Option<IpAddr>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    command: BridgeCommand,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(root) = args.media_root {
        config.media_root = root;
    }
    if let Some(address) = args.device {
        config.device.address = address;
    }

    let session = Arc::new(Session::start(config).await.context("starting session")?);

    let (out_tx, out_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(write_lines(out_rx));
    let forwarder = tokio::spawn(forward_events(Arc::clone(&session), out_tx.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else {
            info!("Bridge input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Unparseable bridge command");
                let reply = json!({ "reply": { "success": false, "error": format!("invalid command: {e}") } });
                let _ = out_tx.send(reply.to_string()).await;
                continue;
            }
        };

        if request.command == BridgeCommand::Shutdown {
            let reply = session.dispatch(request.command).await;
            let _ = out_tx.send(json!({ "id": request.id, "reply": reply }).to_string()).await;
            break;
        }

        let session = Arc::clone(&session);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let reply = session.dispatch(request.command).await;
            let _ = out_tx.send(json!({ "id": request.id, "reply": reply }).to_string()).await;
        });
    }

    session.shutdown().await;
    forwarder.abort();
    drop(out_tx);
    if let Err(e) = writer.await {
        error!(error = %e, "Output writer failed");
    }
    Ok(())
}

async fn forward_events(session: Arc<Session>, out: mpsc::Sender<String>) {
    let mut events = Box::pin(session.event_stream());
    drop(session);
    while let Some(event) = events.next().await {
        let line = event_line(&event);
        if out.send(line).await.is_err() {
            break;
        }
    }
}

fn event_line(event: &SessionEvent) -> String {
    let payload = serde_json::to_value(event)
        .ok()
        .and_then(|mut value| value.get_mut("payload").map(Value::take))
        .unwrap_or(Value::Null);
    json!({ "channel": event.channel(), "payload": payload }).to_string()
}

async fn write_lines(mut lines: mpsc::Receiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.recv().await {
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        };
        if let Err(e) = written.await {
            debug!(error = %e, "Stdout closed");
            break;
        }
    }
}
