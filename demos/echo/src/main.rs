//! Echo over Tandem.
//!
//! ```text
//! tandem-echo serve [addr]          listen and answer `request/echo`
//! tandem-echo call  [uri] [text]    connect, ask the server to echo, exit
//! ```
//!
//! Set `RUST_LOG=debug` to watch the connection lifecycle.

use std::time::Duration;

use serde_json::{json, Value};
use tandem::prelude::*;
use tandem_transport::{Listener, WebSocketConnector, WebSocketListener};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:9000";

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

async fn echo(req: RouteRequest, _client: Client) -> Result<Value, RemoteError> {
    Ok(json!({ "echo": req.payload, "at": req.service.time }))
}

async fn greeted(req: RouteRequest, _client: Client) -> Result<Value, RemoteError> {
    tracing::info!(payload = %req.payload, "server says hello");
    Ok(Value::Null)
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

async fn serve(addr: &str) -> Result<(), ClientError> {
    let mut listener = WebSocketListener::bind(addr).await?;
    tracing::info!(addr, "echo server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let socket = match accepted {
                    Ok(socket) => socket,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let peer = Client::builder()
                    .clock_sync_interval(None)
                    .route(kind::REQUEST, "echo", Route::single(echo))
                    .accept(socket)?;
                peer.send_event("hello", json!("welcome")).await;
                peer.destroy_on(closed(peer.clone()));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                listener.shutdown().await?;
                return Ok(());
            }
        }
    }
}

/// Resolves once `client`'s connection is no longer open. Holding the
/// client until then keeps it alive.
async fn closed(client: Client) {
    let mut status = client.connection().watch_status();
    let _ = status.wait_for(|s| !s.state.is_open()).await;
}

async fn call(uri: &str, text: &str) -> Result<(), ClientError> {
    let client = Client::builder()
        .uri(uri)
        .request_timeout(Duration::from_secs(5))
        .route(kind::EVENT, "hello", Route::single(greeted))
        .dial(WebSocketConnector)?;
    client.connect().await?;

    let answer = client.send_request("echo", json!(text)).await?;
    println!("{answer}");
    tracing::info!(offset_ms = client.clock_offset().await, "clock offset");

    client.destroy().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("serve") => serve(args.get(1).map_or(DEFAULT_ADDR, String::as_str)).await,
        Some("call") => {
            let default_uri = format!("ws://{DEFAULT_ADDR}");
            let (uri, text) = match &args[1..] {
                [uri, text, ..] => (uri.as_str(), text.as_str()),
                [text] => (default_uri.as_str(), text.as_str()),
                [] => (default_uri.as_str(), "hello"),
            };
            call(uri, text).await
        }
        _ => {
            eprintln!("usage: tandem-echo serve [addr] | call [uri] [text]");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "echo failed");
        std::process::exit(1);
    }
}
