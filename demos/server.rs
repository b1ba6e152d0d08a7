//! Standalone demo of [`sse_duplex::handler::ServerHandler`]: echoes every
//! inbound message back to its own client.

use clap::Parser;
use futures::StreamExt;
use sse_duplex::handler::{HandlerConfig, ServerHandler};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "sse-duplex-server")]
#[command(about = "Run a demo SSE+POST duplex server that echoes inbound messages")]
struct Cli {
    /// Address to bind the HTTP listener on.
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: String,

    /// Path the handler answers GET/POST requests on.
    #[arg(long, default_value = "/sse")]
    path: String,

    /// Keep-alive window, in seconds, granted to a disconnected client.
    #[arg(long)]
    keep_alive_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sse_duplex::telemetry::init_tracing();
    let cli = Cli::parse();

    let handler = ServerHandler::new(HandlerConfig {
        path: cli.path.clone(),
        keep_alive: cli.keep_alive_secs.map(Duration::from_secs),
    });

    let mut connections = handler.connections();
    let router = handler.clone().router();

    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    info!(bind = %cli.bind, path = %cli.path, "listening");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server task failed");
    });

    while let Some(connection) = connections.next().await {
        info!(client_id = %connection.id(), "client connected");
        let mut inbound = connection.stream();
        let sink = connection.sink();
        tokio::spawn(async move {
            while let Some(message) = inbound.next().await {
                info!(message = %message, "echoing");
                let _ = sink.submit(message);
            }
        });
    }

    Ok(())
}
