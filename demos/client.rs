//! Standalone demo of [`sse_duplex::client::ClientTransport`]: connects to a
//! server and relays stdin lines as outbound messages, printing whatever
//! comes back.

use clap::Parser;
use futures::StreamExt;
use sse_duplex::client::ClientTransport;
use std::io::BufRead;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sse-duplex-client")]
#[command(about = "Connect to a demo SSE+POST duplex server from the command line")]
struct Cli {
    /// Server URL to subscribe to.
    #[arg(long, default_value = "http://127.0.0.1:3000/sse")]
    server_url: String,

    /// Submit outbound POSTs in strict submission order.
    #[arg(long)]
    ordered: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sse_duplex::telemetry::init_tracing();
    let cli = Cli::parse();

    let transport = ClientTransport::connect(cli.server_url.parse()?, cli.ordered);
    info!(client_id = %transport.id(), "subscribed");

    let reader_transport = transport.clone();
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let transport = reader_transport.clone();
            tokio::runtime::Handle::current().block_on(async move {
                if let Err(error) = transport.submit(line).await {
                    error!(%error, "submit failed");
                }
            });
        }
    });

    let mut inbound = transport.inbound();
    while let Some(message) = inbound.next().await {
        match message {
            Ok(message) => println!("{message}"),
            Err(error) => {
                error!(%error, "inbound stream ended with error");
                break;
            }
        }
    }

    Ok(())
}
