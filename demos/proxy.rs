//! Standalone demo of [`sse_duplex::proxy::Proxy`]: sits in front of an
//! upstream duplex server, forwarding both the SSE GET and the POSTs.

use clap::Parser;
use sse_duplex::proxy::{Proxy, ProxyConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "sse-duplex-proxy")]
#[command(about = "Reverse-proxy an upstream SSE+POST duplex server")]
struct Cli {
    /// Address to bind the proxy's own HTTP listener on.
    #[arg(long, default_value = "127.0.0.1:3001")]
    bind: String,

    /// Local path the proxy answers on.
    #[arg(long, default_value = "/sse")]
    proxy_path: String,

    /// Upstream server URL to forward to.
    #[arg(long, default_value = "http://127.0.0.1:3000/sse")]
    server_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sse_duplex::telemetry::init_tracing();
    let cli = Cli::parse();

    let proxy = Proxy::new(ProxyConfig {
        proxy_path: cli.proxy_path.clone(),
        server_url: cli.server_url.parse()?,
    });
    let router = proxy.router();

    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    info!(bind = %cli.bind, upstream = %cli.server_url, "proxy listening");
    axum::serve(listener, router).await?;

    Ok(())
}
