//! # sse-duplex
//!
//! A bidirectional message transport built on one-way Server-Sent Events
//! plus ordinary HTTP POST — a drop-in alternative to WebSockets for
//! environments where WebSockets are unavailable (restricted corporate
//! networks, certain proxy topologies).
//!
//! Each endpoint exposes a pair of message streams: an outbound sink
//! (server→client rides the SSE channel; client→server rides POST) and an
//! inbound stream of messages from the peer. The hardest part of this crate
//! is the server-side connection manager and its reconnect/keep-alive state
//! machine ([`connection::ServerConnection`]), paired with the client-side
//! ordered POST pipeline ([`client::ClientTransport`]).
//!
//! ## Quick Start
//!
//! ### Server
//!
//! ```rust,no_run
//! use sse_duplex::handler::{HandlerConfig, ServerHandler};
//! use tokio_stream::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handler = ServerHandler::new(HandlerConfig::default());
//! let mut connections = handler.connections();
//!
//! let router = handler.clone().router();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
//!
//! while let Some(connection) = connections.next().await {
//!     connection.sink().submit("hello").ok();
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Client
//!
//! ```rust,no_run
//! use sse_duplex::client::ClientTransport;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = ClientTransport::connect("http://localhost:3000/sse".parse()?, false);
//! transport.submit("hi").await?;
//! let mut inbound = transport.inbound();
//! while let Some(message) = inbound.next().await {
//!     println!("{:?}", message);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::multiple_crate_versions)]

pub mod codec;
pub mod error;
pub mod message;
pub mod sink;
pub mod telemetry;

#[cfg(feature = "server")]
pub mod connection;
#[cfg(feature = "server")]
pub mod handler;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "proxy")]
pub mod proxy;

pub use error::{Error, Result};
pub use message::{ClientId, ControlDirective, Message};

#[cfg(feature = "server")]
pub use connection::ServerConnection;
#[cfg(feature = "server")]
pub use handler::{HandlerConfig, ServerHandler};

#[cfg(feature = "client")]
pub use client::ClientTransport;

#[cfg(feature = "proxy")]
pub use proxy::{Proxy, ProxyConfig};
