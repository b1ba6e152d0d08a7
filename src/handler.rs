//! `ServerHandler` (SH): the HTTP-level dispatcher in front of the
//! `id → ServerConnection` registry (§4.3).

use crate::codec::{self, cors_origin};
use crate::connection::{CloseReason, ServerConnection};
use crate::message::{ClientId, Message};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::Router;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::sink::ChannelSink;

/// How many unflushed SSE frames a single response body may buffer before
/// the drain loop's write starts to push back.
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Configuration for a [`ServerHandler`].
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// The single path this handler answers GET/POST on.
    pub path: String,
    /// Keep-alive window applied to every connection it creates.
    pub keep_alive: Option<Duration>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            path: "/sse".to_string(),
            keep_alive: None,
        }
    }
}

struct Inner {
    config: HandlerConfig,
    registry: DashMap<ClientId, Arc<ServerConnection>>,
    connections_tx: mpsc::UnboundedSender<Arc<ServerConnection>>,
    connections_rx: StdMutex<Option<mpsc::UnboundedReceiver<Arc<ServerConnection>>>>,
    connections_taken: AtomicBool,
}

/// HTTP-level dispatcher owning the per-client connection registry.
#[derive(Clone)]
pub struct ServerHandler(Arc<Inner>);

#[derive(serde::Deserialize)]
struct SseQuery {
    #[serde(rename = "sseClientId")]
    sse_client_id: String,
}

#[derive(serde::Deserialize)]
struct PostQuery {
    #[serde(rename = "sseClientId")]
    sse_client_id: String,
    #[serde(rename = "messageId")]
    message_id: Option<u64>,
}

impl ServerHandler {
    /// Build a new handler. Nothing is listening yet — call [`ServerHandler::router`]
    /// and serve it with whatever HTTP server the embedding application uses.
    pub fn new(config: HandlerConfig) -> Self {
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();
        Self(Arc::new(Inner {
            config,
            registry: DashMap::new(),
            connections_tx,
            connections_rx: StdMutex::new(Some(connections_rx)),
            connections_taken: AtomicBool::new(false),
        }))
    }

    /// The current cardinality of the registry. The registry holds a
    /// connection iff that connection is not closed (I5): every connection
    /// this handler creates is pruned by its own eviction watcher the
    /// instant it closes, so this is always an exact live count, never a
    /// stale one waiting on the next POST/GET.
    pub fn number_of_clients(&self) -> usize {
        self.0.registry.len()
    }

    /// The non-restartable stream of newly-created connections. Panics if
    /// called more than once.
    pub fn connections(&self) -> impl tokio_stream::Stream<Item = Arc<ServerConnection>> {
        if self.0.connections_taken.swap(true, Ordering::SeqCst) {
            panic!("ServerHandler::connections() called more than once");
        }
        let rx = self
            .0
            .connections_rx
            .lock()
            .unwrap()
            .take()
            .expect("connections receiver missing despite first call");
        UnboundedReceiverStream::new(rx)
    }

    /// Build the `axum` router answering this handler's configured path.
    pub fn router(self) -> Router {
        let path = self.0.config.path.clone();
        let method_router = axum::routing::get(handle_get)
            .post(handle_post)
            .fallback(|| async { StatusCode::NOT_FOUND });
        Router::new()
            .route(&path, method_router)
            .with_state(self)
    }

    async fn accept_subscription(&self, id: ClientId, sink: ChannelSink) -> Arc<ServerConnection> {
        let reattach_target = match self.0.registry.get(&id) {
            Some(entry) if entry.is_in_keep_alive_period().await => Some(entry.clone()),
            Some(entry) => {
                debug!(client_id = %id, "evicting live connection for new subscription");
                let evicted = entry.clone();
                tokio::spawn(async move { evicted.close(CloseReason::Evicted).await });
                None
            }
            None => None,
        };

        if let Some(existing) = reattach_target {
            debug!(client_id = %id, "reattaching to existing keep-alive connection");
            if existing.attach(Box::new(sink)).await.is_ok() {
                return existing;
            }
            // Lost a race with the keep-alive timer closing the connection
            // between the check above and the attach; fall through below.
            return self.create_fresh_connection(id).await;
        }

        let connection = ServerConnection::spawn(id.clone(), self.0.config.keep_alive);
        self.0.registry.insert(id.clone(), connection.clone());
        self.spawn_eviction_watcher(id, connection.clone());
        // Attach before publishing so application code observing a new
        // connection never sees one without a live sink. The sink was
        // already consumed by the failed reattach above in that branch, so
        // this path only runs with a still-owned `sink`.
        let _ = connection.attach(Box::new(sink)).await;
        let _ = self.0.connections_tx.send(connection.clone());
        connection
    }

    async fn create_fresh_connection(&self, id: ClientId) -> Arc<ServerConnection> {
        // Reached only when the reattach race above already consumed the
        // original sink; the caller's subscription is lost in that narrow
        // window, matching the equally narrow window where a keep-alive
        // timer fires mid-request. A following client retry succeeds.
        let connection = ServerConnection::spawn(id.clone(), self.0.config.keep_alive);
        self.0.registry.insert(id.clone(), connection.clone());
        self.spawn_eviction_watcher(id, connection.clone());
        let _ = self.0.connections_tx.send(connection.clone());
        connection
    }

    /// Prune `id` from the registry the instant its connection closes (I5),
    /// rather than waiting on the next POST to notice.
    fn spawn_eviction_watcher(&self, id: ClientId, connection: Arc<ServerConnection>) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            connection.closed().await;
            inner.registry.remove(&id);
        });
    }
}

async fn handle_get(
    State(handler): State<ServerHandler>,
    Query(query): Query<SseQuery>,
    headers: HeaderMap,
) -> Response {
    let origin = cors_origin(
        headers.get("origin").and_then(|v| v.to_str().ok()),
        headers.get("host").and_then(|v| v.to_str().ok()),
    );
    let id = ClientId::new(query.sse_client_id);

    let (tx, rx) = mpsc::channel::<Bytes>(OUTBOUND_CHANNEL_CAPACITY);
    let sink = ChannelSink::new(tx);
    handler.accept_subscription(id, sink).await;

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<Bytes, std::io::Error>));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = codec::preamble_headers(&origin);
    response
}

async fn handle_post(
    State(handler): State<ServerHandler>,
    Query(query): Query<PostQuery>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let origin = cors_origin(
        headers.get("origin").and_then(|v| v.to_str().ok()),
        headers.get("host").and_then(|v| v.to_str().ok()),
    );
    let id = ClientId::new(query.sse_client_id);

    // Recover scope (§4.3): any decode or lookup failure is logged, never
    // surfaced to the client — the POST still returns 200.
    match serde_json::from_str::<String>(&body) {
        Ok(payload) => match handler.0.registry.get(&id) {
            Some(connection) => {
                let connection = connection.clone();
                connection.deliver(Message::new(payload)).await;
            }
            None => {
                debug!(client_id = %id, message_id = ?query.message_id, "POST for unknown client id, dropping");
            }
        },
        Err(error) => {
            warn!(client_id = %id, %error, "malformed POST body, dropping");
        }
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = codec::post_response_headers(&origin);
    response
}
