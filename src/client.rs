//! `ClientTransport` (C): the browser-`EventSource`-alike subscription plus
//! an outbound POST pipeline that can run ordered or unordered (§4.4).
//!
//! Reconnection of the underlying SSE connection is delegated entirely to
//! [`reqwest_eventsource::EventSource`], which plays the role the browser's
//! built-in `EventSource` plays in the original design — we only add the
//! error-debounce timer and the POST pipeline around it.

use crate::error::{Error, Result};
use crate::message::{ClientId, ControlDirective, Message};
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, warn};
use url::Url;

/// How long an SSE error is tolerated before it is treated as fatal (§4.4).
const ERROR_DEBOUNCE: Duration = Duration::from_secs(5);

/// How long a failing POST is retried before it is surfaced as a fatal
/// inbound error and the transport is closed (§9 "POST failure after
/// exhausted retries").
const POST_RETRY_WINDOW: Duration = Duration::from_secs(5);

/// Delay between POST retry attempts within [`POST_RETRY_WINDOW`].
const POST_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Client-side handle to a bidirectional connection.
pub struct ClientTransport {
    id: ClientId,
    server_url: Url,
    http: reqwest::Client,
    ordered: bool,
    next_message_id: AtomicU64,
    ordered_lock: Mutex<()>,
    inbound_tx: mpsc::UnboundedSender<Result<Message>>,
    inbound_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Result<Message>>>>,
    dropped_count: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl ClientTransport {
    /// Open an SSE subscription to `server_url` under a freshly generated
    /// client id, and start draining it into an inbound queue.
    pub fn connect(server_url: Url, ordered: bool) -> Arc<Self> {
        Self::connect_as(ClientId::generate(), server_url, ordered)
    }

    /// As [`Self::connect`] but with a caller-supplied id (tests and
    /// reattachment scenarios that must reuse an id across transports).
    pub fn connect_as(id: ClientId, server_url: Url, ordered: bool) -> Arc<Self> {
        let mut subscribe_url = server_url.clone();
        subscribe_url
            .query_pairs_mut()
            .append_pair("sseClientId", id.as_str());

        let http = reqwest::Client::builder()
            .build()
            .expect("reqwest client with default TLS config always builds");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            id,
            server_url,
            http: http.clone(),
            ordered,
            next_message_id: AtomicU64::new(0),
            ordered_lock: Mutex::new(()),
            inbound_tx: inbound_tx.clone(),
            inbound_rx: std::sync::Mutex::new(Some(inbound_rx)),
            dropped_count: AtomicU64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        });

        let closed = transport.closed.clone();
        tokio::spawn(async move {
            run_subscription(subscribe_url, http, inbound_tx, closed).await;
        });

        transport
    }

    /// This transport's client id.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Number of outbound messages dropped for failing to encode (§7).
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// The non-restartable inbound message stream. Panics if called more
    /// than once.
    pub fn inbound(&self) -> impl futures::Stream<Item = Result<Message>> {
        let rx = self
            .inbound_rx
            .lock()
            .unwrap()
            .take()
            .expect("ClientTransport::inbound() called more than once");
        UnboundedReceiverStream::new(rx)
    }

    /// Submit a message for delivery via POST. In ordered mode, the send
    /// completes only after this POST has been issued in turn behind any
    /// earlier `submit` calls still in flight; in unordered mode, it races
    /// concurrently with them.
    pub async fn submit(self: &Arc<Self>, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::ConnectionClosed);
        }

        if self.ordered {
            let _permit = self.ordered_lock.lock().await;
            self.post_once(&message).await
        } else {
            let this = self.clone();
            let message_for_task = message.clone();
            tokio::spawn(async move {
                if let Err(error) = this.post_once(&message_for_task).await {
                    warn!(client_id = %this.id, %error, "unordered POST failed");
                }
            });
            Ok(())
        }
    }

    /// Encode and POST `message`, retrying transient failures for up to
    /// [`POST_RETRY_WINDOW`]. If every retry within that window still fails,
    /// the failure is surfaced on [`Self::inbound`] as a terminal error and
    /// the transport is closed, matching the reference policy for "POST
    /// failure after exhausted retries" (§9).
    async fn post_once(&self, message: &Message) -> Result<()> {
        let payload = match serde_json::to_string(message.as_str()) {
            Ok(payload) => payload,
            Err(error) => {
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
                warn!(client_id = %self.id, %error, "outbound message not encodable, dropped");
                return Ok(());
            }
        };

        let mut url = self.server_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("sseClientId", self.id.as_str());
            if self.ordered {
                let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
                pairs.append_pair("messageId", &message_id.to_string());
            }
        }

        let deadline = tokio::time::Instant::now() + POST_RETRY_WINDOW;
        loop {
            match self.send_post(&url, &payload).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    if tokio::time::Instant::now() >= deadline {
                        error!(client_id = %self.id, %error, "POST retries exhausted, closing transport");
                        let _ = self.inbound_tx.send(Err(Error::Other(anyhow::anyhow!(
                            "POST failed after retries: {error}"
                        ))));
                        self.close();
                        return Err(error);
                    }
                    warn!(client_id = %self.id, %error, "POST failed, retrying before debounce expires");
                    tokio::time::sleep(POST_RETRY_BACKOFF).await;
                }
            }
        }
    }

    async fn send_post(&self, url: &Url, payload: &str) -> Result<()> {
        self.http
            .post(url.clone())
            .header("content-type", "application/json")
            .body(payload.to_string())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Tear down the EventSource, both internal queues, and the HTTP client.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

async fn run_subscription(
    url: Url,
    http: reqwest::Client,
    inbound_tx: mpsc::UnboundedSender<Result<Message>>,
    closed: Arc<AtomicBool>,
) {
    let mut source = match EventSource::new(http.get(url)) {
        Ok(source) => source,
        Err(error) => {
            let _ = inbound_tx.send(Err(Error::Other(anyhow::anyhow!(
                "failed to open SSE subscription: {error}"
            ))));
            return;
        }
    };

    let mut debounce: Option<tokio::time::Instant> = None;

    loop {
        if closed.load(Ordering::Relaxed) {
            source.close();
            return;
        }

        let next = tokio::select! {
            event = source.next() => event,
            _ = sleep_until_debounce_fires(debounce) => {
                error!("SSE error debounce expired without recovery, closing");
                let _ = inbound_tx.send(Err(Error::ConnectionClosed));
                source.close();
                return;
            }
        };

        match next {
            Some(Ok(Event::Open)) => {
                debounce = None;
                debug!("SSE subscription (re)opened");
            }
            Some(Ok(Event::Message(message))) => {
                debounce = None;
                if message.event == "control" {
                    match serde_json::from_str::<String>(&message.data)
                        .map_err(|error| Error::codec(error))
                        .and_then(|literal| {
                            ControlDirective::parse(&literal).map_err(Error::UnknownControl)
                        }) {
                        Ok(ControlDirective::Close) => {
                            debug!("received control close, tearing down transport");
                            source.close();
                            return;
                        }
                        Err(error) => {
                            let _ = inbound_tx.send(Err(error));
                            source.close();
                            return;
                        }
                    }
                } else {
                    match serde_json::from_str::<String>(&message.data) {
                        Ok(payload) => {
                            if inbound_tx.send(Ok(Message::new(payload))).is_err() {
                                source.close();
                                return;
                            }
                        }
                        Err(error) => {
                            warn!(%error, "malformed SSE message payload, dropping");
                        }
                    }
                }
            }
            Some(Err(error)) => {
                warn!(%error, "SSE subscription error, starting debounce");
                if debounce.is_none() {
                    debounce = Some(tokio::time::Instant::now() + ERROR_DEBOUNCE);
                }
            }
            None => {
                source.close();
                return;
            }
        }
    }
}

async fn sleep_until_debounce_fires(debounce: Option<tokio::time::Instant>) {
    match debounce {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
