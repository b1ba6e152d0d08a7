//! `Proxy` (P): forwards the SSE GET / POST split to an upstream server,
//! preserving framing and the client id correlation (§4.5).

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::Router;
use futures::TryStreamExt;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::warn;
use url::Url;

/// Configuration for a [`Proxy`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local path the proxy listens on.
    pub proxy_path: String,
    /// Upstream origin + path to forward to (query strings are appended
    /// per-request, not configured here).
    pub server_url: Url,
}

struct Inner {
    config: ProxyConfig,
    http: OnceLock<reqwest::Client>,
}

/// Pass-through reverse proxy for the SSE + POST split.
#[derive(Clone)]
pub struct Proxy(Arc<Inner>);

impl Proxy {
    /// Build a new proxy. The upstream `reqwest::Client` is constructed
    /// lazily on first use (§4.5).
    pub fn new(config: ProxyConfig) -> Self {
        Self(Arc::new(Inner {
            config,
            http: OnceLock::new(),
        }))
    }

    fn http(&self) -> &reqwest::Client {
        self.0.http.get_or_init(|| {
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client with default TLS config always builds")
        })
    }

    fn upstream_url(&self, query: Option<&str>) -> Url {
        let mut url = self.0.config.server_url.clone();
        url.set_query(query);
        url
    }

    /// Build the `axum` router answering this proxy's configured path.
    pub fn router(self) -> Router {
        let path = self.0.config.proxy_path.clone();
        Router::new()
            .route(
                &path,
                axum::routing::get(proxy_get)
                    .post(proxy_post)
                    .fallback(|| async { StatusCode::NOT_FOUND }),
            )
            .with_state(self)
    }
}

async fn proxy_get(
    State(proxy): State<Proxy>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let upstream_url = proxy.upstream_url(query.as_deref());

    let mut request = proxy.http().get(upstream_url.clone());
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        request = request.header(name, value);
    }
    if let Some(authority) = upstream_url.host_str() {
        request = request.header(axum::http::header::HOST, authority);
    }

    let upstream_response = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            warn!(%error, "proxy: upstream SSE request failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers().iter() {
        response_headers.insert(name.clone(), value.clone());
    }
    response_headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static(crate::codec::EVENT_STREAM_CONTENT_TYPE),
    );

    let byte_stream = upstream_response
        .bytes_stream()
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error));
    let body = Body::from_stream(byte_stream);

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = response_headers;
    response
}

async fn proxy_post(
    State(proxy): State<Proxy>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let upstream_url = proxy.upstream_url(query.as_deref());

    let mut request = proxy.http().post(upstream_url.clone()).body(body);
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST || name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        request = request.header(name, value);
    }
    if let Some(authority) = upstream_url.host_str() {
        request = request.header(axum::http::header::HOST, authority);
    }

    match request.send().await {
        Ok(upstream_response) => {
            let status = upstream_response.status();
            let mut response_headers = HeaderMap::new();
            for (name, value) in upstream_response.headers().iter() {
                response_headers.insert(name.clone(), value.clone());
            }
            let body_bytes = upstream_response.bytes().await.unwrap_or_default();
            let mut response = Response::new(Body::from(body_bytes));
            *response.status_mut() = status;
            *response.headers_mut() = response_headers;
            response
        }
        Err(error) => {
            warn!(%error, "proxy: upstream POST failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
