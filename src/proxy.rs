//! Reverse proxy for app traffic
//!
//! Routes each request by its first path segment: `/{app}/...` is forwarded
//! to the app's current instance as recorded in the routing table, with the
//! remainder of the path and the query string preserved exactly. The proxy
//! never talks to the deployment machinery; it only reads the table, so a
//! half-finished deploy can never surface here.

use crate::routing::RoutingTable;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Value added to Via headers on both legs of a proxied exchange
const VIA_PSEUDONYM: &str = "HTTP/1.1 appdock";

const X_REQUEST_ID: &str = "x-request-id";
const X_CORRELATION_ID: &str = "x-correlation-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that never travel across a proxy hop
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

struct ProxyState {
    routing: Arc<RoutingTable>,
    client: Client<HttpConnector, Incoming>,
    request_timeout: Duration,
}

/// The proxy server: accept loop plus per-connection HTTP/1.1 and HTTP/2
/// service
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        routing: Arc<RoutingTable>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Ok(Self {
            listener,
            state: Arc::new(ProxyState {
                routing,
                client,
                request_timeout,
            }),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("bound listener has an address")
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr(), "Proxy server listening");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { handle_request(req, state, addr).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let correlation_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    let Some((app_name, remainder)) = split_app_path(&path) else {
        return Ok(text_response(StatusCode::NOT_FOUND, "404 Not Found"));
    };

    let Some(target) = state.routing.get(app_name) else {
        debug!(path = %path, "No proxy target configured");
        return Ok(text_response(StatusCode::NOT_FOUND, "404 Not Found"));
    };

    let query = req
        .uri()
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();
    let upstream_uri = format!("{}{}{}", target, remainder, query);

    debug!(
        app = app_name,
        method = %req.method(),
        upstream = %upstream_uri,
        correlation_id,
        "Proxying request"
    );

    let (mut parts, body) = req.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    // Forwarding metadata. X-Forwarded-* values are overwritten rather than
    // appended; this proxy is the first trusted hop.
    let original_host = parts.headers.get(hyper::header::HOST).cloned();
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        parts.headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host.clone() {
        parts.headers.insert(X_FORWARDED_HOST, host);
    }
    parts
        .headers
        .insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    let forwarded = format!(
        "for={};host={};proto=http",
        client_addr.ip(),
        original_host
            .as_ref()
            .and_then(|h| h.to_str().ok())
            .unwrap_or("unknown")
    );
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        parts.headers.insert(hyper::header::FORWARDED, value);
    }
    append_via(&mut parts.headers);

    let mut builder = Request::builder().method(parts.method).uri(&upstream_uri);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }
    let upstream_req = match builder.body(body) {
        Ok(r) => r,
        Err(e) => {
            error!(correlation_id, error = %e, "Failed to build upstream request");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                &format!("502 Bad Gateway (correlation id {})", correlation_id),
            ));
        }
    };

    let result = tokio::time::timeout(
        state.request_timeout,
        state.client.request(upstream_req),
    )
    .await;

    match result {
        Ok(Ok(response)) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            append_via(&mut parts.headers);
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Ok(Err(e)) => {
            error!(app = app_name, correlation_id, error = %e, "Failed to reach upstream instance");
            Ok(error_response(
                StatusCode::BAD_GATEWAY,
                "502 Bad Gateway",
                &correlation_id,
            ))
        }
        Err(_) => {
            warn!(
                app = app_name,
                correlation_id,
                timeout_secs = state.request_timeout.as_secs(),
                "Upstream request timed out"
            );
            Ok(error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "504 Gateway Timeout",
                &correlation_id,
            ))
        }
    }
}

/// Split `/app/rest/of/path` into `("app", "/rest/of/path")`
fn split_app_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/')?;
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.find('/') {
        Some(idx) => Some((&trimmed[..idx], &trimmed[idx..])),
        None => Some((trimmed, "")),
    }
}

/// Remove the fixed hop-by-hop set plus any header named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut named: HashSet<String> = HashSet::new();
    for value in headers.get_all(hyper::header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                named.insert(token.trim().to_lowercase());
            }
        }
    }
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let lower = name.as_str().to_lowercase();
            HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || named.contains(&lower)
        })
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

/// Append this proxy to the Via chain
fn append_via(headers: &mut HeaderMap) {
    let value = match headers.get(hyper::header::VIA).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, VIA_PSEUDONYM),
        None => VIA_PSEUDONYM.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(hyper::header::VIA, value);
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with static headers")
}

fn error_response(
    status: StatusCode,
    message: &str,
    correlation_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = text_response(
        status,
        &format!("{} (correlation id {})", message, correlation_id),
    );
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        response.headers_mut().insert(X_CORRELATION_ID, value);
    }
    response
}
