use crate::auth::challenge_response;
use crate::config::ServerConfig;
use crate::error::{json_error_response, GatewayError, ProxyErrorCode};
use crate::params::write_query_params;
use crate::pool::{strip_hop_by_hop, ConnectionPool, PoolConfig};
use crate::process::{BackendSnapshot, BackendStatus, Supervisor};
use crate::registry::{normalize_prefix, strip_prefix, Route, RouteRegistry};
use crate::tunnel::{relay, signaled, TunnelTracker};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE,
    TRANSFER_ENCODING,
};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Status endpoint under the mount path
const HEALTH_PATH: &str = "/health";

/// Upper bound for a backend's upgrade response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Upper bound for the body of a rejected upgrade
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Header name for the stripped path prefix
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// Shared state for request handling
struct ProxyState {
    registry: Arc<RouteRegistry>,
    supervisor: Arc<Supervisor>,
    tracker: Arc<TunnelTracker>,
    pool: Arc<ConnectionPool>,
    settings: ServerConfig,
    /// Normalized mount path
    mount: String,
    backend_host: IpAddr,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyState {
    /// New requests are refused once the proxy or the supervisor stops
    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow() || self.supervisor.is_shutting_down()
    }
}

/// The external listener: routes requests and tunnels terminal sessions
pub struct ProxyServer {
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        supervisor: Arc<Supervisor>,
        tracker: Arc<TunnelTracker>,
        settings: ServerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: settings.pool_max_idle_per_host,
            idle_timeout: std::time::Duration::from_secs(settings.pool_idle_timeout_secs),
        }));

        let state = ProxyState {
            registry: Arc::clone(supervisor.registry()),
            backend_host: supervisor.interface(),
            mount: normalize_prefix(&settings.mount_path),
            supervisor,
            tracker,
            pool,
            settings,
            shutdown_rx: shutdown_rx.clone(),
        };

        Self {
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    /// Accept connections on `listener` until shutdown is signaled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, mount = %self.state.mount, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let shutdown_rx = self.shutdown_rx.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state, shutdown_rx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = signaled(&mut shutdown_rx) => {
                    info!("Proxy server no longer accepting connections");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _connection = state.tracker.track_connection();
    let mut close_rx = state.tracker.close_signal();

    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // HTTP/1.1 keeps upgrades available for terminal sessions
    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            return result.map_err(|e| anyhow::anyhow!("Connection error: {}", e));
        }
        _ = signaled(&mut close_rx) => return Ok(()),
        _ = signaled(&mut shutdown_rx) => {}
    }

    // Let the in-flight request finish, then close
    conn.as_mut().graceful_shutdown();
    tokio::select! {
        result = conn.as_mut() => result.map_err(|e| anyhow::anyhow!("Connection error: {}", e)),
        _ = signaled(&mut close_rx) => Ok(()),
    }
}

/// Strip the mount path from a request path, keeping the remainder rooted at `/`
fn strip_mount<'a>(mount: &str, path: &'a str) -> Option<&'a str> {
    if mount == "/" {
        return Some(path);
    }
    match path.strip_prefix(mount) {
        Some("") => Some("/"),
        Some(rest) if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

/// Full external prefix of a route, mount path included
fn external_prefix(mount: &str, route_prefix: &str) -> String {
    match (mount, route_prefix) {
        ("/", prefix) => prefix.to_string(),
        (mount, "/") => mount.to_string(),
        (mount, prefix) => format!("{}{}", mount, prefix),
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    let Some(relative) = strip_mount(&state.mount, &path) else {
        return Ok(json_error_response(
            ProxyErrorCode::NotFound,
            format!("No terminal mounted at {}", path),
        ));
    };

    if relative == HEALTH_PATH {
        return Ok(health_response(&state));
    }

    let Some(route) = state.registry.resolve(relative) else {
        debug!(path = %path, request_id, "No route matches request");
        return Ok(json_error_response(
            ProxyErrorCode::RouteNotFound,
            format!("No terminal route for {}", path),
        ));
    };

    // Route credentials replace the global ones
    let credentials = route
        .credentials
        .as_ref()
        .or(state.settings.credentials.as_ref());
    if let Some(credentials) = credentials {
        if !credentials.verify(req.headers().get(AUTHORIZATION)) {
            debug!(route = %route.prefix, request_id, "Rejected unauthenticated request");
            return Ok(challenge_response());
        }
    }

    if state.is_shutting_down() {
        return Ok(json_error_response(
            ProxyErrorCode::from(&GatewayError::ShuttingDown),
            "Gateway is shutting down",
        ));
    }

    let port = match state.supervisor.snapshot(&route.prefix) {
        Some(BackendSnapshot {
            status: BackendStatus::Healthy,
            port: Some(port),
            ..
        }) => port,
        other => {
            let status = other.map(|s| s.status).unwrap_or(BackendStatus::Stopped);
            debug!(route = %route.prefix, ?status, request_id, "Backend not available");
            return Ok(json_error_response(
                ProxyErrorCode::BackendUnavailable,
                format!("Terminal '{}' is {}", route.title, status.as_str()),
            ));
        }
    };

    let target = match req.uri().query() {
        Some(query) => format!("{}?{}", strip_prefix(&route.prefix, relative), query),
        None => strip_prefix(&route.prefix, relative).to_string(),
    };

    // Add proxy headers
    // X-Forwarded-* values are overwritten rather than appended so clients
    // cannot spoof them.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if state.settings.trust_proxy_headers {
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        if let Ok(value) = HeaderValue::from_str(&external_prefix(&state.mount, &route.prefix)) {
            headers.insert(X_FORWARDED_PREFIX, value);
        }
    }

    debug!(
        route = %route.prefix,
        method = %req.method(),
        target = %target,
        port,
        request_id,
        "Forwarding request"
    );

    if is_upgrade_request(&req) {
        return handle_upgrade(req, state, route, port, target, request_id).await;
    }

    let request_timeout = state.settings.request_timeout();
    let result = tokio::time::timeout(
        request_timeout,
        state.pool.send_request(req, state.backend_host, port, &target),
    )
    .await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            let err = GatewayError::BackendUnreachable {
                prefix: route.prefix.clone(),
                port,
                reason: e.to_string(),
            };
            error!(route = %route.prefix, port, request_id, error = %err, "Failed to forward request");
            if e.is_connect() {
                state.supervisor.report_unreachable(&route.prefix, &err);
            }
            Ok(json_error_response(
                ProxyErrorCode::from(&err),
                "Failed to connect to terminal backend",
            ))
        }
        Err(_) => {
            warn!(
                route = %route.prefix,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// JSON status of every route
fn health_response(state: &ProxyState) -> Response<BoxBody<Bytes, hyper::Error>> {
    let report = state.supervisor.report();
    let body = serde_json::json!({
        "status": if report.healthy { "ok" } else { "degraded" },
        "routes": report.routes,
        "active_sessions": state.tracker.active_tunnels(),
        "proxied_requests": state.pool.stats().get_total_requests(),
        "failed_requests": state.pool.stats().get_failed_requests(),
        "generated_at": report.generated_at,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Check if a request is an HTTP upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    // Check for Connection: Upgrade header (case-insensitive value check)
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request<B>(req: &Request<B>, target: &str, host: IpAddr, port: u16) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), target);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    // Host points at the backend
    let authority = match host {
        IpAddr::V4(ip) => format!("{}:{}", ip, port),
        IpAddr::V6(ip) => format!("[{}]:{}", ip, port),
    };
    request.push_str(&format!("Host: {}\r\n", authority));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read a response head, returning it and any bytes received after it
async fn read_response_head<R>(stream: &mut R) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Body of a rejected upgrade, bounded by its `Content-Length`
///
/// `body` holds the bytes already read past the head. Without a
/// `Content-Length` the rejection is passed on without a body.
async fn read_rejection_body<R>(stream: &mut R, mut body: Vec<u8>, headers: &HeaderMap) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let Some(len) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
    else {
        return Vec::new();
    };
    let len = len.min(MAX_REJECTION_BODY);

    let mut chunk = [0u8; 1024];
    while body.len() < len {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
        }
    }
    body.truncate(len);
    body
}

/// Index just past the `\r\n\r\n` ending a response head
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse the HTTP response from the backend to check for 101 Switching Protocols
///
/// Header lines whose name or value is not valid HTTP are dropped.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, HeaderMap)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Parse status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) else {
            continue;
        };
        headers.append(name, value);
    }

    Some((status, headers))
}

/// Tunnel a terminal session to its backend
async fn handle_upgrade(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    route: Arc<Route>,
    port: u16,
    target: String,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let limit = route.max_clients.or(state.settings.max_clients_per_route);
    let Some(guard) = state.tracker.try_open(&route.prefix, limit) else {
        warn!(route = %route.prefix, limit, request_id, "Client limit reached");
        return Ok(json_error_response(
            ProxyErrorCode::TooManyClients,
            format!("Terminal '{}' has reached its client limit", route.title),
        ));
    };

    if route.dynamic {
        let params_file = state.supervisor.params_file(&route.prefix);
        if let Err(e) = write_query_params(&params_file, req.uri().query()) {
            warn!(route = %route.prefix, error = %e, "Failed to write route parameters");
        }
    }

    let raw_request = build_upgrade_request(&req, &target, state.backend_host, port);
    let request_timeout = state.settings.request_timeout();

    let mut backend = match tokio::time::timeout(
        request_timeout,
        TcpStream::connect((state.backend_host, port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let err = GatewayError::BackendUnreachable {
                prefix: route.prefix.clone(),
                port,
                reason: e.to_string(),
            };
            error!(route = %route.prefix, port, error = %err, "Failed to connect to backend for upgrade");
            state.supervisor.report_unreachable(&route.prefix, &err);
            return Ok(json_error_response(
                ProxyErrorCode::from(&err),
                "Failed to connect to terminal backend",
            ));
        }
        Err(_) => {
            warn!(route = %route.prefix, port, "Timed out connecting to backend");
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                "Timed out connecting to terminal backend",
            ));
        }
    };
    let _ = backend.set_nodelay(true);

    if let Err(e) = backend.write_all(&raw_request).await {
        error!(route = %route.prefix, error = %e, "Failed to send upgrade request to backend");
        return Ok(json_error_response(
            ProxyErrorCode::UpgradeRejected,
            "Failed to send upgrade request to backend",
        ));
    }

    let (head, leftover) =
        match tokio::time::timeout(request_timeout, read_response_head(&mut backend)).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                error!(route = %route.prefix, error = %e, "Failed to read upgrade response from backend");
                return Ok(json_error_response(
                    ProxyErrorCode::UpgradeRejected,
                    "Backend did not answer the upgrade",
                ));
            }
            Err(_) => {
                return Ok(json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    "Timed out waiting for backend upgrade response",
                ));
            }
        };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(route = %route.prefix, "Failed to parse backend upgrade response");
        return Ok(json_error_response(
            ProxyErrorCode::UpgradeRejected,
            "Invalid upgrade response from backend",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(route = %route.prefix, status = %status, "Backend rejected upgrade request");
        let body = tokio::time::timeout(
            request_timeout,
            read_rejection_body(&mut backend, leftover, &response_headers),
        )
        .await
        .unwrap_or_default();

        // Pass the rejection through with the body the backend declared
        let mut headers = response_headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(CONTENT_LENGTH);

        let mut response =
            Response::new(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        return Ok(response);
    }

    // Build the 101 response to send to the client
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    for (name, value) in &response_headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        response.headers_mut().append(name, value.clone());
    }

    info!(route = %route.prefix, tunnel = guard.info().id, request_id, "Terminal session opened");

    let close_timeout = state.settings.tunnel_close_timeout();
    let close_rx = state.tracker.close_signal();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !leftover.is_empty() {
                    if let Err(e) = client.write_all(&leftover).await {
                        debug!(route = %route.prefix, error = %e, "Client closed before session start");
                        return;
                    }
                }

                let info = guard.info();
                let end = relay(client, backend, info, close_timeout, close_rx).await;
                info!(
                    route = %route.prefix,
                    tunnel = info.id,
                    request_id,
                    ?end,
                    to_backend = info.bytes_to_backend(),
                    to_client = info.bytes_to_client(),
                    "Terminal session closed"
                );
            }
            Err(e) => {
                error!(route = %route.prefix, error = %e, "Failed to upgrade client connection");
            }
        }
        drop(guard);
    });

    Ok(response)
}
