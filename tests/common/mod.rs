//! Shared helpers for integration tests
//!
//! `MockLauncher` runs each backend as an in-process task instead of a child
//! process. The mock backend speaks just enough HTTP/1.1:
//! - `GET /ping` answers `pong`
//! - `GET /headers` answers the request headers as JSON
//! - any other path answers with the request target it received
//! - an `Upgrade` request gets `101 Switching Protocols` followed by a raw
//!   byte echo, unless the route has a canned upgrade reply

#![allow(dead_code)]

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};
use ttygate::config::{Config, RestartConfig, ServerConfig, SupervisorConfig};
use ttygate::error::{GatewayError, Result};
use ttygate::launcher::{BackendHandle, LaunchRequest, Launcher};
use ttygate::ports::PortProbe;

/// What a launched mock backend does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Listen and serve
    Serve,
    /// Stay running without ever listening
    NeverListen,
    /// Exit right away
    ExitImmediately,
}

/// A request seen by a mock backend
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct RouteRecord {
    behavior: Option<Behavior>,
    /// Behavior for launches after the first one
    restart_behavior: Option<Behavior>,
    /// Raw response head and body sent instead of the default 101
    upgrade_reply: Option<String>,
    launches: Vec<u16>,
    requests: Vec<SeenRequest>,
    current: Option<AbortHandle>,
}

#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<String, RouteRecord>>,
    next_pid: AtomicU32,
}

/// Launches in-process mock backends and records what they see
///
/// Clones share state, so a test keeps one clone and hands another to the
/// gateway.
#[derive(Clone, Default)]
pub struct MockLauncher {
    shared: Arc<Shared>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the behavior of every launch of `prefix`
    pub fn set_behavior(&self, prefix: &str, behavior: Behavior) {
        self.shared.routes.lock().entry(prefix.to_string()).or_default().behavior = Some(behavior);
    }

    /// Set the behavior of launches after the first one
    pub fn set_restart_behavior(&self, prefix: &str, behavior: Behavior) {
        self.shared
            .routes
            .lock()
            .entry(prefix.to_string())
            .or_default()
            .restart_behavior = Some(behavior);
    }

    /// Answer upgrades on `prefix` with `reply` verbatim
    pub fn set_upgrade_reply(&self, prefix: &str, reply: &str) {
        self.shared
            .routes
            .lock()
            .entry(prefix.to_string())
            .or_default()
            .upgrade_reply = Some(reply.to_string());
    }

    /// Ports `prefix` was launched on, in order
    pub fn launches(&self, prefix: &str) -> Vec<u16> {
        self.shared
            .routes
            .lock()
            .get(prefix)
            .map(|r| r.launches.clone())
            .unwrap_or_default()
    }

    /// HTTP requests received by the backends of `prefix`
    pub fn requests(&self, prefix: &str) -> Vec<SeenRequest> {
        self.shared
            .routes
            .lock()
            .get(prefix)
            .map(|r| r.requests.clone())
            .unwrap_or_default()
    }

    pub fn total_requests(&self) -> usize {
        self.shared.routes.lock().values().map(|r| r.requests.len()).sum()
    }

    /// Kill the current backend of `prefix` as if it crashed
    pub fn crash(&self, prefix: &str) {
        let current = self
            .shared
            .routes
            .lock()
            .get(prefix)
            .and_then(|r| r.current.clone());
        if let Some(handle) = current {
            handle.abort();
        }
    }

    /// Handle for passing to a gateway or supervisor
    pub fn launcher(&self) -> Arc<dyn Launcher> {
        Arc::new(self.clone())
    }

    fn upgrade_reply(&self, prefix: &str) -> Option<String> {
        self.shared
            .routes
            .lock()
            .get(prefix)
            .and_then(|r| r.upgrade_reply.clone())
    }

    fn record_request(&self, prefix: &str, request: SeenRequest) {
        self.shared
            .routes
            .lock()
            .entry(prefix.to_string())
            .or_default()
            .requests
            .push(request);
    }
}

impl Launcher for MockLauncher {
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn BackendHandle>> {
        let prefix = request.route.prefix.clone();
        let port = request.port;

        let behavior = {
            let mut routes = self.shared.routes.lock();
            let record = routes.entry(prefix.clone()).or_default();
            let first = record.launches.is_empty();
            record.launches.push(port);
            match (first, record.restart_behavior) {
                (false, Some(behavior)) => behavior,
                _ => record.behavior.unwrap_or(Behavior::Serve),
            }
        };

        let task = match behavior {
            Behavior::Serve => {
                // Bind before returning so a failed bind surfaces as a spawn error
                let spawn_error = |e: std::io::Error| GatewayError::Spawn {
                    prefix: prefix.clone(),
                    reason: e.to_string(),
                };
                let std_listener =
                    std::net::TcpListener::bind((request.interface, port)).map_err(spawn_error)?;
                std_listener.set_nonblocking(true).map_err(spawn_error)?;
                let listener = TcpListener::from_std(std_listener).map_err(spawn_error)?;
                tokio::spawn(serve(listener, self.clone(), prefix.clone()))
            }
            Behavior::NeverListen => tokio::spawn(futures::future::pending::<()>()),
            Behavior::ExitImmediately => tokio::spawn(async {}),
        };

        if let Some(record) = self.shared.routes.lock().get_mut(&prefix) {
            record.current = Some(task.abort_handle());
        }

        Ok(Box::new(MockHandle {
            pid: 10_000 + self.shared.next_pid.fetch_add(1, Ordering::Relaxed),
            task,
        }))
    }
}

struct MockHandle {
    pid: u32,
    task: JoinHandle<()>,
}

impl BackendHandle for MockHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn exit_status(&mut self) -> Option<String> {
        self.task.is_finished().then(|| "exited".to_string())
    }

    fn terminate(&mut self) {
        self.task.abort();
    }

    fn wait(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = (&mut self.task).await;
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.task.abort();
            let _ = (&mut self.task).await;
        })
    }
}

async fn serve(listener: TcpListener, launcher: MockLauncher, route: String) {
    // Connections end with the backend
    let mut connections = tokio::task::JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let launcher = launcher.clone();
                let route = route.clone();
                connections.spawn(async move {
                    handle_connection(stream, launcher, route).await;
                });
            }
            Err(_) => break,
        }
    }
}

async fn handle_connection(mut stream: TcpStream, launcher: MockLauncher, route: String) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    // Read HTTP request headers
    let head_end = loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&temp[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 8192 {
            return;
        }
    };

    let Ok(head) = std::str::from_utf8(&buf[..head_end]) else {
        return;
    };
    let mut lines = head.lines();
    let Some(request_line) = lines.next() else {
        return;
    };
    let parts: Vec<&str> = request_line.split(' ').collect();
    if parts.len() < 2 {
        return;
    }

    let headers: Vec<(String, String)> = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let request = SeenRequest {
        method: parts[0].to_string(),
        target: parts[1].to_string(),
        headers,
    };
    launcher.record_request(&route, request.clone());

    if let Some(protocol) = request.header("upgrade") {
        let response = launcher.upgrade_reply(&route).unwrap_or_else(|| {
            format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: {}\r\n\
                 Connection: Upgrade\r\n\
                 \r\n",
                protocol
            )
        });
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        let early = buf[head_end..].to_vec();
        if !early.is_empty() && stream.write_all(&early).await.is_err() {
            return;
        }
        let (mut rd, mut wr) = stream.split();
        let _ = tokio::io::copy(&mut rd, &mut wr).await;
        let _ = wr.shutdown().await;
        return;
    }

    let (content_type, body) = match request.target.as_str() {
        "/ping" => ("text/plain", "pong".to_string()),
        "/headers" => {
            let map: HashMap<String, String> = request
                .headers
                .iter()
                .map(|(n, v)| (n.to_lowercase(), v.clone()))
                .collect();
            (
                "application/json",
                serde_json::to_string(&map).unwrap_or_default(),
            )
        }
        target => ("text/plain", target.to_string()),
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         X-Mock-Server: true\r\n\
         \r\n\
         {}",
        content_type,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

/// Port probe that reports ports as bound according to a fixed set
pub struct SimulatedProbe {
    bound: Mutex<HashSet<u16>>,
}

impl SimulatedProbe {
    pub fn new(bound: impl IntoIterator<Item = u16>) -> Arc<Self> {
        Arc::new(Self {
            bound: Mutex::new(bound.into_iter().collect()),
        })
    }
}

impl PortProbe for SimulatedProbe {
    fn is_available(&self, port: u16) -> bool {
        !self.bound.lock().contains(&port)
    }
}

/// Gateway config on an ephemeral listener with fast supervision timings
pub fn test_config(base_port: u16) -> Config {
    Config {
        server: ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            mount_path: "/".to_string(),
            drain_timeout_secs: 2,
            tunnel_close_timeout_ms: 500,
            request_timeout_secs: 5,
            ..Default::default()
        },
        supervisor: SupervisorConfig {
            base_port,
            port_search_range: 40,
            readiness_timeout_ms: 500,
            readiness_poll_interval_ms: 20,
            health_check_interval_ms: 100,
            health_probe_timeout_ms: 200,
            shutdown_grace_period_secs: 1,
            restart: RestartConfig {
                max_attempts: 2,
                initial_backoff_ms: 50,
                max_backoff_ms: 200,
                ..Default::default()
            },
            ..Default::default()
        },
        routes: Vec::new(),
    }
}

/// Send a simple HTTP request and get the raw response
pub async fn http_get(addr: std::net::SocketAddr, path: &str) -> std::io::Result<String> {
    http_get_with_headers(addr, path, &[]).await
}

pub async fn http_get_with_headers(
    addr: std::net::SocketAddr,
    path: &str,
    headers: &[(&str, &str)],
) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;

    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", path, addr);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Status code of a raw HTTP response
pub fn status_of(response: &str) -> u16 {
    response
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Body of a raw HTTP response
pub fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

/// Open an upgraded session through the gateway, returning the stream after
/// the response head
pub async fn open_tunnel(addr: std::net::SocketAddr, path: &str) -> std::io::Result<(TcpStream, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: terminal\r\n\
         \r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await?;

    // Read byte by byte so nothing past the head is consumed
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            break;
        }
        head.push(byte[0]);
    }
    Ok((stream, String::from_utf8_lossy(&head).into_owned()))
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
