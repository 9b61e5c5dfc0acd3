//! Terminal session tunnels
//!
//! An upgraded client connection is relayed byte for byte to its backend.
//! Each tunnel moves through `Connecting -> Active -> Closing -> Closed`:
//! when either side closes, the other side gets a bounded window to finish
//! before both are dropped.
//!
//! [`TunnelTracker`] counts open tunnels and in-flight connections so
//! shutdown can wait for them to drain, and broadcasts a force-close signal
//! once the drain timeout has passed.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info};

/// Interval for polling drain status during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

pub type TunnelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Admitted, backend handshake in progress
    Connecting,
    /// Relaying in both directions
    Active,
    /// One side closed, waiting for the other
    Closing,
    Closed,
}

/// How a relay ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    BackendClosed,
    ForceClosed,
    Error(String),
}

#[derive(Debug)]
pub struct TunnelInfo {
    pub id: TunnelId,
    pub route: String,
    pub opened_at: Instant,
    state: Mutex<TunnelState>,
    bytes_to_backend: AtomicU64,
    bytes_to_client: AtomicU64,
}

impl TunnelInfo {
    fn new(id: TunnelId, route: &str) -> Self {
        Self {
            id,
            route: route.to_string(),
            opened_at: Instant::now(),
            state: Mutex::new(TunnelState::Connecting),
            bytes_to_backend: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    fn set_state(&self, state: TunnelState) {
        *self.state.lock() = state;
    }

    pub fn bytes_to_backend(&self) -> u64 {
        self.bytes_to_backend.load(Ordering::Relaxed)
    }

    pub fn bytes_to_client(&self) -> u64 {
        self.bytes_to_client.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

/// Tracks open tunnels and in-flight connections
pub struct TunnelTracker {
    tunnels: DashMap<TunnelId, Arc<TunnelInfo>>,
    /// Open tunnels per route, checked and updated under one lock
    per_route: Mutex<HashMap<String, usize>>,
    connections: AtomicUsize,
    next_id: AtomicU64,
    close_tx: watch::Sender<bool>,
}

impl TunnelTracker {
    pub fn new() -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            tunnels: DashMap::new(),
            per_route: Mutex::new(HashMap::new()),
            connections: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            close_tx,
        })
    }

    /// Admit a tunnel for `route` unless it already has `limit` open
    pub fn try_open(self: &Arc<Self>, route: &str, limit: Option<usize>) -> Option<TunnelGuard> {
        {
            let mut per_route = self.per_route.lock();
            let open = per_route.entry(route.to_string()).or_insert(0);
            if limit.is_some_and(|max| *open >= max) {
                debug!(route, open = *open, "Tunnel rejected, client limit reached");
                return None;
            }
            *open += 1;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(TunnelInfo::new(id, route));
        self.tunnels.insert(id, Arc::clone(&info));

        debug!(id, route, total = self.tunnels.len(), "Tunnel opened");

        Some(TunnelGuard {
            info,
            tracker: Arc::clone(self),
        })
    }

    fn close(&self, info: &TunnelInfo) {
        info.set_state(TunnelState::Closed);
        self.tunnels.remove(&info.id);

        let mut per_route = self.per_route.lock();
        if let Some(open) = per_route.get_mut(&info.route) {
            *open = open.saturating_sub(1);
            if *open == 0 {
                per_route.remove(&info.route);
            }
        }

        debug!(
            id = info.id,
            route = %info.route,
            age_ms = info.age().as_millis() as u64,
            to_backend = info.bytes_to_backend(),
            to_client = info.bytes_to_client(),
            "Tunnel closed"
        );
    }

    /// Count an accepted client connection until the guard drops
    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active_tunnels(&self) -> usize {
        self.tunnels.len()
    }

    pub fn tunnels_for(&self, route: &str) -> usize {
        self.per_route.lock().get(route).copied().unwrap_or(0)
    }

    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Snapshot of open tunnels
    pub fn tunnels(&self) -> Vec<Arc<TunnelInfo>> {
        self.tunnels.iter().map(|t| Arc::clone(t.value())).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.active_tunnels() == 0 && self.active_connections() == 0
    }

    /// Wait until no tunnels or connections remain, up to `timeout`
    ///
    /// Returns whether the tracker drained in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while !self.is_idle() {
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
        true
    }

    /// Tell every open tunnel and connection to close now
    pub fn force_close(&self) {
        info!(
            tunnels = self.active_tunnels(),
            connections = self.active_connections(),
            "Force-closing remaining sessions"
        );
        self.close_tx.send_replace(true);
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

/// Keeps a tunnel registered; closing it on drop
pub struct TunnelGuard {
    info: Arc<TunnelInfo>,
    tracker: Arc<TunnelTracker>,
}

impl TunnelGuard {
    pub fn info(&self) -> &Arc<TunnelInfo> {
        &self.info
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.tracker.close(&self.info);
    }
}

pub struct ConnectionGuard {
    tracker: Arc<TunnelTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolve once the signal is set; never if its sender is gone
pub async fn signaled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Copy bytes until EOF, then half-close the writer
async fn pipe<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Relay bytes between a client and a backend until the session ends
///
/// When one direction finishes, the other has `close_timeout` to finish
/// before both streams are dropped. A force-close signal ends the relay
/// immediately.
pub async fn relay<C, B>(
    client: C,
    backend: B,
    info: &TunnelInfo,
    close_timeout: Duration,
    mut close_rx: watch::Receiver<bool>,
) -> RelayEnd
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    info.set_state(TunnelState::Active);

    let upstream = pipe(&mut client_rd, &mut backend_wr, &info.bytes_to_backend);
    let downstream = pipe(&mut backend_rd, &mut client_wr, &info.bytes_to_client);
    tokio::pin!(upstream, downstream);

    let end = tokio::select! {
        result = &mut upstream => {
            info.set_state(TunnelState::Closing);
            tokio::select! {
                _ = tokio::time::timeout(close_timeout, &mut downstream) => {}
                _ = signaled(&mut close_rx) => {}
            }
            match result {
                Ok(()) => RelayEnd::ClientClosed,
                Err(e) => RelayEnd::Error(e.to_string()),
            }
        }
        result = &mut downstream => {
            info.set_state(TunnelState::Closing);
            tokio::select! {
                _ = tokio::time::timeout(close_timeout, &mut upstream) => {}
                _ = signaled(&mut close_rx) => {}
            }
            match result {
                Ok(()) => RelayEnd::BackendClosed,
                Err(e) => RelayEnd::Error(e.to_string()),
            }
        }
        _ = signaled(&mut close_rx) => RelayEnd::ForceClosed,
    };

    info.set_state(TunnelState::Closed);
    end
}
