use crate::config::SupervisorConfig;
use crate::error::{GatewayError, Result};
use crate::launcher::{BackendHandle, CommandLauncher, LaunchRequest, Launcher};
use crate::params::params_file_path;
use crate::ports::{PortAllocator, PortProbe, PortReservation, TcpBindProbe};
use crate::registry::RouteRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// State of a route's backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// No process is running
    Stopped,
    /// Process spawned, waiting for it to accept connections
    Starting,
    /// Process is accepting connections; requests are forwarded
    Healthy,
    /// A health check failed; a restart is pending
    Unhealthy,
    /// Process is being replaced
    Restarting,
    /// Startup or recovery gave up; needs an operator restart
    Failed,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Stopped => "stopped",
            BackendStatus::Starting => "starting",
            BackendStatus::Healthy => "healthy",
            BackendStatus::Unhealthy => "unhealthy",
            BackendStatus::Restarting => "restarting",
            BackendStatus::Failed => "failed",
        }
    }
}

/// Restart behavior for crashed backends
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Healthy time after which the restart counter resets
    pub reset_after: Duration,
}

impl RestartPolicy {
    /// Delay before restart `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()).max(0.0))
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        SupervisorConfig::default().restart_policy()
    }
}

/// Runtime record for one route's backend
struct BackendProcess {
    status: BackendStatus,
    port: Option<u16>,
    handle: Option<Box<dyn BackendHandle>>,
    reservation: Option<PortReservation>,
    restart_count: u32,
    started_at: Option<Instant>,
    healthy_since: Option<Instant>,
    last_health_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// A recovery task owns this backend
    recovering: bool,
}

impl BackendProcess {
    fn stopped() -> Self {
        Self {
            status: BackendStatus::Stopped,
            port: None,
            handle: None,
            reservation: None,
            restart_count: 0,
            started_at: None,
            healthy_since: None,
            last_health_check: None,
            last_error: None,
            recovering: false,
        }
    }

    /// Detach the running instance, leaving the record without a process
    fn detach(&mut self) -> (Option<Box<dyn BackendHandle>>, Option<PortReservation>) {
        self.port = None;
        self.started_at = None;
        self.healthy_since = None;
        (self.handle.take(), self.reservation.take())
    }
}

/// Point-in-time view of a backend used on the request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSnapshot {
    pub status: BackendStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub restart_count: u32,
}

/// Status of a single route for reporting
#[derive(Debug, Clone, Serialize)]
pub struct RouteStatus {
    pub route_path: String,
    pub title: String,
    pub status: BackendStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub uptime_secs: Option<u64>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dynamic: bool,
}

/// Status of all routes
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// True when every route is healthy
    pub healthy: bool,
    pub routes: Vec<RouteStatus>,
    pub generated_at: DateTime<Utc>,
}

/// Published when a route is marked failed
#[derive(Debug, Clone)]
pub struct RouteFailure {
    pub prefix: String,
    pub error: GatewayError,
    pub restart_count: u32,
}

/// Supervises one backend process per registered route.
///
/// `Supervisor` is shared behind an `Arc`; [`new`](Supervisor::new) returns
/// `Arc<Self>` directly. Methods that spawn recovery tasks take `&Arc<Self>`.
///
/// Lifecycle operations on a route are serialized by a per-route async lock,
/// so at most one process per route is ever running. Status reads never take
/// that lock.
pub struct Supervisor {
    registry: Arc<RouteRegistry>,
    config: SupervisorConfig,
    policy: RestartPolicy,
    interface: IpAddr,
    ports: Arc<PortAllocator>,
    launcher: Arc<dyn Launcher>,
    /// Backend records keyed by route prefix
    backends: DashMap<String, Mutex<BackendProcess>>,
    /// Per-route lifecycle locks
    controls: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    failures: broadcast::Sender<RouteFailure>,
    shutting_down: AtomicBool,
}

/// Parse the backend interface, falling back to IPv4 loopback
fn backend_ip(interface: &str) -> IpAddr {
    interface
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

impl Supervisor {
    /// Create a supervisor that launches routes as child processes
    pub fn new(registry: Arc<RouteRegistry>, config: SupervisorConfig) -> Arc<Self> {
        let probe = Arc::new(TcpBindProbe::new(backend_ip(&config.backend_interface)));
        Self::with_launcher(registry, config, Arc::new(CommandLauncher), probe)
    }

    /// Create a supervisor with a custom launcher and port probe
    pub fn with_launcher(
        registry: Arc<RouteRegistry>,
        config: SupervisorConfig,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn PortProbe>,
    ) -> Arc<Self> {
        let backends = DashMap::new();
        let controls = DashMap::new();
        for route in registry.list() {
            backends.insert(route.prefix.clone(), Mutex::new(BackendProcess::stopped()));
            controls.insert(route.prefix.clone(), Arc::new(tokio::sync::Mutex::new(())));
        }

        let (failures, _) = broadcast::channel(64);

        Arc::new(Self {
            ports: PortAllocator::new(config.base_port, config.last_port(), probe),
            interface: backend_ip(&config.backend_interface),
            policy: config.restart_policy(),
            registry,
            config,
            launcher,
            backends,
            controls,
            failures,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    /// Address backends listen on
    pub fn interface(&self) -> IpAddr {
        self.interface
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Subscribe to routes being marked failed
    pub fn subscribe_failures(&self) -> broadcast::Receiver<RouteFailure> {
        self.failures.subscribe()
    }

    /// Parameter file written for a dynamic route
    pub fn params_file(&self, prefix: &str) -> PathBuf {
        params_file_path(&self.config.params_dir(), prefix)
    }

    fn with_backend<T>(&self, prefix: &str, f: impl FnOnce(&mut BackendProcess) -> T) -> Result<T> {
        let entry = self
            .backends
            .get(prefix)
            .ok_or_else(|| GatewayError::UnknownRoute(prefix.to_string()))?;
        let mut backend = entry.lock();
        Ok(f(&mut backend))
    }

    fn control(&self, prefix: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        self.controls
            .get(prefix)
            .map(|c| Arc::clone(&c))
            .ok_or_else(|| GatewayError::UnknownRoute(prefix.to_string()))
    }

    /// Start a route's backend and wait until it accepts connections.
    ///
    /// No-op while the backend is starting or running, including while a
    /// recovery task owns it. On failure the route is marked `Failed`, any
    /// spawned process is killed and its port released.
    pub async fn start(&self, prefix: &str) -> Result<()> {
        let control = self.control(prefix)?;
        let _guard = control.lock().await;
        if self.is_shutting_down() {
            return Err(GatewayError::ShuttingDown);
        }
        self.start_locked(prefix).await
    }

    async fn start_locked(&self, prefix: &str) -> Result<()> {
        let route = self
            .registry
            .get(prefix)
            .ok_or_else(|| GatewayError::UnknownRoute(prefix.to_string()))?;

        // An unhealthy backend belongs to its recovery task
        let status = self.with_backend(prefix, |b| b.status)?;
        if matches!(
            status,
            BackendStatus::Starting | BackendStatus::Healthy | BackendStatus::Unhealthy
        ) {
            debug!(route = prefix, ?status, "Backend already running or recovering");
            return Ok(());
        }

        let reservation = match self.ports.reserve() {
            Ok(reservation) => reservation,
            Err(e) => {
                self.mark_failed(prefix, &e);
                return Err(e);
            }
        };
        let port = reservation.port();

        let request = LaunchRequest {
            route: &route,
            port,
            interface: &self.config.backend_interface,
            params_file: route.dynamic.then(|| self.params_file(prefix)),
        };
        let handle = match self.launcher.launch(&request) {
            Ok(handle) => handle,
            Err(e) => {
                error!(route = prefix, error = %e, "Failed to launch backend");
                self.mark_failed(prefix, &e);
                return Err(e);
            }
        };
        let pid = handle.pid();

        self.with_backend(prefix, |b| {
            b.status = BackendStatus::Starting;
            b.port = Some(port);
            b.handle = Some(handle);
            b.reservation = Some(reservation);
            b.started_at = Some(Instant::now());
            b.healthy_since = None;
            b.last_error = None;
        })?;

        info!(route = prefix, port, pid, "Waiting for backend to accept connections");

        match self.wait_ready(prefix, port).await {
            Ok(()) => {
                let elapsed = self.with_backend(prefix, |b| {
                    b.status = BackendStatus::Healthy;
                    b.healthy_since = Some(Instant::now());
                    b.last_health_check = Some(Utc::now());
                    b.started_at.map(|t| t.elapsed())
                })?;
                info!(
                    route = prefix,
                    port,
                    startup_ms = elapsed.map(|d| d.as_millis() as u64),
                    "Backend is healthy"
                );
                Ok(())
            }
            Err(e) => {
                error!(route = prefix, port, error = %e, "Backend failed to start");
                let (handle, reservation) = self.with_backend(prefix, |b| {
                    b.status = BackendStatus::Failed;
                    b.last_error = Some(e.to_string());
                    b.detach()
                })?;
                self.terminate(prefix, handle, reservation).await;
                Err(e)
            }
        }
    }

    fn mark_failed(&self, prefix: &str, error: &GatewayError) {
        let _ = self.with_backend(prefix, |b| {
            b.status = BackendStatus::Failed;
            b.last_error = Some(error.to_string());
        });
    }

    /// Poll until the backend accepts a TCP connection, exits, or times out
    async fn wait_ready(&self, prefix: &str, port: u16) -> Result<()> {
        let timeout = self.config.readiness_timeout();
        let poll = self.config.readiness_poll_interval();
        let deadline = Instant::now() + timeout;

        loop {
            let exited = self.with_backend(prefix, |b| {
                b.handle.as_mut().and_then(|h| h.exit_status())
            })?;
            if let Some(status) = exited {
                return Err(GatewayError::ProcessExited {
                    prefix: prefix.to_string(),
                    status,
                });
            }

            if self.probe_port(port, poll).await {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(GatewayError::ProcessStartupTimeout {
                    prefix: prefix.to_string(),
                    port,
                    timeout,
                });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    async fn probe_port(&self, port: u16, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect((self.interface, port))).await,
            Ok(Ok(_))
        )
    }

    /// Stop a route's backend. Stopping an idle route is a no-op.
    pub async fn stop(&self, prefix: &str) -> Result<()> {
        let control = self.control(prefix)?;
        let _guard = control.lock().await;
        self.stop_locked(prefix, BackendStatus::Stopped).await
    }

    async fn stop_locked(&self, prefix: &str, next: BackendStatus) -> Result<()> {
        let (handle, reservation) = self.with_backend(prefix, |b| {
            if b.handle.is_some() {
                b.status = next;
            }
            b.detach()
        })?;
        self.terminate(prefix, handle, reservation).await;
        Ok(())
    }

    /// Terminate a process with graceful shutdown
    /// 1. Send SIGTERM
    /// 2. Wait for exit (with grace period)
    /// 3. Send SIGKILL if still running
    /// 4. Release the port
    async fn terminate(
        &self,
        prefix: &str,
        handle: Option<Box<dyn BackendHandle>>,
        reservation: Option<PortReservation>,
    ) {
        if let Some(mut handle) = handle {
            let grace_period = self.config.shutdown_grace_period();
            info!(route = prefix, pid = handle.pid(), "Sending SIGTERM to backend");
            handle.terminate();

            match tokio::time::timeout(grace_period, handle.wait()).await {
                Ok(()) => info!(route = prefix, "Backend process exited"),
                Err(_) => {
                    warn!(
                        route = prefix,
                        grace_period_ms = grace_period.as_millis() as u64,
                        "Grace period exceeded, sending SIGKILL"
                    );
                    handle.kill().await;
                }
            }
        }

        // Port becomes reusable only after the process is gone
        drop(reservation);
    }

    /// Replace a route's backend with a fresh process on a fresh port
    pub async fn restart(&self, prefix: &str) -> Result<()> {
        let control = self.control(prefix)?;
        let _guard = control.lock().await;
        if self.is_shutting_down() {
            return Err(GatewayError::ShuttingDown);
        }

        let restart_count = self.with_backend(prefix, |b| {
            b.restart_count += 1;
            b.status = BackendStatus::Restarting;
            b.restart_count
        })?;
        info!(route = prefix, restart_count, "Restarting backend");

        self.stop_locked(prefix, BackendStatus::Restarting).await?;
        self.start_locked(prefix).await
    }

    /// Start every registered route concurrently
    ///
    /// Routes that fail are marked `Failed` and published to failure
    /// subscribers; the others keep running.
    pub async fn start_all(&self) -> Vec<(String, Result<()>)> {
        let routes = self.registry.list();
        let results = join_all(routes.iter().map(|route| async move {
            let result = self.start(&route.prefix).await;
            (route.prefix.clone(), result)
        }))
        .await;

        for (prefix, result) in &results {
            if let Err(e) = result {
                let _ = self.failures.send(RouteFailure {
                    prefix: prefix.clone(),
                    error: e.clone(),
                    restart_count: 0,
                });
            }
        }
        results
    }

    /// Stop every backend; no process is started afterwards
    pub async fn stop_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let routes = self.registry.list();
        info!(count = routes.len(), "Stopping all backends");

        join_all(routes.iter().rev().map(|route| async move {
            if let Err(e) = self.stop(&route.prefix).await {
                warn!(route = %route.prefix, error = %e, "Error stopping backend");
            }
        }))
        .await;
    }

    /// Check a running backend: process alive and port accepting connections
    pub async fn check_backend(&self, prefix: &str) -> Result<()> {
        let (port, exited) = self.with_backend(prefix, |b| {
            (b.port, b.handle.as_mut().and_then(|h| h.exit_status()))
        })?;

        if let Some(status) = exited {
            return Err(GatewayError::ProcessCrash {
                prefix: prefix.to_string(),
                reason: format!("process exited ({})", status),
            });
        }

        let Some(port) = port else {
            return Err(GatewayError::ProcessCrash {
                prefix: prefix.to_string(),
                reason: "no process running".to_string(),
            });
        };

        if !self.probe_port(port, self.config.health_probe_timeout()).await {
            return Err(GatewayError::ProcessCrash {
                prefix: prefix.to_string(),
                reason: format!("port {} is not accepting connections", port),
            });
        }

        Ok(())
    }

    /// Record a passing health check
    ///
    /// Resets the restart counter once the backend has stayed healthy for
    /// the policy's `reset_after`.
    pub fn record_healthy(&self, prefix: &str) {
        let reset_after = self.policy.reset_after;
        let _ = self.with_backend(prefix, |b| {
            b.last_health_check = Some(Utc::now());
            let stable = b
                .healthy_since
                .is_some_and(|since| since.elapsed() >= reset_after);
            if b.status == BackendStatus::Healthy && b.restart_count > 0 && stable {
                info!(route = prefix, restarts = b.restart_count, "Backend stable, resetting restart counter");
                b.restart_count = 0;
            }
        });
    }

    /// Handle a crashed or unresponsive backend.
    ///
    /// Marks it `Unhealthy` and spawns a recovery task that restarts it with
    /// exponential backoff. Once the policy's attempts are used up the route
    /// is marked `Failed` and published to failure subscribers. Ignored when a
    /// recovery is already running or the backend is not serving.
    pub fn handle_failure(self: &Arc<Self>, prefix: &str, error: GatewayError) {
        if self.is_shutting_down() {
            return;
        }

        let begin = self
            .with_backend(prefix, |b| {
                let serving = matches!(b.status, BackendStatus::Healthy | BackendStatus::Unhealthy);
                if b.recovering || !serving {
                    return false;
                }
                b.status = BackendStatus::Unhealthy;
                b.recovering = true;
                b.last_error = Some(error.to_string());
                true
            })
            .unwrap_or(false);

        if !begin {
            return;
        }

        warn!(route = prefix, error = %error, "Backend unhealthy, scheduling restart");

        let supervisor = Arc::clone(self);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            supervisor.recover(&prefix, error).await;
        });
    }

    async fn recover(&self, prefix: &str, mut error: GatewayError) {
        loop {
            if self.is_shutting_down() {
                break;
            }

            let attempts = match self.with_backend(prefix, |b| b.restart_count) {
                Ok(attempts) => attempts,
                Err(_) => break,
            };

            if attempts >= self.policy.max_attempts {
                error!(
                    route = prefix,
                    attempts,
                    error = %error,
                    "Restart attempts exhausted, marking route failed"
                );
                let detached = self.with_backend(prefix, |b| {
                    b.status = BackendStatus::Failed;
                    b.last_error = Some(error.to_string());
                    b.detach()
                });
                if let Ok((handle, reservation)) = detached {
                    self.terminate(prefix, handle, reservation).await;
                }
                let _ = self.failures.send(RouteFailure {
                    prefix: prefix.to_string(),
                    error,
                    restart_count: attempts,
                });
                break;
            }

            let delay = self.policy.backoff(attempts + 1);
            info!(
                route = prefix,
                attempt = attempts + 1,
                delay_ms = delay.as_millis() as u64,
                "Restarting backend after backoff"
            );
            tokio::time::sleep(delay).await;

            match self.restart(prefix).await {
                Ok(()) => {
                    info!(route = prefix, "Backend recovered");
                    break;
                }
                Err(GatewayError::ShuttingDown) => break,
                Err(e) => {
                    warn!(route = prefix, error = %e, "Restart attempt failed");
                    error = e;
                }
            }
        }

        let _ = self.with_backend(prefix, |b| b.recovering = false);
    }

    /// The proxy could not reach a backend it believed healthy.
    ///
    /// Re-checks the backend in the background and hands it to
    /// [`handle_failure`](Self::handle_failure) if the check fails.
    pub fn report_unreachable(self: &Arc<Self>, prefix: &str, error: &GatewayError) {
        debug!(route = prefix, error = %error, "Backend reported unreachable");

        let supervisor = Arc::clone(self);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            match supervisor.check_backend(&prefix).await {
                Ok(()) => debug!(route = %prefix, "Backend reachable on re-check"),
                Err(e) => supervisor.handle_failure(&prefix, e),
            }
        });
    }

    /// Current state of a route's backend
    pub fn snapshot(&self, prefix: &str) -> Option<BackendSnapshot> {
        self.with_backend(prefix, |b| BackendSnapshot {
            status: b.status,
            port: b.port,
            pid: b.handle.as_ref().and_then(|h| h.pid()),
            restart_count: b.restart_count,
        })
        .ok()
    }

    pub fn is_healthy(&self, prefix: &str) -> bool {
        self.with_backend(prefix, |b| b.status == BackendStatus::Healthy)
            .unwrap_or(false)
    }

    /// Prefixes of backends currently marked healthy
    pub fn healthy_routes(&self) -> Vec<String> {
        self.registry
            .list()
            .into_iter()
            .filter(|r| self.is_healthy(&r.prefix))
            .map(|r| r.prefix.clone())
            .collect()
    }

    /// Status of every route, in registration order
    pub fn status(&self) -> Vec<RouteStatus> {
        self.registry
            .list()
            .into_iter()
            .filter_map(|route| {
                self.with_backend(&route.prefix, |b| RouteStatus {
                    route_path: route.prefix.clone(),
                    title: route.title.clone(),
                    status: b.status,
                    port: b.port,
                    pid: b.handle.as_ref().and_then(|h| h.pid()),
                    restart_count: b.restart_count,
                    uptime_secs: b.started_at.map(|t| t.elapsed().as_secs()),
                    last_health_check: b.last_health_check,
                    last_error: b.last_error.clone(),
                    dynamic: route.dynamic,
                })
                .ok()
            })
            .collect()
    }

    pub fn report(&self) -> StatusReport {
        let routes = self.status();
        StatusReport {
            healthy: routes.iter().all(|r| r.status == BackendStatus::Healthy),
            routes,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RouteSpec;

    fn test_config(base_port: u16) -> SupervisorConfig {
        SupervisorConfig {
            base_port,
            port_search_range: 50,
            readiness_timeout_ms: 300,
            readiness_poll_interval_ms: 20,
            shutdown_grace_period_secs: 1,
            ..Default::default()
        }
    }

    fn supervisor(specs: Vec<RouteSpec>, base_port: u16) -> Arc<Supervisor> {
        let registry = Arc::new(RouteRegistry::from_specs(specs).unwrap());
        Supervisor::new(registry, test_config(base_port))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RestartPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(3),
            reset_after: Duration::from_secs(60),
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(40), Duration::from_secs(3));
    }

    #[test]
    fn test_initial_state_is_stopped() {
        let sup = supervisor(vec![RouteSpec::command("/a", "sleep", &["60"])], 23100);
        let snapshot = sup.snapshot("/a").unwrap();
        assert_eq!(snapshot.status, BackendStatus::Stopped);
        assert_eq!(snapshot.port, None);
        assert!(sup.snapshot("/missing").is_none());
    }

    #[tokio::test]
    async fn test_start_unknown_route() {
        let sup = supervisor(vec![], 23150);
        let err = sup.start("/nope").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownRoute(_)));
    }

    #[tokio::test]
    async fn test_startup_timeout_marks_failed_and_releases_port() {
        // sleep never listens on its port
        let sup = supervisor(vec![RouteSpec::command("/a", "sleep", &["60"])], 23200);

        let err = sup.start("/a").await.unwrap_err();
        assert!(matches!(err, GatewayError::ProcessStartupTimeout { .. }));

        let snapshot = sup.snapshot("/a").unwrap();
        assert_eq!(snapshot.status, BackendStatus::Failed);
        assert_eq!(snapshot.port, None);
        assert_eq!(snapshot.pid, None);
        assert!(sup.ports().reserved_ports().is_empty());

        let status = &sup.status()[0];
        assert!(status.last_error.as_deref().unwrap().contains("did not accept"));
    }

    #[tokio::test]
    async fn test_early_exit_reported() {
        let sup = supervisor(vec![RouteSpec::command("/a", "sh", &["-c", "exit 3"])], 23250);

        let err = sup.start("/a").await.unwrap_err();
        assert!(matches!(err, GatewayError::ProcessExited { .. }), "got {:?}", err);
        assert_eq!(sup.snapshot("/a").unwrap().status, BackendStatus::Failed);
        assert!(sup.ports().reserved_ports().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_failed() {
        let sup = supervisor(
            vec![RouteSpec::command("/a", "/nonexistent/ttygate-backend", &[])],
            23300,
        );

        let err = sup.start("/a").await.unwrap_err();
        assert!(matches!(err, GatewayError::Spawn { .. }));
        assert_eq!(sup.snapshot("/a").unwrap().status, BackendStatus::Failed);
        assert!(sup.ports().reserved_ports().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let sup = supervisor(vec![RouteSpec::command("/a", "sleep", &["60"])], 23350);

        sup.stop("/a").await.unwrap();
        sup.stop("/a").await.unwrap();
        assert_eq!(sup.snapshot("/a").unwrap().status, BackendStatus::Stopped);
    }

    #[tokio::test]
    async fn test_restart_counts_attempts() {
        let sup = supervisor(vec![RouteSpec::command("/a", "sleep", &["60"])], 23400);

        assert!(sup.restart("/a").await.is_err());
        assert!(sup.restart("/a").await.is_err());

        let snapshot = sup.snapshot("/a").unwrap();
        assert_eq!(snapshot.restart_count, 2);
        assert_eq!(snapshot.status, BackendStatus::Failed);
    }

    #[tokio::test]
    async fn test_start_all_publishes_failures() {
        let sup = supervisor(
            vec![
                RouteSpec::command("/a", "sh", &["-c", "exit 1"]),
                RouteSpec::command("/b", "sh", &["-c", "exit 2"]),
            ],
            23450,
        );
        let mut failures = sup.subscribe_failures();

        let results = sup.start_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_err()));

        let mut failed = vec![
            failures.recv().await.unwrap().prefix,
            failures.recv().await.unwrap().prefix,
        ];
        failed.sort();
        assert_eq!(failed, vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn test_no_start_after_stop_all() {
        let sup = supervisor(vec![RouteSpec::command("/a", "sleep", &["60"])], 23500);

        sup.stop_all().await;
        assert!(sup.is_shutting_down());
        assert!(matches!(
            sup.start("/a").await.unwrap_err(),
            GatewayError::ShuttingDown
        ));
        assert!(matches!(
            sup.restart("/a").await.unwrap_err(),
            GatewayError::ShuttingDown
        ));
    }

    #[tokio::test]
    async fn test_check_backend_without_process() {
        let sup = supervisor(vec![RouteSpec::command("/a", "sleep", &["60"])], 23550);
        let err = sup.check_backend("/a").await.unwrap_err();
        assert!(matches!(err, GatewayError::ProcessCrash { .. }));
    }

    #[test]
    fn test_params_file_location() {
        let registry = Arc::new(RouteRegistry::new());
        let config = SupervisorConfig {
            params_dir: Some("/var/run/ttygate".to_string()),
            ..Default::default()
        };
        let sup = Supervisor::new(registry, config);
        assert_eq!(
            sup.params_file("/snake"),
            PathBuf::from("/var/run/ttygate/ttygate_params_snake.json")
        );
    }

    #[test]
    fn test_report_serializes_status() {
        let sup = supervisor(vec![RouteSpec::command("/a", "sleep", &["60"])], 23600);
        let report = sup.report();
        assert!(!report.healthy);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["routes"][0]["route_path"], "/a");
        assert_eq!(json["routes"][0]["status"], "stopped");
        assert_eq!(json["routes"][0]["title"], "a");
    }
}
