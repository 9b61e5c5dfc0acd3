//! Startup and shutdown sequencing
//!
//! Startup runs registry, then backends, then health monitoring, then the
//! listener. Shutdown reverses it: stop accepting, drain sessions,
//! force-close the rest, then stop every backend.

use crate::config::Config;
use crate::healthcheck::HealthMonitor;
use crate::launcher::Launcher;
use crate::ports::PortProbe;
use crate::process::{RouteFailure, StatusReport, Supervisor};
use crate::proxy::ProxyServer;
use crate::registry::{RouteRegistry, RouteSpec};
use crate::tunnel::TunnelTracker;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Time force-closed sessions get to unwind before backends are stopped
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Outcome of a shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// All sessions finished within the drain timeout
    pub drained: bool,
    /// Sessions still open when the drain timeout passed
    pub forced_sessions: usize,
}

/// A running gateway
pub struct Gateway {
    config: Config,
    supervisor: Arc<Supervisor>,
    tracker: Arc<TunnelTracker>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
    proxy_task: JoinHandle<anyhow::Result<()>>,
    monitor_task: JoinHandle<()>,
    failure_task: JoinHandle<()>,
}

impl Gateway {
    /// Start the gateway with backends run as child processes
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let registry = RouteRegistry::from_specs(config.route_specs()?)?;
        let supervisor = Supervisor::new(Arc::new(registry), config.supervisor.clone());
        Self::launch(config, supervisor).await
    }

    /// Start the gateway with explicit routes, launcher and port probe
    pub async fn start_with(
        config: Config,
        specs: Vec<RouteSpec>,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn PortProbe>,
    ) -> anyhow::Result<Self> {
        let registry = RouteRegistry::from_specs(specs)?;
        let supervisor =
            Supervisor::with_launcher(Arc::new(registry), config.supervisor.clone(), launcher, probe);
        Self::launch(config, supervisor).await
    }

    async fn launch(config: Config, supervisor: Arc<Supervisor>) -> anyhow::Result<Self> {
        let failure_task = tokio::spawn(log_failures(supervisor.subscribe_failures()));

        let results = supervisor.start_all().await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(
            routes = results.len(),
            healthy = results.len() - failed,
            failed,
            "Backends started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = HealthMonitor::new(
            Arc::clone(&supervisor),
            config.supervisor.health_check_interval(),
            shutdown_rx.clone(),
        );
        let monitor_task = tokio::spawn(monitor.run());

        let listener = match TcpListener::bind((config.server.bind.as_str(), config.server.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(bind = %config.server.bind, port = config.server.port, error = %e, "Failed to bind listener");
                let _ = shutdown_tx.send(true);
                let _ = monitor_task.await;
                supervisor.stop_all().await;
                failure_task.abort();
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;

        let tracker = TunnelTracker::new();
        let proxy = ProxyServer::new(
            Arc::clone(&supervisor),
            Arc::clone(&tracker),
            config.server.clone(),
            shutdown_rx,
        );
        let proxy_task = tokio::spawn(proxy.serve(listener));

        Ok(Self {
            config,
            supervisor,
            tracker,
            shutdown_tx,
            local_addr,
            proxy_task,
            monitor_task,
            failure_task,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn tracker(&self) -> &Arc<TunnelTracker> {
        &self.tracker
    }

    pub fn status(&self) -> StatusReport {
        self.supervisor.report()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<RouteFailure> {
        self.supervisor.subscribe_failures()
    }

    /// Shut down gracefully
    /// 1. Stop accepting connections
    /// 2. Wait for sessions to drain (with timeout)
    /// 3. Force-close whatever is left
    /// 4. Stop every backend
    pub async fn shutdown(self) -> ShutdownSummary {
        info!("Gateway shutting down");
        let _ = self.shutdown_tx.send(true);

        match self.proxy_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Proxy server exited with error"),
            Err(e) => warn!(error = %e, "Proxy server task failed"),
        }

        let drain_timeout = self.config.server.drain_timeout();
        let drained = self.tracker.wait_idle(drain_timeout).await;

        let forced_sessions = if drained {
            0
        } else {
            let remaining = self.tracker.active_tunnels();
            warn!(
                remaining,
                drain_timeout_secs = drain_timeout.as_secs(),
                "Drain timeout exceeded, closing remaining sessions"
            );
            self.tracker.force_close();
            if !self.tracker.wait_idle(FORCE_CLOSE_GRACE).await {
                warn!("Sessions still open after force close");
            }
            remaining
        };

        let _ = self.monitor_task.await;
        self.supervisor.stop_all().await;
        self.failure_task.abort();

        info!(drained, forced_sessions, "Gateway stopped");
        ShutdownSummary {
            drained,
            forced_sessions,
        }
    }
}

async fn log_failures(mut failures: broadcast::Receiver<RouteFailure>) {
    loop {
        match failures.recv().await {
            Ok(failure) => error!(
                route = %failure.prefix,
                restarts = failure.restart_count,
                error = %failure.error,
                "Route failed"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed route failure notifications");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
