//! Health monitoring for terminal backends
//!
//! Periodically checks every healthy backend: the process must still be
//! running and its port must accept a TCP connection. Failures are handed
//! to the supervisor, which restarts the backend according to its policy.

use crate::process::Supervisor;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Background task checking backend health
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(
        supervisor: Arc<Supervisor>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            supervisor,
            interval,
            shutdown_rx,
        }
    }

    /// Run until shutdown is signaled
    pub async fn run(mut self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.check_all().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Check every healthy backend once
    pub async fn check_all(&self) {
        let routes = self.supervisor.healthy_routes();
        debug!(count = routes.len(), "Running health checks");

        join_all(routes.into_iter().map(|prefix| async move {
            match self.supervisor.check_backend(&prefix).await {
                Ok(()) => self.supervisor.record_healthy(&prefix),
                Err(e) => {
                    warn!(route = %prefix, error = %e, "Health check failed");
                    self.supervisor.handle_failure(&prefix, e);
                }
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::process::BackendStatus;
    use crate::registry::{RouteRegistry, RouteSpec};

    fn supervisor() -> Arc<Supervisor> {
        let registry = Arc::new(
            RouteRegistry::from_specs(vec![RouteSpec::command("/a", "sleep", &["60"])]).unwrap(),
        );
        Supervisor::new(registry, SupervisorConfig::default())
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let monitor = HealthMonitor::new(supervisor(), Duration::from_millis(20), rx);
        let handle = tokio::spawn(monitor.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should exit")
            .unwrap();
    }

    #[tokio::test]
    async fn test_monitor_stops_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        let monitor = HealthMonitor::new(supervisor(), Duration::from_secs(60), rx);
        let handle = tokio::spawn(monitor.run());

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should exit")
            .unwrap();
    }

    #[tokio::test]
    async fn test_check_all_ignores_stopped_backends() {
        let sup = supervisor();
        let (_tx, rx) = watch::channel(false);
        let monitor = HealthMonitor::new(Arc::clone(&sup), Duration::from_secs(60), rx);

        monitor.check_all().await;
        assert_eq!(sup.snapshot("/a").unwrap().status, BackendStatus::Stopped);
    }
}
