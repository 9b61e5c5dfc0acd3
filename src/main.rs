use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use ttygate::config::Config;
use ttygate::gateway::Gateway;
use ttygate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ttygate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("ttygate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let gateway = Gateway::start(config).await?;

    for route in gateway.status().routes {
        info!(
            route = %route.route_path,
            title = %route.title,
            status = route.status.as_str(),
            port = route.port,
            pid = route.pid,
            "Terminal route"
        );
    }
    info!(addr = %gateway.local_addr(), "Gateway ready");

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let summary = gateway.shutdown().await;
    if !summary.drained {
        warn!(forced_sessions = summary.forced_sessions, "Some sessions were force-closed");
    }

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        use std::io::Write;
        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting terminal gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        mount_path = %config.server.mount_path,
        trust_proxy_headers = config.server.trust_proxy_headers,
        auth = config.server.credentials.is_some(),
        max_clients_per_route = config.server.max_clients_per_route,
        "Server configuration"
    );
    info!(
        base_port = config.supervisor.base_port,
        last_port = config.supervisor.last_port(),
        interface = %config.supervisor.backend_interface,
        "Backend port range"
    );
    info!(
        readiness_timeout_ms = config.supervisor.readiness_timeout_ms,
        health_check_interval_ms = config.supervisor.health_check_interval_ms,
        max_restart_attempts = config.supervisor.restart.max_attempts,
        "Supervision settings"
    );
    info!(
        shutdown_grace_period_secs = config.supervisor.shutdown_grace_period_secs,
        drain_timeout_secs = config.server.drain_timeout_secs,
        tunnel_close_timeout_ms = config.server.tunnel_close_timeout_ms,
        "Shutdown settings"
    );
    info!(
        route_count = config.routes.len(),
        routes = ?config.routes.iter().map(|r| r.path.as_str()).collect::<Vec<_>>(),
        "Configured routes"
    );
}
