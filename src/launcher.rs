//! Spawning backend processes
//!
//! The supervisor talks to backends through [`Launcher`] and [`BackendHandle`]
//! so process lifecycle can be exercised without real terminal servers.
//! [`CommandLauncher`] is the production implementation.

use crate::error::{GatewayError, Result};
use crate::registry::Route;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Environment variable carrying the route prefix for dynamic backends
pub const ROUTE_PATH_ENV: &str = "TTYGATE_ROUTE_PATH";

/// Environment variable carrying the parameter file path for dynamic backends
pub const PARAMS_FILE_ENV: &str = "TTYGATE_PARAMS_FILE";

/// Everything a launcher needs to start one backend instance
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    pub route: &'a Route,
    pub port: u16,
    pub interface: &'a str,
    /// Set for dynamic routes
    pub params_file: Option<PathBuf>,
}

/// Starts backend instances
pub trait Launcher: Send + Sync {
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn BackendHandle>>;
}

/// A running backend instance
pub trait BackendHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit description if the instance has exited, `None` while it runs
    fn exit_status(&mut self) -> Option<String>;

    /// Ask the instance to exit (SIGTERM)
    fn terminate(&mut self);

    /// Wait for the instance to exit
    fn wait(&mut self) -> BoxFuture<'_, ()>;

    /// Force the instance to exit (SIGKILL) and reap it
    fn kill(&mut self) -> BoxFuture<'_, ()>;
}

/// Launches routes as child processes
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&self, request: &LaunchRequest<'_>) -> Result<Box<dyn BackendHandle>> {
        let route = request.route;
        let launch = &route.launch;
        let args = launch.args_for_port(request.port);

        info!(
            route = %route.prefix,
            program = %launch.program,
            port = request.port,
            "Starting backend process"
        );

        let mut cmd = Command::new(&launch.program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Own process group so signals reach the whole terminal session
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(ref working_dir) = launch.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        cmd.env("PORT", request.port.to_string());
        cmd.env("TTYGATE_INTERFACE", request.interface);

        if let Some(ref params_file) = request.params_file {
            cmd.env(ROUTE_PATH_ENV, &route.prefix);
            cmd.env(PARAMS_FILE_ENV, params_file);
        }

        let mut child = cmd.spawn().map_err(|e| GatewayError::Spawn {
            prefix: route.prefix.clone(),
            reason: format!("{}: {}", launch.program, e),
        })?;

        let pid = child.id();
        info!(route = %route.prefix, pid, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(route.prefix.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(route.prefix.clone(), "stderr", stderr);
        }

        Ok(Box::new(ChildHandle { child, pid }))
    }
}

/// Forward a backend's output stream into the log, line by line
fn forward_output<R>(route: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(target: "backend", route = %route, stream, "{}", line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(route = %route, stream, error = %e, "Error reading backend output");
                    break;
                }
            }
        }
    });
}

struct ChildHandle {
    child: Child,
    pid: Option<u32>,
}

impl ChildHandle {
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        if let Some(pid) = self.pid {
            // SAFETY: kill(2) with a negative pid signals the process group we created
            unsafe {
                libc::kill(-(pid as libc::pid_t), signal);
            }
        }
    }
}

impl BackendHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {}", e)),
        }
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGTERM);

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }

    fn wait(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.child.wait().await {
                warn!(pid = self.pid, error = %e, "Error waiting for backend to exit");
            }
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            #[cfg(unix)]
            self.signal_group(libc::SIGKILL);

            let _ = self.child.kill().await;
        })
    }
}
