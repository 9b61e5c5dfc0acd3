use crate::auth::Credentials;
use crate::error::GatewayError;
use crate::process::RestartPolicy;
use crate::registry::{RouteSpec, RouteTarget};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// External listener and proxy settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend process supervision settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Terminal routes, in registration order
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// External port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Mount path all routes are nested under (default: /)
    #[serde(default = "default_mount_path")]
    pub mount_path: String,

    /// Set X-Forwarded-* headers on forwarded requests
    #[serde(default = "default_trust_proxy_headers")]
    pub trust_proxy_headers: bool,

    /// Global credentials; routes may override them
    pub credentials: Option<Credentials>,

    /// Concurrent terminal sessions per route (unlimited when unset)
    pub max_clients_per_route: Option<usize>,

    /// Seconds to let in-flight requests and tunnels finish on shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Milliseconds a tunnel waits for the second leg once the first closes
    #[serde(default = "default_tunnel_close_timeout")]
    pub tunnel_close_timeout_ms: u64,

    /// Request timeout in seconds (max time to wait for backend response headers)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn tunnel_close_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel_close_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            mount_path: default_mount_path(),
            trust_proxy_headers: default_trust_proxy_headers(),
            credentials: None,
            max_clients_per_route: None,
            drain_timeout_secs: default_drain_timeout(),
            tunnel_close_timeout_ms: default_tunnel_close_timeout(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// First port tried when allocating backend ports
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// How many ports above `base_port` may be probed
    #[serde(default = "default_port_search_range")]
    pub port_search_range: u16,

    /// Interface backends listen on; always loopback
    #[serde(default = "default_backend_interface")]
    pub backend_interface: String,

    /// Max time for a new backend to accept connections
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_ms: u64,

    /// Poll interval while waiting for readiness
    #[serde(default = "default_readiness_poll_interval")]
    pub readiness_poll_interval_ms: u64,

    /// Interval between health checks of running backends
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Timeout for a single health probe connection
    #[serde(default = "default_health_probe_timeout")]
    pub health_probe_timeout_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Directory for dynamic-route parameter files (default: system temp dir)
    pub params_dir: Option<String>,

    /// Restart policy for crashed backends
    #[serde(default)]
    pub restart: RestartConfig,
}

impl SupervisorConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn params_dir(&self) -> PathBuf {
        self.params_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_attempts: self.restart.max_attempts,
            initial_backoff: Duration::from_millis(self.restart.initial_backoff_ms),
            multiplier: self.restart.backoff_multiplier,
            max_backoff: Duration::from_millis(self.restart.max_backoff_ms),
            reset_after: Duration::from_secs(self.restart.reset_after_secs),
        }
    }

    /// Last port the allocator may hand out
    pub fn last_port(&self) -> u16 {
        self.base_port.saturating_add(self.port_search_range)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            port_search_range: default_port_search_range(),
            backend_interface: default_backend_interface(),
            readiness_timeout_ms: default_readiness_timeout(),
            readiness_poll_interval_ms: default_readiness_poll_interval(),
            health_check_interval_ms: default_health_interval(),
            health_probe_timeout_ms: default_health_probe_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            params_dir: None,
            restart: RestartConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RestartConfig {
    /// Restarts allowed before a route is marked failed
    #[serde(default = "default_max_restart_attempts")]
    pub max_attempts: u32,

    /// Delay before the first restart
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Growth factor applied per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Healthy time after which the restart counter resets
    #[serde(default = "default_reset_after")]
    pub reset_after_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_restart_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff(),
            reset_after_secs: default_reset_after(),
        }
    }
}

/// Configuration for a single terminal route
///
/// Exactly one of `command` or `script` must be set. `command` is split
/// with shell quoting rules; `args` are appended after it.
///
/// # Security Warning
///
/// `command` and `script` are executed directly. Configuration files must be
/// protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RouteConfig {
    /// URL path prefix under the mount path
    pub path: String,

    /// Display title
    pub title: Option<String>,

    /// Command line to run (e.g. "ttyd -p {port} bash")
    pub command: Option<String>,

    /// Script to run through `interpreter`
    pub script: Option<String>,

    /// Interpreter for `script` (default: python3)
    pub interpreter: Option<String>,

    /// Extra arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the backend
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Backend accepts runtime arguments from the connecting client
    #[serde(default)]
    pub dynamic: bool,

    /// Auto-generated index route; explicit routes take precedence
    #[serde(default)]
    pub index: bool,

    /// Credentials for this route (overrides server credentials)
    pub credentials: Option<Credentials>,

    /// Concurrent sessions for this route (overrides server setting)
    pub max_clients: Option<usize>,
}

impl RouteConfig {
    /// Resolve into a route specification
    pub fn to_spec(&self) -> Result<RouteSpec, GatewayError> {
        let target = match (&self.command, &self.script) {
            (Some(command), None) => {
                let mut words = shell_words::split(command).map_err(|e| {
                    GatewayError::Config(format!("route '{}': invalid command: {}", self.path, e))
                })?;
                if words.is_empty() {
                    return Err(GatewayError::Config(format!(
                        "route '{}': 'command' is empty",
                        self.path
                    )));
                }
                let program = words.remove(0);
                words.extend(self.args.iter().cloned());
                RouteTarget::Command {
                    program,
                    args: words,
                }
            }
            (None, Some(script)) => RouteTarget::Script {
                interpreter: self
                    .interpreter
                    .clone()
                    .unwrap_or_else(|| "python3".to_string()),
                script: PathBuf::from(script),
                args: self.args.clone(),
            },
            (Some(_), Some(_)) => {
                return Err(GatewayError::Config(format!(
                    "route '{}': set either 'command' or 'script', not both",
                    self.path
                )))
            }
            (None, None) => {
                return Err(GatewayError::Config(format!(
                    "route '{}': requires 'command' or 'script'",
                    self.path
                )))
            }
        };

        Ok(RouteSpec {
            prefix: self.path.clone(),
            title: self.title.clone(),
            target,
            working_dir: self.working_dir.as_ref().map(PathBuf::from),
            env: self.env.clone(),
            dynamic: self.dynamic,
            index: self.index,
            credentials: self.credentials.clone(),
            max_clients: self.max_clients,
        })
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_mount_path() -> String {
    "/".to_string()
}

fn default_trust_proxy_headers() -> bool {
    true
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_tunnel_close_timeout() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_base_port() -> u16 {
    7681
}

fn default_port_search_range() -> u16 {
    1000
}

fn default_backend_interface() -> String {
    "127.0.0.1".to_string()
}

fn default_readiness_timeout() -> u64 {
    5000
}

fn default_readiness_poll_interval() -> u64 {
    100
}

fn default_health_interval() -> u64 {
    5000
}

fn default_health_probe_timeout() -> u64 {
    1000
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_reset_after() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve every route entry into a specification
    pub fn route_specs(&self) -> Result<Vec<RouteSpec>, GatewayError> {
        self.routes.iter().map(RouteConfig::to_spec).collect()
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.supervisor.base_port == 0 {
            errors.push("supervisor.base_port must be greater than 0".to_string());
        }

        if self.supervisor.backend_interface != "127.0.0.1"
            && self.supervisor.backend_interface != "::1"
            && self.supervisor.backend_interface != "localhost"
        {
            errors.push(format!(
                "supervisor.backend_interface must be loopback, got '{}'",
                self.supervisor.backend_interface
            ));
        }

        if self.supervisor.restart.backoff_multiplier < 1.0 {
            errors.push("supervisor.restart.backoff_multiplier must be >= 1.0".to_string());
        }

        for route in &self.routes {
            if let Err(e) = route.to_spec() {
                errors.push(e.to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
mount_path = "/terminals"
max_clients_per_route = 4

[server.credentials]
username = "admin"
password = "secret"

[supervisor]
base_port = 9000
health_check_interval_ms = 250

[supervisor.restart]
max_attempts = 5

[[routes]]
path = "/shell"
title = "Shell"
command = "ttyd -p {port} bash"

[[routes]]
path = "/snake"
script = "games/snake.py"
args = ["--fast"]
dynamic = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.mount_path, "/terminals");
        assert_eq!(config.server.max_clients_per_route, Some(4));
        assert_eq!(
            config.server.credentials,
            Some(Credentials::new("admin", "secret"))
        );
        assert_eq!(config.supervisor.base_port, 9000);
        assert_eq!(config.supervisor.restart.max_attempts, 5);
        assert_eq!(config.routes.len(), 2);
        assert!(config.routes[1].dynamic);
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.mount_path, "/");
        assert!(config.trust_proxy_headers);
        assert_eq!(config.drain_timeout(), Duration::from_secs(10));
        assert_eq!(config.tunnel_close_timeout(), Duration::from_millis(2000));
        assert_eq!(config.pool_max_idle_per_host, 10);
    }

    #[test]
    fn test_default_supervisor_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.base_port, 7681);
        assert_eq!(config.last_port(), 8681);
        assert_eq!(config.backend_interface, "127.0.0.1");
        assert_eq!(config.readiness_timeout(), Duration::from_secs(5));
        assert_eq!(config.health_check_interval(), Duration::from_secs(5));
        assert_eq!(config.shutdown_grace_period(), Duration::from_secs(5));

        let policy = config.restart_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_backoff, Duration::from_secs(10));
        assert_eq!(policy.reset_after, Duration::from_secs(60));
    }

    #[test]
    fn test_last_port_saturates() {
        let config = SupervisorConfig {
            base_port: 65000,
            port_search_range: 2000,
            ..Default::default()
        };
        assert_eq!(config.last_port(), u16::MAX);
    }

    #[test]
    fn test_command_route_is_split() {
        let route: RouteConfig = toml::from_str(
            r#"
path = "/shell"
command = "ttyd -p {port} 'bash --login'"
args = ["-x"]
"#,
        )
        .unwrap();

        let spec = route.to_spec().unwrap();
        match spec.target {
            RouteTarget::Command { program, args } => {
                assert_eq!(program, "ttyd");
                assert_eq!(args, vec!["-p", "{port}", "bash --login", "-x"]);
            }
            other => panic!("unexpected target: {:?}", other),
        }
    }

    #[test]
    fn test_script_route_defaults_interpreter() {
        let route: RouteConfig = toml::from_str(
            r#"
path = "/snake"
script = "snake.py"
"#,
        )
        .unwrap();

        match route.to_spec().unwrap().target {
            RouteTarget::Script { interpreter, script, .. } => {
                assert_eq!(interpreter, "python3");
                assert_eq!(script, PathBuf::from("snake.py"));
            }
            other => panic!("unexpected target: {:?}", other),
        }
    }

    #[test]
    fn test_route_requires_exactly_one_target() {
        let neither = RouteConfig {
            path: "/x".to_string(),
            ..Default::default()
        };
        assert!(neither.to_spec().is_err());

        let both = RouteConfig {
            path: "/x".to_string(),
            command: Some("bash".to_string()),
            script: Some("x.py".to_string()),
            ..Default::default()
        };
        assert!(both.to_spec().is_err());
    }

    #[test]
    fn test_validate_rejects_public_backend_interface() {
        let config: Config = toml::from_str(
            r#"
[supervisor]
backend_interface = "0.0.0.0"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("loopback"));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.supervisor.base_port, 7681);
        assert!(config.routes.is_empty());
        assert!(config.validate().is_ok());
    }
}
