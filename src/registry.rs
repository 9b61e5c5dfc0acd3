//! Route registry
//!
//! Maps URL path prefixes to terminal backends. The registry is built once at
//! startup and shared read-only behind an `Arc` afterwards.
//!
//! Matching rules:
//! - prefixes are normalized to a leading slash and no trailing slash
//! - a prefix matches a path only on segment boundaries (`/a` matches `/a`
//!   and `/a/b`, never `/ab`)
//! - the longest matching prefix wins
//! - explicit routes always win over index routes

use crate::auth::Credentials;
use crate::error::{GatewayError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// What a route runs
#[derive(Debug, Clone, PartialEq)]
pub enum RouteTarget {
    /// Run a program directly
    Command { program: String, args: Vec<String> },
    /// Run a script through an interpreter
    Script {
        interpreter: String,
        script: PathBuf,
        args: Vec<String>,
    },
}

impl RouteTarget {
    /// Program and arguments to execute
    pub fn argv(&self) -> (String, Vec<String>) {
        match self {
            RouteTarget::Command { program, args } => (program.clone(), args.clone()),
            RouteTarget::Script {
                interpreter,
                script,
                args,
            } => {
                let mut argv = Vec::with_capacity(args.len() + 1);
                argv.push(script.to_string_lossy().into_owned());
                argv.extend(args.iter().cloned());
                (interpreter.clone(), argv)
            }
        }
    }
}

/// Fully resolved launch parameters for a backend
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    /// Arguments; `{port}` is replaced with the allocated port at launch
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    /// Arguments with `{port}` substituted
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{port}", &port))
            .collect()
    }
}

/// Input for registering a route
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub prefix: String,
    pub title: Option<String>,
    pub target: RouteTarget,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub dynamic: bool,
    pub index: bool,
    pub credentials: Option<Credentials>,
    pub max_clients: Option<usize>,
}

impl RouteSpec {
    /// Minimal spec running `program` with `args`
    pub fn command(prefix: &str, program: &str, args: &[&str]) -> Self {
        Self {
            prefix: prefix.to_string(),
            title: None,
            target: RouteTarget::Command {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
            working_dir: None,
            env: HashMap::new(),
            dynamic: false,
            index: false,
            credentials: None,
            max_clients: None,
        }
    }
}

/// A registered route
#[derive(Debug, Clone)]
pub struct Route {
    /// Normalized prefix, also the route's identity
    pub prefix: String,
    pub title: String,
    pub launch: LaunchSpec,
    pub dynamic: bool,
    pub index: bool,
    pub credentials: Option<Credentials>,
    pub max_clients: Option<usize>,
}

/// Normalize a prefix to a leading slash and no trailing slash
///
/// Empty segments are dropped, so `""`, `"/"` and `"//"` all become `"/"`.
pub fn normalize_prefix(raw: &str) -> String {
    let segments: Vec<&str> = raw
        .trim()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    format!("/{}", segments.join("/"))
}

/// Whether `prefix` matches `path` on a segment boundary
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Strip a matched prefix, keeping the remainder rooted at `/`
pub fn strip_prefix<'a>(prefix: &str, path: &'a str) -> &'a str {
    if prefix == "/" {
        return if path.is_empty() { "/" } else { path };
    }
    match path.strip_prefix(prefix) {
        Some("") | None => "/",
        Some(rest) => rest,
    }
}

/// Default title derived from the prefix
fn default_title(prefix: &str) -> String {
    match prefix.rsplit('/').find(|s| !s.is_empty()) {
        Some(last) => last.to_string(),
        None => "Terminal".to_string(),
    }
}

/// Registered routes in registration order
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: Vec<Arc<Route>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from specs, failing on the first conflict
    pub fn from_specs(specs: Vec<RouteSpec>) -> Result<Self> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    /// Register a route
    ///
    /// Fails with `RouteConflict` when an equal prefix, or one equal ignoring
    /// ASCII case, is already registered. An explicit route replaces an index
    /// route at the same prefix; an index route is ignored when an explicit
    /// route already holds it.
    pub fn register(&mut self, spec: RouteSpec) -> Result<Arc<Route>> {
        let prefix = normalize_prefix(&spec.prefix);

        if let Some(pos) = self
            .routes
            .iter()
            .position(|r| r.prefix.eq_ignore_ascii_case(&prefix))
        {
            let existing = &self.routes[pos];
            match (existing.index, spec.index, existing.prefix == prefix) {
                (true, false, true) => {
                    info!(prefix = %prefix, "Explicit route replaces index route");
                    self.routes.remove(pos);
                }
                (false, true, true) => {
                    debug!(prefix = %prefix, "Index route shadowed by explicit route");
                    return Ok(Arc::clone(&self.routes[pos]));
                }
                _ => {
                    return Err(GatewayError::RouteConflict {
                        prefix,
                        existing: existing.prefix.clone(),
                    })
                }
            }
        }

        let (program, args) = spec.target.argv();
        let route = Arc::new(Route {
            title: spec.title.unwrap_or_else(|| default_title(&prefix)),
            launch: LaunchSpec {
                program,
                args,
                working_dir: spec.working_dir,
                env: spec.env,
            },
            dynamic: spec.dynamic,
            index: spec.index,
            credentials: spec.credentials,
            max_clients: spec.max_clients,
            prefix,
        });

        debug!(prefix = %route.prefix, program = %route.launch.program, "Registered route");
        self.routes.push(Arc::clone(&route));
        Ok(route)
    }

    /// Register an auto-generated index route at `spec.prefix`
    ///
    /// Yields to an explicit route already holding the prefix.
    pub fn register_index(&mut self, mut spec: RouteSpec) -> Result<Arc<Route>> {
        spec.index = true;
        self.register(spec)
    }

    /// Find the route serving `path`
    pub fn resolve(&self, path: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .filter(|r| prefix_matches(&r.prefix, path))
            .max_by_key(|r| (!r.index, r.prefix.len()))
            .cloned()
    }

    /// Look up a route by its normalized prefix
    pub fn get(&self, prefix: &str) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.prefix == prefix).cloned()
    }

    /// All routes in registration order
    pub fn list(&self) -> Vec<Arc<Route>> {
        self.routes.clone()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
