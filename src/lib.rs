//! ttygate - Serves many terminal backends behind a single port
//!
//! This library provides a process supervisor plus reverse proxy that:
//! - Maps URL path prefixes to terminal backend processes
//! - Allocates a free loopback port for each backend and waits until it listens
//! - Monitors backend health and restarts crashed backends with backoff
//! - Forwards plain HTTP requests and tunnels upgraded connections byte-for-byte
//! - Drains open terminal sessions before stopping backends on shutdown

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod healthcheck;
pub mod launcher;
pub mod params;
pub mod pool;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod tunnel;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
