//! Backend port allocation
//!
//! Ports are handed out from `base..=last` by probing upward. Each port
//! lives inside a [`PortReservation`] and is released when that is dropped.
//! A port is never handed out while its reservation is still alive.

use crate::error::{GatewayError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::Arc;
use tracing::debug;

/// Decides whether the OS would let a backend bind a port
pub trait PortProbe: Send + Sync {
    fn is_available(&self, port: u16) -> bool;
}

/// Probe by binding a TCP listener on the backend interface
#[derive(Debug, Clone)]
pub struct TcpBindProbe {
    interface: IpAddr,
}

impl TcpBindProbe {
    pub fn new(interface: IpAddr) -> Self {
        Self { interface }
    }
}

impl Default for TcpBindProbe {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortProbe for TcpBindProbe {
    fn is_available(&self, port: u16) -> bool {
        TcpListener::bind((self.interface, port)).is_ok()
    }
}

pub struct PortAllocator {
    start: u16,
    end: u16,
    reserved: Mutex<HashSet<u16>>,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16, probe: Arc<dyn PortProbe>) -> Arc<Self> {
        Arc::new(Self {
            start,
            end: end.max(start),
            reserved: Mutex::new(HashSet::new()),
            probe,
        })
    }

    /// Reserve the lowest port that is neither reserved nor bound
    ///
    /// Checking and inserting happen under one lock, so concurrent callers
    /// never receive the same port.
    pub fn reserve(self: &Arc<Self>) -> Result<PortReservation> {
        let mut reserved = self.reserved.lock();

        for port in self.start..=self.end {
            if reserved.contains(&port) {
                continue;
            }
            if !self.probe.is_available(port) {
                debug!(port, "Port in use, probing next");
                continue;
            }

            reserved.insert(port);
            debug!(port, "Reserved backend port");
            return Ok(PortReservation {
                port,
                allocator: Arc::clone(self),
            });
        }

        Err(GatewayError::PortAllocation {
            start: self.start,
            end: self.end,
        })
    }

    fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            debug!(port, "Released backend port");
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    /// Currently reserved ports, sorted
    pub fn reserved_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.reserved.lock().iter().copied().collect();
        ports.sort_unstable();
        ports
    }
}

/// Exclusive claim on a backend port
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("reserved", &self.reserved_ports())
            .finish()
    }
}
