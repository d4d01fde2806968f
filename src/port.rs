//! Local port allocation by bind probing
//!
//! A port is considered free when a transient listener can bind it. The
//! listener is closed before the port is handed out, so another process can
//! still grab it before the child binds; that failure surfaces through the
//! child's own error output.
//!
//! Ports handed to live instances are tracked in [`PortClaims`]. A claim is
//! taken before the probe and held until the instance is torn down, so two
//! starts racing on different names never receive the same port.

use crate::error::PreviewError;
use dashmap::DashSet;
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Check whether `port` can currently be bound on the loopback interface
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Ports currently owned by live instances
#[derive(Debug, Default)]
pub struct PortClaims {
    claimed: DashSet<u16>,
}

impl PortClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a free port, starting at `preferred_start` and counting upwards.
    ///
    /// Claimed ports are skipped without probing; their child may not have
    /// bound yet. The returned port stays claimed until [`release`](Self::release).
    pub fn allocate(&self, preferred_start: u16) -> Result<u16, PreviewError> {
        let mut port = preferred_start.max(1);
        loop {
            // insert is the atomic test-and-set
            if self.claimed.insert(port) {
                if is_port_free(port) {
                    debug!(port, "Allocated port");
                    return Ok(port);
                }
                self.claimed.remove(&port);
                debug!(port, "Port in use, trying next");
            }
            port = port
                .checked_add(1)
                .ok_or(PreviewError::AllocationFailure { start: preferred_start })?;
        }
    }

    /// Give `port` back once its instance is gone
    pub fn release(&self, port: u16) -> bool {
        self.claimed.remove(&port).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_allocate_returns_bindable_port() {
        let claims = PortClaims::new();
        let port = claims.allocate(20000).unwrap();
        assert!(port >= 20000);
        assert!(is_port_free(port));
        assert!(claims.claimed.contains(&port));
    }

    #[test]
    fn test_allocate_skips_port_in_use() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = held.local_addr().unwrap().port();

        let claims = PortClaims::new();
        let port = claims.allocate(busy).unwrap();
        assert!(port > busy);
        assert!(!claims.claimed.contains(&busy));
    }

    #[test]
    fn test_allocate_skips_claimed_ports() {
        let claims = PortClaims::new();
        let first = claims.allocate(21000).unwrap();
        let second = claims.allocate(first).unwrap();
        assert_ne!(first, second);

        assert!(claims.release(first));
        assert!(!claims.release(first));
        assert_eq!(claims.claimed.len(), 1);
        assert_eq!(claims.allocate(first).unwrap(), first);
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let claims = Arc::new(PortClaims::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let claims = Arc::clone(&claims);
                std::thread::spawn(move || claims.allocate(22000).unwrap())
            })
            .collect();

        let ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
    }

    #[test]
    fn test_allocate_exhaustion() {
        let claims = PortClaims::new();
        claims.claimed.insert(u16::MAX);
        let result = claims.allocate(u16::MAX);
        assert!(matches!(result, Err(PreviewError::AllocationFailure { .. })));
        assert!(claims.claimed.contains(&u16::MAX));
    }
}
