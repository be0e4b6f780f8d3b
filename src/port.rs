//! Local port allocation
//!
//! Ports are probed by connecting to `127.0.0.1:<port>`: a refused or
//! timed-out connect means nobody listens there. The probe is inherently
//! racy, a port may be taken between the probe and the backend's bind.
//! Ports handed to running units are additionally reserved so two units of
//! the same supervisor never receive the same port, even before either has
//! bound its listener.

use crate::common::net::loopback_addr;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Default per-probe connect timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default number of candidate ports tried before giving up
pub const DEFAULT_SEARCH_LIMIT: u16 = 100;

/// Check whether nothing accepts TCP connections on the loopback port.
pub async fn is_port_available(port: u16) -> bool {
    probe(port, DEFAULT_PROBE_TIMEOUT).await
}

async fn probe(port: u16, probe_timeout: Duration) -> bool {
    match timeout(probe_timeout, TcpStream::connect(loopback_addr(port))).await {
        Ok(Ok(_stream)) => false,
        Ok(Err(_)) | Err(_) => true,
    }
}

/// Bounded port allocator with reservation tracking
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
    probe_timeout: Duration,
    search_limit: u16,
}

impl PortAllocator {
    pub fn new(probe_timeout: Duration, search_limit: u16) -> Self {
        PortAllocator {
            reserved: Mutex::new(HashSet::new()),
            probe_timeout,
            search_limit: search_limit.max(1),
        }
    }

    /// Probe a single port with this allocator's timeout
    pub async fn is_available(&self, port: u16) -> bool {
        probe(port, self.probe_timeout).await
    }

    /// Reserve the smallest free port `>= preferred`.
    ///
    /// At most `search_limit` candidates are examined; the search also stops
    /// at 65535.
    pub async fn allocate(&self, preferred: u16) -> Result<u16> {
        let end = preferred.saturating_add(self.search_limit - 1);
        let mut candidate = preferred;

        loop {
            if !self.is_reserved(candidate) && self.is_available(candidate).await {
                // Another caller may have reserved it while we probed.
                if self.reserved.lock().insert(candidate) {
                    if candidate != preferred {
                        debug!("Port {} in use, allocated {} instead", preferred, candidate);
                    }
                    return Ok(candidate);
                }
            } else {
                trace!("Port {} unavailable", candidate);
            }

            if candidate >= end {
                return Err(Error::NoAvailablePort {
                    start: preferred,
                    end,
                });
            }
            candidate += 1;
        }
    }

    /// Return a reserved port to the pool
    pub fn release(&self, port: u16) {
        self.reserved.lock().remove(&port);
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    /// Number of currently reserved ports
    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT, DEFAULT_SEARCH_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Bind an ephemeral port and keep it open
    async fn occupied() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// Find an ephemeral port and close it again
    async fn free_port() -> u16 {
        let (listener, port) = occupied().await;
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_occupied_port_is_unavailable() {
        let (_listener, port) = occupied().await;
        assert!(!is_port_available(port).await);
    }

    #[tokio::test]
    async fn test_free_port_is_allocated_exactly() {
        let allocator = PortAllocator::default();
        let port = free_port().await;
        assert_eq!(allocator.allocate(port).await.unwrap(), port);
        assert!(allocator.is_reserved(port));
    }

    #[tokio::test]
    async fn test_occupied_port_is_skipped() {
        let allocator = PortAllocator::default();
        let (_listener, port) = occupied().await;
        let allocated = allocator.allocate(port).await.unwrap();
        assert!(allocated > port);
    }

    #[tokio::test]
    async fn test_reserved_port_is_skipped_and_released() {
        let allocator = PortAllocator::default();
        let port = free_port().await;

        let first = allocator.allocate(port).await.unwrap();
        let second = allocator.allocate(port).await.unwrap();
        assert_eq!(first, port);
        assert!(second > first);
        assert_eq!(allocator.reserved_count(), 2);

        allocator.release(first);
        assert!(!allocator.is_reserved(first));
        assert_eq!(allocator.allocate(port).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_search_is_bounded() {
        let allocator = PortAllocator::new(DEFAULT_PROBE_TIMEOUT, 1);
        let (_listener, port) = occupied().await;

        match allocator.allocate(port).await {
            Err(Error::NoAvailablePort { start, end }) => {
                assert_eq!(start, port);
                assert_eq!(end, port);
            }
            other => panic!("expected NoAvailablePort, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_search_stops_at_max_port() {
        let allocator = PortAllocator::new(DEFAULT_PROBE_TIMEOUT, 10);
        allocator.reserved.lock().insert(u16::MAX);
        assert!(matches!(
            allocator.allocate(u16::MAX).await,
            Err(Error::NoAvailablePort { .. })
        ));
    }
}
