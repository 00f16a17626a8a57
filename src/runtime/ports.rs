//! Host port allocation pool
//!
//! The port namespace is shared across all instances and guarded by its
//! own lock, independent of per-instance serialization tokens.

use crate::utils::errors::{HubError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::debug;

/// Pool of locally-unique host ports
pub struct PortPool {
    start: u16,
    len: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(start: u16, len: u16) -> Self {
        Self {
            start,
            len,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve the lowest free port in the range
    pub fn allocate(&self) -> Result<u16> {
        let mut in_use = self.in_use.lock();
        for port in self.start..self.start.saturating_add(self.len) {
            if in_use.insert(port) {
                debug!(port, "allocated host port");
                return Ok(port);
            }
        }
        Err(HubError::AllocationFailed(format!(
            "no free port in {}..{}",
            self.start,
            self.start.saturating_add(self.len)
        )))
    }

    /// Return a port to the pool; releasing an unallocated port is a no-op
    pub fn release(&self, port: u16) {
        if self.in_use.lock().remove(&port) {
            debug!(port, "released host port");
        }
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_release() {
        let pool = PortPool::new(9000, 4);

        let p1 = pool.allocate().unwrap();
        let p2 = pool.allocate().unwrap();
        assert_ne!(p1, p2);
        assert_eq!(pool.in_use_count(), 2);

        pool.release(p1);
        assert_eq!(pool.in_use_count(), 1);

        // Released port becomes available again
        let p3 = pool.allocate().unwrap();
        assert_eq!(p3, p1);
    }

    #[test]
    fn test_exhaustion() {
        let pool = PortPool::new(9000, 2);
        pool.allocate().unwrap();
        pool.allocate().unwrap();

        let err = pool.allocate().unwrap_err();
        assert!(matches!(err, HubError::AllocationFailed(_)));
    }

    #[test]
    fn test_double_release_is_noop() {
        let pool = PortPool::new(9000, 2);
        let p = pool.allocate().unwrap();
        pool.release(p);
        pool.release(p);
        assert_eq!(pool.in_use_count(), 0);
    }
}
