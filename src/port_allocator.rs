//! Port Allocator, §4.3.
//!
//! Range-bounded, concurrency-safe reservation of TCP/UDP ports. The
//! allocator only reserves the *number* — the caller performs the actual
//! bind and must [`PortAllocator::release`] on bind failure.

use crate::error::PortAllocError;
use std::collections::HashSet;
use std::sync::Mutex;

pub struct PortAllocator {
    min: u16,
    max: u16,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        assert!(min <= max, "port range min must be <= max");
        Self { min, max, used: Mutex::new(HashSet::new()) }
    }

    /// Reserve `requested` if nonzero (must be in range and free), else the
    /// first free port in the configured range.
    pub fn allocate(&self, requested: u16) -> Result<u16, PortAllocError> {
        let mut used = self.used.lock().expect("port allocator mutex poisoned");
        if requested != 0 {
            if requested < self.min || requested > self.max {
                return Err(PortAllocError::OutOfRange(requested));
            }
            if !used.insert(requested) {
                return Err(PortAllocError::InUse(requested));
            }
            return Ok(requested);
        }
        for port in self.min..=self.max {
            if used.insert(port) {
                return Ok(port);
            }
        }
        Err(PortAllocError::Exhausted)
    }

    /// Idempotent: releasing a port that isn't held is a no-op.
    pub fn release(&self, port: u16) {
        self.used.lock().expect("port allocator mutex poisoned").remove(&port);
    }

    pub fn in_use_count(&self) -> usize {
        self.used.lock().expect("port allocator mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allocates_requested_port() {
        let alloc = PortAllocator::new(100, 110);
        assert_eq!(alloc.allocate(105).unwrap(), 105);
    }

    #[test]
    fn rejects_out_of_range() {
        let alloc = PortAllocator::new(100, 110);
        assert!(matches!(alloc.allocate(50), Err(PortAllocError::OutOfRange(50))));
    }

    #[test]
    fn rejects_double_allocate() {
        let alloc = PortAllocator::new(100, 110);
        alloc.allocate(105).unwrap();
        assert!(matches!(alloc.allocate(105), Err(PortAllocError::InUse(105))));
    }

    #[test]
    fn release_is_idempotent() {
        let alloc = PortAllocator::new(100, 110);
        alloc.release(105);
        alloc.release(105);
        assert_eq!(alloc.allocate(105).unwrap(), 105);
    }

    #[test]
    fn scans_for_first_free_port() {
        let alloc = PortAllocator::new(100, 102);
        assert_eq!(alloc.allocate(0).unwrap(), 100);
        assert_eq!(alloc.allocate(0).unwrap(), 101);
        assert_eq!(alloc.allocate(0).unwrap(), 102);
        assert!(matches!(alloc.allocate(0), Err(PortAllocError::Exhausted)));
    }

    #[test]
    fn concurrent_allocate_yields_distinct_ports() {
        const RANGE: u16 = 1000;
        let alloc = Arc::new(PortAllocator::new(20000, 20000 + RANGE - 1));
        let mut handles = Vec::new();
        for _ in 0..RANGE {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || alloc.allocate(0).unwrap()));
        }
        let mut ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), RANGE as usize);
        assert!(matches!(alloc.allocate(0), Err(PortAllocError::Exhausted)));
    }
}
