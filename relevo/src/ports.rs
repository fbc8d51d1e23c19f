//! Pool of internal listening ports handed out to instances.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::{Error, Result};

/// Hands out unique ports from a configured `[from, to)` range.
///
/// A rotating cursor keeps freshly released ports at the back of the queue:
/// a port that just went through a child's lifetime may still be in
/// TIME_WAIT, and an immediate `bind()` on it can fail even though the pool
/// considers it free.
#[derive(Debug)]
pub struct PortPool {
    from: u16,
    to: u16,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    cursor: u16,
    leased: HashSet<u16>,
}

impl PortPool {
    /// Creates a pool over `[from, to)`. Caller validates `from < to`.
    pub fn new(from: u16, to: u16) -> Self {
        debug_assert!(from < to);
        Self {
            from,
            to,
            inner: Mutex::new(Inner {
                cursor: 0,
                leased: HashSet::with_capacity(usize::from(to - from)),
            }),
        }
    }

    /// Leases the next free port, scanning at most the full range.
    pub fn reserve(&self) -> Result<u16> {
        let size = self.to - self.from;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        for _ in 0..size {
            let port = self.from + inner.cursor;
            inner.cursor = (inner.cursor + 1) % size;
            if inner.leased.insert(port) {
                return Ok(port);
            }
        }
        Err(Error::PortsExhausted)
    }

    /// Returns a port to the pool. No-op if the port is not leased.
    pub fn release(&self, port: u16) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.leased.remove(&port);
    }
}
