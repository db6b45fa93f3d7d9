//! Round-robin pools of backend slots.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::{BackendConnection, Destination};

/// The ordered set of backend slots serving one virtual host.
///
/// `next` hands out candidates round-robin without regard for readiness
/// or busyness; the dispatcher probes what it gets and keeps advancing.
/// The cursor advances before it reads, so index 0 is only returned once
/// the cursor has wrapped — callers that probe a full cycle see every
/// slot regardless.
pub struct Pool {
    slots: Vec<Arc<BackendConnection>>,
    cursor: AtomicUsize,
}

impl Pool {
    /// Builds a pool with one slot per destination, in order.
    pub fn new(destinations: Vec<Destination>) -> Pool {
        Pool {
            slots: destinations.into_iter().map(BackendConnection::new).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Number of slots in the pool.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slots at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The slots themselves, in configuration order.
    pub fn slots(&self) -> &[Arc<BackendConnection>] {
        &self.slots
    }

    /// Advances the cursor and returns the slot it lands on.
    ///
    /// Called concurrently from every request task; contended callers may
    /// observe the same index or skip one, which is harmless because the
    /// dispatcher re-checks readiness on whatever it receives.
    pub fn next(&self) -> Option<Arc<BackendConnection>> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = self
            .cursor
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
            % self.slots.len();
        Some(Arc::clone(&self.slots[idx]))
    }

    /// Schedules the initial connect on every slot.
    pub fn connect_all(&self) {
        for slot in &self.slots {
            Arc::clone(slot).connect();
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pool").field("slots", &self.slots).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> Pool {
        let dests = (0..n)
            .map(|i| Destination::parse(&format!("127.0.0.1:{}", 9000 + i)).unwrap())
            .collect();
        Pool::new(dests)
    }

    #[test]
    fn empty_pool_has_no_next() {
        let pool = Pool::new(Vec::new());
        assert!(pool.is_empty());
        assert!(pool.next().is_none());
    }

    #[test]
    fn advance_then_read_skips_index_zero_until_wrap() {
        let pool = pool_of(3);
        let order: Vec<String> = (0..4)
            .map(|_| pool.next().unwrap().destination().authority().to_owned())
            .collect();
        // Cursor starts at 0 and advances before reading: 1, 2, wrap to
        // 0, then 1 again.
        assert_eq!(
            order,
            [
                "127.0.0.1:9001",
                "127.0.0.1:9002",
                "127.0.0.1:9000",
                "127.0.0.1:9001"
            ]
        );
    }

    #[test]
    fn two_cycles_cover_every_slot() {
        let pool = pool_of(5);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..(2 * pool.len()) {
            let slot = pool.next().unwrap();
            seen.insert(slot.destination().authority().to_owned());
        }
        assert_eq!(seen.len(), pool.len());
    }

    #[test]
    fn single_slot_pool_always_returns_it() {
        let pool = pool_of(1);
        for _ in 0..3 {
            let slot = pool.next().unwrap();
            assert_eq!(slot.destination().authority(), "127.0.0.1:9000");
        }
    }
}
