//! Process-wide link counter.
//!
//! Every upgraded socket holds a [`LinkPermit`]. Acquiring increments the
//! shared counter; dropping the permit decrements it, so a rejected or
//! abandoned upgrade can never leak capacity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::RelayError;

/// Shared counter of live WebSocket links, bounded by `limit`.
///
/// Cloneable; all clones share the same counter.
#[derive(Clone)]
pub struct LinkCounter {
    count: Arc<AtomicUsize>,
    limit: usize,
}

/// Proof that one link slot is in use. Releases the slot on drop.
#[derive(Debug)]
pub struct LinkPermit {
    count: Arc<AtomicUsize>,
}

impl LinkCounter {
    pub fn new(limit: usize) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Claim a slot. Fails with [`RelayError::LinkLimitExceeded`] when the
    /// post-increment count would exceed the limit; the counter is restored
    /// before returning.
    pub fn acquire(&self) -> Result<LinkPermit, RelayError> {
        let permit = LinkPermit {
            count: Arc::clone(&self.count),
        };
        if self.count.fetch_add(1, Ordering::AcqRel) + 1 > self.limit {
            drop(permit);
            return Err(RelayError::LinkLimitExceeded { limit: self.limit });
        }
        Ok(permit)
    }

    /// Number of links currently held.
    pub fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Drop for LinkPermit {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_up_to_limit() {
        let links = LinkCounter::new(2);
        let a = links.acquire().unwrap();
        let b = links.acquire().unwrap();
        assert_eq!(links.current(), 2);
        drop(a);
        drop(b);
        assert_eq!(links.current(), 0);
    }

    #[test]
    fn test_rejection_restores_counter() {
        let links = LinkCounter::new(1);
        let _held = links.acquire().unwrap();
        let before = links.current();
        let err = links.acquire().unwrap_err();
        assert_eq!(err, RelayError::LinkLimitExceeded { limit: 1 });
        assert_eq!(links.current(), before);
    }

    #[test]
    fn test_clones_share_the_counter() {
        let links = LinkCounter::new(4);
        let other = links.clone();
        let _p = other.acquire().unwrap();
        assert_eq!(links.current(), 1);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_limit() {
        let links = LinkCounter::new(8);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let links = links.clone();
                std::thread::spawn(move || links.acquire().ok())
            })
            .collect();
        let granted: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert!(granted.len() <= 8);
        assert_eq!(links.current(), granted.len());
    }
}
