//! Per-source-IP concurrency slots.
//!
//! Caps the number of in-flight connections from a single client IP.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;

/// Counted admission slots keyed by source IP.
///
/// `acquire` increments the source's counter unless it is at the cap;
/// `release` decrements and reaps empty entries.
#[derive(Debug, Clone)]
pub struct SourceLimiter {
    max_per_source: usize,
    counts: Arc<DashMap<IpAddr, usize>>,
}

impl SourceLimiter {
    /// Create a limiter allowing `max_per_source` concurrent connections per
    /// source IP. Returns None when the cap is zero (disabled).
    pub fn new(max_per_source: usize) -> Option<Self> {
        if max_per_source == 0 {
            return None;
        }
        Some(Self {
            max_per_source,
            counts: Arc::new(DashMap::new()),
        })
    }

    /// Try to take a slot for `ip`. Returns false when the source is at cap.
    pub fn acquire(&self, ip: IpAddr) -> bool {
        let mut entry = self.counts.entry(ip).or_insert(0);
        if *entry >= self.max_per_source {
            return false;
        }
        *entry += 1;
        true
    }

    /// Return a slot previously taken with `acquire`.
    pub fn release(&self, ip: IpAddr) {
        if let Some(mut entry) = self.counts.get_mut(&ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                drop(entry);
                self.counts.remove_if(&ip, |_, count| *count == 0);
            }
        }
    }

    /// Number of slots currently held by `ip`.
    pub fn in_flight(&self, ip: IpAddr) -> usize {
        self.counts.get(&ip).map(|e| *e).unwrap_or(0)
    }

    /// Number of sources currently holding at least one slot.
    pub fn source_count(&self) -> usize {
        self.counts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_zero_cap_disables() {
        assert!(SourceLimiter::new(0).is_none());
    }

    #[test]
    fn test_acquire_up_to_cap() {
        let limiter = SourceLimiter::new(2).unwrap();
        assert!(limiter.acquire(ip("1.2.3.4")));
        assert!(limiter.acquire(ip("1.2.3.4")));
        assert!(!limiter.acquire(ip("1.2.3.4")));
        assert_eq!(limiter.in_flight(ip("1.2.3.4")), 2);
    }

    #[test]
    fn test_sources_are_independent() {
        let limiter = SourceLimiter::new(1).unwrap();
        assert!(limiter.acquire(ip("1.2.3.4")));
        assert!(limiter.acquire(ip("5.6.7.8")));
        assert!(!limiter.acquire(ip("1.2.3.4")));
        assert_eq!(limiter.source_count(), 2);
    }

    #[test]
    fn test_release_frees_slot() {
        let limiter = SourceLimiter::new(1).unwrap();
        assert!(limiter.acquire(ip("1.2.3.4")));
        assert!(!limiter.acquire(ip("1.2.3.4")));
        limiter.release(ip("1.2.3.4"));
        assert!(limiter.acquire(ip("1.2.3.4")));
    }

    #[test]
    fn test_release_reaps_empty_entries() {
        let limiter = SourceLimiter::new(4).unwrap();
        assert!(limiter.acquire(ip("1.2.3.4")));
        limiter.release(ip("1.2.3.4"));
        assert_eq!(limiter.source_count(), 0);
    }

    #[test]
    fn test_release_without_acquire_is_harmless() {
        let limiter = SourceLimiter::new(1).unwrap();
        limiter.release(ip("9.9.9.9"));
        assert!(limiter.acquire(ip("9.9.9.9")));
    }

    #[test]
    fn test_concurrent_acquire_release() {
        use std::thread;

        let limiter = SourceLimiter::new(3).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let l = limiter.clone();
                thread::spawn(move || {
                    let addr = ip(&format!("10.0.0.{}", i % 2));
                    for _ in 0..200 {
                        if l.acquire(addr) {
                            l.release(addr);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(limiter.source_count(), 0);
    }
}
