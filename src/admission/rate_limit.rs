//! Accept-rate limiting and connection caps, §4.4 steps 2-3.

use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter as GovernorLimiter};
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type GlobalLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token-bucket accept-rate limiting, global and per-IP, plus the
/// connection-count caps from §4.4 step 3.
pub struct AdmissionLimits {
    global_rate: GlobalLimiter,
    per_ip_rate: Mutex<HashMap<IpAddr, GlobalLimiter>>,
    per_ip_quota: Quota,
    global_conns: AtomicUsize,
    max_global_conns: usize,
    per_ip_conns: Mutex<HashMap<IpAddr, usize>>,
    max_conns_per_ip: usize,
}

impl AdmissionLimits {
    pub fn new(
        global_rate_per_sec: u32,
        per_ip_rate_per_sec: u32,
        max_global_conns: usize,
        max_conns_per_ip: usize,
    ) -> Self {
        let global_quota =
            Quota::per_second(NonZeroU32::new(global_rate_per_sec.max(1)).unwrap())
                .allow_burst(NonZeroU32::new(global_rate_per_sec.max(1)).unwrap());
        let per_ip_quota =
            Quota::per_second(NonZeroU32::new(per_ip_rate_per_sec.max(1)).unwrap())
                .allow_burst(NonZeroU32::new(per_ip_rate_per_sec.max(1)).unwrap());

        Self {
            global_rate: GovernorLimiter::direct(global_quota),
            per_ip_rate: Mutex::new(HashMap::new()),
            per_ip_quota,
            global_conns: AtomicUsize::new(0),
            max_global_conns,
            per_ip_conns: Mutex::new(HashMap::new()),
            max_conns_per_ip,
        }
    }

    /// Checks the global accept-rate bucket. Authenticated/trusted IPs
    /// still consume from this bucket — only the per-IP bucket is
    /// bypassed for them.
    pub fn check_global_rate(&self) -> bool {
        self.global_rate.check().is_ok()
    }

    /// Checks the per-IP accept-rate bucket. `trusted` IPs (an
    /// authenticated client's remote address, for the life of the
    /// session — data-session joins legitimately need many connections)
    /// always pass.
    pub fn check_per_ip_rate(&self, ip: IpAddr, trusted: bool) -> bool {
        if trusted {
            return true;
        }
        let mut buckets = self.per_ip_rate.lock().expect("rate limiter mutex poisoned");
        let limiter = buckets
            .entry(ip)
            .or_insert_with(|| GovernorLimiter::direct(self.per_ip_quota));
        limiter.check().is_ok()
    }

    /// Attempts to reserve one global + one per-IP connection slot.
    /// Returns `false` (and releases anything it reserved) if either cap
    /// is full.
    pub fn try_reserve(&self, ip: IpAddr) -> bool {
        let prev = self.global_conns.fetch_add(1, Ordering::AcqRel);
        if prev >= self.max_global_conns {
            self.global_conns.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        let mut per_ip = self.per_ip_conns.lock().expect("conn cap mutex poisoned");
        let count = per_ip.entry(ip).or_insert(0);
        if *count >= self.max_conns_per_ip {
            self.global_conns.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        *count += 1;
        true
    }

    pub fn release(&self, ip: IpAddr) {
        self.global_conns.fetch_sub(1, Ordering::AcqRel);
        let mut per_ip = self.per_ip_conns.lock().expect("conn cap mutex poisoned");
        if let Some(count) = per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
    }

    pub fn global_conn_count(&self) -> usize {
        self.global_conns.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_global_connections() {
        let limits = AdmissionLimits::new(1000, 1000, 2, 10);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limits.try_reserve(ip));
        assert!(limits.try_reserve(ip2));
        assert!(!limits.try_reserve(ip));
        limits.release(ip);
        assert!(limits.try_reserve(ip));
    }

    #[test]
    fn caps_per_ip_connections() {
        let limits = AdmissionLimits::new(1000, 1000, 100, 1);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limits.try_reserve(ip));
        assert!(!limits.try_reserve(ip));
    }

    #[test]
    fn trusted_ip_bypasses_per_ip_rate() {
        let limits = AdmissionLimits::new(1000, 1, 100, 100);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limits.check_per_ip_rate(ip, false));
        // Second call within the same instant would normally be denied by
        // a burst-1 bucket, but trusted bypasses entirely.
        assert!(limits.check_per_ip_rate(ip, true));
        assert!(limits.check_per_ip_rate(ip, true));
    }
}
