//! IP-ban manager, §4.4.
//!
//! Tracks per-IP violation events (auth failures, flood events) and bans
//! an IP once its event count crosses a threshold within a sliding
//! window. Ban duration doubles with each successive ban, capped, and the
//! ban *count* persists across expirations until the IP has been quiet
//! for a full cleanup window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Auth,
    Flood,
}

struct ViolationRecord {
    auth_events: Vec<Instant>,
    flood_events: Vec<Instant>,
    last_event: Instant,
    ban_count: u32,
}

impl ViolationRecord {
    fn new(now: Instant) -> Self {
        Self { auth_events: Vec::new(), flood_events: Vec::new(), last_event: now, ban_count: 0 }
    }
}

struct Ban {
    until: Instant,
}

pub struct IpBanConfig {
    pub auth_threshold: u32,
    pub auth_window: Duration,
    pub flood_threshold: u32,
    pub flood_window: Duration,
    pub ban_duration: Duration,
    pub max_ban_duration: Duration,
    /// How long an IP must be quiet before its ban-count streak resets.
    pub cleanup_idle: Duration,
}

impl Default for IpBanConfig {
    fn default() -> Self {
        Self {
            auth_threshold: 5,
            auth_window: Duration::from_secs(300),
            flood_threshold: 20,
            flood_window: Duration::from_secs(10),
            ban_duration: Duration::from_secs(3600),
            max_ban_duration: Duration::from_secs(86400),
            cleanup_idle: Duration::from_secs(600),
        }
    }
}

pub struct IpBanManager {
    config: IpBanConfig,
    violations: Mutex<HashMap<IpAddr, ViolationRecord>>,
    bans: Mutex<HashMap<IpAddr, Ban>>,
}

impl IpBanManager {
    pub fn new(config: IpBanConfig) -> Self {
        Self { config, violations: Mutex::new(HashMap::new()), bans: Mutex::new(HashMap::new()) }
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let mut bans = self.bans.lock().expect("ban map mutex poisoned");
        match bans.get(&ip) {
            Some(ban) if ban.until > Instant::now() => true,
            Some(_) => {
                bans.remove(&ip);
                false
            }
            None => false,
        }
    }

    /// Records a violation event and bans the IP if it crosses threshold.
    /// Returns `true` if this call caused a new ban to start.
    pub fn record(&self, ip: IpAddr, kind: ViolationKind) -> bool {
        let now = Instant::now();
        let mut violations = self.violations.lock().expect("violation map mutex poisoned");
        let record = violations.entry(ip).or_insert_with(|| ViolationRecord::new(now));
        record.last_event = now;

        let (events, threshold, window) = match kind {
            ViolationKind::Auth => (&mut record.auth_events, self.config.auth_threshold, self.config.auth_window),
            ViolationKind::Flood => (&mut record.flood_events, self.config.flood_threshold, self.config.flood_window),
        };
        events.push(now);
        events.retain(|t| now.duration_since(*t) <= window);

        if events.len() as u32 >= threshold {
            events.clear();
            let ban_count = record.ban_count;
            record.ban_count = record.ban_count.saturating_add(1);
            let duration = self.backoff_duration(ban_count);
            drop(violations);
            let mut bans = self.bans.lock().expect("ban map mutex poisoned");
            bans.insert(ip, Ban { until: now + duration });
            return true;
        }
        false
    }

    fn backoff_duration(&self, prior_ban_count: u32) -> Duration {
        let multiplier = 1u64.checked_shl(prior_ban_count).unwrap_or(u64::MAX);
        let secs = self.config.ban_duration.as_secs().saturating_mul(multiplier);
        Duration::from_secs(secs).min(self.config.max_ban_duration)
    }

    /// Drops expired bans and violation records that have been quiet for a
    /// full cleanup window. Intended to run on a periodic background
    /// ticker (every 5 minutes per §4.4).
    pub fn cleanup(&self) {
        let now = Instant::now();
        {
            let mut bans = self.bans.lock().expect("ban map mutex poisoned");
            bans.retain(|_, ban| ban.until > now);
        }
        let mut violations = self.violations.lock().expect("violation map mutex poisoned");
        violations.retain(|_, record| now.duration_since(record.last_event) < self.config.cleanup_idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "198.51.100.7".parse().unwrap()
    }

    #[test]
    fn bans_after_auth_threshold() {
        let mgr = IpBanManager::new(IpBanConfig { auth_threshold: 3, ..Default::default() });
        assert!(!mgr.is_banned(ip()));
        assert!(!mgr.record(ip(), ViolationKind::Auth));
        assert!(!mgr.record(ip(), ViolationKind::Auth));
        assert!(mgr.record(ip(), ViolationKind::Auth));
        assert!(mgr.is_banned(ip()));
    }

    #[test]
    fn ban_duration_doubles_and_caps() {
        let mgr = IpBanManager::new(IpBanConfig {
            auth_threshold: 1,
            ban_duration: Duration::from_secs(10),
            max_ban_duration: Duration::from_secs(35),
            ..Default::default()
        });
        assert_eq!(mgr.backoff_duration(0), Duration::from_secs(10));
        assert_eq!(mgr.backoff_duration(1), Duration::from_secs(20));
        assert_eq!(mgr.backoff_duration(2), Duration::from_secs(35)); // capped from 40
        assert_eq!(mgr.backoff_duration(10), Duration::from_secs(35));
    }

    #[test]
    fn flood_threshold_independent_of_auth() {
        let mgr = IpBanManager::new(IpBanConfig { flood_threshold: 2, ..Default::default() });
        assert!(!mgr.record(ip(), ViolationKind::Flood));
        assert!(mgr.record(ip(), ViolationKind::Flood));
        assert!(mgr.is_banned(ip()));
    }

    #[test]
    fn cleanup_evicts_expired_bans_and_idle_violations() {
        let mgr = IpBanManager::new(IpBanConfig {
            auth_threshold: 1,
            ban_duration: Duration::from_millis(1),
            cleanup_idle: Duration::from_millis(1),
            ..Default::default()
        });
        mgr.record(ip(), ViolationKind::Auth);
        std::thread::sleep(Duration::from_millis(20));
        mgr.cleanup();
        assert!(!mgr.is_banned(ip()));
        assert!(mgr.violations.lock().unwrap().is_empty());
    }
}
