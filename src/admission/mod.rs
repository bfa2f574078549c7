//! Admission Control, §4.4: the three-stage pipeline every new control
//! connection passes through, in order: IP ban, accept rate, connection
//! caps.

mod ip_ban;
mod rate_limit;

pub use ip_ban::{IpBanConfig, IpBanManager, ViolationKind};
pub use rate_limit::AdmissionLimits;

use crate::error::AdmissionError;
use std::net::IpAddr;

pub struct AdmissionController {
    pub ban_manager: IpBanManager,
    pub limits: AdmissionLimits,
    ban_enabled: bool,
}

impl AdmissionController {
    pub fn new(ban_config: IpBanConfig, ban_enabled: bool, limits: AdmissionLimits) -> Self {
        Self { ban_manager: IpBanManager::new(ban_config), limits, ban_enabled }
    }

    /// Runs stages 1-3. `trusted` should be true only for a connection on
    /// an already-authenticated client's remote address (data-session
    /// joins bypass the per-IP rate limiter).
    ///
    /// On `RateLimited` from the per-IP bucket, the caller must also
    /// record a flood violation (step 2's "AND records a flood
    /// violation") — that's left to the caller since it owns the decision
    /// of *when* a dropped connection counts as a flood event versus an
    /// expected burst.
    pub fn admit(&self, ip: IpAddr, trusted: bool) -> Result<AdmissionGuard<'_>, AdmissionError> {
        if self.ban_enabled && self.ban_manager.is_banned(ip) {
            return Err(AdmissionError::Banned);
        }
        if !self.limits.check_global_rate() {
            return Err(AdmissionError::RateLimited);
        }
        if !self.limits.check_per_ip_rate(ip, trusted) {
            if self.ban_enabled {
                self.ban_manager.record(ip, ViolationKind::Flood);
            }
            return Err(AdmissionError::RateLimited);
        }
        if !self.limits.try_reserve(ip) {
            return Err(AdmissionError::CapacityExceeded);
        }
        Ok(AdmissionGuard { limits: &self.limits, ip })
    }

    pub fn record_auth_failure(&self, ip: IpAddr) {
        if self.ban_enabled {
            self.ban_manager.record(ip, ViolationKind::Auth);
        }
    }

    pub fn cleanup(&self) {
        self.ban_manager.cleanup();
    }
}

/// Releases the reserved connection slot when the control connection ends.
pub struct AdmissionGuard<'a> {
    limits: &'a AdmissionLimits,
    ip: IpAddr,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.limits.release(self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banned_ip_is_rejected_before_anything_else() {
        let controller = AdmissionController::new(
            IpBanConfig { auth_threshold: 1, ..Default::default() },
            true,
            AdmissionLimits::new(1000, 1000, 1000, 1000),
        );
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        controller.record_auth_failure(ip);
        assert!(matches!(controller.admit(ip, false), Err(AdmissionError::Banned)));
    }
}
