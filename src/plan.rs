//! Service plans and API token records, §4.5.
//!
//! A [`Plan`] bounds what a client may do once authenticated: how many
//! tunnels it may open, at what aggregate bandwidth, and whether request
//! inspection is available to it. An [`ApiTokenRecord`] binds a hashed
//! token to a user and an optional narrower override of their plan's
//! defaults (allowed subdomain patterns, allowed source IPs).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub name: String,
    /// Negative means unlimited.
    pub max_tunnels: i64,
    pub max_tunnels_per_token: u32,
    /// 0 means unlimited.
    pub bandwidth_mbps: u32,
    pub inspector_enabled: bool,
}

impl Plan {
    /// The plan handed to an unauthenticated or anonymously-authenticated
    /// client per §4.5 step 4.
    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".to_string(),
            max_tunnels: 10,
            max_tunnels_per_token: 10,
            bandwidth_mbps: 0,
            inspector_enabled: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiTokenRecord {
    /// Hex-encoded SHA-256 of the bearer token, never the token itself.
    pub token_hash: String,
    pub user_id: String,
    pub plan: Plan,
    /// Glob-style patterns (`*` matches any run of label characters); an
    /// empty vec means no subdomain restriction beyond the global grammar.
    pub allowed_subdomain_patterns: Vec<String>,
    /// Empty means no source-IP restriction.
    pub allowed_ips: Vec<std::net::IpAddr>,
}

impl ApiTokenRecord {
    pub fn subdomain_allowed(&self, subdomain: &str) -> bool {
        if self.allowed_subdomain_patterns.is_empty() {
            return true;
        }
        self.allowed_subdomain_patterns.iter().any(|pat| glob_match(pat, subdomain))
    }

    pub fn ip_allowed(&self, ip: std::net::IpAddr) -> bool {
        self.allowed_ips.is_empty() || self.allowed_ips.contains(&ip)
    }
}

/// Minimal `*`-only glob match, case-sensitive over already-lowercased
/// subdomains.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn helper(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => helper(&p[1..], t) || (!t.is_empty() && helper(p, &t[1..])),
            Some(&c) => t.first() == Some(&c) && helper(&p[1..], &t[1..]),
        }
    }
    helper(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_plan_has_default_quota() {
        let plan = Plan::anonymous();
        assert_eq!(plan.max_tunnels, 10);
        assert!(!plan.inspector_enabled);
    }

    #[test]
    fn glob_pattern_matches_wildcard() {
        assert!(glob_match("team-*", "team-bench"));
        assert!(!glob_match("team-*", "other-bench"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn token_record_enforces_subdomain_pattern() {
        let record = ApiTokenRecord {
            token_hash: "deadbeef".into(),
            user_id: "u1".into(),
            plan: Plan::anonymous(),
            allowed_subdomain_patterns: vec!["team-*".into()],
            allowed_ips: vec![],
        };
        assert!(record.subdomain_allowed("team-bench"));
        assert!(!record.subdomain_allowed("other"));
    }
}
