//! Subdomain grammar and the reserved-label blocklist, §3.

const RESERVED: &[&str] =
    &["www", "api", "admin", "mail", "ftp", "smtp", "imap", "pop", "ns1", "ns2", "mx", "app"];

/// `^[a-z0-9]([a-z0-9-]{0,30}[a-z0-9])?$`, checked by hand to avoid
/// pulling in a regex engine for one fixed grammar.
fn matches_grammar(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > 32 {
        return false;
    }
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !is_alnum(bytes[0]) {
        return false;
    }
    if bytes.len() == 1 {
        return true;
    }
    if !is_alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes[1..bytes.len() - 1].iter().all(|&b| is_alnum(b) || b == b'-')
}

/// Case-insensitive validity check: matches the grammar and isn't reserved.
/// Callers should lowercase before storing/looking up.
pub fn is_valid(subdomain: &str) -> bool {
    let lower = subdomain.to_ascii_lowercase();
    if RESERVED.contains(&lower.as_str()) {
        return false;
    }
    matches_grammar(&lower)
}

pub fn normalize(subdomain: &str) -> String {
    subdomain.to_ascii_lowercase()
}

/// Extracts a candidate subdomain from a Host header: strips a trailing
/// `:port`, and if what remains ends with `.{base}`, strips that suffix
/// and lowercases the remainder. Returns `None` if the host isn't under
/// `base`, or the remainder is empty or unchanged (bare base domain).
pub fn extract_from_host(host: &str, base: &str) -> Option<String> {
    let host_no_port = host.split(':').next().unwrap_or(host);
    let suffix = format!(".{}", base.to_ascii_lowercase());
    let host_lower = host_no_port.to_ascii_lowercase();
    let candidate = host_lower.strip_suffix(&suffix)?;
    if candidate.is_empty() || candidate == host_lower {
        return None;
    }
    Some(candidate.to_string())
}

/// Strips a trailing `:port` and lowercases, for custom-domain lookups.
pub fn normalize_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_labels() {
        assert!(is_valid("bench"));
        assert!(is_valid("a"));
        assert!(is_valid("a-b-c"));
        assert!(is_valid("ABC123"));
    }

    #[test]
    fn rejects_reserved_labels_case_insensitively() {
        assert!(!is_valid("www"));
        assert!(!is_valid("WWW"));
        assert!(!is_valid("Admin"));
    }

    #[test]
    fn rejects_malformed_labels() {
        assert!(!is_valid(""));
        assert!(!is_valid("-abc"));
        assert!(!is_valid("abc-"));
        assert!(!is_valid("ab_c"));
        assert!(!is_valid(&"a".repeat(40)));
    }

    #[test]
    fn extracts_subdomain_from_host_header() {
        assert_eq!(extract_from_host("bench.fxtun.dev:443", "fxtun.dev"), Some("bench".into()));
        assert_eq!(extract_from_host("BENCH.fxtun.dev", "fxtun.dev"), Some("bench".into()));
        assert_eq!(extract_from_host("fxtun.dev", "fxtun.dev"), None);
        assert_eq!(extract_from_host("example.com", "fxtun.dev"), None);
    }
}
