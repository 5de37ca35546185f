//! Bearer-token and origin checks for the WebSocket upgrade.

/// Constant-time token comparison. Empty tokens never match.
pub fn tokens_equal(expected: &str, actual: &str) -> bool {
    if expected.is_empty() || actual.is_empty() {
        return false;
    }
    if expected.len() != actual.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in expected.bytes().zip(actual.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Check the connection token against the configured one. An empty
/// configured token disables auth. The token arrives either as
/// `Authorization: Bearer <token>` or as a `token` query parameter;
/// surrounding whitespace is ignored on both sides.
pub fn is_authorized(
    configured: &str,
    auth_header: Option<&str>,
    query_token: Option<&str>,
) -> bool {
    let configured = configured.trim();
    if configured.is_empty() {
        return true;
    }

    if let Some(header) = auth_header {
        if let Some(bearer) = header.strip_prefix("Bearer") {
            if tokens_equal(configured, bearer.trim()) {
                return true;
            }
        }
    }
    if let Some(token) = query_token {
        if tokens_equal(configured, token.trim()) {
            return true;
        }
    }
    false
}

/// Check an `Origin` header against the allowed patterns. Supported forms:
/// `*` (any), `host:*` (any port on that host), `*.domain.tld` (suffix
/// match), and exact `host[:port]`. Requests without an Origin header
/// (non-browser clients) are allowed; the gate exists for browsers.
pub fn origin_allowed(patterns: &[String], origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let host_port = strip_scheme(origin);
    let host = host_port.split(':').next().unwrap_or_default();

    patterns.iter().any(|pattern| {
        let pattern = pattern.trim();
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(":*") {
            return host == prefix;
        }
        if let Some(suffix) = pattern.strip_prefix('*') {
            // "*.domain.tld" matches any subdomain.
            return host.ends_with(suffix);
        }
        host_port == pattern || host == pattern
    })
}

fn strip_scheme(origin: &str) -> &str {
    let rest = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    rest.split('/').next().unwrap_or(rest)
}
