//! Host name normalization
//!
//! Tunnel targets arrive as bare names, `host:port` pairs or full urls.
//! Everything here reduces them to a comparable lowercase host.

/// Names that all refer to this machine
const LOOPBACK_ALIASES: [&str; 5] = ["localhost", "127.0.0.1", "::1", "[::1]", "0.0.0.0"];

/// Reduces a host or url to a lowercase host name.
///
/// Strips the scheme, any path or trailing slash, a trailing dot and the
/// port. Loopback aliases all normalize to `localhost`.
pub fn normalize_host(input: &str) -> String {
    let mut host = input.trim();

    if let Some(idx) = host.find("://") {
        host = &host[idx + 3..];
    }
    if let Some(idx) = host.find('/') {
        host = &host[..idx];
    }

    let mut host = host.to_ascii_lowercase();

    if LOOPBACK_ALIASES.contains(&host.as_str()) {
        return "localhost".to_string();
    }

    // strip a port, leaving bare ipv6 literals alone
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            host = host[1..end].to_string();
        }
    } else if host.matches(':').count() == 1 {
        if let Some(idx) = host.rfind(':') {
            host.truncate(idx);
        }
    }

    while host.ends_with('.') {
        host.pop();
    }

    if LOOPBACK_ALIASES.contains(&host.as_str()) {
        return "localhost".to_string();
    }
    host
}

/// Strips a single trailing `/` from a configured target
pub fn strip_trailing_slash(input: &str) -> &str {
    input.strip_suffix('/').unwrap_or(input)
}

/// True when `target` names this client (or this machine)
pub fn is_local_host(target: &str, my_host: &str) -> bool {
    let target = normalize_host(target);
    target == "localhost" || target == normalize_host(my_host)
}
