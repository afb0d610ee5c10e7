// Helpers for turning HTTP Host values into registry keys.

/// Strips an optional `:port` suffix and IPv6 brackets from a Host value.
/// Idempotent: applying it twice yields the same result as applying it once.
pub(crate) fn split_host(host: &str) -> &str {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[')
        && let Some(end) = rest.find(']')
    {
        return &rest[..end];
    }
    match host.rfind(':') {
        // A single colon separates host and port. More than one colon means
        // a bare IPv6 address, which has no port to strip.
        Some(index) if !host[..index].contains(':') => &host[..index],
        _ => host,
    }
}

/// Returns the leftmost dot-separated label of a host, lowercased.
pub(crate) fn subdomain_label(host: &str) -> String {
    host.split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Whether a (port-stripped) host addresses a tunnel under `domain`,
/// i.e. ends with `.<domain>` and carries at least one extra label.
pub(crate) fn is_tunnel_host(host: &str, domain: &str) -> bool {
    host.len() > domain.len() + 1
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
        && host[host.len() - domain.len()..].eq_ignore_ascii_case(domain)
}
