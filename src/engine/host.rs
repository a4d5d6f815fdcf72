use std::net::IpAddr;

/// Syntactic check only: an IP literal or a well-formed hostname. No DNS
/// lookup or other network I/O happens here.
pub fn validate_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(valid_label)
}

// RFC 1123 label: 1-63 ASCII alphanumerics or hyphens, no hyphen at either
// end.
fn valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

/// Resolve a host to the first address the system resolver returns. IP
/// literals pass through without a lookup.
pub async fn resolve(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    // lookup_host wants a port; it is discarded with the socket address.
    tokio::net::lookup_host((host, 0))
        .await
        .ok()?
        .next()
        .map(|sa| sa.ip())
}
