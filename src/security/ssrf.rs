//! SSRF protection for OIDC discovery and JWKS fetches.
//!
//! Issuer URLs come out of attacker-supplied JWTs, and `jwks_uri` comes out
//! of a document fetched from such a URL. Both must be validated before any
//! outbound request, or a crafted token turns the verifier into a proxy
//! against internal infrastructure and cloud metadata endpoints.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use url::Url;

/// Rejection reasons for outbound URLs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlGuardError {
    /// Not parseable as an absolute URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Scheme is not `https`.
    #[error("Protocol not allowed: {0}")]
    ProtocolNotAllowed(String),

    /// Host is a cloud metadata endpoint.
    #[error("Metadata endpoint blocked: {0}")]
    MetadataBlocked(String),

    /// Host is an IP literal in a private/reserved range.
    #[error("Private or reserved address blocked: {0}")]
    PrivateAddress(String),
}

/// Validate a URL for outbound fetching.
///
/// Rejects non-HTTPS schemes, cloud-metadata hostnames, and IP literals in
/// private, loopback, link-local, multicast, or reserved ranges. IPv4-mapped
/// IPv6 literals are unwrapped and re-checked under the IPv4 rules.
/// Hostnames other than the metadata names pass through; DNS resolution is
/// out of scope here.
///
/// # Errors
///
/// Returns [`UrlGuardError`] naming the first rule the URL violates.
pub fn validate_fetch_url(url_str: &str) -> Result<Url, UrlGuardError> {
    let parsed =
        Url::parse(url_str).map_err(|e| UrlGuardError::InvalidUrl(format!("{url_str}: {e}")))?;

    if parsed.scheme() != "https" {
        return Err(UrlGuardError::ProtocolNotAllowed(
            parsed.scheme().to_string(),
        ));
    }

    let Some(host) = parsed.host_str() else {
        return Err(UrlGuardError::InvalidUrl("URL has no host".to_string()));
    };

    if is_metadata_host(host) {
        return Err(UrlGuardError::MetadataBlocked(host.to_string()));
    }

    // IP literals; IPv6 arrives bracket-enclosed from Url::host_str
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(addr) = trimmed.parse::<IpAddr>() {
        if is_blocked_addr(addr) {
            return Err(UrlGuardError::PrivateAddress(addr.to_string()));
        }
    }

    Ok(parsed)
}

/// Cloud metadata hostnames: `metadata.google.internal` and subdomains, plus
/// the link-local metadata literal (matched here by name; the range check
/// below also covers it).
fn is_metadata_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "metadata.google.internal"
        || host.ends_with(".metadata.google.internal")
        || host == "169.254.169.254"
}

fn is_blocked_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(ipv4) => is_blocked_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_blocked_ipv6(ipv6),
    }
}

/// Blocked IPv4 ranges: 0.0.0.0/8, 10/8, 127/8, 169.254/16, 172.16/12,
/// 192.168/16, 224/4 (multicast), 240/4 (reserved, includes broadcast).
fn is_blocked_ipv4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 0
        || addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_multicast()
        || octets[0] >= 240
}

/// Blocked IPv6: loopback, unique-local fc00::/7, link-local fe80::/10,
/// multicast ff00::/8; IPv4-mapped addresses re-checked as IPv4.
fn is_blocked_ipv6(addr: Ipv6Addr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() {
        return true;
    }

    let segments = addr.segments();

    // Unique Local Address (fc00::/7)
    if segments[0] & 0xFE00 == 0xFC00 {
        return true;
    }
    // Link-local (fe80::/10)
    if segments[0] & 0xFFC0 == 0xFE80 {
        return true;
    }
    // Multicast (ff00::/8)
    if segments[0] & 0xFF00 == 0xFF00 {
        return true;
    }

    // IPv4-mapped IPv6 (`::ffff:a.b.c.d`) -- the classic bypass vector
    if let Some(ipv4) = addr.to_ipv4_mapped() {
        return is_blocked_ipv4(ipv4);
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── scheme and shape ──────────────────────────────────────────────

    #[test]
    fn rejects_unparseable_url() {
        assert!(matches!(
            validate_fetch_url("not a url"),
            Err(UrlGuardError::InvalidUrl(_))
        ));
    }

    #[test]
    fn rejects_relative_url() {
        assert!(matches!(
            validate_fetch_url("/.well-known/openid-configuration"),
            Err(UrlGuardError::InvalidUrl(_))
        ));
    }

    #[test]
    fn rejects_http_scheme() {
        assert_eq!(
            validate_fetch_url("http://issuer.example.com/jwks"),
            Err(UrlGuardError::ProtocolNotAllowed("http".to_string()))
        );
    }

    #[test]
    fn rejects_file_scheme() {
        assert!(matches!(
            validate_fetch_url("file:///etc/passwd"),
            Err(UrlGuardError::ProtocolNotAllowed(_))
        ));
    }

    // ── metadata endpoints ────────────────────────────────────────────

    #[test]
    fn blocks_google_metadata_host() {
        assert!(matches!(
            validate_fetch_url("https://metadata.google.internal/computeMetadata/v1/"),
            Err(UrlGuardError::MetadataBlocked(_))
        ));
    }

    #[test]
    fn blocks_metadata_subdomain() {
        assert!(matches!(
            validate_fetch_url("https://foo.metadata.google.internal/"),
            Err(UrlGuardError::MetadataBlocked(_))
        ));
    }

    #[test]
    fn blocks_metadata_host_case_insensitively() {
        assert!(matches!(
            validate_fetch_url("https://Metadata.Google.Internal/"),
            Err(UrlGuardError::MetadataBlocked(_))
        ));
    }

    #[test]
    fn blocks_metadata_ip_literal() {
        // 169.254.169.254 is caught by the metadata rule before the range rule
        assert!(validate_fetch_url("https://169.254.169.254/latest/meta-data/").is_err());
    }

    // ── IPv4 ranges ───────────────────────────────────────────────────

    #[test]
    fn blocks_documented_ipv4_ranges() {
        for ip in [
            "0.0.0.0",
            "0.255.255.255",
            "10.0.0.1",
            "127.0.0.1",
            "127.255.255.255",
            "169.254.0.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "224.0.0.1",
            "239.255.255.255",
            "240.0.0.1",
            "255.255.255.255",
        ] {
            assert!(
                matches!(
                    validate_fetch_url(&format!("https://{ip}/jwks")),
                    Err(UrlGuardError::PrivateAddress(_)) | Err(UrlGuardError::MetadataBlocked(_))
                ),
                "expected {ip} to be blocked"
            );
        }
    }

    #[test]
    fn allows_public_ipv4() {
        assert!(validate_fetch_url("https://8.8.8.8/jwks").is_ok());
        assert!(validate_fetch_url("https://1.1.1.1/jwks").is_ok());
    }

    #[test]
    fn allows_boundary_neighbors() {
        // Just outside 172.16.0.0/12 and 240.0.0.0/4
        assert!(validate_fetch_url("https://172.15.255.255/").is_ok());
        assert!(validate_fetch_url("https://172.32.0.1/").is_ok());
        assert!(validate_fetch_url("https://223.255.255.255/").is_ok());
    }

    // ── IPv6 ranges ───────────────────────────────────────────────────

    #[test]
    fn blocks_ipv6_loopback_and_private() {
        for ip in ["::1", "fc00::1", "fd12:3456::1", "fe80::1", "ff02::1"] {
            assert!(
                matches!(
                    validate_fetch_url(&format!("https://[{ip}]/jwks")),
                    Err(UrlGuardError::PrivateAddress(_))
                ),
                "expected [{ip}] to be blocked"
            );
        }
    }

    #[test]
    fn blocks_ipv4_mapped_ipv6() {
        assert!(validate_fetch_url("https://[::ffff:127.0.0.1]/jwks").is_err());
        assert!(validate_fetch_url("https://[::ffff:10.0.0.1]/jwks").is_err());
        assert!(validate_fetch_url("https://[::ffff:169.254.169.254]/jwks").is_err());
    }

    #[test]
    fn allows_ipv4_mapped_public() {
        assert!(validate_fetch_url("https://[::ffff:8.8.8.8]/jwks").is_ok());
    }

    #[test]
    fn allows_public_ipv6() {
        assert!(validate_fetch_url("https://[2001:db8::1]/jwks").is_ok());
    }

    // ── hostnames ─────────────────────────────────────────────────────

    #[test]
    fn allows_https_hostnames() {
        assert!(validate_fetch_url("https://token.actions.githubusercontent.com/.well-known/openid-configuration").is_ok());
        assert!(validate_fetch_url("https://accounts.google.com/.well-known/openid-configuration").is_ok());
    }
}
