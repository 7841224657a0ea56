//! SSRF-safe URL validation, shared by the webhook outbound bridge, the
//! skill marketplace downloader, and any tool that fetches a user-supplied
//! URL.

use std::net::IpAddr;

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum UrlSecurityError {
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("missing host")]
    MissingHost,
    #[error("host resolves to a disallowed address: {0}")]
    DisallowedAddress(IpAddr),
    #[error("invalid url: {0}")]
    Parse(#[from] url::ParseError),
}

/// Validates a URL is `http(s)` and, when the host is a literal IP, that the
/// IP is not loopback/private/link-local/metadata-endpoint. Hostnames are
/// accepted here; callers performing the actual connection must re-check the
/// resolved address with [`check_ip_allowed`] to avoid DNS-rebinding.
pub fn validate_url(raw: &str, allow_localhost: bool) -> Result<Url, UrlSecurityError> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlSecurityError::UnsupportedScheme(other.to_string())),
    }
    let host = url.host_str().ok_or(UrlSecurityError::MissingHost)?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        check_ip_allowed(ip, allow_localhost)?;
    }
    Ok(url)
}

/// Blocks loopback/private/link-local/unspecified/broadcast IPv4 and the
/// IPv6 equivalents, plus the common cloud metadata endpoint
/// (`169.254.169.254`), unless `allow_localhost` opts loopback back in for
/// local-dev configurations.
pub fn check_ip_allowed(ip: IpAddr, allow_localhost: bool) -> Result<(), UrlSecurityError> {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() && !allow_localhost {
                return Err(UrlSecurityError::DisallowedAddress(ip));
            }
            if v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.octets() == [169, 254, 169, 254]
            {
                return Err(UrlSecurityError::DisallowedAddress(ip));
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() && !allow_localhost {
                return Err(UrlSecurityError::DisallowedAddress(ip));
            }
            let is_unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            if v6.is_unspecified() || is_unique_local || v6.segments()[0] == 0xfe80 {
                return Err(UrlSecurityError::DisallowedAddress(ip));
            }
            if let Some(v4) = v6.to_ipv4_mapped() {
                check_ip_allowed(IpAddr::V4(v4), allow_localhost)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_scheme() {
        assert!(matches!(
            validate_url("file:///etc/passwd", false),
            Err(UrlSecurityError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn rejects_private_literal_ip() {
        assert!(validate_url("http://10.0.0.5/hook", false).is_err());
        assert!(validate_url("http://169.254.169.254/latest/meta-data", false).is_err());
    }

    #[test]
    fn allows_public_host() {
        assert!(validate_url("https://example.com/webhook", false).is_ok());
    }

    #[test]
    fn loopback_allowed_only_with_flag() {
        assert!(validate_url("http://127.0.0.1:8080/hook", false).is_err());
        assert!(validate_url("http://127.0.0.1:8080/hook", true).is_ok());
    }
}
