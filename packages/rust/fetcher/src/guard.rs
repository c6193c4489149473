//! SSRF protection.
//!
//! Every hostname is resolved up front and the request is only made when no
//! resolved address is private, loopback, link-local or otherwise reserved.
//! The fetcher then connects to exactly the addresses checked here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tracing::{debug, warn};
use url::{Host, Url};

use genie_shared::FetchError;

/// Reject anything that is not plain http(s).
pub fn check_scheme(url: &Url) -> Result<(), FetchError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(FetchError::Blocked {
            reason: format!("scheme '{other}' is not allowed"),
        }),
    }
}

/// Resolve the URL's host and make sure every answer is a public address.
///
/// With `allow_private` the address check is skipped (scheme checks still
/// apply); this exists for tests against local mock servers.
pub async fn resolve_target(
    url: &Url,
    allow_private: bool,
    timeout: Duration,
) -> Result<Vec<SocketAddr>, FetchError> {
    check_scheme(url)?;
    let port = url.port_or_known_default().unwrap_or(80);

    let addrs: Vec<SocketAddr> = match url.host() {
        None => {
            return Err(FetchError::InvalidUrl {
                message: format!("{url}: missing host"),
            });
        }
        Some(Host::Ipv4(ip)) => vec![SocketAddr::new(IpAddr::V4(ip), port)],
        Some(Host::Ipv6(ip)) => vec![SocketAddr::new(IpAddr::V6(ip), port)],
        Some(Host::Domain(domain)) => {
            match tokio::time::timeout(timeout, tokio::net::lookup_host((domain, port))).await {
                Err(_) => {
                    return Err(FetchError::Timeout {
                        secs: timeout.as_secs(),
                    });
                }
                Ok(Err(e)) => {
                    return Err(FetchError::Network {
                        message: format!("cannot resolve {domain}: {e}"),
                    });
                }
                Ok(Ok(resolved)) => resolved.collect(),
            }
        }
    };

    if addrs.is_empty() {
        return Err(FetchError::Network {
            message: format!("{url}: host resolved to no addresses"),
        });
    }

    if !allow_private {
        if let Some(addr) = addrs.iter().find(|addr| is_blocked_ip(&addr.ip())) {
            let host = url.host_str().unwrap_or_default();
            warn!(%host, ip = %addr.ip(), "SSRF protection: blocked");
            return Err(FetchError::Blocked {
                reason: format!("{host} resolves to blocked address {}", addr.ip()),
            });
        }
    }

    debug!(host = url.host_str().unwrap_or_default(), addrs = addrs.len(), "target resolved");
    Ok(addrs)
}

/// Check if an IP is in a private/reserved range.
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(v4: &Ipv4Addr) -> bool {
    let octets = v4.octets();
    v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_broadcast()
        || v4.is_unspecified()
        // 0.0.0.0/8 ("this network")
        || octets[0] == 0
        // 100.64.0.0/10 (Carrier-grade NAT)
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
        // 192.0.0.0/24
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
}

fn is_blocked_v6(v6: &Ipv6Addr) -> bool {
    if let Some(mapped) = v6.to_ipv4_mapped() {
        return is_blocked_v4(&mapped);
    }
    let first = v6.segments()[0];
    v6.is_loopback()
        || v6.is_unspecified()
        // fc00::/7 (unique local)
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 (link local)
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(ip: &str) -> bool {
        is_blocked_ip(&ip.parse().expect("ip"))
    }

    #[test]
    fn blocks_private_and_reserved_v4() {
        for ip in [
            "10.0.0.1",
            "10.255.255.255",
            "172.16.0.1",
            "172.31.255.1",
            "192.168.1.1",
            "127.0.0.1",
            "127.8.8.8",
            "169.254.169.254",
            "0.0.0.0",
            "255.255.255.255",
            "100.64.0.1",
        ] {
            assert!(blocked(ip), "{ip} should be blocked");
        }
    }

    #[test]
    fn allows_public_v4() {
        for ip in ["8.8.8.8", "93.184.216.34", "172.32.0.1", "100.128.0.1"] {
            assert!(!blocked(ip), "{ip} should be allowed");
        }
    }

    #[test]
    fn blocks_private_v6_and_mapped_v4() {
        for ip in ["::1", "::", "fc00::1", "fd12:3456::1", "fe80::1", "::ffff:10.0.0.1", "::ffff:127.0.0.1"] {
            assert!(blocked(ip), "{ip} should be blocked");
        }
        assert!(!blocked("2606:4700::1111"));
        assert!(!blocked("::ffff:8.8.8.8"));
    }

    #[test]
    fn scheme_check() {
        let file = Url::parse("file:///etc/passwd").expect("url");
        assert!(matches!(check_scheme(&file), Err(FetchError::Blocked { .. })));
        let ftp = Url::parse("ftp://example.com/").expect("url");
        assert!(check_scheme(&ftp).is_err());
        let https = Url::parse("https://example.com/").expect("url");
        assert!(check_scheme(&https).is_ok());
    }

    #[tokio::test]
    async fn literal_private_addresses_are_blocked_before_connecting() {
        let timeout = Duration::from_secs(1);
        for raw in ["http://127.0.0.1:8080/", "http://10.1.2.3/admin", "http://[::1]/"] {
            let url = Url::parse(raw).expect("url");
            let err = resolve_target(&url, false, timeout).await.unwrap_err();
            assert!(err.is_blocked(), "{raw}: {err}");
        }
    }

    #[tokio::test]
    async fn private_addresses_pass_when_allowed() {
        let url = Url::parse("http://127.0.0.1:9/").expect("url");
        let addrs = resolve_target(&url, true, Duration::from_secs(1)).await.expect("resolve");
        assert_eq!(addrs, vec!["127.0.0.1:9".parse::<SocketAddr>().expect("addr")]);
    }
}
