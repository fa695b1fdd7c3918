//! Target parsing and name resolution for probes.

use crate::error::ProbeFailure;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::net::lookup_host;

/// A probe target split into host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parses `host`, `host:port`, `[v6]:port`, a bare IP literal or a URL.
    /// `default_port` applies when the target carries no port.
    pub fn parse(target: &str, default_port: u16) -> Self {
        let target = target.trim();

        if target.contains("://") {
            if let Ok(url) = reqwest::Url::parse(target) {
                if let Some(host) = url.host_str() {
                    let host = host.trim_start_matches('[').trim_end_matches(']');
                    return Self {
                        host: host.to_string(),
                        port: url.port_or_known_default().unwrap_or(default_port),
                    };
                }
            }
        }

        if let Some(rest) = target.strip_prefix('[') {
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(default_port);
                return Self {
                    host: host.to_string(),
                    port,
                };
            }
        }

        if target.parse::<IpAddr>().is_ok() {
            return Self {
                host: target.to_string(),
                port: default_port,
            };
        }

        if let Some((host, port)) = target.rsplit_once(':') {
            if !host.contains(':') {
                if let Ok(port) = port.parse() {
                    return Self {
                        host: host.to_string(),
                        port,
                    };
                }
            }
        }

        Self {
            host: target.to_string(),
            port: default_port,
        }
    }

    /// Host as it must appear in a URL authority.
    pub fn url_host(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]", self.host),
            _ => self.host.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.url_host(), self.port)
    }
}

/// Resolves an endpoint to one socket address, preferring IPv4.
pub async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr, ProbeFailure> {
    if let Ok(ip) = endpoint.host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, endpoint.port));
    }

    let addrs: Vec<SocketAddr> = lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| {
            tracing::debug!(host = %endpoint.host, error = %e, "lookup failed");
            ProbeFailure::Resolution(endpoint.host.clone())
        })?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ProbeFailure::Resolution(endpoint.host.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(host: &str, port: u16) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn parses_target_forms() {
        assert_eq!(Endpoint::parse("1.1.1.1", 443), ep("1.1.1.1", 443));
        assert_eq!(Endpoint::parse(" google.com ", 443), ep("google.com", 443));
        assert_eq!(Endpoint::parse("example.com:8080", 443), ep("example.com", 8080));
        assert_eq!(Endpoint::parse("::1", 443), ep("::1", 443));
        assert_eq!(Endpoint::parse("[::1]:22", 443), ep("::1", 22));
        assert_eq!(Endpoint::parse("[2606:4700::1111]", 80), ep("2606:4700::1111", 80));
        assert_eq!(Endpoint::parse("https://example.com", 22), ep("example.com", 443));
        assert_eq!(Endpoint::parse("http://[::1]:8000/x", 22), ep("::1", 8000));
    }

    #[test]
    fn unparsable_port_keeps_whole_target_as_host() {
        assert_eq!(Endpoint::parse("example.com:http", 443), ep("example.com:http", 443));
    }

    #[test]
    fn display_brackets_ipv6() {
        assert_eq!(ep("::1", 443).to_string(), "[::1]:443");
        assert_eq!(ep("example.com", 80).to_string(), "example.com:80");
    }

    #[tokio::test]
    async fn ip_literals_resolve_without_lookup() {
        let addr = resolve(&ep("127.0.0.1", 9)).await.unwrap();
        assert_eq!(addr, "127.0.0.1:9".parse().unwrap());
    }

    #[tokio::test]
    async fn unknown_host_is_a_resolution_failure() {
        let err = resolve(&ep("pingwatch-test.invalid", 443)).await.unwrap_err();
        assert!(matches!(err, ProbeFailure::Resolution(_)), "{err:?}");
    }
}
