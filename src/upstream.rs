//! Upstream spec grammar (§6): `host:port` or `host:port@ip`, comma-separated.
//!
//! Kept as its own small module so the parsing can be unit-tested without
//! spinning up a pool or a TLS dialer.

use std::net::SocketAddr;

use crate::error::{ForwarderError, Result};

/// One parsed upstream: where to TLS-dial, and what SNI/`ServerName` to
/// present while doing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// `host:port` to dial. Equal to `sni:port` unless an explicit `@ip`
    /// override was given.
    pub dial_host: String,
    pub port: u16,
    /// TLS SNI / `ServerName`. Always the hostname, never the IP override.
    pub sni: String,
}

impl Upstream {
    /// The address actually passed to the TCP connector.
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.dial_host, self.port)
    }

    fn parse_one(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ForwarderError::Config("empty upstream spec".into()));
        }

        let (host_port, ip_override) = match spec.split_once('@') {
            Some((hp, ip)) => (hp, Some(ip)),
            None => (spec, None),
        };

        let (host, port) = host_port.rsplit_once(':').ok_or_else(|| {
            ForwarderError::Config(format!("upstream {spec:?} missing :port"))
        })?;
        if host.is_empty() {
            return Err(ForwarderError::Config(format!(
                "upstream {spec:?} missing hostname"
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ForwarderError::Config(format!("upstream {spec:?} has a bad port")))?;

        let dial_host = match ip_override {
            Some(ip) => {
                ip.parse::<std::net::IpAddr>().map_err(|_| {
                    ForwarderError::Config(format!("upstream {spec:?} has a bad @ip override"))
                })?;
                ip.to_string()
            }
            None => host.to_string(),
        };

        Ok(Upstream {
            dial_host,
            port,
            sni: host.to_string(),
        })
    }
}

/// Parse a comma-separated upstream list. Rejects an empty list — a
/// forwarder with no upstreams can never answer a query.
pub fn parse_list(spec: &str) -> Result<Vec<Upstream>> {
    let upstreams: Result<Vec<_>> = spec
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Upstream::parse_one)
        .collect();
    let upstreams = upstreams?;
    if upstreams.is_empty() {
        return Err(ForwarderError::Config(
            "upstream list must not be empty".into(),
        ));
    }
    Ok(upstreams)
}

/// Resolve the dial address to a concrete [`SocketAddr`], used by the pool
/// to open the underlying TCP connection before the TLS handshake.
pub fn resolve_dial_addr(upstream: &Upstream) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    upstream
        .dial_addr()
        .to_socket_addrs()
        .map_err(ForwarderError::Io)?
        .next()
        .ok_or_else(|| {
            ForwarderError::Upstream {
                upstream: upstream.dial_addr(),
                reason: "no addresses resolved".into(),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let u = Upstream::parse_one("dns.google:853").unwrap();
        assert_eq!(u.dial_host, "dns.google");
        assert_eq!(u.port, 853);
        assert_eq!(u.sni, "dns.google");
    }

    #[test]
    fn parses_host_port_at_ip() {
        let u = Upstream::parse_one("one.one.one.one:853@1.1.1.1").unwrap();
        assert_eq!(u.dial_host, "1.1.1.1");
        assert_eq!(u.port, 853);
        assert_eq!(u.sni, "one.one.one.one");
    }

    #[test]
    fn parses_comma_separated_list() {
        let list = parse_list("one.one.one.one:853@1.1.1.1,dns.google:853@8.8.8.8").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].sni, "dns.google");
    }

    #[test]
    fn rejects_empty_list() {
        assert!(parse_list("").is_err());
        assert!(parse_list("  ,  ").is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!(Upstream::parse_one("dns.google").is_err());
    }

    #[test]
    fn rejects_bad_ip_override() {
        assert!(Upstream::parse_one("dns.google:853@not-an-ip").is_err());
    }

    #[test]
    fn tolerates_surrounding_whitespace_between_entries() {
        let list = parse_list(" dns.google:853 , one.one.one.one:853@1.1.1.1 ").unwrap();
        assert_eq!(list.len(), 2);
    }
}
