//! Broker address parsing and DNS pre-flight.
//!
//! Everything here is pure apart from [`resolve_host`], which performs the
//! lookup itself. The helpers accept the loose address forms operators type
//! into settings pages: bare hosts, `host:port`, bracketed or raw IPv6, with
//! or without a scheme.

use std::{
    fmt,
    net::{IpAddr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{error::ClientError, Result};

/// Standard plaintext MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Standard MQTT-over-TLS port.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Broker URL schemes understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Mqtt,
    Ssl,
    Tls,
    Mqtts,
}

impl Scheme {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "tcp" => Some(Scheme::Tcp),
            "mqtt" => Some(Scheme::Mqtt),
            "ssl" => Some(Scheme::Ssl),
            "tls" => Some(Scheme::Tls),
            "mqtts" => Some(Scheme::Mqtts),
            _ => None,
        }
    }

    /// `ssl://`, `tls://` and `mqtts://` switch transport security on.
    pub fn requires_tls(&self) -> bool {
        matches!(self, Scheme::Ssl | Scheme::Tls | Scheme::Mqtts)
    }

    pub fn default_port(&self) -> u16 {
        if self.requires_tls() {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Mqtt => "mqtt",
            Scheme::Ssl => "ssl",
            Scheme::Tls => "tls",
            Scheme::Mqtts => "mqtts",
        }
    }
}

/// A parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    pub scheme: Scheme,
    /// Host name or IP literal, without brackets.
    pub host: String,
    pub port: u16,
}

impl BrokerUrl {
    /// Parses `scheme://host[:port]`. A missing scheme means `tcp`.
    ///
    /// # Errors
    /// `ClientError::InvalidBrokerUrl` for unknown schemes, empty hosts,
    /// unbalanced brackets and bad ports.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (scheme, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => {
                let parsed = Scheme::parse(scheme).ok_or_else(|| {
                    ClientError::InvalidBrokerUrl(format!("unsupported scheme '{scheme}'"))
                })?;
                (parsed, rest)
            }
            None => (Scheme::Tcp, raw),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = split_host_port(authority)
            .ok_or_else(|| ClientError::InvalidBrokerUrl(format!("malformed address '{raw}'")))?;

        if host.is_empty() {
            return Err(ClientError::InvalidBrokerUrl(format!(
                "missing host in '{raw}'"
            )));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ClientError::InvalidBrokerUrl(format!("invalid port '{p}'")))?,
            None => scheme.default_port(),
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    pub fn requires_tls(&self) -> bool {
        self.scheme.requires_tls()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    pub fn is_ip_literal(&self) -> bool {
        self.ip().is_some()
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        format_host_port(&self.host, self.port)
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.address())
    }
}

/// Splits an authority into host and optional port string.
///
/// Returns `None` for an unterminated `[` bracket or garbage after `]`.
fn split_host_port(authority: &str) -> Option<(&str, Option<&str>)> {
    if let Some(inner) = authority.strip_prefix('[') {
        let (host, after) = inner.split_once(']')?;
        return match after {
            "" => Some((host, None)),
            _ => after.strip_prefix(':').map(|port| (host, Some(port))),
        };
    }

    match authority.matches(':').count() {
        0 => Some((authority, None)),
        1 => authority
            .split_once(':')
            .map(|(host, port)| (host, Some(port))),
        // More than one colon without brackets is only valid as a raw IPv6.
        _ => Some((authority, None)),
    }
}

fn strip_known_scheme(input: &str) -> Option<&str> {
    match input.split_once("://") {
        Some((scheme, rest)) => Scheme::parse(scheme).map(|_| rest),
        None => Some(input),
    }
}

fn format_host_port(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Reports whether `input` denotes an IP literal rather than a host name.
///
/// Accepts IPv4, IPv6 with or without brackets, optional port and an optional
/// known scheme. Unknown schemes and unbalanced brackets are rejected.
pub fn is_ip_address(input: &str) -> bool {
    let Some(rest) = strip_known_scheme(input.trim()) else {
        return false;
    };
    match split_host_port(rest) {
        Some((host, _)) => host.parse::<IpAddr>().is_ok(),
        None => false,
    }
}

/// Extracts the host part of a broker address, brackets removed.
pub fn extract_host(input: &str) -> Result<String> {
    BrokerUrl::parse(input).map(|url| url.host)
}

/// Extracts `host:port` from a broker address, defaulting the port per scheme.
pub fn extract_host_port(input: &str) -> Result<String> {
    BrokerUrl::parse(input).map(|url| url.address())
}

/// Network class of an address, logged during pre-flight for triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Loopback,
    Private,
    LinkLocal,
    Unspecified,
    Public,
}

impl AddressClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressClass::Loopback => "loopback",
            AddressClass::Private => "private",
            AddressClass::LinkLocal => "link-local",
            AddressClass::Unspecified => "unspecified",
            AddressClass::Public => "public",
        }
    }
}

pub fn classify_ip(ip: IpAddr) -> AddressClass {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                AddressClass::Loopback
            } else if v4.is_unspecified() {
                AddressClass::Unspecified
            } else if v4.is_private() {
                AddressClass::Private
            } else if v4.is_link_local() {
                AddressClass::LinkLocal
            } else {
                AddressClass::Public
            }
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return classify_ip(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            if v6.is_loopback() {
                AddressClass::Loopback
            } else if v6.is_unspecified() {
                AddressClass::Unspecified
            } else if first & 0xfe00 == 0xfc00 {
                // fc00::/7 unique local
                AddressClass::Private
            } else if first & 0xffc0 == 0xfe80 {
                // fe80::/10
                AddressClass::LinkLocal
            } else {
                AddressClass::Public
            }
        }
    }
}

/// Resolves `host` before a session is attempted.
///
/// Bounded by `timeout` and interruptible through `cancel`. A lookup that
/// fails or yields no addresses is a `ClientError::Dns`, one that runs out of
/// time is a `ClientError::DnsTimeout`.
pub async fn resolve_host(
    host: &str,
    port: u16,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<SocketAddr>> {
    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host((host, port)));

    let addrs: Vec<SocketAddr> = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ClientError::Cancelled("DNS lookup")),
        result = lookup => match result {
            Err(_) => {
                return Err(ClientError::DnsTimeout {
                    host: host.to_string(),
                    timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(ClientError::Dns {
                    host: host.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(addrs)) => addrs.collect(),
        },
    };

    if addrs.is_empty() {
        return Err(ClientError::Dns {
            host: host.to_string(),
            reason: "no addresses found".into(),
        });
    }

    for addr in &addrs {
        debug!(
            host,
            address = %addr.ip(),
            class = classify_ip(addr.ip()).as_str(),
            "Resolved broker address"
        );
    }

    Ok(addrs)
}
