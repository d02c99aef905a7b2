//! Port specification grammar: parsing, validation, canonical serialization
//! and host-port conflict detection.
//!
//! A port spec is a compact string of the form
//! `[addr:][published:]container[/protocol][@mode]` where `addr` is a
//! hostname, an IPv4 address or a bracketed IPv6 address. The same syntax is
//! used for CLI flags and for the `uncloud.service.ports` container label.
//!
//! ## Examples
//!
//! ```rust
//! use uncloud::port::{PortMode, PortProtocol, PortSpec};
//!
//! let spec: PortSpec = "app.example.com:8080".parse().unwrap();
//! assert_eq!(spec.hostname.as_deref(), Some("app.example.com"));
//! assert_eq!(spec.container_port, 8080);
//! assert_eq!(spec.protocol, PortProtocol::Https);
//! assert_eq!(spec.mode, PortMode::Ingress);
//!
//! let spec: PortSpec = "127.0.0.1:8080:80/tcp@host".parse().unwrap();
//! assert_eq!(spec.published_port, Some(8080));
//! assert_eq!(spec.mode, PortMode::Host);
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::Error;

/// How a service port is published to the outside world.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortMode {
    /// Published through the cluster's L7 reverse proxy on every machine,
    /// routed by the `Host` header.
    #[default]
    Ingress,
    /// Bound directly as a host port on the machine running the container.
    Host,
}

impl fmt::Display for PortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortMode::Ingress => write!(f, "ingress"),
            PortMode::Host => write!(f, "host"),
        }
    }
}

impl FromStr for PortMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingress" => Ok(PortMode::Ingress),
            "host" => Ok(PortMode::Host),
            _ => Err(Error::invalid_spec(format!("invalid port mode: '{s}'"))),
        }
    }
}

/// The protocol a service port is published with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde_derive::Serialize, serde_derive::Deserialize)]
pub enum PortProtocol {
    /// Plain HTTP, routed by the ingress proxy.
    Http,
    /// HTTPS, routed by the ingress proxy.
    Https,
    /// Raw TCP.
    #[default]
    Tcp,
    /// Raw UDP.
    Udp,
}

impl PortProtocol {
    /// Whether the protocol is routable by the L7 ingress proxy.
    pub fn is_l7(&self) -> bool {
        matches!(self, PortProtocol::Http | PortProtocol::Https)
    }
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortProtocol::Http => write!(f, "http"),
            PortProtocol::Https => write!(f, "https"),
            PortProtocol::Tcp => write!(f, "tcp"),
            PortProtocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for PortProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(PortProtocol::Http),
            "https" => Ok(PortProtocol::Https),
            "tcp" => Ok(PortProtocol::Tcp),
            "udp" => Ok(PortProtocol::Udp),
            _ => Err(Error::invalid_spec(format!("invalid protocol: '{s}'"))),
        }
    }
}

/// A single unit of publishing intent for a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortSpec {
    /// Publishing mode, [`PortMode::Ingress`] unless `@host` was given.
    pub mode: PortMode,
    /// Publishing protocol. Defaults to `tcp`, or `https` when a hostname is
    /// present and no protocol was given.
    pub protocol: PortProtocol,
    /// The port the container listens on. Required; the parser tolerates `0`
    /// but [`PortSpec::validate`] rejects it.
    pub container_port: u16,
    /// The externally published port. Required in host mode, optional in
    /// ingress mode.
    pub published_port: Option<u16>,
    /// DNS name to route by. Only meaningful in ingress mode with an L7
    /// protocol.
    pub hostname: Option<String>,
    /// Host IP to bind the published port on. Only meaningful in host mode.
    pub host_ip: Option<IpAddr>,
}

impl PortSpec {
    /// Creates an ingress-mode TCP spec exposing only a container port.
    pub fn container(container_port: u16) -> Self {
        PortSpec {
            mode: PortMode::Ingress,
            protocol: PortProtocol::Tcp,
            container_port,
            published_port: None,
            hostname: None,
            host_ip: None,
        }
    }

    /// Checks the combination rules that the grammar alone cannot express.
    ///
    /// Every spec accepted by the CLI or decoded from a container label must
    /// pass this before it is acted upon.
    pub fn validate(&self) -> Result<(), Error> {
        if self.container_port == 0 {
            return Err(Error::invalid_spec("container port must not be 0"));
        }
        match self.mode {
            PortMode::Ingress => {
                if self.host_ip.is_some() {
                    return Err(Error::invalid_spec(
                        "host IP can only be specified for ports in host mode",
                    ));
                }
                match (&self.hostname, self.protocol.is_l7()) {
                    (Some(_), false) => {
                        return Err(Error::invalid_spec(format!(
                            "hostname requires the http or https protocol, got '{}'",
                            self.protocol
                        )));
                    }
                    (None, true) => {
                        return Err(Error::invalid_spec(format!(
                            "a hostname is required for '{}' ports in ingress mode",
                            self.protocol
                        )));
                    }
                    _ => {}
                }
            }
            PortMode::Host => {
                match self.published_port {
                    None => {
                        return Err(Error::invalid_spec(
                            "a published port is required in host mode",
                        ));
                    }
                    Some(0) => {
                        return Err(Error::invalid_spec("published port must not be 0"));
                    }
                    Some(_) => {}
                }
                if self.protocol.is_l7() {
                    return Err(Error::invalid_spec(format!(
                        "'{}' protocol is not supported in host mode, use tcp or udp",
                        self.protocol
                    )));
                }
                if self.hostname.is_some() {
                    return Err(Error::invalid_spec(
                        "hostname can only be specified for ports in ingress mode",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether two published host-mode ports would fight over the same host
    /// port binding.
    ///
    /// Ports conflict when both are in host mode, publish the same port with
    /// the same protocol, and their host IPs overlap. A missing or invalid
    /// host IP binds all interfaces, which overlaps with everything. The
    /// predicate is symmetric and reflexive on a published host-mode spec.
    pub fn conflicts_with(&self, other: &PortSpec) -> bool {
        self.mode == PortMode::Host
            && other.mode == PortMode::Host
            && self.published_port.is_some()
            && self.published_port == other.published_port
            && self.protocol == other.protocol
            && (self.host_ip.is_none() || other.host_ip.is_none() || self.host_ip == other.host_ip)
    }
}

/// Returns the subset of `proposed` ports that conflict with at least one of
/// the `existing` ports.
///
/// Non-host-mode ports never conflict, and the same port number under
/// different protocols does not conflict either.
pub fn conflicting_service_ports(existing: &[PortSpec], proposed: &[PortSpec]) -> Vec<PortSpec> {
    proposed
        .iter()
        .filter(|p| existing.iter().any(|e| e.conflicts_with(p)))
        .cloned()
        .collect()
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Tokenize outside-in: mode first, then protocol, then the
        // colon-separated address and port part.
        let (rest, mode) = match s.split_once('@') {
            Some((head, tail)) => {
                if tail.contains('@') {
                    return Err(Error::invalid_spec(format!(
                        "invalid port spec '{s}': at most one '@' is allowed"
                    )));
                }
                (head, tail.parse::<PortMode>()?)
            }
            None => (s, PortMode::Ingress),
        };

        let (rest, protocol) = match rest.split_once('/') {
            Some((head, tail)) => {
                if tail.contains('/') {
                    return Err(Error::invalid_spec(format!(
                        "invalid port spec '{s}': at most one '/' is allowed"
                    )));
                }
                (head, Some(tail.parse::<PortProtocol>()?))
            }
            None => (rest, None),
        };

        let parts: Vec<&str> = rest.split(':').collect();
        // An IPv6 address part contains colons of its own. Rejoin everything
        // except the trailing published:container pair.
        let (addr, published, container): (Option<String>, Option<&str>, &str) = match parts.len() {
            1 => (None, None, parts[0]),
            2 => {
                if parts[0].parse::<u16>().is_ok() {
                    (None, Some(parts[0]), parts[1])
                } else {
                    (Some(parts[0].to_owned()), None, parts[1])
                }
            }
            3 => (Some(parts[0].to_owned()), Some(parts[1]), parts[2]),
            n => (Some(parts[..n - 2].join(":")), Some(parts[n - 2]), parts[n - 1]),
        };

        let container_port = parse_port(container)?;
        let published_port = published.map(parse_port).transpose()?;

        let (hostname, host_ip) = match addr {
            None => (None, None),
            Some(addr) if addr.is_empty() => {
                return Err(Error::invalid_spec(format!(
                    "invalid port spec '{s}': hostname must not be empty"
                )));
            }
            Some(addr) => match mode {
                PortMode::Host => (None, Some(parse_host_ip(&addr)?)),
                PortMode::Ingress => (Some(addr), None),
            },
        };

        let protocol = protocol.unwrap_or(if hostname.is_some() {
            PortProtocol::Https
        } else {
            PortProtocol::Tcp
        });

        Ok(PortSpec {
            mode,
            protocol,
            container_port,
            published_port,
            hostname,
            host_ip,
        })
    }
}

fn parse_port(s: &str) -> Result<u16, Error> {
    s.parse::<u16>()
        .map_err(|_| Error::invalid_spec(format!("invalid port number: '{s}'")))
}

fn parse_host_ip(s: &str) -> Result<IpAddr, Error> {
    if let Some(inner) = s.strip_prefix('[') {
        let inner = inner.strip_suffix(']').ok_or_else(|| {
            Error::invalid_spec(format!("invalid host IP '{s}': missing closing bracket"))
        })?;
        let ip = inner.parse::<Ipv6Addr>().map_err(|_| {
            Error::invalid_spec(format!("invalid IPv6 host address: '{inner}'"))
        })?;
        return Ok(IpAddr::V6(ip));
    }
    if s.contains(':') {
        return Err(Error::invalid_spec(format!(
            "IPv6 host address must be enclosed in square brackets: '{s}'"
        )));
    }
    let ip = s
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::invalid_spec(format!("invalid host IP address: '{s}'")))?;
    Ok(IpAddr::V4(ip))
}

impl fmt::Display for PortSpec {
    /// Emits the canonical form that round-trips through the parser for
    /// every validated spec. The protocol is elided when it equals the
    /// default the parser would infer.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(hostname) = &self.hostname {
            write!(f, "{hostname}:")?;
        } else if let Some(ip) = &self.host_ip {
            match ip {
                IpAddr::V4(v4) => write!(f, "{v4}:")?,
                IpAddr::V6(v6) => write!(f, "[{v6}]:")?,
            }
        }
        if let Some(published) = self.published_port {
            write!(f, "{published}:")?;
        }
        write!(f, "{}", self.container_port)?;

        let default_protocol = if self.hostname.is_some() {
            PortProtocol::Https
        } else {
            PortProtocol::Tcp
        };
        if self.protocol != default_protocol {
            write!(f, "/{}", self.protocol)?;
        }
        if self.mode == PortMode::Host {
            write!(f, "@{}", self.mode)?;
        }
        Ok(())
    }
}

impl Serialize for PortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
