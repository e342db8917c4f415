//! Parsing and validation of slirp4netns network options.
//!
//! Options arrive as raw `key=value` strings: engine-wide defaults
//! first, then the per-container list. Later entries override earlier
//! ones for the same key. Parsing stops at the first malformed entry.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use thiserror::Error;

use crate::error::{NetResult, UsernetError};
use crate::types::EngineDefaults;

/// Default MTU for the tap interface, matching slirp4netns' maximum.
pub const DEFAULT_MTU: u32 = 65520;

/// Smallest MTU accepted (the IPv4 minimum datagram size).
pub const MIN_MTU: u32 = 68;

/// Which port-forwarding strategy to use for this container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortHandler {
    /// Register forwards over the helper's own control socket.
    SlirpNative,
    /// Launch the dedicated `burrow-portfwd` forwarding process.
    #[default]
    External,
}

/// An IPv4 network in CIDR notation.
///
/// The engine only needs this type for validation and for deriving the
/// forwarder's child IP, so it stays minimal: address, prefix length,
/// and host derivation within the masked network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix: u8,
}

/// Error returned when a string is not a valid IPv4 network.
#[derive(Debug, Error)]
#[error("invalid IPv4 network")]
pub struct InvalidIpv4Net;

impl Ipv4Net {
    /// The address as written, host bits included.
    #[must_use]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// The prefix length.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The network base address (host bits masked off).
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        Ipv4Addr::from(u32::from(self.addr) & mask)
    }

    /// The `n`th address counting from the network base.
    #[must_use]
    pub fn nth(&self, n: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()).wrapping_add(n))
    }
}

impl FromStr for Ipv4Net {
    type Err = InvalidIpv4Net;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or(InvalidIpv4Net)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| InvalidIpv4Net)?;
        let prefix: u8 = prefix.parse().map_err(|_| InvalidIpv4Net)?;
        if prefix > 32 {
            return Err(InvalidIpv4Net);
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// An outbound address: a literal IP or a local interface name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAddr {
    /// A literal address of the expected family.
    Ip(IpAddr),
    /// The name of an existing local interface.
    Interface(String),
}

impl fmt::Display for OutboundAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboundAddr::Ip(ip) => write!(f, "{ip}"),
            OutboundAddr::Interface(name) => write!(f, "{name}"),
        }
    }
}

/// Whether a local interface with this name exists.
fn interface_exists(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && std::path::Path::new("/sys/class/net").join(name).exists()
}

/// Parse an outbound address value: a literal of the wanted family, or
/// the name of an existing interface. A literal of the wrong family is
/// only accepted if it happens to name an interface, which it never
/// does in practice.
fn parse_outbound(value: &str, want_v6: bool) -> Option<OutboundAddr> {
    if let Ok(ip) = value.parse::<IpAddr>() {
        if ip.is_ipv6() == want_v6 {
            return Some(OutboundAddr::Ip(ip));
        }
    }
    interface_exists(value).then(|| OutboundAddr::Interface(value.to_string()))
}

/// Validated slirp4netns configuration for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    /// Subnet the helper should use, when overridden.
    pub cidr: Option<Ipv4Net>,
    /// Whether the host loopback is unreachable from the container.
    pub disable_host_loopback: bool,
    /// Whether IPv6 is enabled inside the namespace.
    pub enable_ipv6: bool,
    /// Selected port-forwarding strategy.
    pub port_handler: PortHandler,
    /// MTU of the tap interface.
    pub mtu: u32,
    /// Outbound IPv4 address or interface.
    pub outbound_addr: Option<OutboundAddr>,
    /// Outbound IPv6 address or interface.
    pub outbound_addr6: Option<OutboundAddr>,
    /// Inherited from engine-wide config; suppresses the helper sandbox.
    pub no_pivot_root: bool,
}

impl NetworkOptions {
    /// Parse engine-wide plus per-container `key=value` options into a
    /// validated configuration. Later entries win for duplicate keys.
    ///
    /// Cross-option constraints are checked after the whole list is
    /// applied, so `enable_ipv6=true` satisfies `outbound_addr6` no
    /// matter where it appears.
    ///
    /// # Errors
    ///
    /// Fails on the first unknown key, malformed entry, or invalid
    /// value, naming the offending option.
    pub fn parse(defaults: &EngineDefaults, extra: &[String]) -> NetResult<Self> {
        let mut opts = Self {
            cidr: None,
            disable_host_loopback: true,
            enable_ipv6: false,
            port_handler: PortHandler::default(),
            mtu: DEFAULT_MTU,
            outbound_addr: None,
            outbound_addr6: None,
            no_pivot_root: defaults.no_pivot_root,
        };

        for entry in defaults.network_options.iter().chain(extra) {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(UsernetError::UnknownOption {
                    option: entry.clone(),
                });
            };
            match key {
                "cidr" => {
                    opts.cidr = Some(value.parse().map_err(|_| UsernetError::InvalidOption {
                        option: "cidr",
                        value: value.to_string(),
                    })?);
                }
                "port_handler" => {
                    opts.port_handler = match value {
                        "slirp4netns" => PortHandler::SlirpNative,
                        "rootlesskit" => PortHandler::External,
                        _ => {
                            return Err(UsernetError::InvalidOption {
                                option: "port_handler",
                                value: value.to_string(),
                            });
                        }
                    };
                }
                "allow_host_loopback" => {
                    opts.disable_host_loopback = !parse_bool("allow_host_loopback", value)?;
                }
                "enable_ipv6" => {
                    opts.enable_ipv6 = parse_bool("enable_ipv6", value)?;
                }
                "outbound_addr" => {
                    opts.outbound_addr = Some(parse_outbound(value, false).ok_or_else(|| {
                        UsernetError::InvalidOption {
                            option: "outbound_addr",
                            value: value.to_string(),
                        }
                    })?);
                }
                "outbound_addr6" => {
                    opts.outbound_addr6 = Some(parse_outbound(value, true).ok_or_else(|| {
                        UsernetError::InvalidOption {
                            option: "outbound_addr6",
                            value: value.to_string(),
                        }
                    })?);
                }
                "mtu" => {
                    opts.mtu = value
                        .parse::<u32>()
                        .ok()
                        .filter(|mtu| *mtu >= MIN_MTU)
                        .ok_or_else(|| UsernetError::InvalidOption {
                            option: "mtu",
                            value: value.to_string(),
                        })?;
                }
                _ => {
                    return Err(UsernetError::UnknownOption {
                        option: entry.clone(),
                    });
                }
            }
        }

        if opts.outbound_addr6.is_some() && !opts.enable_ipv6 {
            return Err(UsernetError::OutboundAddr6RequiresIpv6);
        }

        Ok(opts)
    }
}

/// Parse the boolean literals accepted in option values.
fn parse_bool(option: &'static str, value: &str) -> NetResult<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(UsernetError::InvalidOption {
            option,
            value: value.to_string(),
        }),
    }
}
