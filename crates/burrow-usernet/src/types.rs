//! Inputs handed over by the container lifecycle layer.

use std::net::IpAddr;
use std::path::PathBuf;

use burrow_common::BurrowPaths;
use serde::{Deserialize, Serialize};

/// Protocol for a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    /// Get the protocol string used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A host-to-container port mapping, supplied per container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    /// Protocol (TCP or UDP).
    pub protocol: Protocol,
    /// Host address to bind; the wildcard address when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Create a new TCP port mapping.
    #[must_use]
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            host_ip: None,
            host_port,
            container_port,
        }
    }

    /// Create a new UDP port mapping.
    #[must_use]
    pub fn udp(host_port: u16, container_port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            host_ip: None,
            host_port,
            container_port,
        }
    }

    /// Set the host IP to bind to.
    #[must_use]
    pub fn with_host_ip(mut self, ip: IpAddr) -> Self {
        self.host_ip = Some(ip);
        self
    }
}

/// How the container's network namespace is addressed.
#[derive(Debug, Clone)]
pub enum NetnsRef {
    /// A bind-mounted namespace file, passed as `--netns-type=path`.
    Path(PathBuf),
    /// A PID whose `/proc/<pid>/ns/net` is the namespace. Used when the
    /// namespace was configured after container start; old helpers only
    /// accept the PID form.
    Pid(u32),
}

impl NetnsRef {
    /// The filesystem path of the namespace this reference points at.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        match self {
            NetnsRef::Path(p) => p.clone(),
            NetnsRef::Pid(pid) => PathBuf::from(format!("/proc/{pid}/ns/net")),
        }
    }
}

/// Per-container networking inputs assembled by the lifecycle layer.
#[derive(Debug, Clone)]
pub struct ContainerNetwork {
    /// Container identity, used to key log and socket paths.
    pub id: String,
    /// The network namespace to configure.
    pub netns: NetnsRef,
    /// Ports to forward from the host into the container.
    pub port_mappings: Vec<PortMapping>,
    /// Addresses already observed on the container, if network status
    /// is known at call time. The first IPv4 entry overrides the
    /// computed child IP for external port forwarding.
    pub observed_addrs: Vec<IpAddr>,
    /// Raw `key=value` network options for this container, applied
    /// after the engine-wide ones.
    pub options: Vec<String>,
}

/// Engine-wide defaults inherited by every network setup call.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    /// Configured slirp4netns path; searched on `PATH` when unset.
    pub helper_path: Option<PathBuf>,
    /// Configured `burrow-portfwd` path; searched on `PATH` when unset.
    pub forwarder_path: Option<PathBuf>,
    /// Engine-wide raw `key=value` network options, applied before the
    /// per-container ones.
    pub network_options: Vec<String>,
    /// Engine-wide no-pivot-root setting; suppresses the helper sandbox.
    pub no_pivot_root: bool,
    /// Standard paths, keying log and socket files by container.
    pub paths: BurrowPaths,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            helper_path: None,
            forwarder_path: None,
            network_options: Vec::new(),
            no_pivot_root: false,
            paths: BurrowPaths::new(),
        }
    }
}
