//! Host-to-container port forwarding strategies.
//!
//! Two interchangeable mechanisms: registering forwards over the
//! helper's own control socket ([`register_ports`]), or launching the
//! dedicated `burrow-portfwd` process ([`start_port_forwarder`]).

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::PortMapping;

mod external;
mod slirp;

pub use external::{ForwarderHandle, compute_child_ip, start_port_forwarder};
pub use slirp::{register_ports, wait_for_api_socket};

/// Configuration document handed to the forwarding process on its
/// standard input, as a single JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Ports to forward.
    pub mappings: Vec<PortMapping>,
    /// Path of the container's network namespace.
    #[serde(rename = "netnsPath")]
    pub netns_path: PathBuf,
    /// Descriptor the forwarder watches for EOF to know when to exit.
    #[serde(rename = "exitFD")]
    pub exit_fd: i32,
    /// Descriptor the forwarder writes its readiness marker to.
    #[serde(rename = "readyFD")]
    pub ready_fd: i32,
    /// Engine scratch directory.
    #[serde(rename = "tmpDir")]
    pub tmp_dir: PathBuf,
    /// Container-side address connections are proxied towards.
    #[serde(rename = "childIP")]
    pub child_ip: Ipv4Addr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarder_config_wire_field_names() {
        let config = ForwarderConfig {
            mappings: vec![PortMapping::tcp(8080, 80)],
            netns_path: PathBuf::from("/run/netns/ctr"),
            exit_fd: 3,
            ready_fd: 4,
            tmp_dir: PathBuf::from("/run/burrow/net"),
            child_ip: Ipv4Addr::new(10, 0, 2, 100),
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["netnsPath"], "/run/netns/ctr");
        assert_eq!(json["exitFD"], 3);
        assert_eq!(json["readyFD"], 4);
        assert_eq!(json["tmpDir"], "/run/burrow/net");
        assert_eq!(json["childIP"], "10.0.2.100");
        assert_eq!(json["mappings"][0]["protocol"], "tcp");
        assert_eq!(json["mappings"][0]["host_port"], 8080);
    }
}
