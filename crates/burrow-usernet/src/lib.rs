//! # burrow-usernet
//!
//! User-mode networking for unprivileged Burrow containers.
//!
//! This crate configures a container's network namespace without
//! privileges by launching and supervising the external `slirp4netns`
//! helper, then wiring up host-to-container port forwarding through
//! one of two strategies:
//!
//! - the helper's own control socket (`add_hostfwd` JSON commands), or
//! - the separately built `burrow-portfwd` forwarding process.
//!
//! Namespace creation, the container state machine, and the engine RPC
//! surface are owned by the lifecycle layer; this crate only consumes
//! the container identity, namespace reference, and port mappings it
//! is handed.

#![warn(missing_docs)]

pub mod command;
pub mod error;
pub mod features;
pub mod options;
pub mod portfwd;
pub mod setup;
pub mod supervisor;
pub mod types;

pub use error::{NetResult, UsernetError};
pub use features::{SlirpFeatures, probe};
pub use options::{Ipv4Net, NetworkOptions, PortHandler};
pub use setup::{SlirpHandle, setup_slirp4netns};
pub use types::{ContainerNetwork, EngineDefaults, NetnsRef, PortMapping, Protocol};
