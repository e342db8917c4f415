//! Error types for user-mode networking setup.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`UsernetError`].
pub type NetResult<T> = Result<T, UsernetError>;

/// Errors raised while configuring user-mode networking.
#[derive(Error, Diagnostic, Debug)]
pub enum UsernetError {
    /// The helper binary could not be executed or probed.
    #[error("helper binary {path} is unavailable: {output}")]
    #[diagnostic(
        code(burrow::usernet::helper_unavailable),
        help("install slirp4netns or point the engine at it with helper_path")
    )]
    HelperUnavailable {
        /// Path of the binary that failed to run.
        path: PathBuf,
        /// Combined output (or exec error text) captured from the attempt.
        output: String,
    },

    /// An option string was not of the form `key=value`, or the key is
    /// not recognized.
    #[error("unknown network option {option:?}")]
    #[diagnostic(code(burrow::usernet::unknown_option))]
    UnknownOption {
        /// The raw option entry.
        option: String,
    },

    /// A recognized option carried a malformed or invalid value.
    #[error("invalid value {value:?} for network option {option}")]
    #[diagnostic(code(burrow::usernet::invalid_option))]
    InvalidOption {
        /// The offending key.
        option: &'static str,
        /// The offending value.
        value: String,
    },

    /// `outbound_addr6` was configured without enabling IPv6.
    #[error("enable_ipv6=true is required for outbound_addr6")]
    #[diagnostic(
        code(burrow::usernet::outbound_addr6_requires_ipv6),
        help("add enable_ipv6=true to the network options")
    )]
    OutboundAddr6RequiresIpv6,

    /// A requested option is not supported by the probed helper binary.
    #[error("{option} is not supported by this slirp4netns version")]
    #[diagnostic(code(burrow::usernet::unsupported_feature))]
    UnsupportedFeature {
        /// The option the helper cannot honor.
        option: &'static str,
    },

    /// The helper exited before signaling readiness.
    #[error("{helper} failed: {log:?}")]
    #[diagnostic(code(burrow::usernet::helper_failed))]
    HelperFailed {
        /// Name of the supervised program.
        helper: String,
        /// Captured log contents at the time of failure.
        log: String,
    },

    /// The helper was killed by a signal before signaling readiness.
    #[error("{helper} was killed by a signal")]
    #[diagnostic(code(burrow::usernet::helper_killed))]
    HelperKilled {
        /// Name of the supervised program.
        helper: String,
    },

    /// The helper's control socket rejected a port mapping.
    #[error("error from slirp4netns while setting up port redirection: {reason}")]
    #[diagnostic(code(burrow::usernet::port_forward_rejected))]
    PortForwardRejected {
        /// The error message embedded in the control socket response.
        reason: String,
    },

    /// The port-forwarding process reported a startup error on stdout.
    #[error("port forwarder failed: {message}")]
    #[diagnostic(code(burrow::usernet::forwarder_failed))]
    ForwarderFailed {
        /// Trimmed human-readable text the forwarder wrote on stdout.
        message: String,
    },

    /// A JSON payload could not be encoded or decoded.
    #[error("JSON protocol error: {0}")]
    #[diagnostic(code(burrow::usernet::json))]
    Json(#[from] serde_json::Error),

    /// An I/O operation on a pipe, socket, or file failed.
    #[error("{op}: {source}")]
    #[diagnostic(code(burrow::usernet::io))]
    Io {
        /// The operation (and path, where one applies) that failed.
        op: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl UsernetError {
    /// Wrap an I/O error with the operation that produced it.
    pub(crate) fn io(op: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            op: op.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_option_names_the_key() {
        let err = UsernetError::InvalidOption {
            option: "mtu",
            value: "67".to_string(),
        };
        assert_eq!(err.to_string(), "invalid value \"67\" for network option mtu");
    }

    #[test]
    fn io_wraps_operation() {
        let err = UsernetError::io("open sync pipe", std::io::Error::other("boom"));
        assert!(err.to_string().starts_with("open sync pipe:"));
    }
}
