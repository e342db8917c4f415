//! Capability probing of the slirp4netns binary.
//!
//! The helper's command-line surface varies by version, so the set of
//! supported switches is discovered once per invocation by scanning its
//! `--help` output for known flag names. The scan is deliberately
//! version-tolerant: it does not require structured help output, and a
//! missing flag simply reads as "unsupported".

use std::path::Path;
use std::process::Command;

use crate::error::{NetResult, UsernetError};

/// Capability flags supported by a probed slirp4netns binary.
///
/// Never mutated after construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlirpFeatures {
    /// `--disable-host-loopback` is accepted.
    pub has_disable_host_loopback: bool,
    /// `--mtu` is accepted.
    pub has_mtu: bool,
    /// `--enable-sandbox` is accepted.
    pub has_enable_sandbox: bool,
    /// `--enable-seccomp` is accepted.
    pub has_enable_seccomp: bool,
    /// `--cidr` is accepted.
    pub has_cidr: bool,
    /// `--outbound-addr` / `--outbound-addr6` are accepted.
    pub has_outbound_addr: bool,
    /// `--enable-ipv6` is accepted.
    pub has_ipv6: bool,
}

impl SlirpFeatures {
    /// A feature set with every capability present, for tests.
    #[cfg(test)]
    pub(crate) fn all() -> Self {
        Self {
            has_disable_host_loopback: true,
            has_mtu: true,
            has_enable_sandbox: true,
            has_enable_seccomp: true,
            has_cidr: true,
            has_outbound_addr: true,
            has_ipv6: true,
        }
    }
}

/// Probe the helper binary at `path` for its supported switches.
///
/// # Errors
///
/// Returns [`UsernetError::HelperUnavailable`] when the binary cannot
/// be executed at all or exits non-zero, carrying the captured output
/// for diagnostics. A missing flag is not an error.
pub fn probe(path: &Path) -> NetResult<SlirpFeatures> {
    let output = match Command::new(path).arg("--help").output() {
        Ok(output) => output,
        Err(err) => {
            return Err(UsernetError::HelperUnavailable {
                path: path.to_path_buf(),
                output: err.to_string(),
            });
        }
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(UsernetError::HelperUnavailable {
            path: path.to_path_buf(),
            output: text,
        });
    }

    let features = SlirpFeatures {
        has_disable_host_loopback: text.contains("--disable-host-loopback"),
        has_mtu: text.contains("--mtu"),
        has_enable_sandbox: text.contains("--enable-sandbox"),
        has_enable_seccomp: text.contains("--enable-seccomp"),
        has_cidr: text.contains("--cidr"),
        has_outbound_addr: text.contains("--outbound-addr"),
        has_ipv6: text.contains("--enable-ipv6"),
    };
    tracing::debug!(helper = %path.display(), ?features, "Probed slirp4netns capabilities");
    Ok(features)
}
