//! Construction of the slirp4netns argument vector.

use crate::error::{NetResult, UsernetError};
use crate::features::SlirpFeatures;
use crate::options::NetworkOptions;

/// Build the helper's argument vector from validated options and the
/// probed feature set, in canonical order. Defaults the helper cannot
/// honor (loopback disable, MTU, sandbox, seccomp) are skipped;
/// explicitly requested options the helper lacks fail with
/// [`UsernetError::UnsupportedFeature`] instead of being dropped.
///
/// The caller appends the fixed tail: `-c`, the exit/ready descriptors,
/// the optional API socket, and the namespace reference plus device
/// name.
///
/// # Errors
///
/// Fails when a requested option is absent from `features`.
pub fn build_command_args(
    options: &NetworkOptions,
    features: &SlirpFeatures,
) -> NetResult<Vec<String>> {
    let mut args = Vec::new();

    if options.disable_host_loopback && features.has_disable_host_loopback {
        args.push("--disable-host-loopback".to_string());
    }
    if features.has_mtu {
        args.push(format!("--mtu={}", options.mtu));
    }
    if !options.no_pivot_root && features.has_enable_sandbox {
        args.push("--enable-sandbox".to_string());
    }
    if features.has_enable_seccomp {
        args.push("--enable-seccomp".to_string());
    }

    if let Some(cidr) = &options.cidr {
        if !features.has_cidr {
            return Err(UsernetError::UnsupportedFeature { option: "cidr" });
        }
        args.push(format!("--cidr={cidr}"));
    }

    if options.enable_ipv6 {
        if !features.has_ipv6 {
            return Err(UsernetError::UnsupportedFeature {
                option: "enable_ipv6",
            });
        }
        args.push("--enable-ipv6".to_string());
    }

    if let Some(addr) = &options.outbound_addr {
        if !features.has_outbound_addr {
            return Err(UsernetError::UnsupportedFeature {
                option: "outbound_addr",
            });
        }
        args.push(format!("--outbound-addr={addr}"));
    }

    if let Some(addr6) = &options.outbound_addr6 {
        // IPv6 outbound addressing rides on the same flag family, so it
        // needs both capabilities present.
        if !features.has_outbound_addr || !features.has_ipv6 {
            return Err(UsernetError::UnsupportedFeature {
                option: "outbound_addr6",
            });
        }
        args.push(format!("--outbound-addr6={addr6}"));
    }

    Ok(args)
}
