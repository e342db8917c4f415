//! End-to-end slirp4netns setup for one container.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Duration;

use crate::command::build_command_args;
use crate::error::NetResult;
use crate::features::probe;
use crate::options::{NetworkOptions, PortHandler};
use crate::portfwd;
use crate::supervisor::{EXIT_FD, LogFile, READY_FD, SyncPipe, spawn_helper, wait_for_ready};
use crate::types::{ContainerNetwork, EngineDefaults, NetnsRef};

/// Name of the helper binary searched on `PATH` when no path is
/// configured.
pub const HELPER_BINARY: &str = "slirp4netns";

/// Device name the helper creates inside the namespace.
const TAP_DEVICE: &str = "tap0";

/// Per-iteration readiness deadline for the namespace helper.
const HELPER_READY_TIMEOUT: Duration = Duration::from_secs(1);

/// A running, detached namespace helper.
///
/// Dropping `exit_pipe` (or the whole handle) tells the helper to shut
/// down; the lifecycle layer usually hands the descriptor to the
/// container monitor instead.
#[derive(Debug)]
pub struct SlirpHandle {
    /// PID of the helper process. Never waited on by this crate after
    /// setup returns.
    pub pid: u32,
    /// Write end of the helper's exit-notification pipe.
    pub exit_pipe: OwnedFd,
    /// Control socket path, when the native port handler is active.
    pub api_socket: Option<PathBuf>,
    /// Handle to the external port forwarder, when one was started.
    pub forwarder: Option<portfwd::ForwarderHandle>,
}

/// Configure user-mode networking for a container.
///
/// Launches slirp4netns against the container's namespace, waits for
/// its readiness handshake, and registers port forwards through the
/// configured strategy. Returns `Ok(None)` when the helper binary
/// cannot be located at all: the namespace is left without
/// helper-assisted networking and an advisory error is logged, but the
/// container is allowed to start.
///
/// # Errors
///
/// Fails on invalid options, unsupported features, helper startup
/// failure, or port-forward registration errors.
pub fn setup_slirp4netns(
    defaults: &EngineDefaults,
    ctr: &ContainerNetwork,
) -> NetResult<Option<SlirpHandle>> {
    let Some(binary) = resolve_helper(defaults) else {
        tracing::error!(
            container = %ctr.id,
            "could not find slirp4netns, the network namespace will not be configured"
        );
        return Ok(None);
    };

    let options = NetworkOptions::parse(defaults, &ctr.options)?;
    let features = probe(&binary)?;
    let mut args = build_command_args(&options, &features)?;

    // -c brings up the tap interface; -e/-r name the descriptors the
    // child inherits for exit notification and the readiness marker.
    args.push("-c".to_string());
    args.push("-e".to_string());
    args.push(EXIT_FD.to_string());
    args.push("-r".to_string());
    args.push(READY_FD.to_string());

    let have_ports = !ctr.port_mappings.is_empty();
    let api_socket = (have_ports && options.port_handler == PortHandler::SlirpNative)
        .then(|| defaults.paths.helper_api_socket(&ctr.id));
    if let Some(socket) = &api_socket {
        args.push("--api-socket".to_string());
        args.push(socket.display().to_string());
    }

    match &ctr.netns {
        NetnsRef::Path(path) => {
            args.push("--netns-type=path".to_string());
            args.push(path.display().to_string());
            args.push(TAP_DEVICE.to_string());
        }
        // Helpers older than 0.4 only accept the PID form.
        NetnsRef::Pid(pid) => {
            args.push(pid.to_string());
            args.push(TAP_DEVICE.to_string());
        }
    }

    tracing::debug!(helper = %binary.display(), ?args, "slirp4netns command");

    let mut log = LogFile::create_unlinked(&defaults.paths.helper_log(&ctr.id))?;
    let ready = SyncPipe::new()?;
    let exit = SyncPipe::new()?;
    let sandboxed = !options.no_pivot_root && features.has_enable_sandbox;
    let pid = spawn_helper(&binary, &args, ready.write, exit.read, &log, sandboxed)?;
    wait_for_ready(&ready.read, pid, HELPER_BINARY, &mut log, HELPER_READY_TIMEOUT)?;

    let mut forwarder = None;
    if have_ports {
        match (&api_socket, options.port_handler) {
            (Some(socket), PortHandler::SlirpNative) => {
                portfwd::wait_for_api_socket(socket, pid)?;
                portfwd::register_ports(socket, &ctr.port_mappings)?;
            }
            _ => {
                forwarder = Some(portfwd::start_port_forwarder(
                    defaults,
                    ctr,
                    &ctr.netns.path(),
                    options.cidr.as_ref(),
                )?);
            }
        }
    }

    Ok(Some(SlirpHandle {
        pid,
        exit_pipe: exit.write,
        api_socket,
        forwarder,
    }))
}

/// Locate the helper binary: the configured path when it exists,
/// otherwise a `PATH` search. `None` means networking degrades.
fn resolve_helper(defaults: &EngineDefaults) -> Option<PathBuf> {
    if let Some(path) = &defaults.helper_path {
        if path.exists() {
            return Some(path.clone());
        }
        tracing::warn!(path = %path.display(), "configured helper path does not exist");
        return None;
    }
    find_in_path(HELPER_BINARY, std::env::var_os("PATH"))
}

/// Search a `PATH`-style variable for an executable with this name.
pub(crate) fn find_in_path(name: &str, path_var: Option<std::ffi::OsString>) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path_var = path_var?;
    for dir in std::env::split_paths(&path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if let Ok(metadata) = std::fs::metadata(&candidate) {
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn scratch_defaults(dir: &Path) -> EngineDefaults {
        EngineDefaults {
            helper_path: None,
            forwarder_path: None,
            network_options: Vec::new(),
            no_pivot_root: false,
            paths: burrow_common::BurrowPaths::with_root(dir),
        }
    }

    fn container(id: &str, netns: &Path) -> ContainerNetwork {
        ContainerNetwork {
            id: id.to_string(),
            netns: NetnsRef::Path(netns.to_path_buf()),
            port_mappings: Vec::new(),
            observed_addrs: Vec::new(),
            options: Vec::new(),
        }
    }

    #[test]
    fn find_in_path_skips_non_executables() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("tool");
        std::fs::write(&plain, "not executable").unwrap();
        let path_var = Some(dir.path().as_os_str().to_os_string());
        assert_eq!(find_in_path("tool", path_var.clone()), None);

        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(find_in_path("tool", path_var), Some(plain));
    }

    #[test]
    fn missing_helper_degrades_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut defaults = scratch_defaults(dir.path());
        defaults.paths.create_dirs().unwrap();
        defaults.helper_path = Some(dir.path().join("no-such-slirp4netns"));
        let ctr = container("degraded", &dir.path().join("netns"));
        let handle = setup_slirp4netns(&defaults, &ctr).unwrap();
        assert!(handle.is_none());
    }

    #[test]
    fn helper_failure_surfaces_its_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut defaults = scratch_defaults(dir.path());
        defaults.paths.create_dirs().unwrap();

        // A fake helper that understands --help but dies at startup.
        let helper = dir.path().join("slirp4netns");
        let mut file = std::fs::File::create(&helper).unwrap();
        writeln!(
            file,
            "#!/bin/sh\n\
             case \"$1\" in --help) echo -- --mtu; exit 0;; esac\n\
             echo 'tap device open failed'\n\
             exit 1"
        )
        .unwrap();
        drop(file);
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
        defaults.helper_path = Some(helper);

        let ctr = container("failing", &dir.path().join("netns"));
        let err = setup_slirp4netns(&defaults, &ctr).unwrap_err();
        match err {
            crate::UsernetError::HelperFailed { log, .. } => {
                assert!(log.contains("tap device open failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ready_helper_yields_a_detached_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mut defaults = scratch_defaults(dir.path());
        defaults.paths.create_dirs().unwrap();

        // A fake helper that signals readiness on fd 4 and then idles
        // until its exit pipe closes.
        let helper = dir.path().join("slirp4netns");
        let mut file = std::fs::File::create(&helper).unwrap();
        writeln!(
            file,
            "#!/bin/sh\n\
             case \"$1\" in --help) echo -- --mtu; exit 0;; esac\n\
             printf 1 >&4\n\
             exec 4>&-\n\
             read _ <&3\n\
             exit 0"
        )
        .unwrap();
        drop(file);
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
        defaults.helper_path = Some(helper);

        let ctr = container("ready", &dir.path().join("netns"));
        let handle = setup_slirp4netns(&defaults, &ctr).unwrap().unwrap();
        assert!(handle.api_socket.is_none());
        assert!(handle.forwarder.is_none());
        // Closing the exit pipe lets the fake helper terminate.
        drop(handle);
    }
}
