//! Launching the dedicated port-forwarding process.
//!
//! The forwarder is the separately built `burrow-portfwd` binary. It
//! receives its configuration as one JSON document on standard input
//! and performs the same readiness handshake as the namespace helper,
//! with a longer deadline to cover its socket setup. Its stdout is
//! reserved for a one-line human-readable error; its stderr is debug
//! output captured to an unlinked log file.

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{NetResult, UsernetError};
use crate::options::Ipv4Net;
use crate::portfwd::ForwarderConfig;
use crate::setup::find_in_path;
use crate::supervisor::{EXIT_FD, LogFile, READY_FD, SyncPipe, install_child_fds, wait_for_ready};
use crate::types::{ContainerNetwork, EngineDefaults};

/// Name of the forwarder binary searched on `PATH` when no path is
/// configured.
pub const FORWARDER_BINARY: &str = "burrow-portfwd";

/// Fixed container-side address of the default slirp4netns subnet.
pub const DEFAULT_CHILD_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 100);

/// Per-iteration readiness deadline; the forwarder binds sockets before
/// signaling, so it gets more room than the namespace helper.
const FORWARDER_READY_TIMEOUT: Duration = Duration::from_secs(3);

/// A running, detached port-forwarding process.
#[derive(Debug)]
pub struct ForwarderHandle {
    /// PID of the forwarder. Never waited on after setup returns.
    pub pid: u32,
    /// Write end of the forwarder's exit-notification pipe; closing it
    /// tells the forwarder to shut down.
    pub exit_pipe: OwnedFd,
}

/// Compute the container-side address the forwarder proxies towards.
///
/// The helper's default subnet pins it to [`DEFAULT_CHILD_IP`]; a
/// custom CIDR moves it to the 100th address of that network; an
/// already-observed container IPv4 address overrides both. IPv6
/// entries are skipped, first IPv4 match wins.
#[must_use]
pub fn compute_child_ip(cidr: Option<&Ipv4Net>, observed: &[IpAddr]) -> Ipv4Addr {
    let mut child_ip = cidr.map_or(DEFAULT_CHILD_IP, |net| net.nth(100));
    for addr in observed {
        if let IpAddr::V4(v4) = addr {
            child_ip = *v4;
            break;
        }
    }
    child_ip
}

/// Start the forwarding process for a container's port mappings.
///
/// # Errors
///
/// Fails when the forwarder binary cannot be found, its configuration
/// cannot be serialized, the process cannot be started, or it fails its
/// readiness handshake. In the handshake case the forwarder's stdout
/// text, when present, is surfaced as the error and the verbose
/// internal failure is logged at debug level instead.
pub fn start_port_forwarder(
    defaults: &EngineDefaults,
    ctr: &ContainerNetwork,
    netns_path: &Path,
    cidr: Option<&Ipv4Net>,
) -> NetResult<ForwarderHandle> {
    let binary = defaults
        .forwarder_path
        .clone()
        .or_else(|| find_in_path(FORWARDER_BINARY, std::env::var_os("PATH")))
        .ok_or_else(|| UsernetError::HelperUnavailable {
            path: FORWARDER_BINARY.into(),
            output: "not found in PATH".to_string(),
        })?;

    let config = ForwarderConfig {
        mappings: ctr.port_mappings.clone(),
        netns_path: netns_path.to_path_buf(),
        exit_fd: EXIT_FD,
        ready_fd: READY_FD,
        tmp_dir: defaults.paths.network_tmp(),
        child_ip: compute_child_ip(cidr, &ctr.observed_addrs),
    };
    let config_json = serde_json::to_vec(&config)?;

    let mut log = LogFile::create_unlinked(&defaults.paths.portfwd_log(&ctr.id))?;
    let ready = SyncPipe::new()?;
    let exit = SyncPipe::new()?;

    let mut cmd = Command::new(&binary);
    let _ = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log.writer()?));
    install_child_fds(
        &mut cmd,
        exit.read.as_raw_fd(),
        ready.write.as_raw_fd(),
        false,
    );

    let mut child = cmd.spawn().map_err(|e| {
        UsernetError::io(format!("start port forwarder {}", binary.display()), e)
    })?;
    let pid = child.id();
    drop(ready.write);
    drop(exit.read);

    if let Some(mut stdin) = child.stdin.take() {
        // A forwarder that died before reading its configuration
        // surfaces through the handshake below, where its stdout text
        // takes precedence over the raw pipe error.
        if let Err(err) = stdin.write_all(&config_json) {
            tracing::debug!(error = %err, "could not write the port forwarder configuration");
        }
    }

    // Collect stdout incrementally so partial output is visible even
    // while the forwarder is still running.
    let collected = Arc::new(Mutex::new(String::new()));
    let mut collector = None;
    if let Some(stdout) = child.stdout.take() {
        let sink = Arc::clone(&collected);
        collector = Some(std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let mut text = sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                text.push_str(&line);
                text.push('\n');
            }
        }));
    }
    drop(child);

    if let Err(err) = wait_for_ready(
        &ready.read,
        pid,
        FORWARDER_BINARY,
        &mut log,
        FORWARDER_READY_TIMEOUT,
    ) {
        // Let the collector drain whatever the forwarder managed to
        // print; bounded, since the child may still hold stdout open.
        if let Some(handle) = collector {
            let deadline = Instant::now() + Duration::from_millis(200);
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        let stdout_text = collected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .trim_end_matches('\n')
            .to_string();
        if stdout_text.is_empty() {
            return Err(err);
        }
        // The internal error carries the full debug log and is too
        // verbose to surface; the stdout line is written for humans.
        tracing::debug!(error = %err, "port forwarder handshake failed");
        return Err(UsernetError::ForwarderFailed {
            message: stdout_text,
        });
    }

    tracing::debug!(pid, "port forwarder is ready");
    Ok(ForwarderHandle {
        pid,
        exit_pipe: exit.write,
    })
}
