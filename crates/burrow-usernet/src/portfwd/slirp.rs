//! Port-forward registration over the slirp4netns control socket.
//!
//! The helper exposes a unix-domain socket accepting one JSON command
//! per connection, newline-terminated, with writes shut down to mark
//! the end of the request. A response object without an `"error"` key
//! means success.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{NetResult, UsernetError};
use crate::supervisor::{ChildState, check_child};
use crate::types::PortMapping;

/// Overall deadline for the control socket file to appear.
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between liveness and socket-existence checks.
const SOCKET_WAIT_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on a control socket response.
const RESPONSE_LIMIT: usize = 2048;

#[derive(Serialize)]
struct HostFwdCommand<'a> {
    execute: &'static str,
    arguments: HostFwdArguments<'a>,
}

#[derive(Serialize)]
struct HostFwdArguments<'a> {
    proto: &'a str,
    host_addr: String,
    host_port: u16,
    guest_addr: &'a str,
    guest_port: u16,
}

/// Wait for the helper's control socket file to appear, racing a
/// background liveness watcher.
///
/// The watcher polls the helper PID with a non-blocking wait every
/// 25 ms and reports at most one terminal result; it is abandoned
/// (never joined) once the foreground wait resolves and self-terminates
/// with its bounded loop. Commands are never sent before the socket
/// file is confirmed to exist.
///
/// # Errors
///
/// Fails when the helper dies first or the socket never appears within
/// the deadline.
pub fn wait_for_api_socket(path: &Path, pid: u32) -> NetResult<()> {
    let (tx, rx) = crossbeam_channel::bounded::<UsernetError>(1);
    let _watcher = std::thread::spawn(move || {
        let mut elapsed = Duration::ZERO;
        while elapsed < SOCKET_WAIT_TIMEOUT {
            match check_child(pid, "slirp4netns") {
                Ok(ChildState::Running) => {}
                Ok(ChildState::Exited(status)) => {
                    let _ = tx.try_send(UsernetError::HelperFailed {
                        helper: "slirp4netns".to_string(),
                        log: format!("exited with status {status} before creating the API socket"),
                    });
                    return;
                }
                Ok(ChildState::Signaled) => {
                    let _ = tx.try_send(UsernetError::HelperKilled {
                        helper: "slirp4netns".to_string(),
                    });
                    return;
                }
                // The PID is gone or was reaped elsewhere; nothing
                // useful left to report.
                Err(_) => return,
            }
            std::thread::sleep(SOCKET_WAIT_INTERVAL);
            elapsed += SOCKET_WAIT_INTERVAL;
        }
    });

    let deadline = Instant::now() + SOCKET_WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if path.exists() {
            return Ok(());
        }
        if let Ok(err) = rx.try_recv() {
            return Err(err);
        }
        std::thread::sleep(SOCKET_WAIT_INTERVAL);
    }
    Err(UsernetError::io(
        format!("waiting for the API socket {}", path.display()),
        std::io::Error::new(std::io::ErrorKind::TimedOut, "socket file never appeared"),
    ))
}

/// Register every port mapping with the helper's control socket.
///
/// Each mapping uses its own fresh connection; there is no pipelining.
/// The first rejected mapping aborts the batch, leaving earlier
/// registrations in place.
///
/// # Errors
///
/// [`UsernetError::PortForwardRejected`] when the helper reports an
/// error for a mapping, or an I/O error on the socket.
pub fn register_ports(api_socket: &Path, mappings: &[PortMapping]) -> NetResult<()> {
    for mapping in mappings {
        let mut conn = UnixStream::connect(api_socket).map_err(|e| {
            UsernetError::io(format!("connect to {}", api_socket.display()), e)
        })?;

        let host_addr = mapping
            .host_ip
            .map_or_else(|| "0.0.0.0".to_string(), |ip| ip.to_string());
        let command = HostFwdCommand {
            execute: "add_hostfwd",
            arguments: HostFwdArguments {
                proto: mapping.protocol.as_str(),
                host_addr,
                host_port: mapping.host_port,
                guest_addr: "",
                guest_port: mapping.container_port,
            },
        };
        let mut payload = serde_json::to_vec(&command)?;
        payload.push(b'\n');

        conn.write_all(&payload).map_err(|e| {
            UsernetError::io(format!("write to control socket {}", api_socket.display()), e)
        })?;
        // The protocol marks the end of the request by shutting down
        // writes on the connection.
        conn.shutdown(Shutdown::Write).map_err(|e| {
            UsernetError::io(format!("shutdown control socket {}", api_socket.display()), e)
        })?;

        let mut buf = vec![0u8; RESPONSE_LIMIT];
        let n = conn.read(&mut buf).map_err(|e| {
            UsernetError::io(format!("read from control socket {}", api_socket.display()), e)
        })?;
        let response: serde_json::Value = serde_json::from_slice(&buf[..n])?;
        if let Some(error) = response.get("error") {
            return Err(UsernetError::PortForwardRejected {
                reason: error.to_string(),
            });
        }
    }
    tracing::debug!("slirp4netns port forwarding set up via add_hostfwd");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::sync::mpsc;

    /// Serve one canned response per accepted connection, forwarding
    /// each received request line to the test.
    fn control_socket_stub(
        path: &Path,
        responses: Vec<&'static str>,
    ) -> mpsc::Receiver<String> {
        let listener = UnixListener::bind(path).unwrap();
        let (tx, rx) = mpsc::channel();
        let _ = std::thread::spawn(move || {
            for response in responses {
                let (mut conn, _) = listener.accept().unwrap();
                let mut request = String::new();
                let _ = conn.read_to_string(&mut request).unwrap();
                tx.send(request).unwrap();
                conn.write_all(response.as_bytes()).unwrap();
            }
        });
        rx
    }

    #[test]
    fn empty_responses_mean_success() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ctr.net");
        let requests = control_socket_stub(&socket, vec!["{}", "{}"]);

        let mappings = vec![PortMapping::tcp(8080, 80), PortMapping::udp(5353, 53)];
        register_ports(&socket, &mappings).unwrap();

        let first = requests.recv().unwrap();
        assert!(first.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(value["execute"], "add_hostfwd");
        assert_eq!(value["arguments"]["proto"], "tcp");
        assert_eq!(value["arguments"]["host_addr"], "0.0.0.0");
        assert_eq!(value["arguments"]["host_port"], 8080);
        assert_eq!(value["arguments"]["guest_addr"], "");
        assert_eq!(value["arguments"]["guest_port"], 80);

        let second = requests.recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&second).unwrap();
        assert_eq!(value["arguments"]["proto"], "udp");
    }

    #[test]
    fn rejection_aborts_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ctr.net");
        let requests =
            control_socket_stub(&socket, vec!["{}", "{\"error\":\"bad port\"}", "{}"]);

        let mappings = vec![
            PortMapping::tcp(8080, 80),
            PortMapping::tcp(8443, 443),
            PortMapping::tcp(9090, 90),
        ];
        let err = register_ports(&socket, &mappings).unwrap_err();
        match err {
            UsernetError::PortForwardRejected { reason } => {
                assert!(reason.contains("bad port"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // Only the first two mappings ever reached the socket.
        let _ = requests.recv().unwrap();
        let _ = requests.recv().unwrap();
        assert!(requests.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn socket_wait_fails_fast_when_the_helper_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("never.net");

        // A child that exits immediately; its PID stays waitable
        // because nothing else reaps it.
        let child = std::process::Command::new("/bin/true").spawn().unwrap();
        let pid = child.id();
        std::mem::forget(child);
        std::thread::sleep(Duration::from_millis(50));

        let err = wait_for_api_socket(&socket, pid).unwrap_err();
        assert!(matches!(err, UsernetError::HelperFailed { .. }));
    }

    #[test]
    fn socket_wait_succeeds_when_the_file_appears() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("late.net");
        let socket_clone = socket.clone();
        let _ = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let _ = UnixListener::bind(&socket_clone).unwrap();
        });

        // Our own PID is as good as a live helper for the watcher.
        let pid = std::process::id();
        wait_for_api_socket(&socket, pid).unwrap();
    }
}
