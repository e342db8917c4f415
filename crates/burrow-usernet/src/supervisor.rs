//! Supervision of asynchronously-started helper processes.
//!
//! The helper is spawned with an inherited pipe write end; it writes a
//! short marker there once initialized, or closes it after logging a
//! diagnostic. [`wait_for_ready`] drives the resulting state machine:
//! `Starting -> AwaitingReady -> { Ready, Failed(log) }`. The
//! per-iteration deadline re-arms indefinitely; the wait resolves only
//! on readiness, child exit, or a read error.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use rustix::pipe::PipeFlags;

use crate::error::{NetResult, UsernetError};

/// Descriptor number the child sees for the exit-notification pipe.
pub const EXIT_FD: i32 = 3;
/// Descriptor number the child sees for the readiness pipe.
pub const READY_FD: i32 = 4;

/// An anonymous pipe used for the readiness handshake or for exit
/// notification. The end transferred to the child is closed in the
/// parent right after spawn, so the parent can observe the child's
/// close.
#[derive(Debug)]
pub struct SyncPipe {
    /// Read end.
    pub read: OwnedFd,
    /// Write end.
    pub write: OwnedFd,
}

impl SyncPipe {
    /// Create a new pipe. Both ends are close-on-exec; the spawn path
    /// re-installs the transferred end at a fixed descriptor number.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe cannot be created.
    pub fn new() -> NetResult<Self> {
        let (read, write) = rustix::pipe::pipe_with(PipeFlags::CLOEXEC)
            .map_err(|errno| UsernetError::io("create sync pipe", errno.into()))?;
        Ok(Self { read, write })
    }
}

/// A log file that exists only as an open descriptor.
///
/// The file is unlinked right after creation so nothing leaks on a
/// crash; the helper keeps writing through the inherited descriptor and
/// the supervisor reads it back on failure.
#[derive(Debug)]
pub struct LogFile {
    file: File,
}

impl LogFile {
    /// Create the log file at `path` and immediately unlink it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or removed.
    pub fn create_unlinked(path: &Path) -> NetResult<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| UsernetError::io(format!("create log file {}", path.display()), e))?;
        std::fs::remove_file(path)
            .map_err(|e| UsernetError::io(format!("unlink log file {}", path.display()), e))?;
        Ok(Self { file })
    }

    /// A writable clone of the descriptor, for redirecting a child's
    /// stdout or stderr.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be duplicated.
    pub fn writer(&self) -> NetResult<File> {
        self.file
            .try_clone()
            .map_err(|e| UsernetError::io("duplicate log descriptor", e))
    }

    /// Seek to the start and read the full captured contents.
    ///
    /// # Errors
    ///
    /// Returns an error if seeking or reading fails.
    pub fn read_all(&mut self) -> std::io::Result<String> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut text = String::new();
        let _ = self.file.read_to_string(&mut text)?;
        Ok(text)
    }
}

/// Install the transferred pipe ends at the fixed descriptor numbers
/// and put the child in its own process group. Runs between fork and
/// exec, so only async-signal-safe calls are allowed.
pub(crate) fn install_child_fds(
    cmd: &mut Command,
    exit_raw: RawFd,
    ready_raw: RawFd,
    unshare_mount_ns: bool,
) {
    unsafe {
        let _ = cmd.pre_exec(move || {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // Move both ends clear of the target slots before
            // installing them, in case they already occupy 3 or 4.
            let exit_tmp = libc::fcntl(exit_raw, libc::F_DUPFD_CLOEXEC, 10);
            if exit_tmp < 0 {
                return Err(std::io::Error::last_os_error());
            }
            let ready_tmp = libc::fcntl(ready_raw, libc::F_DUPFD_CLOEXEC, 10);
            if ready_tmp < 0 {
                return Err(std::io::Error::last_os_error());
            }
            // dup2 clears close-on-exec on the new descriptors.
            if libc::dup2(exit_tmp, EXIT_FD) < 0 || libc::dup2(ready_tmp, READY_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            // The installed fds 3/4 must be the child's only copies;
            // a leftover duplicate of the ready write end would keep
            // the parent from ever seeing the child's close.
            if libc::close(exit_tmp) != 0 || libc::close(ready_tmp) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // Keep the sandboxed helper's mount namespace private
            // (slirp4netns would otherwise pivot in the shared one).
            if unshare_mount_ns && libc::unshare(libc::CLONE_NEWNS) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Start the namespace helper.
///
/// The child inherits `exit_read` at descriptor [`EXIT_FD`] and
/// `ready_write` at [`READY_FD`]; both parent copies are closed before
/// this returns. Combined stdout/stderr go to `log`. The returned PID
/// is never waited on beyond [`wait_for_ready`]'s non-blocking checks;
/// the helper outlives the setup call.
///
/// # Errors
///
/// Returns an error if the log descriptor cannot be duplicated or the
/// process cannot be started.
pub fn spawn_helper(
    binary: &Path,
    args: &[String],
    ready_write: OwnedFd,
    exit_read: OwnedFd,
    log: &LogFile,
    unshare_mount_ns: bool,
) -> NetResult<u32> {
    let mut cmd = Command::new(binary);
    let _ = cmd
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.writer()?))
        .stderr(Stdio::from(log.writer()?));
    install_child_fds(
        &mut cmd,
        exit_read.as_raw_fd(),
        ready_write.as_raw_fd(),
        unshare_mount_ns,
    );

    let child = cmd.spawn().map_err(|e| {
        UsernetError::io(format!("start helper process {}", binary.display()), e)
    })?;
    let pid = child.id();
    // Close the parent's copies so the child's close is observable, and
    // detach from the handle; the helper runs for the namespace's life.
    drop(ready_write);
    drop(exit_read);
    drop(child);
    tracing::debug!(pid, helper = %binary.display(), "Helper process started");
    Ok(pid)
}

/// What a non-blocking wait learned about a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildState {
    /// Still running.
    Running,
    /// Exited normally with this status.
    Exited(i32),
    /// Terminated by a signal.
    Signaled,
}

/// Non-blocking `waitpid` on a supervised child.
pub(crate) fn check_child(pid: u32, helper: &str) -> NetResult<ChildState> {
    let mut status: libc::c_int = 0;
    let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
    if ret < 0 {
        return Err(UsernetError::io(
            format!("read {helper} process status"),
            std::io::Error::last_os_error(),
        ));
    }
    if ret == 0 {
        return Ok(ChildState::Running);
    }
    if libc::WIFEXITED(status) {
        Ok(ChildState::Exited(libc::WEXITSTATUS(status)))
    } else if libc::WIFSIGNALED(status) {
        Ok(ChildState::Signaled)
    } else {
        Ok(ChildState::Running)
    }
}

/// Poll the readiness pipe for readability with a bounded deadline.
fn poll_readable(fd: &OwnedFd, timeout: Duration) -> NetResult<bool> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    #[allow(clippy::cast_possible_truncation)]
    let millis = timeout.as_millis().min(i64::from(i32::MAX) as u128) as i32;
    let ret = unsafe { libc::poll(&mut pollfd, 1, millis) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(false);
        }
        return Err(UsernetError::io("poll sync pipe", err));
    }
    Ok(ret > 0)
}

/// Block until the child signals readiness or terminates.
///
/// Each `timeout` expiry triggers a non-blocking wait on the child and
/// re-arms the deadline, so the overall wait is unbounded while the
/// child keeps running. A closed pipe without a marker byte is a
/// failure; the unlinked log is read back and attached.
///
/// # Errors
///
/// [`UsernetError::HelperFailed`] when the child exited (log attached),
/// [`UsernetError::HelperKilled`] when it died to a signal, or an I/O
/// error from the pipe itself.
pub fn wait_for_ready(
    sync_read: &OwnedFd,
    pid: u32,
    helper: &str,
    log: &mut LogFile,
    timeout: Duration,
) -> NetResult<()> {
    let mut buf = [0u8; 16];
    loop {
        if poll_readable(sync_read, timeout)? {
            match rustix::io::read(sync_read, &mut buf[..]) {
                Ok(0) => {
                    // The child closed the pipe without signaling.
                    // Its exit status may not be collectable yet, so
                    // give it a short grace period before classifying.
                    let deadline = Instant::now() + Duration::from_millis(100);
                    loop {
                        match check_child(pid, helper)? {
                            ChildState::Running if Instant::now() < deadline => {
                                std::thread::sleep(Duration::from_millis(5));
                            }
                            ChildState::Signaled => {
                                return Err(UsernetError::HelperKilled {
                                    helper: helper.to_string(),
                                });
                            }
                            ChildState::Running | ChildState::Exited(_) => break,
                        }
                    }
                    let text = log.read_all().unwrap_or_default();
                    return Err(UsernetError::HelperFailed {
                        helper: helper.to_string(),
                        log: text,
                    });
                }
                Ok(_) => return Ok(()),
                Err(rustix::io::Errno::INTR) => {}
                Err(errno) => {
                    return Err(UsernetError::io(
                        format!("read from {helper} sync pipe"),
                        errno.into(),
                    ));
                }
            }
            continue;
        }

        match check_child(pid, helper)? {
            ChildState::Running => {}
            ChildState::Exited(status) => {
                let text = log.read_all().unwrap_or_default();
                tracing::debug!(pid, status, "Helper exited before readiness");
                return Err(UsernetError::HelperFailed {
                    helper: helper.to_string(),
                    log: text,
                });
            }
            ChildState::Signaled => {
                return Err(UsernetError::HelperKilled {
                    helper: helper.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_log(dir: &tempfile::TempDir) -> LogFile {
        LogFile::create_unlinked(&dir.path().join("helper.log")).unwrap()
    }

    fn spawn_shell(script: &str, ready: SyncPipe, exit: SyncPipe, log: &LogFile) -> u32 {
        let args = vec!["-c".to_string(), script.to_string()];
        let pid = spawn_helper(
            Path::new("/bin/sh"),
            &args,
            ready.write,
            exit.read,
            log,
            false,
        )
        .unwrap();
        // Keep the other ends alive for the duration of the test.
        std::mem::forget(exit.write);
        pid
    }

    #[test]
    fn log_file_is_unlinked_but_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.log");
        let mut log = LogFile::create_unlinked(&path).unwrap();
        assert!(!path.exists());
        log.writer().unwrap().write_all(b"diagnostics\n").unwrap();
        assert_eq!(log.read_all().unwrap(), "diagnostics\n");
    }

    #[test]
    fn ready_marker_resolves_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = scratch_log(&dir);
        let ready = SyncPipe::new().unwrap();
        let exit = SyncPipe::new().unwrap();
        let read_end = ready.read.try_clone().unwrap();
        let pid = spawn_shell("printf 1 >&4; sleep 5", ready, exit, &log);
        wait_for_ready(&read_end, pid, "test helper", &mut log, Duration::from_secs(1)).unwrap();
        unsafe {
            let _ = libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    }

    #[test]
    fn exit_before_readiness_attaches_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = scratch_log(&dir);
        let ready = SyncPipe::new().unwrap();
        let exit = SyncPipe::new().unwrap();
        let read_end = ready.read.try_clone().unwrap();
        let pid = spawn_shell("echo boom; exit 1", ready, exit, &log);
        let err = wait_for_ready(
            &read_end,
            pid,
            "test helper",
            &mut log,
            Duration::from_millis(100),
        )
        .unwrap_err();
        match err {
            UsernetError::HelperFailed { log, .. } => assert!(log.contains("boom")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn close_without_marker_fails_while_the_child_lives() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = scratch_log(&dir);
        let ready = SyncPipe::new().unwrap();
        let exit = SyncPipe::new().unwrap();
        let read_end = ready.read.try_clone().unwrap();
        // The child closes its ready fd without writing and keeps
        // running; the parent must see EOF promptly, which only works
        // if fd 4 was the child's sole copy of the write end.
        let pid = spawn_shell("exec 4>&-; sleep 10", ready, exit, &log);
        let started = Instant::now();
        let err = wait_for_ready(
            &read_end,
            pid,
            "test helper",
            &mut log,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, UsernetError::HelperFailed { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        unsafe {
            let _ = libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    }

    #[test]
    fn death_by_signal_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = scratch_log(&dir);
        let ready = SyncPipe::new().unwrap();
        let exit = SyncPipe::new().unwrap();
        let read_end = ready.read.try_clone().unwrap();
        let pid = spawn_shell("kill -9 $$", ready, exit, &log);
        let err = wait_for_ready(
            &read_end,
            pid,
            "test helper",
            &mut log,
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert!(matches!(err, UsernetError::HelperKilled { .. }));
    }
}
