//! Guest process supervision with three-stage timeout escalation.
//!
//! After the timeout a soft token goes down the control pipe; after one
//! grace window a hard token; after another the whole process group is
//! killed. Waiting blocks on a pidfd, never on a sleep loop.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use brig_proto::ControlToken;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Grace window between escalation stages.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Escalation timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    /// Time the guest gets before the first token.
    pub timeout: Duration,
    /// Time after each token before escalating further.
    pub grace: Duration,
}

impl Escalation {
    /// Escalation after `timeout` with the default grace windows.
    pub const fn after(timeout: Duration) -> Self {
        Self {
            timeout,
            grace: DEFAULT_GRACE,
        }
    }
}

/// Opens a pidfd for `pid`.
fn pidfd_open(pid: u32) -> io::Result<OwnedFd> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: pidfd_open takes a pid and flags and returns a new descriptor.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = i32::try_from(fd).map_err(|_| io::Error::other("pidfd out of range"))?;
    // SAFETY: the kernel just handed us this descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Waits up to `timeout` for `child` to exit. `None` means it is still running.
pub fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    if let Some(status) = child.try_wait()? {
        return Ok(Some(status));
    }
    let pidfd = pidfd_open(child.id())?;
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ms = i32::try_from(remaining.as_micros().div_ceil(1000)).unwrap_or(i32::MAX);
        let mut pfd = libc::pollfd {
            fd: pidfd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&raw mut pfd, 1, ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret > 0 || remaining.is_zero() {
            return child.try_wait();
        }
    }
}

/// Writes one token, tolerating a guest that has stopped listening.
fn send(control: &mut File, token: ControlToken) {
    if let Err(e) = control.write_all(token.as_bytes()) {
        warn!(?token, "control pipe write failed: {e}");
    }
}

/// Waits for `child`, escalating if `escalation` is set.
///
/// `control` is the host end of the control pipe; the kernel process must be
/// the leader of its own process group.
pub fn supervise(
    child: &mut Child,
    control: Option<File>,
    escalation: Option<Escalation>,
) -> io::Result<ExitStatus> {
    let (Some(mut control), Some(esc)) = (control, escalation) else {
        return child.wait();
    };

    if let Some(status) = wait_timeout(child, esc.timeout)? {
        return Ok(status);
    }
    warn!("timed out after {:?}, asking the guest to stop", esc.timeout);
    send(&mut control, ControlToken::Soft);

    if let Some(status) = wait_timeout(child, esc.grace)? {
        return Ok(status);
    }
    warn!("guest still running, forcing the command down");
    send(&mut control, ControlToken::Hard);

    if let Some(status) = wait_timeout(child, esc.grace)? {
        return Ok(status);
    }
    warn!("guest unresponsive, killing its process group");
    let pgid = Pid::from_raw(
        i32::try_from(child.id()).map_err(|_| io::Error::other("pid out of range"))?,
    );
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("killpg: {e}");
        child.kill()?;
    }
    child.wait()
}

/// Shell-style exit code: the status code, or `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}
