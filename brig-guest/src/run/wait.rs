//! Blocking wait for the next supervision event.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use brig_proto::ControlToken;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, ppoll};
use nix::sys::signal::SigSet;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::warn;

use crate::error::{GuestError, StepExt};
use crate::sys;

/// Descriptor the host's timeout tokens arrive on (the console).
pub const CONTROL_FD: RawFd = 0;

/// One thing that woke the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// A child changed state and was reaped.
    Reaped {
        /// The reaped child.
        pid: Pid,
        /// Its final status.
        status: WaitStatus,
    },
    /// A control byte arrived.
    Control(ControlToken),
    /// Woken without anything to report; look again.
    Interrupted,
}

/// Waits on SIGCHLD and the control channel together.
///
/// SIGCHLD must be blocked by the caller; it is only unblocked atomically
/// inside `ppoll`, so an exit between `waitpid` and `ppoll` is never lost.
#[derive(Debug)]
pub struct Waiter {
    /// Descriptor timeout tokens are read from.
    control: RawFd,
    /// Mask in effect while suspended; SIGCHLD is not in it.
    suspend_mask: SigSet,
    /// False once the control channel hit end of input.
    control_open: bool,
}

impl Waiter {
    /// Creates a waiter reading tokens from `control` and suspending with
    /// `suspend_mask`. `control` must stay open while the waiter is used.
    pub const fn new(control: RawFd, suspend_mask: SigSet) -> Self {
        Self {
            control,
            suspend_mask,
            control_open: true,
        }
    }

    /// Returns the next event, blocking if there is none pending.
    pub fn next(&mut self) -> Result<WaitEvent, GuestError> {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)).spawn_step("waitpid")? {
            WaitStatus::StillAlive => {}
            status => {
                if let Some(pid) = status.pid() {
                    return Ok(WaitEvent::Reaped { pid, status });
                }
            }
        }

        // SAFETY: `new` requires the descriptor to outlive the waiter.
        #[allow(unsafe_code)]
        let control = unsafe { BorrowedFd::borrow_raw(self.control) };
        let mut fds = Vec::with_capacity(1);
        if self.control_open {
            fds.push(PollFd::new(control, PollFlags::POLLIN));
        }
        match ppoll(&mut fds, None, Some(self.suspend_mask)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(WaitEvent::Interrupted),
            Err(e) => return Err(e).spawn_step("ppoll"),
        }
        if fds.is_empty() {
            return Ok(WaitEvent::Interrupted);
        }

        let mut buf = [0u8; 16];
        match sys::read(self.control, &mut buf) {
            Ok(0) => {
                warn!("control channel closed");
                self.control_open = false;
                Ok(WaitEvent::Interrupted)
            }
            Ok(n) => Ok(ControlToken::parse(&buf[..n]).map_or(WaitEvent::Interrupted, WaitEvent::Control)),
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                Ok(WaitEvent::Interrupted)
            }
            Err(e) => {
                warn!("control channel unreadable: {e}");
                self.control_open = false;
                Ok(WaitEvent::Interrupted)
            }
        }
    }
}
