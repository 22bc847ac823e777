//! Run engine: executes one configured [`Run`] at a time.
//!
//! Each run forks a command child and, when output shaping is requested,
//! a relay child that copies the command's combined output to the
//! configured streams. Daemons are left running; foreground runs are
//! supervised until both children are reaped or the host escalates.

mod exec;
mod identity;
mod limits;
mod stdio;
mod supervision;
mod wait;

use std::convert::Infallible;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use brig_proto::{CONFINEMENT_ROOT, Run};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill, sigprocmask};
use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid, chdir, chroot, fork, pipe};
use tracing::{debug, info, warn};

use self::identity::Identity;
pub use self::supervision::TimeoutPhase;
use self::supervision::{Action, Supervision};
use self::wait::{WaitEvent, Waiter};
use crate::error::{GuestError, StepExt};
use crate::fail::{self, Role};
use crate::sys;

/// How a run ended, from the supervisor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A daemon was started and left running.
    Detached {
        /// The daemon's pid.
        pid: Pid,
    },
    /// Every foreground child was reaped without a timeout.
    Completed {
        /// Final status of the command child.
        status: Option<WaitStatus>,
    },
    /// The host signalled a timeout while waiting.
    TimedOut {
        /// How far the escalation went.
        phase: TimeoutPhase,
        /// Final status of the command child, if it was reaped.
        status: Option<WaitStatus>,
    },
}

impl Outcome {
    /// Whether the remaining runs must be skipped.
    pub const fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Runs `runs` in order through `execute`, stopping after the first timeout.
///
/// Non-zero exits do not stop the sequence. Returns how many runs were started.
pub fn run_sequence<F>(runs: &[Run], mut execute: F) -> Result<usize, GuestError>
where
    F: FnMut(&Run) -> Result<Outcome, GuestError>,
{
    for (i, run) in runs.iter().enumerate() {
        let outcome = execute(run)?;
        if outcome.timed_out() {
            warn!(cmd = %run.cmd, ?outcome, "timed out, skipping remaining runs");
            return Ok(i + 1);
        }
    }
    Ok(runs.len())
}

/// SIGCHLD held off for the duration of one run.
///
/// Restored on drop in the supervisor, and explicitly in children.
#[derive(Debug)]
struct SigchldBlock {
    /// Mask in effect before blocking.
    original: SigSet,
}

impl SigchldBlock {
    /// Blocks SIGCHLD, remembering the previous mask.
    fn new() -> Result<Self, GuestError> {
        let mut block = SigSet::empty();
        block.add(Signal::SIGCHLD);
        let mut original = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_SETMASK, None, Some(&mut original)).spawn_step("sigprocmask")?;
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&block), None).spawn_step("sigprocmask")?;
        Ok(Self { original })
    }

    /// Reinstates the original mask.
    fn restore(&self) -> Result<(), GuestError> {
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.original), None).spawn_step("sigprocmask")
    }
}

impl Drop for SigchldBlock {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

/// Forks and runs `body` in the child. The child never returns: `body`
/// either execs, exits on its own, or fails and exits non-zero.
#[allow(unsafe_code)]
fn spawn<F>(what: &'static str, body: F) -> Result<Pid, GuestError>
where
    F: FnOnce() -> Result<Infallible, GuestError>,
{
    // SAFETY: the supervisor is single-threaded, so the child inherits a
    // consistent address space.
    match unsafe { fork() }.spawn_step("fork")? {
        ForkResult::Parent { child } => {
            debug!(%child, what, "spawned");
            Ok(child)
        }
        ForkResult::Child => match body() {
            Ok(never) => match never {},
            Err(e) => fail::fatal(Role::Child, &e),
        },
    }
}

/// Moves the calling child into the confinement root and, optionally, a
/// reduced identity.
fn confine(cwd: Option<&str>, identity: Option<Identity>) -> Result<(), GuestError> {
    chdir(CONFINEMENT_ROOT).spawn_step("chdir /host")?;
    chroot(".").spawn_step("chroot")?;
    chdir(cwd.filter(|c| !c.is_empty()).unwrap_or("/")).spawn_step("chdir cwd")?;
    if let Some(id) = identity {
        identity::assume(id)?;
    }
    Ok(())
}

/// Starts the relay child, returning its pid and the pipe end the command
/// writes into.
fn spawn_relay(
    run: &Run,
    identity: Option<Identity>,
    mask: &SigchldBlock,
) -> Result<(Pid, OwnedFd), GuestError> {
    let (read, write) = pipe().spawn_step("pipe")?;
    let pid = spawn("relay", || {
        mask.restore()?;
        sys::dup2(read.as_raw_fd(), 0).spawn_step("dup2 relay")?;
        sys::close(read.as_raw_fd());
        sys::close(write.as_raw_fd());
        stdio::connect_outputs(&run.output, &run.error)?;
        confine(run.cwd.as_deref(), identity)?;
        sys::pump(0, 1).spawn_step("relay output")?;
        sys::exit_child(0)
    })?;
    drop(read);
    Ok((pid, write))
}

/// Starts the command child.
fn spawn_command(
    run: &Run,
    identity: Option<Identity>,
    relay: Option<&OwnedFd>,
    mask: &SigchldBlock,
) -> Result<Pid, GuestError> {
    spawn("command", || {
        stdio::redirect(run, relay.map(AsRawFd::as_raw_fd))?;
        confine(run.cwd.as_deref(), identity)?;
        limits::apply(&run.limits)?;
        mask.restore()?;
        Err(exec::exec(run))
    })
}

/// Executes one run and reports how it ended.
pub fn execute(run: &Run) -> Result<Outcome, GuestError> {
    info!(cmd = %run.cmd, args = ?run.args, daemon = run.daemon, "run");
    let mask = SigchldBlock::new()?;
    let identity = identity::derive(run);

    let relay = if run.relay_output {
        Some(spawn_relay(run, identity, &mask)?)
    } else {
        None
    };
    let child = spawn_command(run, identity, relay.as_ref().map(|(_, w)| w), &mask)?;
    // The relay sees end of input once the command's copies are gone.
    let relay = relay.map(|(pid, _write)| pid);

    if run.daemon {
        return Ok(Outcome::Detached { pid: child });
    }
    supervise(Supervision::new(child, relay), &mask, wait::CONTROL_FD)
}

/// Waits out a foreground run, taking timeout tokens from `control`.
fn supervise(
    mut sup: Supervision,
    mask: &SigchldBlock,
    control: RawFd,
) -> Result<Outcome, GuestError> {
    let mut waiter = Waiter::new(control, mask.original);
    loop {
        let action = match waiter.next()? {
            WaitEvent::Reaped { pid, status } => {
                debug!(%pid, ?status, "reaped");
                sup.on_reaped(pid, status)
            }
            WaitEvent::Control(token) => {
                warn!(?token, "timeout from host");
                sup.on_control(token)
            }
            WaitEvent::Interrupted => Action::Continue,
        };
        match action {
            Action::Continue => {}
            Action::Signal(pid, signal) => signal_child(pid, signal)?,
            Action::Finish => break,
            Action::Abandon => {
                for pid in sup.running() {
                    signal_child(pid, Signal::SIGKILL)?;
                }
                break;
            }
        }
    }

    Ok(match sup.phase() {
        TimeoutPhase::None => {
            info!(status = ?sup.status(), "run finished");
            Outcome::Completed {
                status: sup.status(),
            }
        }
        phase => Outcome::TimedOut {
            phase,
            status: sup.status(),
        },
    })
}

/// Signals a tracked child. It cannot have vanished: it is unreaped.
fn signal_child(pid: Pid, signal: Signal) -> Result<(), GuestError> {
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).spawn_step("kill"),
    }
}
