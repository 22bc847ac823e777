//! Fatal error handling.
//!
//! The same failure means different things depending on who hits it: the
//! supervisor must never leave the guest hung, so it powers off; a forked
//! child just exits non-zero and lets the supervisor carry on.

use tracing::error;

use crate::error::GuestError;
use crate::sys;

/// Which process is failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// PID 1.
    Supervisor,
    /// A process forked by the run engine.
    Child,
}

/// Logs `err` and terminates according to `role`.
pub fn fatal(role: Role, err: &GuestError) -> ! {
    error!(?role, "brig: {err}");
    match role {
        Role::Supervisor => power_off(),
        Role::Child => sys::exit_child(1),
    }
}

/// Flushes filesystems and powers the guest off.
pub fn power_off() -> ! {
    use nix::sys::reboot::{RebootMode, reboot};

    nix::unistd::sync();
    match reboot(RebootMode::RB_POWER_OFF) {
        Ok(never) => match never {},
        Err(e) => {
            // PID 1 exiting panics the kernel, which still halts the guest.
            error!("brig: reboot: {e}");
            std::process::exit(1)
        }
    }
}
