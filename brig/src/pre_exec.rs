//! Pre-exec hardening for the guest kernel process.
//!
//! Applied after `fork()` but before `exec()`:
//! 1. **Die with parent**: `PR_SET_PDEATHSIG(SIGKILL)` prevents orphaned guests.
//! 2. **Console descriptors**: clear `FD_CLOEXEC` on every descriptor named
//!    in a `conN=fd:` argument so the kernel inherits it.
//! 3. **Own process group**: so escalation can kill the kernel and all of
//!    its helper processes at once.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Installs the pre-exec hooks on `cmd`. `inherit` lists the descriptors to pass through.
pub fn apply(cmd: &mut Command, inherit: Vec<RawFd>) {
    cmd.process_group(0);

    // SAFETY: only async-signal-safe syscalls run between fork and exec, and
    // `inherit` is not reallocated there.
    unsafe {
        cmd.pre_exec(move || {
            #[cfg(target_os = "linux")]
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);

            for &fd in &inherit {
                clear_cloexec(fd)?;
            }
            Ok(())
        });
    }
}

/// Clears `FD_CLOEXEC` on `fd`.
fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl(F_GETFD/F_SETFD) is async-signal-safe; an invalid fd yields EBADF.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn passed_descriptor_survives_exec() {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        let fd = write.as_raw_fd();

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("echo ok >&{fd}"));
        apply(&mut cmd, vec![fd]);
        let status = cmd.status().unwrap();
        assert!(status.success());
        drop(write);

        let out = std::io::read_to_string(std::fs::File::from(read)).unwrap();
        assert_eq!(out, "ok\n");
    }

    #[test]
    fn unknown_descriptor_fails_spawn() {
        let mut cmd = Command::new("true");
        apply(&mut cmd, vec![9999]);
        assert!(cmd.status().is_err());
    }
}
