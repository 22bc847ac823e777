//! Device nodes created by the supervisor in the bare initramfs root.
//!
//! Nodes live directly under `/` so that they stay reachable from the
//! supervisor but are invisible beneath the confinement root.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use brig_proto::TTY_COUNT;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::stat::{Mode, SFlag, makedev, mknod};

use crate::error::{GuestError, StepExt};
use crate::sys;

/// Guest console.
pub const CONSOLE: &str = "/console";
/// Block device carrying the configuration image.
pub const IMAGE: &str = "/ubda";
/// Discard device.
pub const NULL: &str = "/null";
/// Kernel entropy pool.
pub const RANDOM: &str = "/random";

/// Character node `(major, minor)` for the console.
const CONSOLE_DEV: (u64, u64) = (5, 1);
/// Block node for the first UML block device.
const IMAGE_DEV: (u64, u64) = (98, 0);
/// Character node for the discard device.
const NULL_DEV: (u64, u64) = (1, 3);
/// Character node for the random device.
const RANDOM_DEV: (u64, u64) = (1, 8);
/// Major number shared by the virtual terminals; the minor is the tty number.
const TTY_MAJOR: u64 = 4;

/// Creates a node at `path`, replacing nothing.
fn node(path: &str, kind: SFlag, (major, minor): (u64, u64)) -> nix::Result<()> {
    mknod(path, kind, Mode::from_bits_truncate(0o644), makedev(major, minor))
}

/// Creates the random device. Only needed when entropy is injected.
pub fn create_random() -> nix::Result<()> {
    node(RANDOM, SFlag::S_IFCHR, RANDOM_DEV)
}

/// Creates the console node and connects it to descriptors 0, 1 and 2.
pub fn attach_console() -> Result<(), GuestError> {
    node(CONSOLE, SFlag::S_IFCHR, CONSOLE_DEV).bootstrap("mknod /console")?;
    open_to(0, CONSOLE, Access::Read).bootstrap("open /console")?;
    open_to(1, CONSOLE, Access::Write).bootstrap("open /console")?;
    open_to(2, CONSOLE, Access::Write).bootstrap("open /console")
}

/// Creates the image, discard and terminal nodes.
pub fn create_nodes() -> Result<(), GuestError> {
    node(IMAGE, SFlag::S_IFBLK, IMAGE_DEV).bootstrap("mknod /ubda")?;
    node(NULL, SFlag::S_IFCHR, NULL_DEV).bootstrap("mknod /null")?;
    for n in 1..=TTY_COUNT {
        node(&format!("/tty{n}"), SFlag::S_IFCHR, (TTY_MAJOR, u64::from(n)))
            .bootstrap("mknod tty")?;
    }
    Ok(())
}

/// How a node is opened onto a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read only.
    Read,
    /// Write only, existing target.
    Write,
}

/// Opens `path` and moves the resulting descriptor onto `fd`.
pub fn open_to(fd: RawFd, path: &str, access: Access) -> io::Result<()> {
    let mut opts = OpenOptions::new();
    match access {
        Access::Read => opts.read(true),
        Access::Write => opts.write(true),
    };
    install(opts.open(path)?.into(), fd)
}

/// Moves `file` onto descriptor `fd`, which survives exec afterwards.
pub fn install(file: OwnedFd, fd: RawFd) -> io::Result<()> {
    if file.as_raw_fd() != fd {
        // Dropping `file` closes the original; the duplicate has no CLOEXEC.
        return sys::dup2(file.as_raw_fd(), fd);
    }
    // Opened straight onto a free `fd`: keep it, minus the CLOEXEC std set.
    fcntl(&file, FcntlArg::F_SETFD(FdFlag::empty()))?;
    let _ = file.into_raw_fd();
    Ok(())
}

#[cfg(test)]
#[allow(unsafe_code, clippy::unwrap_used)]
mod tests {
    use std::fs::File;
    use std::os::fd::{BorrowedFd, FromRawFd};

    use super::*;

    fn cloexec(fd: RawFd) -> bool {
        // SAFETY: the test owns `fd` for the duration of the call.
        let flags = fcntl(unsafe { BorrowedFd::borrow_raw(fd) }, FcntlArg::F_GETFD).unwrap();
        flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn installed_descriptor_survives_exec() {
        let dir = tempfile::tempdir().unwrap();
        let source = File::create(dir.path().join("out")).unwrap();
        let target = File::create(dir.path().join("placeholder")).unwrap().into_raw_fd();
        assert!(cloexec(target));

        install(source.into(), target).unwrap();
        assert!(!cloexec(target));
        // SAFETY: `target` now holds the duplicate and nothing else owns it.
        drop(unsafe { OwnedFd::from_raw_fd(target) });
    }

    #[test]
    fn install_onto_itself_clears_cloexec() {
        let dir = tempfile::tempdir().unwrap();
        let file: OwnedFd = File::create(dir.path().join("out")).unwrap().into();
        let fd = file.as_raw_fd();

        install(file, fd).unwrap();
        assert!(!cloexec(fd));
        // SAFETY: `install` released ownership of `fd`.
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}
