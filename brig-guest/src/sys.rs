//! Raw syscalls the `nix` wrappers don't cover in the shape we need.
//!
//! All `unsafe` code in the guest outside of `fork` lives here.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

// Defined in include/uapi/linux/random.h:
//   #define RNDADDENTROPY _IOW('R', 0x03, int[2])  = 0x40085203
/// `RNDADDENTROPY` ioctl: add bytes to the pool and credit their entropy.
const RNDADDENTROPY: nix::sys::ioctl::ioctl_num_type = 0x4008_5203;

/// `dup2(2)`; a no-op when `from == to`.
pub fn dup2(from: RawFd, to: RawFd) -> io::Result<()> {
    if from == to {
        return Ok(());
    }
    // SAFETY: dup2 only manipulates the descriptor table.
    if unsafe { libc::dup2(from, to) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Closes a raw descriptor in a forked child, where ownership was not transferred.
pub fn close(fd: RawFd) {
    // SAFETY: the caller no longer uses `fd`; errors are irrelevant in a child about to exec.
    unsafe { libc::close(fd) };
}

/// Single `read(2)` into `buf`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for writes of buf.len() bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    usize::try_from(n).map_err(|_| io::Error::last_os_error())
}

/// Terminates a forked child without running exit handlers.
pub fn exit_child(code: i32) -> ! {
    // SAFETY: _exit is always safe to call.
    unsafe { libc::_exit(code) }
}

/// Copies `from` to `to` until end of input. Neither descriptor is closed.
pub fn pump(from: RawFd, to: RawFd) -> io::Result<u64> {
    // SAFETY: both descriptors stay open for the lifetime of these wrappers,
    // and ManuallyDrop keeps them from being closed here.
    let mut src = ManuallyDrop::new(unsafe { File::from_raw_fd(from) });
    let mut dst = ManuallyDrop::new(unsafe { File::from_raw_fd(to) });
    let n = io::copy(&mut *src, &mut *dst)?;
    dst.flush()?;
    Ok(n)
}

/// Feeds `data` into the kernel random pool through an open `/random` node.
pub fn add_entropy(random: &File, data: &[u8]) -> io::Result<()> {
    let len = i32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entropy blob too large"))?;
    let bits = len
        .checked_mul(8)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "entropy blob too large"))?;

    // struct rand_pool_info { int entropy_count; int buf_size; __u32 buf[]; }
    let mut info = Vec::with_capacity(8 + data.len());
    info.extend_from_slice(&bits.to_ne_bytes());
    info.extend_from_slice(&len.to_ne_bytes());
    info.extend_from_slice(data);

    // SAFETY: info is a well-formed rand_pool_info of buf_size trailing bytes.
    if unsafe { libc::ioctl(random.as_raw_fd(), RNDADDENTROPY, info.as_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Installs a no-op SIGCHLD handler.
///
/// Reaping stays explicit; the handler exists so that a child exit
/// interrupts `ppoll` instead of being discarded by the default disposition.
pub fn install_sigchld_wakeup() -> io::Result<()> {
    // SAFETY: the handler does nothing, which is trivially async-signal-safe.
    unsafe { signal_hook::low_level::register(libc::SIGCHLD, || {}) }?;
    Ok(())
}
