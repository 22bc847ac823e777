//! Boot-time device and filesystem preparation.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsFd;

use brig_proto::{Mount, confined_path};
use nix::mount::MsFlags;
use nix::sys::termios::{self, LocalFlags, SetArg};
use tracing::{debug, info};

use crate::devices::{self, RANDOM};
use crate::error::{GuestError, StepExt};
use crate::sys;

/// Seeds the kernel random pool and credits the seed as entropy.
pub fn add_entropy(data: &[u8]) -> Result<(), GuestError> {
    devices::create_random().bootstrap("mknod /random")?;
    let random = File::open(RANDOM).bootstrap("open /random")?;
    sys::add_entropy(&random, data).bootstrap("RNDADDENTROPY")?;
    debug!(bytes = data.len(), "entropy added");
    Ok(())
}

/// Puts a guest terminal into raw mode.
pub fn make_raw(dev: &str) -> Result<(), GuestError> {
    let tty = OpenOptions::new()
        .read(true)
        .write(true)
        .open(dev)
        .bootstrap("open raw tty")?;
    let mut attrs = termios::tcgetattr(&tty).bootstrap("tcgetattr")?;
    termios::cfmakeraw(&mut attrs);
    termios::tcsetattr(&tty, SetArg::TCSANOW, &attrs).bootstrap("tcsetattr")?;
    debug!(dev, "tty raw");
    Ok(())
}

/// Stops a terminal from echoing its input back to its output.
///
/// The host writes timeout tokens into the console's input; echoed, they
/// would land on the host's stdout.
pub fn disable_echo(tty: impl AsFd) -> nix::Result<()> {
    let mut attrs = termios::tcgetattr(tty.as_fd())?;
    attrs.local_flags.remove(LocalFlags::ECHO | LocalFlags::ECHONL);
    termios::tcsetattr(tty.as_fd(), SetArg::TCSANOW, &attrs)
}

/// Mounts one entry beneath the confinement root, creating the mount point.
pub fn mount(entry: &Mount) -> Result<(), GuestError> {
    let target = confined_path(&entry.target);
    let fail = |source: std::io::Error| GuestError::Mount {
        target: target.clone(),
        source,
    };

    fs::create_dir_all(&target).map_err(fail)?;

    let mut flags = MsFlags::empty();
    if entry.read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    if entry.nosuid {
        flags |= MsFlags::MS_NOSUID;
    }
    let data = entry.data.as_deref().filter(|d| !d.is_empty());

    nix::mount::mount(
        Some(entry.source.as_str()),
        target.as_str(),
        Some(entry.fstype.as_str()),
        flags,
        data,
    )
    .map_err(|e| fail(e.into()))?;

    info!(
        fstype = %entry.fstype,
        source = %entry.source,
        target = %entry.target,
        ro = entry.read_only,
        "mounted"
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use brig_proto::confined_path;
    use nix::pty::openpty;
    use nix::sys::termios::{LocalFlags, tcgetattr};

    use super::disable_echo;

    #[test]
    fn mount_targets_stay_beneath_the_root() {
        assert_eq!(confined_path("/usr/lib"), "/host/usr/lib");
        assert_eq!(confined_path("relative"), "/host/relative");
        assert_eq!(confined_path("/../../etc"), "/host/etc");
    }

    #[test]
    fn console_stops_echoing_but_stays_canonical() {
        let pty = openpty(None, None).unwrap();
        assert!(tcgetattr(&pty.slave).unwrap().local_flags.contains(LocalFlags::ECHO));

        disable_echo(&pty.slave).unwrap();

        let flags = tcgetattr(&pty.slave).unwrap().local_flags;
        assert!(!flags.contains(LocalFlags::ECHO));
        assert!(flags.contains(LocalFlags::ICANON));
    }
}
