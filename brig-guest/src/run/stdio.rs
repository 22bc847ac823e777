//! Standard stream wiring inside a freshly forked child.
//!
//! Streams are opened in the supervisor's root, before the child confines
//! itself. File streams are resolved with the confinement root as their
//! root, so neither `..` nor a symlink inside a share can leave it.

use std::fs::File;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::Path;

use brig_proto::{CONFINEMENT_ROOT, Run, Stream, TTY_COUNT};
use nix::fcntl::{OFlag, OpenHow, ResolveFlag, openat2};
use nix::sys::stat::Mode;

use crate::devices::{self, Access};
use crate::error::{GuestError, StepExt};
use crate::sys;

/// Guest path backing `stream`, or `None` for [`Stream::Output`].
fn resolve(stream: &Stream) -> io::Result<Option<String>> {
    match stream {
        Stream::Tty(n) if !(1..=TTY_COUNT).contains(n) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no such terminal: tty{n}"),
        )),
        Stream::File(path) if path.split('/').any(|part| part == "..") => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("stream path leaves its root: {path}"),
        )),
        _ => Ok(stream.guest_path()),
    }
}

/// Opens `path` with `root` as the root of resolution.
fn open_beneath(root: &Path, path: &str, write: bool) -> io::Result<OwnedFd> {
    let dir = File::open(root)?;
    let mut how = OpenHow::new()
        .resolve(ResolveFlag::RESOLVE_IN_ROOT | ResolveFlag::RESOLVE_NO_MAGICLINKS);
    how = if write {
        how.flags(OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC)
            .mode(Mode::from_bits_truncate(0o666))
    } else {
        how.flags(OFlag::O_RDONLY | OFlag::O_CLOEXEC)
    };
    Ok(openat2(&dir, path.trim_start_matches('/'), how)?)
}

/// Connects `stream` to descriptor `fd`.
fn open(fd: RawFd, stream: &Stream, write: bool) -> io::Result<()> {
    let Some(path) = resolve(stream)? else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "stream has no target of its own",
        ));
    };
    match stream {
        Stream::File(file) => {
            devices::install(open_beneath(Path::new(CONFINEMENT_ROOT), file, write)?, fd)
        }
        _ if write => devices::open_to(fd, &path, Access::Write),
        _ => devices::open_to(fd, &path, Access::Read),
    }
}

/// Connects descriptors 1 and 2. `error = Output` shares descriptor 1.
pub fn connect_outputs(output: &Stream, error: &Stream) -> Result<(), GuestError> {
    open(1, output, true).spawn_step("open output")?;
    match error {
        Stream::Output => sys::dup2(1, 2).spawn_step("dup2 error"),
        other => open(2, other, true).spawn_step("open error"),
    }
}

/// Wires a command child's streams: input from its config, output either
/// from its config or into the relay pipe.
pub fn redirect(run: &Run, relay: Option<RawFd>) -> Result<(), GuestError> {
    open(0, &run.input, false).spawn_step("open input")?;
    match relay {
        Some(pipe) => {
            sys::dup2(pipe, 1).spawn_step("dup2 relay")?;
            sys::dup2(pipe, 2).spawn_step("dup2 relay")?;
            if pipe > 2 {
                sys::close(pipe);
            }
            Ok(())
        }
        None => connect_outputs(&run.output, &run.error),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;
    use std::io::Read;
    use std::os::unix::fs::symlink;

    use super::*;

    #[test]
    fn terminal_numbers_are_checked() {
        assert!(resolve(&Stream::Tty(0)).is_err());
        assert!(resolve(&Stream::Tty(TTY_COUNT + 1)).is_err());
        assert_eq!(
            resolve(&Stream::Tty(TTY_COUNT)).ok().flatten().as_deref(),
            Some("/tty15")
        );
    }

    #[test]
    fn files_resolve_beneath_the_confinement_root() {
        let path = resolve(&Stream::File("/out/log.txt".into())).ok().flatten();
        assert_eq!(path.as_deref(), Some("/host/out/log.txt"));
    }

    #[test]
    fn parent_components_are_refused() {
        for path in ["../ubda", "/../console", "out/../../tty1", ".."] {
            let err = resolve(&Stream::File(path.into())).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{path}");
        }
        assert!(resolve(&Stream::File("/out/..log".into())).is_ok());
    }

    #[test]
    fn output_alias_has_no_path() {
        assert_eq!(resolve(&Stream::Output).ok().flatten(), None);
        assert!(open(1, &Stream::Output, true).is_err());
    }

    /// `path` as seen from inside `root`, with its parent created there.
    fn mirrored(root: &Path, path: &Path) -> std::path::PathBuf {
        let inside = root.join(path.strip_prefix("/").unwrap());
        fs::create_dir_all(inside.parent().unwrap()).unwrap();
        inside
    }

    #[test]
    fn absolute_symlinks_resolve_inside_the_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let escape = outside.path().join("escaped");
        let inside = mirrored(root.path(), &escape);
        fs::create_dir(root.path().join("share")).unwrap();
        symlink(&escape, root.path().join("share/log")).unwrap();

        drop(open_beneath(root.path(), "/share/log", true).unwrap());

        assert!(!escape.exists());
        assert!(inside.exists());
    }

    #[test]
    fn relative_symlinks_cannot_climb_out() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret");
        fs::write(&secret, "host").unwrap();
        fs::write(mirrored(root.path(), &secret), "guest").unwrap();

        let hops = "../".repeat(root.path().components().count());
        let relative = secret.strip_prefix("/").unwrap().display();
        symlink(format!("{hops}{relative}"), root.path().join("link")).unwrap();

        let mut text = String::new();
        File::from(open_beneath(root.path(), "link", false).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "guest");
    }
}
