//! Discovery of the helper binaries a sandbox needs on the host.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A helper file shipped alongside the `brig` executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Binary {
    /// The user-mode guest kernel.
    Kernel,
    /// The initramfs holding the guest supervisor.
    Initrd,
    /// The port/socket relay, run on both sides of the console.
    Relay,
}

impl Binary {
    /// File name searched for.
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Kernel => "brig-linux",
            Self::Initrd => "brig-initrd.img",
            Self::Relay => "brig-relay",
        }
    }
}

/// Resolves `bin`, honouring an explicit override.
///
/// An override must exist; it is not a hint. Without one the search order
/// is the executable's directory, `<exe>/../lib/brig`, the user data
/// directory, then `PATH`.
pub fn locate(bin: Binary, override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(Error::BinaryNotFound {
                name: bin.file_name(),
                searched: vec![path.to_path_buf()],
            })
        };
    }
    find_in(bin.file_name(), &search_dirs())
}

/// Default search directories, most specific first.
fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir.join("..").join("lib").join("brig"));
        dirs.insert(0, exe_dir);
    }
    if let Some(data) = dirs::data_dir() {
        dirs.push(data.join("brig"));
    }
    if let Some(path) = env::var_os("PATH") {
        dirs.extend(env::split_paths(&path));
    }
    dirs
}

/// First `dir/name` that is a regular file.
fn find_in(name: &'static str, dirs: &[PathBuf]) -> Result<PathBuf> {
    let candidates: Vec<PathBuf> = dirs.iter().map(|d| d.join(name)).collect();
    match candidates.iter().find(|c| c.is_file()) {
        Some(found) => {
            tracing::debug!(name, path = %found.display(), "located");
            Ok(found.clone())
        }
        None => Err(Error::BinaryNotFound {
            name,
            searched: candidates,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn first_match_wins() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(b.path().join("brig-linux"), b"").unwrap();
        fs::write(a.path().join("brig-linux"), b"").unwrap();

        let dirs = [a.path().to_path_buf(), b.path().to_path_buf()];
        assert_eq!(find_in("brig-linux", &dirs).unwrap(), a.path().join("brig-linux"));
    }

    #[test]
    fn directories_do_not_count() {
        let a = tempfile::tempdir().unwrap();
        fs::create_dir(a.path().join("brig-relay")).unwrap();
        let err = find_in("brig-relay", &[a.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound { name: "brig-relay", .. }));
    }

    #[test]
    fn failure_lists_every_candidate() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let dirs = [a.path().to_path_buf(), b.path().to_path_buf()];
        match find_in("brig-initrd.img", &dirs).unwrap_err() {
            Error::BinaryNotFound { searched, .. } => {
                assert_eq!(
                    searched,
                    [a.path().join("brig-initrd.img"), b.path().join("brig-initrd.img")]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn override_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("vmlinux");
        assert!(locate(Binary::Kernel, Some(&kernel)).is_err());

        fs::write(&kernel, b"").unwrap();
        assert_eq!(locate(Binary::Kernel, Some(&kernel)).unwrap(), kernel);
    }
}
