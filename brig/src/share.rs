//! Host directories exposed to the guest.

use std::path::{Path, PathBuf};

use brig_proto::Mount;

use crate::error::{Error, Result};

/// A host directory mounted into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Canonical host path.
    pub host: PathBuf,
    /// Absolute guest path.
    pub guest: String,
    /// Mounted read-write.
    pub writable: bool,
}

impl Share {
    /// Parses `HOST[:GUEST]`. Without `GUEST` the directory appears at its
    /// canonical host path.
    ///
    /// `HOST` may itself contain `:`; the guest path is whatever follows the
    /// last one, unless the whole spec names an existing path. `GUEST`
    /// cannot contain `:`.
    pub fn parse(spec: &str, writable: bool) -> Result<Self> {
        let (host, guest) = match spec.rsplit_once(':') {
            Some((host, guest)) if !Path::new(spec).exists() => (host, Some(guest)),
            _ => (spec, None),
        };
        if host.is_empty() {
            return Err(invalid(spec, "empty host path"));
        }
        let host = std::fs::canonicalize(host).map_err(|e| invalid(spec, &e.to_string()))?;
        let guest = match guest {
            Some(g) if g.starts_with('/') => g.to_owned(),
            Some(_) => return Err(invalid(spec, "guest path must be absolute")),
            None => host
                .to_str()
                .ok_or_else(|| invalid(spec, "host path is not UTF-8"))?
                .to_owned(),
        };
        Ok(Self {
            host,
            guest,
            writable,
        })
    }

    /// The mount entry exposing this share.
    pub fn to_mount(&self) -> Mount {
        Mount::hostfs(
            self.host.to_string_lossy(),
            self.guest.clone(),
            !self.writable,
        )
    }
}

/// Shorthand for [`Error::InvalidShare`].
fn invalid(spec: &str, reason: &str) -> Error {
    Error::InvalidShare {
        spec: spec.to_owned(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_host_path() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let share = Share::parse(dir.path().to_str().unwrap(), false).unwrap();
        assert_eq!(share.host, canonical);
        assert_eq!(share.guest, canonical.to_str().unwrap());

        let mount = share.to_mount();
        assert!(mount.read_only);
        assert_eq!(mount.fstype, "hostfs");
        assert_eq!(mount.data.as_deref(), canonical.to_str());
    }

    #[test]
    fn translated_guest_path() {
        let dir = tempfile::tempdir().unwrap();
        let spec = format!("{}:/work", dir.path().display());
        let share = Share::parse(&spec, true).unwrap();
        assert_eq!(share.guest, "/work");
        assert!(!share.to_mount().read_only);
    }

    #[test]
    fn host_paths_may_contain_colons() {
        let dir = tempfile::tempdir().unwrap();
        let odd = dir.path().join("build:x86_64");
        std::fs::create_dir(&odd).unwrap();
        let canonical = odd.canonicalize().unwrap();

        let whole = Share::parse(odd.to_str().unwrap(), false).unwrap();
        assert_eq!(whole.host, canonical);
        assert_eq!(whole.guest, canonical.to_str().unwrap());

        let mapped = Share::parse(&format!("{}:/out", odd.display()), true).unwrap();
        assert_eq!(mapped.host, canonical);
        assert_eq!(mapped.guest, "/out");
    }

    #[test]
    fn rejects_relative_guest_and_missing_host() {
        let dir = tempfile::tempdir().unwrap();
        let spec = format!("{}:work", dir.path().display());
        assert!(Share::parse(&spec, false).is_err());
        assert!(Share::parse(":/work", false).is_err());
        assert!(Share::parse(&format!("{}/missing", dir.path().display()), false).is_err());
    }
}
