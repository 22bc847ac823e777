//! Resource limits applied to a child just before exec.

use brig_proto::{Limit, Resource};
use nix::sys::resource::{Resource as Rlimit, setrlimit};

use crate::error::GuestError;

/// The kernel resource behind a configured kind.
const fn rlimit(resource: Resource) -> Rlimit {
    match resource {
        Resource::As => Rlimit::RLIMIT_AS,
        Resource::Core => Rlimit::RLIMIT_CORE,
        Resource::Cpu => Rlimit::RLIMIT_CPU,
        Resource::Data => Rlimit::RLIMIT_DATA,
        Resource::Fsize => Rlimit::RLIMIT_FSIZE,
        Resource::Memlock => Rlimit::RLIMIT_MEMLOCK,
        Resource::Nofile => Rlimit::RLIMIT_NOFILE,
        Resource::Nproc => Rlimit::RLIMIT_NPROC,
        Resource::Stack => Rlimit::RLIMIT_STACK,
    }
}

/// Negative values mean unlimited.
fn bound(value: i64) -> libc::rlim_t {
    libc::rlim_t::try_from(value).unwrap_or(libc::RLIM_INFINITY)
}

/// Applies every limit in order.
pub fn apply(limits: &[Limit]) -> Result<(), GuestError> {
    for limit in limits {
        setrlimit(rlimit(limit.resource), bound(limit.soft), bound(limit.hard)).map_err(|e| {
            GuestError::Limit {
                resource: limit.resource,
                source: e.into(),
            }
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_is_unlimited() {
        assert_eq!(bound(-1), libc::RLIM_INFINITY);
        assert_eq!(bound(i64::MIN), libc::RLIM_INFINITY);
        assert_eq!(bound(0), 0);
        assert_eq!(bound(4096), 4096);
    }

    #[test]
    fn every_kind_maps_to_a_distinct_resource() {
        let mapped: Vec<_> = Resource::ALL.iter().map(|&r| rlimit(r)).collect();
        for (i, a) in mapped.iter().enumerate() {
            assert!(mapped[i + 1..].iter().all(|b| b != a), "{:?}", Resource::ALL[i]);
        }
    }

    #[test]
    fn empty_list_is_a_no_op() {
        assert!(apply(&[]).is_ok());
    }
}
