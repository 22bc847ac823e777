//! Unprivileged identity selection and assumption.

use std::ops::RangeInclusive;

use brig_proto::Run;
use nix::unistd::{Gid, Uid, setgid, setgroups, setuid};

use crate::error::{GuestError, StepExt};

/// Range random sandbox ids are drawn from, clear of ordinary system accounts.
pub const SANDBOX_IDS: RangeInclusive<u32> = 5000..=999_999;

/// Credentials a child switches to before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// User id.
    pub uid: u32,
    /// Group id; also the only supplementary group.
    pub gid: u32,
}

/// Chooses the identity for `run`, or `None` to stay root.
///
/// A zero id under privilege drop is replaced by a random one; uid and gid
/// are drawn independently.
pub fn derive(run: &Run) -> Option<Identity> {
    derive_with(run, || rand::random_range(SANDBOX_IDS))
}

/// [`derive`] with an injectable id source.
fn derive_with(run: &Run, mut pick: impl FnMut() -> u32) -> Option<Identity> {
    if !run.drop_privileges {
        return None;
    }
    let uid = if run.uid == 0 { pick() } else { run.uid };
    let gid = if run.gid == 0 { pick() } else { run.gid };
    Some(Identity { uid, gid })
}

/// Drops to `id`. Groups go first; after `setuid` they can no longer change.
pub fn assume(id: Identity) -> Result<(), GuestError> {
    let gid = Gid::from_raw(id.gid);
    setgroups(&[gid]).spawn_step("setgroups")?;
    setgid(gid).spawn_step("setgid")?;
    setuid(Uid::from_raw(id.uid)).spawn_step("setuid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run::new("id", Vec::<String>::new())
    }

    #[test]
    fn root_runs_keep_identity() {
        assert_eq!(derive_with(&run(), || unreachable!()), None);
        let explicit = Run {
            uid: 1000,
            ..run()
        };
        assert_eq!(derive_with(&explicit, || unreachable!()), None);
    }

    #[test]
    fn explicit_ids_are_kept() {
        let r = run().unprivileged(1000, 100);
        assert_eq!(
            derive_with(&r, || unreachable!()),
            Some(Identity { uid: 1000, gid: 100 })
        );
    }

    #[test]
    fn zero_ids_are_drawn_independently() {
        let mut next = [6000, 7000].into_iter();
        let r = run().unprivileged(0, 0);
        assert_eq!(
            derive_with(&r, || next.next().unwrap_or_default()),
            Some(Identity { uid: 6000, gid: 7000 })
        );

        let r = run().unprivileged(1000, 0);
        assert_eq!(
            derive_with(&r, || 5555),
            Some(Identity { uid: 1000, gid: 5555 })
        );
    }

    #[test]
    fn random_ids_stay_in_range() {
        let r = run().unprivileged(0, 0);
        for _ in 0..100 {
            let id = derive(&r).unwrap_or(Identity { uid: 0, gid: 0 });
            assert!(SANDBOX_IDS.contains(&id.uid));
            assert!(SANDBOX_IDS.contains(&id.gid));
        }
    }
}
