//! Scoped raising and dropping of Linux capabilities.
//!
//! The privileged steps (map burning, namespace bind mounts, NIC creation)
//! each run inside a raise/drop envelope: the needed capabilities are moved
//! from the permitted set into the effective set immediately before the
//! syscall and cleared immediately after. [`make_capable`] returns a guard
//! so the drop also happens on error paths.

use caps::errors::CapsError;
use caps::{CapSet, Capability, CapsHashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapError {
    #[error("read permitted capability set: {0}")]
    ReadPermitted(#[source] CapsError),

    #[error("capability {0} is not in the permitted set")]
    NotPermitted(Capability),

    #[error("raise effective capabilities: {0}")]
    Raise(#[source] CapsError),

    #[error("drop effective capabilities: {0}")]
    Drop(#[source] CapsError),
}

/// Witness that the effective set is elevated.
///
/// Call [`CapGuard::reset`] on the normal path to surface drop failures;
/// `Drop` is only the backstop for early returns.
#[derive(Debug)]
pub struct CapGuard {
    armed: bool,
}

/// Raise `mask` into the effective set.
///
/// Every capability in `mask` must already be permitted; refusing up front
/// keeps the failure out of the privileged syscall itself.
pub fn make_capable(mask: &[Capability]) -> Result<CapGuard, CapError> {
    let permitted = caps::read(None, CapSet::Permitted).map_err(CapError::ReadPermitted)?;
    for cap in mask {
        if !permitted.contains(cap) {
            return Err(CapError::NotPermitted(*cap));
        }
    }
    let wanted: CapsHashSet = mask.iter().copied().collect();
    caps::set(None, CapSet::Effective, &wanted).map_err(CapError::Raise)?;
    Ok(CapGuard { armed: true })
}

/// Clear the effective set, leaving the permitted set untouched.
pub fn reset_capabilities() -> Result<(), CapError> {
    caps::clear(None, CapSet::Effective).map_err(CapError::Drop)
}

impl CapGuard {
    pub fn reset(mut self) -> Result<(), CapError> {
        self.armed = false;
        reset_capabilities()
    }
}

impl Drop for CapGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The process must not keep running with an elevated effective set,
        // and there is nobody left to report to from here.
        if let Err(e) = reset_capabilities() {
            eprintln!("nscage: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_always_possible() {
        reset_capabilities().unwrap();
    }

    #[test]
    fn raise_requires_permitted() {
        // Unprivileged runs must refuse before touching the effective set;
        // privileged runs (e.g. root in CI containers) raise and drop.
        match make_capable(&[Capability::CAP_SYS_ADMIN]) {
            Ok(guard) => guard.reset().unwrap(),
            Err(CapError::NotPermitted(cap)) => assert_eq!(cap, Capability::CAP_SYS_ADMIN),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn guard_drop_clears_effective() {
        if let Ok(guard) = make_capable(&[Capability::CAP_SETUID]) {
            drop(guard);
            let effective = caps::read(None, CapSet::Effective).unwrap();
            assert!(!effective.contains(&Capability::CAP_SETUID));
        }
    }
}
