//! Ephemeral cgroup lifetime watching and cleanup.
//!
//! When the launcher puts the sandbox into its own cgroup v2 directory,
//! somebody has to delete that directory after the last process leaves it,
//! and that moment can come after the launcher itself is gone. The watcher
//! is therefore a detached process: it takes ownership of the parent cgroup
//! directory fd, waits for the `populated` flag of
//! `<dir>/bst.<rootpid>/cgroup.events` to reach 0, removes the cgroup
//! and exits.
//!
//! `cgroup.events` does not support being re-read in place; the watcher
//! arms an edge-triggered epoll on it and opens a fresh fd on every wake to
//! see the current state. Field order within the file is unspecified, so
//! every line is inspected; wakes where `populated` is still 1 are
//! harmless.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, OwnedFd};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::{setsid, Pid};
use rustix::fs::{openat, unlinkat, AtFlags, Dir, FileType, Mode, OFlags};
use thiserror::Error;

/// Upper bound on a single `cgroup.events` line.
const EVENTS_LINE_MAX: usize = 128;

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("create new session for the cgroup watcher: {0}")]
    Setsid(nix::errno::Errno),

    #[error("open {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("epoll on cgroup.events: {0}")]
    Epoll(nix::errno::Errno),

    #[error("read cgroup.events: {0}")]
    Read(#[source] io::Error),

    #[error("cgroup.events line exceeds {} bytes", EVENTS_LINE_MAX)]
    LineTooLong,

    #[error("remove cgroup {path}: {source}")]
    Remove { path: String, source: io::Error },
}

/// Name of the ephemeral cgroup directory for a given launcher root pid.
///
/// The launcher creates this directory before the watcher ever runs; the
/// name is part of that contract and cannot change independently.
pub fn subcgroup_name(rootpid: Pid) -> String {
    format!("bst.{rootpid}")
}

/// Watch the ephemeral cgroup until it empties, then remove it.
///
/// Becomes its own session leader first, so job-control signals aimed at
/// the launcher's group cannot take the watcher down with it.
pub fn watch(cgroupfd: OwnedFd, rootpid: Pid) -> Result<(), CgroupError> {
    setsid().map_err(CgroupError::Setsid)?;

    let name = subcgroup_name(rootpid);
    let subfd = openat(
        &cgroupfd,
        &name,
        OFlags::DIRECTORY | OFlags::RDONLY,
        Mode::empty(),
    )
    .map_err(|e| CgroupError::Open {
        path: name.clone(),
        source: e.into(),
    })?;
    let cevent = openat(&subfd, "cgroup.events", OFlags::RDONLY, Mode::empty()).map_err(|e| {
        CgroupError::Open {
            path: "cgroup.events".into(),
            source: e.into(),
        }
    })?;

    // Edge-triggered, no read interest: cgroup.events signals changes with
    // EPOLLPRI/EPOLLERR, and EPOLLERR is always reported.
    let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(CgroupError::Epoll)?;
    epoll
        .add(&cevent, EpollEvent::new(EpollFlags::EPOLLET, 0))
        .map_err(CgroupError::Epoll)?;

    let mut events = [EpollEvent::empty(); 1];
    loop {
        epoll
            .wait(&mut events, EpollTimeout::NONE)
            .map_err(CgroupError::Epoll)?;

        // A fresh fd is required to observe the new state.
        let fd = openat(&subfd, "cgroup.events", OFlags::RDONLY, Mode::empty()).map_err(|e| {
            CgroupError::Open {
                path: "cgroup.events".into(),
                source: e.into(),
            }
        })?;
        let mut text = String::new();
        File::from(fd)
            .read_to_string(&mut text)
            .map_err(CgroupError::Read)?;

        tracing::debug!(cgroup = %name, "cgroup.events changed");
        if events_show_empty(&text)? {
            clean(&cgroupfd, rootpid)?;
            return Ok(());
        }
    }
}

/// Scan `cgroup.events` content for a `populated 0` line.
fn events_show_empty(text: &str) -> Result<bool, CgroupError> {
    for line in text.lines() {
        if line.len() >= EVENTS_LINE_MAX {
            return Err(CgroupError::LineTooLong);
        }
        if line.starts_with("populated 0") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Remove the ephemeral cgroup and any child cgroups beneath it.
///
/// Cgroup directories only nest one level here (children created for
/// controller delegation); each child must be removed before the parent
/// rmdir can succeed.
pub fn clean(cgroupfd: impl AsFd, rootpid: Pid) -> Result<(), CgroupError> {
    let name = subcgroup_name(rootpid);
    let remove_err = |e: rustix::io::Errno| CgroupError::Remove {
        path: name.clone(),
        source: e.into(),
    };

    let subfd = openat(
        &cgroupfd,
        &name,
        OFlags::DIRECTORY | OFlags::RDONLY,
        Mode::empty(),
    )
    .map_err(|e| CgroupError::Open {
        path: name.clone(),
        source: e.into(),
    })?;

    for entry in Dir::read_from(&subfd).map_err(remove_err)? {
        let entry = entry.map_err(remove_err)?;
        let fname = entry.file_name();
        if fname == c"." || fname == c".." {
            continue;
        }
        if entry.file_type() != FileType::Directory {
            continue;
        }
        unlinkat(&subfd, fname, AtFlags::REMOVEDIR).map_err(remove_err)?;
    }
    unlinkat(&cgroupfd, &name, AtFlags::REMOVEDIR).map_err(remove_err)?;

    tracing::debug!(cgroup = %name, "removed cgroup");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn subcgroup_name_is_the_launcher_contract() {
        assert_eq!(subcgroup_name(Pid::from_raw(1234)), "bst.1234");
    }

    #[test]
    fn populated_zero_terminates() {
        assert!(events_show_empty("populated 0\nfrozen 0\n").unwrap());
    }

    #[test]
    fn still_populated_is_a_false_wake() {
        assert!(!events_show_empty("populated 1\nfrozen 0\n").unwrap());
    }

    #[test]
    fn field_order_does_not_matter() {
        // `populated 0` alongside a later `frozen 1` on the same wake must
        // still terminate.
        assert!(events_show_empty("frozen 1\npopulated 0\n").unwrap());
        assert!(events_show_empty("populated 0\nfrozen 1\n").unwrap());
    }

    #[test]
    fn overlong_line_is_a_protocol_error() {
        let line = "x".repeat(EVENTS_LINE_MAX);
        assert!(matches!(
            events_show_empty(&line),
            Err(CgroupError::LineTooLong)
        ));
    }

    #[test]
    fn clean_removes_children_then_the_cgroup() {
        let root = tempfile::tempdir().unwrap();
        let pid = Pid::from_raw(1234);
        let sub = root.path().join(subcgroup_name(pid));
        fs::create_dir(&sub).unwrap();
        fs::create_dir(sub.join("init")).unwrap();
        fs::create_dir(sub.join("payload")).unwrap();

        let dirfd = File::open(root.path()).unwrap();
        clean(&dirfd, pid).unwrap();
        assert!(!sub.exists());
    }

    #[test]
    fn clean_without_the_cgroup_fails() {
        let root = tempfile::tempdir().unwrap();
        let dirfd = File::open(root.path()).unwrap();
        assert!(matches!(
            clean(&dirfd, Pid::from_raw(77)),
            Err(CgroupError::Open { .. })
        ));
    }
}
