//! Persisting a child's namespaces as bind-mounted files.
//!
//! A namespace stays alive as long as something holds it open; bind-mounting
//! `/proc/<pid>/ns/<name>` onto a regular file keeps it entered-able after
//! every process in it has exited.

use std::path::PathBuf;

use caps::Capability;
use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{unlink, Pid};
use thiserror::Error;

use crate::capable::{make_capable, CapError};

pub const NS_COUNT: usize = 8;

/// Namespace kinds, named after their `/proc/<pid>/ns` entries.
///
/// The short names are stable: persisted paths are re-entered with
/// `nsenter`, which knows them by exactly these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsType {
    User,
    Mnt,
    Net,
    Pid,
    Uts,
    Ipc,
    Cgroup,
    Time,
}

impl NsType {
    pub const ALL: [NsType; NS_COUNT] = [
        NsType::User,
        NsType::Mnt,
        NsType::Net,
        NsType::Pid,
        NsType::Uts,
        NsType::Ipc,
        NsType::Cgroup,
        NsType::Time,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NsType::User => "user",
            NsType::Mnt => "mnt",
            NsType::Net => "net",
            NsType::Pid => "pid",
            NsType::Uts => "uts",
            NsType::Ipc => "ipc",
            NsType::Cgroup => "cgroup",
            NsType::Time => "time",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Error)]
pub enum NsPersistError {
    #[error("create {path}: {source}")]
    Create { path: String, source: Errno },

    #[error("bind-mount {src} to {dst}: destination is not on a private mount")]
    NotPrivate { src: String, dst: String },

    #[error("bind-mount {src} to {dst}: {source}")]
    Mount {
        src: String,
        dst: String,
        source: Errno,
    },

    #[error(transparent)]
    Capability(#[from] CapError),
}

/// Bind-mount `/proc/<pid>/ns/<name>` onto each requested target path.
///
/// Target files are created first (`EEXIST` is fine). `ENOENT` from the
/// mount means the running kernel lacks that namespace type; the target is
/// removed and the remaining namespaces proceed. On every other failure the
/// empty target is removed before reporting.
pub fn persist_ns_files(
    pid: Pid,
    persist: &[Option<PathBuf>; NS_COUNT],
) -> Result<(), NsPersistError> {
    for ns in NsType::ALL {
        let Some(target) = &persist[ns.index()] else {
            continue;
        };

        match mknod(target.as_path(), SFlag::S_IFREG, Mode::empty(), 0) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => {
                return Err(NsPersistError::Create {
                    path: target.display().to_string(),
                    source: e,
                })
            }
        }

        let src = format!("/proc/{}/ns/{}", pid, ns.name());

        let guard = make_capable(&[Capability::CAP_SYS_ADMIN, Capability::CAP_SYS_PTRACE])?;
        let mounted = mount(
            Some(src.as_str()),
            target.as_path(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        );
        guard.reset()?;

        if let Err(e) = mounted {
            let _ = unlink(target.as_path());
            match e {
                // Kernel does not support this namespace type.
                Errno::ENOENT => continue,
                Errno::EINVAL => {
                    return Err(NsPersistError::NotPrivate {
                        src,
                        dst: target.display().to_string(),
                    })
                }
                e => {
                    return Err(NsPersistError::Mount {
                        src,
                        dst: target.display().to_string(),
                        source: e,
                    })
                }
            }
        }
        tracing::debug!(ns = ns.name(), target = %target.display(), "persisted namespace");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ns_names_are_stable() {
        let names: Vec<&str> = NsType::ALL.iter().map(|ns| ns.name()).collect();
        assert_eq!(
            names,
            ["user", "mnt", "net", "pid", "uts", "ipc", "cgroup", "time"]
        );
    }

    #[test]
    fn indices_cover_the_persist_array() {
        for (i, ns) in NsType::ALL.iter().enumerate() {
            assert_eq!(ns.index(), i);
        }
    }

    #[test]
    fn nothing_to_persist_is_a_no_op() {
        let persist: [Option<PathBuf>; NS_COUNT] = Default::default();
        persist_ns_files(Pid::from_raw(1), &persist).unwrap();
    }
}
