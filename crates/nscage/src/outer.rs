//! The privileged sibling helper.
//!
//! Once the launcher enters its new user namespace it loses
//! `CAP_SET[UG]ID` over the host namespace and can no longer install
//! arbitrary subordinate id ranges for its child. The canonical fix is the
//! setuid `newuidmap`/`newgidmap` pair; depending on binaries that may not
//! exist on the host is not acceptable, so that functionality lives here
//! instead: a helper forked *before* the unshare, running as a sibling of
//! the sandbox child with the launcher's original credentials.
//!
//! The protocol over the shared socketpair is fixed-width and strictly
//! ordered:
//!
//! 1. helper ← launcher: the child's pid (4 bytes)
//! 2. helper ← launcher: the cgroup directory fd (`SCM_RIGHTS`, only when
//!    cgroup cleanup is enabled); the helper forks the detached watcher
//! 3. helper: burn uid/gid maps, persist namespace files, create NICs
//! 4. helper → waiter: OK (4 bytes)
//!
//! The child blocks on its inherited copy of the socket until OK arrives,
//! and must not touch `setgroups`/`setuid`/`setgid` before that. A short
//! read anywhere means the peer died: the helper exits silently (the peer
//! already reported), the waiter treats it as fatal.

use std::io::Write as _;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;

use caps::Capability;
use nix::errno::Errno;
use nix::sys::prctl;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{getpid, Pid};
use rustix::fs::{open, openat, Mode, OFlags};
use thiserror::Error;

use crate::capable::{make_capable, CapError};
use crate::cgroup;
use crate::fdpass::{self, FdPassError};
use crate::idmap::{self, IdMap, IdMapError};
use crate::net::{self, NetError, NicOptions};
use crate::nsfs::{self, NsPersistError, NS_COUNT};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("outer helper: fork: {0}")]
    Fork(Errno),

    #[error("outer helper: read child pid: {0}")]
    ReadPid(#[source] std::io::Error),

    #[error("outer helper: send child pid: {0}")]
    SendPid(#[source] std::io::Error),

    #[error("outer helper: write ok: {0}")]
    WriteOk(#[source] std::io::Error),

    #[error("outer helper: read ok: {0}")]
    Sync(#[source] std::io::Error),

    #[error("outer helper died before completing setup")]
    HelperDied,

    #[error("set parent-death signal: {0}")]
    Pdeathsig(Errno),

    #[error("clear signal mask: {0}")]
    SigMask(Errno),

    #[error("open {path}: {source}")]
    OpenProc {
        path: String,
        source: std::io::Error,
    },

    #[error("burn {path}: {op}: {source}")]
    Burn {
        path: &'static str,
        op: &'static str,
        source: std::io::Error,
    },

    #[error("burn {path}: short write")]
    BurnShortWrite { path: &'static str },

    #[error("{which} map: {source}")]
    IdMap {
        which: &'static str,
        source: IdMapError,
    },

    #[error(transparent)]
    Capability(#[from] CapError),

    #[error(transparent)]
    NsPersist(#[from] NsPersistError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    FdPass(#[from] FdPassError),
}

/// Everything the helper will do on behalf of the child, fixed before
/// [`spawn`].
#[derive(Debug, Default)]
pub struct OuterHelperOptions {
    /// The launcher will unshare a user namespace; burn uid/gid maps.
    pub unshare_user: bool,
    /// The launcher will unshare a network namespace; create the NICs.
    pub unshare_net: bool,
    /// The launcher created an ephemeral cgroup and will pass its parent
    /// directory fd; arm the detached watcher.
    pub cgroup_enabled: bool,
    /// Requested uid map. Empty means the default single-id + subuid map.
    pub uid_desired: IdMap,
    /// Requested gid map. Empty means the default single-id + subgid map.
    pub gid_desired: IdMap,
    /// Per-namespace persistence targets, indexed by [`crate::NsType`].
    pub persist: [Option<PathBuf>; NS_COUNT],
    /// Interfaces to materialize inside the child's network namespace.
    pub nics: Vec<NicOptions>,
}

/// Launcher-side handle to a spawned helper. The control socket closes
/// when the handle drops.
#[derive(Debug)]
pub struct OuterHelper {
    pid: Pid,
    fd: OwnedFd,
}

/// Exit disposition of the helper process.
enum HelperExit {
    /// The peer died; it already reported, so exit 1 without noise.
    Silent,
    Fatal(SetupError),
}

impl From<SetupError> for HelperExit {
    fn from(e: SetupError) -> HelperExit {
        HelperExit::Fatal(e)
    }
}

/// Fork the helper while host credentials are still intact.
///
/// Must run before the launcher unshares anything. The helper shares
/// nothing with the launcher but the control socketpair; it dies with the
/// launcher via `PR_SET_PDEATHSIG`.
pub fn spawn(options: OuterHelperOptions) -> Result<OuterHelper, SetupError> {
    let (parent_sock, child_sock) = fdpass::socketpair()?;
    let rootpid = getpid();

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(SetupError::Fork(Errno::last()));
    }
    if pid > 0 {
        drop(child_sock);
        tracing::debug!(helper_pid = pid, "outer helper spawned");
        return Ok(OuterHelper {
            pid: Pid::from_raw(pid),
            fd: parent_sock,
        });
    }

    drop(parent_sock);
    match helper_main(child_sock, &options, rootpid) {
        Ok(()) => unsafe { libc::_exit(0) },
        Err(HelperExit::Silent) => unsafe { libc::_exit(1) },
        Err(HelperExit::Fatal(e)) => {
            let _ = writeln!(std::io::stderr(), "nscage: outer helper: {e}");
            unsafe { libc::_exit(1) }
        }
    }
}

fn helper_main(
    sock: OwnedFd,
    options: &OuterHelperOptions,
    rootpid: Pid,
) -> Result<(), HelperExit> {
    // Die with the launcher rather than linger holding host credentials.
    prctl::set_pdeathsig(Signal::SIGKILL).map_err(SetupError::Pdeathsig)?;
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(SetupError::SigMask)?;

    let mut buf = [0u8; 4];
    let n = unsafe { libc::read(sock.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(SetupError::ReadPid(std::io::Error::last_os_error()).into());
    }
    // Typically the launcher dying before sending, e.g. Ctrl-C. Not worth
    // warning about.
    if n as usize != buf.len() {
        return Err(HelperExit::Silent);
    }
    let child_pid = Pid::from_raw(i32::from_ne_bytes(buf));

    if options.cgroup_enabled {
        let cgroupfd = fdpass::recv_fd(sock.as_fd()).map_err(SetupError::from)?;
        spawn_cgroup_watcher(cgroupfd, rootpid)?;
    }

    if options.unshare_user {
        burn_uidmap_gidmap(child_pid, &options.uid_desired, &options.gid_desired)?;
    }

    nsfs::persist_ns_files(child_pid, &options.persist).map_err(SetupError::from)?;

    if options.unshare_net {
        create_nics(child_pid, &options.nics)?;
    }

    // Unblocks the sibling: every attribute above is now visible to it.
    let ok: i32 = 1;
    let n = unsafe { libc::write(sock.as_raw_fd(), ok.to_ne_bytes().as_ptr().cast(), 4) };
    if n != 4 {
        return Err(SetupError::WriteOk(std::io::Error::last_os_error()).into());
    }
    Ok(())
}

/// Fork the detached cgroup watcher.
///
/// Deliberately never reaped: the watcher has to outlive both the helper
/// and the launcher to observe the cgroup emptying, and reparents to init.
fn spawn_cgroup_watcher(cgroupfd: OwnedFd, rootpid: Pid) -> Result<(), HelperExit> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(SetupError::Fork(Errno::last()).into());
    }
    if pid == 0 {
        match cgroup::watch(cgroupfd, rootpid) {
            Ok(()) => unsafe { libc::_exit(0) },
            Err(e) => {
                let _ = writeln!(std::io::stderr(), "nscage: cgroup watcher: {e}");
                unsafe { libc::_exit(1) }
            }
        }
    }
    tracing::debug!(watcher_pid = pid, "cgroup watcher spawned");
    drop(cgroupfd);
    Ok(())
}

/// Open the file at `path` under `procfd`, write `data` with exactly one
/// syscall, close it.
///
/// `uid_map` and `gid_map` reject every write after the first, so the whole
/// buffer goes in one `write` and a short write is fatal, not retried.
fn burn(procfd: BorrowedFd<'_>, path: &'static str, data: &str) -> Result<(), SetupError> {
    let fd = openat(procfd, path, OFlags::WRONLY, Mode::empty()).map_err(|e| SetupError::Burn {
        path,
        op: "open",
        source: e.into(),
    })?;
    let n = rustix::io::write(&fd, data.as_bytes()).map_err(|e| SetupError::Burn {
        path,
        op: "write",
        source: e.into(),
    })?;
    if n != data.len() {
        return Err(SetupError::BurnShortWrite { path });
    }
    Ok(())
}

fn burn_uidmap_gidmap(
    child_pid: Pid,
    uid_desired: &IdMap,
    gid_desired: &IdMap,
) -> Result<(), SetupError> {
    let procpath = format!("/proc/{child_pid}");
    let procfd = open(&procpath, OFlags::DIRECTORY | OFlags::PATH, Mode::empty()).map_err(|e| {
        SetupError::OpenProc {
            path: procpath.clone(),
            source: e.into(),
        }
    })?;

    let uid_map = idmap::resolve_uid_map(uid_desired).map_err(|e| SetupError::IdMap {
        which: "uid",
        source: e,
    })?;
    let gid_map = idmap::resolve_gid_map(gid_desired).map_err(|e| SetupError::IdMap {
        which: "gid",
        source: e,
    })?;

    let guard = make_capable(&[
        Capability::CAP_SETUID,
        Capability::CAP_SETGID,
        Capability::CAP_DAC_OVERRIDE,
    ])?;
    burn(procfd.as_fd(), "uid_map", &uid_map)?;
    burn(procfd.as_fd(), "gid_map", &gid_map)?;
    guard.reset()?;
    Ok(())
}

fn create_nics(child_pid: Pid, nics: &[NicOptions]) -> Result<(), SetupError> {
    let guard = make_capable(&[Capability::CAP_NET_ADMIN])?;
    let socket = net::init_rtnetlink_socket()?;
    for nic in nics {
        net::net_if_add(&socket, nic, child_pid)?;
    }
    guard.reset()?;
    Ok(())
}

impl OuterHelper {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Unblock the helper with the freshly created child's pid.
    pub fn send_pid(&self, pid: Pid) -> Result<(), SetupError> {
        let bytes = pid.as_raw().to_ne_bytes();
        let n = unsafe { libc::write(self.fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        if n != bytes.len() as isize {
            return Err(SetupError::SendPid(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Hand the helper the cgroup directory fd so it can arm the watcher.
    /// Only valid (and required) when `cgroup_enabled` was set, directly
    /// after [`OuterHelper::send_pid`].
    pub fn send_cgroup_fd(&self, cgroupfd: BorrowedFd<'_>) -> Result<(), SetupError> {
        fdpass::send_fd(self.fd.as_fd(), cgroupfd).map_err(SetupError::from)
    }

    /// Wait for the helper's OK; EOF means it died mid-setup.
    ///
    /// Exactly one process may consume the OK. In the full launch sequence
    /// that is the sandbox child, which inherits a copy of the control fd
    /// and blocks here before touching its own credentials.
    pub fn sync(&self) -> Result<(), SetupError> {
        let mut buf = [0u8; 4];
        let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            -1 => Err(SetupError::Sync(std::io::Error::last_os_error())),
            0 => Err(SetupError::HelperDied),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for(pid: Pid) -> i32 {
        let mut status = 0;
        let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        assert_eq!(rc, pid.as_raw());
        assert!(libc::WIFEXITED(status));
        libc::WEXITSTATUS(status)
    }

    #[test]
    fn degenerate_setup_completes() {
        // Nothing privileged requested: the helper reads a pid, has no
        // work, writes OK and exits 0.
        let helper = spawn(OuterHelperOptions::default()).unwrap();
        helper.send_pid(getpid()).unwrap();
        helper.sync().unwrap();
        assert_eq!(wait_for(helper.pid()), 0);
    }

    #[test]
    fn truncated_pid_makes_the_helper_exit_silently() {
        let helper = spawn(OuterHelperOptions::default()).unwrap();

        // Two bytes instead of four, then EOF on our end: the helper must
        // treat the short read as a dead peer.
        let n = unsafe { libc::write(helper.fd.as_raw_fd(), [1u8, 2].as_ptr().cast(), 2) };
        assert_eq!(n, 2);
        let rc = unsafe { libc::shutdown(helper.fd.as_raw_fd(), libc::SHUT_WR) };
        assert_eq!(rc, 0);

        assert_eq!(wait_for(helper.pid()), 1);
        assert!(matches!(helper.sync(), Err(SetupError::HelperDied)));
    }
}
