//! Controlling-terminal brokering between the launcher and the sandbox
//! child.
//!
//! The pty pair must live in the child's namespaces, so the child allocates
//! it: it opens `/dev/pts/ptmx`, takes the slave as its controlling
//! terminal and sends the master fd back over the setup socket. The parent
//! then relays between its own stdio and the master.
//!
//! The relay never moves bytes directly between stdio and the master.
//! Two pipes sit in between (`stdin → inpipe → master` and
//! `master → outpipe → stdout`) so a blocked sink cannot stall reads from
//! the other direction, and `splice` moves the data without copies. One
//! relay pass services whichever of the four edges is ready, plus a
//! signalfd: window-size changes are applied to the master, every other
//! signal is forwarded to the child, and `SIGCHLD` tells the caller to
//! reap and tear down.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{splice, SpliceFFlags};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::{pipe, setsid, Pid};
use thiserror::Error;

use crate::fdpass::{self, FdPassError};
use crate::sig;

const SPLICE_LEN: usize = 1024;

// Read-side poll slots.
const R_STDIN: usize = 0;
const R_TERM: usize = 1;
const R_SIG: usize = 2;
const R_INPIPE: usize = 3;
const R_OUTPIPE: usize = 4;
const R_NFDS: usize = 5;

// Write-side poll slots.
const W_STDOUT: usize = 0;
const W_TERM: usize = 1;
const W_INPIPE: usize = 2;
const W_OUTPIPE: usize = 3;
const W_NFDS: usize = 4;

#[derive(Debug, Error)]
pub enum TtyError {
    #[error("open /dev/pts/ptmx: {0}")]
    OpenMaster(Errno),

    #[error("unlock pty slave: {0}")]
    UnlockSlave(Errno),

    #[error("open pty slave: {0}")]
    OpenSlave(Errno),

    #[error("set controlling terminal: {0}")]
    SetControlling(Errno),

    #[error("dup pty slave onto stdio: {0}")]
    DupSlave(Errno),

    #[error("terminal attributes: {0}")]
    Termios(Errno),

    #[error("block signals: {0}")]
    SigMask(Errno),

    #[error("signalfd: {0}")]
    SignalFd(Errno),

    #[error("pipe: {0}")]
    Pipe(Errno),

    #[error("poll: {0}")]
    Poll(#[source] io::Error),

    #[error("read window size: {0}")]
    GetWinsize(#[source] io::Error),

    #[error("write window size: {0}")]
    SetWinsize(#[source] io::Error),

    #[error(transparent)]
    FdPass(#[from] FdPassError),
}

/// Child half: allocate the pty pair, hand the master to the parent, and
/// make the slave the controlling terminal on stdio.
///
/// Must run after namespace entry (so the pty belongs to the child's
/// devpts instance) and before the payload exec.
pub fn tty_child(socket: BorrowedFd<'_>) -> Result<(), TtyError> {
    let master = {
        let fd = unsafe { libc::open(c"/dev/pts/ptmx".as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(TtyError::OpenMaster(Errno::last()));
        }
        unsafe { OwnedFd::from_raw_fd(fd) }
    };

    let unlock: libc::c_int = 0;
    if unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSPTLCK, &unlock) } < 0 {
        return Err(TtyError::UnlockSlave(Errno::last()));
    }
    let slave = {
        let fd = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCGPTPEER, libc::O_RDWR) };
        if fd < 0 {
            return Err(TtyError::OpenSlave(Errno::last()));
        }
        unsafe { OwnedFd::from_raw_fd(fd) }
    };

    fdpass::send_fd(socket, master.as_fd())?;
    drop(master);

    // Fails if the child is already a session leader, which is fine.
    let _ = setsid();
    if unsafe { libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY, 0) } < 0 {
        return Err(TtyError::SetControlling(Errno::last()));
    }
    for stdfd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(slave.as_raw_fd(), stdfd) } < 0 {
            return Err(TtyError::DupSlave(Errno::last()));
        }
    }
    // If the slave landed on a standard fd the dup2 was a no-op and the fd
    // must stay open.
    if slave.as_raw_fd() <= libc::STDERR_FILENO {
        std::mem::forget(slave);
    }
    Ok(())
}

/// Parent half of the relay. Owns the pty master and the raw-mode state of
/// the launcher's stdin; dropping it restores the original terminal
/// attributes.
pub struct TtyParent {
    termfd: OwnedFd,
    sigfd: SignalFd,
    inpipe_r: OwnedFd,
    inpipe_w: Option<OwnedFd>,
    outpipe_r: OwnedFd,
    outpipe_w: Option<OwnedFd>,
    rfds: [libc::pollfd; R_NFDS],
    wfds: [libc::pollfd; W_NFDS],
    stdin_orig: Option<Termios>,
}

impl TtyParent {
    /// Put stdin in raw mode, receive the pty master from the child, and
    /// arm the relay.
    ///
    /// When stdin is not a tty (pipes, redirections), termios handling is
    /// skipped entirely and window-size signals are forwarded instead of
    /// handled.
    pub fn setup(socket: BorrowedFd<'_>) -> Result<TtyParent, TtyError> {
        let stdin_orig = if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
            let orig = tcgetattr(std::io::stdin()).map_err(TtyError::Termios)?;
            let mut raw = orig.clone();
            cfmakeraw(&mut raw);
            // Keep output post-processing (ONLCR and friends) as it was.
            raw.output_flags = orig.output_flags;
            tcsetattr(std::io::stdin(), SetArg::TCSANOW, &raw).map_err(TtyError::Termios)?;
            Some(orig)
        } else {
            None
        };

        match Self::arm(socket, &stdin_orig) {
            Ok(parent) => Ok(parent),
            Err(e) => {
                // Raw mode must not outlive a failed setup.
                if let Some(orig) = &stdin_orig {
                    let _ = tcsetattr(std::io::stdin(), SetArg::TCSADRAIN, orig);
                }
                Err(e)
            }
        }
    }

    fn arm(socket: BorrowedFd<'_>, stdin_orig: &Option<Termios>) -> Result<TtyParent, TtyError> {
        // Wait for the child to create the pty pair and pass the master
        // back. Output post-processing on the master would grow carriage
        // returns on everything relayed through it.
        let termfd = fdpass::recv_fd(socket)?;
        let mut tios = tcgetattr(&termfd).map_err(TtyError::Termios)?;
        tios.output_flags
            .remove(nix::sys::termios::OutputFlags::OPOST);
        tcsetattr(&termfd, SetArg::TCSAFLUSH, &tios).map_err(TtyError::Termios)?;

        let mask = SigSet::all();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).map_err(TtyError::SigMask)?;
        let sigfd = SignalFd::with_flags(&mask, SfdFlags::empty()).map_err(TtyError::SignalFd)?;

        let (inpipe_r, inpipe_w) = pipe().map_err(TtyError::Pipe)?;
        let (outpipe_r, outpipe_w) = pipe().map_err(TtyError::Pipe)?;

        // splice to an O_APPEND stdout fails with EINVAL.
        unsafe {
            let flags = libc::fcntl(libc::STDOUT_FILENO, libc::F_GETFL);
            libc::fcntl(libc::STDOUT_FILENO, libc::F_SETFL, flags & !libc::O_APPEND);
        }

        let pfd = |fd: RawFd, events: libc::c_short| libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let rfds = [
            pfd(libc::STDIN_FILENO, libc::POLLIN),
            pfd(termfd.as_raw_fd(), libc::POLLIN),
            pfd(sigfd.as_raw_fd(), libc::POLLIN),
            pfd(inpipe_r.as_raw_fd(), libc::POLLIN),
            pfd(outpipe_r.as_raw_fd(), libc::POLLIN),
        ];
        let wfds = [
            pfd(libc::STDOUT_FILENO, libc::POLLOUT),
            pfd(termfd.as_raw_fd(), libc::POLLOUT),
            pfd(inpipe_w.as_raw_fd(), libc::POLLOUT),
            pfd(outpipe_w.as_raw_fd(), libc::POLLOUT),
        ];

        let parent = TtyParent {
            termfd,
            sigfd,
            inpipe_r,
            inpipe_w: Some(inpipe_w),
            outpipe_r,
            outpipe_w: Some(outpipe_w),
            rfds,
            wfds,
            stdin_orig: stdin_orig.clone(),
        };

        if parent.stdin_orig.is_some() {
            parent.set_winsize()?;
        }
        Ok(parent)
    }

    /// Copy stdin's window size onto the master.
    pub fn set_winsize(&self) -> Result<(), TtyError> {
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        if unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) } < 0 {
            return Err(TtyError::GetWinsize(io::Error::last_os_error()));
        }
        if unsafe { libc::ioctl(self.termfd.as_raw_fd(), libc::TIOCSWINSZ, &ws) } < 0 {
            return Err(TtyError::SetWinsize(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Handle a signal locally if it is the relay's business. Returns false
    /// when the signal should be forwarded to the child instead.
    pub fn handle_sig(&self, signal: Signal) -> Result<bool, TtyError> {
        match signal {
            Signal::SIGWINCH if self.stdin_orig.is_some() => {
                self.set_winsize()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Run one relay pass. Returns true once `SIGCHLD` is observed, so the
    /// caller can reap the child and drop the relay.
    ///
    /// Short reads and writes are not retried within a pass; the next poll
    /// picks the edge up again. A drained source has its poll slot disabled
    /// so subsequent passes do not spin on it.
    pub fn select(&mut self, child: Pid) -> Result<bool, TtyError> {
        let rc = unsafe { libc::poll(self.rfds.as_mut_ptr(), R_NFDS as libc::nfds_t, -1) };
        if rc == 0 {
            return Ok(false);
        }
        if rc < 0 {
            if Errno::last() == Errno::EINTR {
                return Ok(false);
            }
            return Err(TtyError::Poll(io::Error::last_os_error()));
        }
        if unsafe { libc::poll(self.wfds.as_mut_ptr(), W_NFDS as libc::nfds_t, 0) } <= 0 {
            return Ok(false);
        }

        if self.readable(R_STDIN) && self.writable(W_INPIPE) {
            let res = match &self.inpipe_w {
                Some(inpipe_w) => splice(
                    std::io::stdin(),
                    None,
                    inpipe_w,
                    None,
                    SPLICE_LEN,
                    SpliceFFlags::empty(),
                ),
                None => Ok(0),
            };
            match res {
                Ok(n) if n > 0 => {}
                res => {
                    if let Err(e) = res {
                        tracing::warn!("reading from stdin: {e}");
                    }
                    self.rfds[R_STDIN].revents &= !libc::POLLIN;
                    self.wfds[W_INPIPE].revents &= !libc::POLLOUT;
                    self.rfds[R_STDIN].fd = -1;
                    self.close_inpipe_w();
                }
            }
            return Ok(false);
        }

        if self.readable(R_INPIPE) && self.writable(W_TERM) {
            match splice(
                &self.inpipe_r,
                None,
                &self.termfd,
                None,
                SPLICE_LEN,
                SpliceFFlags::empty(),
            ) {
                Ok(n) if n > 0 => {}
                res => {
                    if let Err(e) = res {
                        tracing::warn!("reading from inpipe: {e}");
                    }
                    self.rfds[R_INPIPE].revents &= !libc::POLLIN;
                    self.wfds[W_TERM].revents &= !libc::POLLOUT;
                    self.rfds[R_INPIPE].fd = -1;
                    // Input is exhausted; hand the line discipline an
                    // end-of-transmission so the child sees end-of-input.
                    let delivered = match &self.inpipe_w {
                        Some(fd) => {
                            (unsafe { libc::write(fd.as_raw_fd(), [0x04u8].as_ptr().cast(), 1) })
                                == 1
                        }
                        None => false,
                    };
                    if !delivered {
                        tracing::warn!("writing end-of-transmission to terminal");
                    }
                }
            }
        }

        if self.readable(R_TERM) && self.writable(W_OUTPIPE) {
            let res = match &self.outpipe_w {
                Some(outpipe_w) => splice(
                    &self.termfd,
                    None,
                    outpipe_w,
                    None,
                    SPLICE_LEN,
                    SpliceFFlags::empty(),
                ),
                None => Ok(0),
            };
            match res {
                Ok(n) if n > 0 => {}
                res => {
                    // EIO is how a master reads once the slave side is gone.
                    if let Err(e) = res {
                        if e != Errno::EIO {
                            tracing::warn!("reading from terminal: {e}");
                        }
                    }
                    self.rfds[R_TERM].revents &= !libc::POLLIN;
                    self.wfds[W_OUTPIPE].revents &= !libc::POLLOUT;
                    self.rfds[R_TERM].fd = -1;
                    self.close_outpipe_w();
                }
            }
            return Ok(false);
        }

        if self.readable(R_OUTPIPE) && self.writable(W_STDOUT) {
            match splice(
                &self.outpipe_r,
                None,
                std::io::stdout(),
                None,
                SPLICE_LEN,
                SpliceFFlags::empty(),
            ) {
                Ok(n) if n > 0 => {}
                res => {
                    if let Err(e) = res {
                        tracing::warn!("reading from outpipe: {e}");
                    }
                    self.rfds[R_OUTPIPE].revents &= !libc::POLLIN;
                    self.wfds[W_STDOUT].revents &= !libc::POLLOUT;
                    self.rfds[R_OUTPIPE].fd = -1;
                }
            }
        }

        let mut child_exited = false;
        if self.readable(R_SIG) {
            if let Ok(Some(info)) = self.sigfd.read_signal() {
                if let Ok(signal) = Signal::try_from(info.ssi_signo as i32) {
                    if !self.handle_sig(signal)? {
                        sig::forward(child, signal);
                    }
                    child_exited = signal == Signal::SIGCHLD;
                }
            }
        }
        Ok(child_exited)
    }

    fn readable(&self, slot: usize) -> bool {
        self.rfds[slot].revents & libc::POLLIN != 0
    }

    fn writable(&self, slot: usize) -> bool {
        self.wfds[slot].revents & libc::POLLOUT != 0
    }

    fn close_inpipe_w(&mut self) {
        self.inpipe_w = None;
        self.wfds[W_INPIPE].fd = -1;
    }

    fn close_outpipe_w(&mut self) {
        self.outpipe_w = None;
        self.wfds[W_OUTPIPE].fd = -1;
    }
}

impl Drop for TtyParent {
    fn drop(&mut self) {
        if let Some(orig) = &self.stdin_orig {
            let _ = tcsetattr(std::io::stdin(), SetArg::TCSADRAIN, orig);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;

    /// Stand in for the child: allocate a pty locally and send the master
    /// over the socket, like the real child does from inside its
    /// namespaces.
    fn send_fake_master(socket: OwnedFd) -> OwnedFd {
        let pty = nix::pty::openpty(None, None).unwrap();
        fdpass::send_fd(socket.as_fd(), pty.master.as_fd()).unwrap();
        // Keep the slave open so the master stays usable.
        pty.slave
    }

    /// These tests exercise the non-tty half of setup and need a
    /// non-terminal stdin, which is what test runners provide; skip under
    /// an interactive run.
    fn stdin_is_a_tty() -> bool {
        unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
    }

    #[test]
    fn setup_without_a_tty_skips_termios_and_forwards_winch() {
        if stdin_is_a_tty() {
            return;
        }
        let (parent_sock, child_sock) = fdpass::socketpair().unwrap();
        let _slave = send_fake_master(child_sock);

        // Test stdin is not a terminal.
        let parent = TtyParent::setup(parent_sock.as_fd()).unwrap();
        assert!(parent.stdin_orig.is_none());

        // SIGWINCH is not the relay's business without a tty on stdin.
        assert!(!parent.handle_sig(Signal::SIGWINCH).unwrap());
        assert!(!parent.handle_sig(Signal::SIGTERM).unwrap());
    }

    #[test]
    fn poll_matrix_covers_all_edges() {
        if stdin_is_a_tty() {
            return;
        }
        let (parent_sock, child_sock) = fdpass::socketpair().unwrap();
        let _slave = send_fake_master(child_sock);

        let parent = TtyParent::setup(parent_sock.as_fd()).unwrap();
        assert_eq!(parent.rfds[R_TERM].fd, parent.termfd.as_raw_fd());
        assert_eq!(parent.wfds[W_TERM].fd, parent.termfd.as_raw_fd());
        assert_eq!(parent.rfds[R_SIG].fd, parent.sigfd.as_raw_fd());
        assert_eq!(parent.rfds[R_STDIN].fd, libc::STDIN_FILENO);
        assert_eq!(parent.wfds[W_STDOUT].fd, libc::STDOUT_FILENO);
    }
}
