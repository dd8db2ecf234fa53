//! Unix-socket fd passing via `SCM_RIGHTS`.
//!
//! The setup protocol hands two descriptors across process boundaries: the
//! cgroup directory fd (launcher → outer helper) and the pty master
//! (child → launcher). Both travel as a single `SCM_RIGHTS` control message
//! attached to a one-byte payload; the byte itself is opaque.
//!
//! The receiver validates the first control header completely (level, type,
//! length) rather than trusting the peer. EOF on the socket means the peer
//! died before sending and is an error here; callers decide whether that is
//! fatal or a silent exit.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FdPassError {
    #[error("socketpair: {0}")]
    Socketpair(#[source] io::Error),

    #[error("send fd: {0}")]
    Send(#[source] io::Error),

    #[error("recv fd: {0}")]
    Recv(#[source] io::Error),

    #[error("recv fd: peer closed the socket")]
    Eof,

    #[error("recv fd: no control message received")]
    NoControlMessage,

    #[error("recv fd: control message has unexpected length")]
    BadLength,

    #[error("recv fd: control level is not SOL_SOCKET")]
    BadLevel,

    #[error("recv fd: control type is not SCM_RIGHTS")]
    BadType,
}

/// Create an `AF_UNIX SOCK_STREAM` socketpair, close-on-exec.
///
/// After fork each side keeps one end and drops the other.
pub fn socketpair() -> Result<(OwnedFd, OwnedFd), FdPassError> {
    let mut fds = [0i32; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(FdPassError::Socketpair(io::Error::last_os_error()));
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Send one file descriptor over `socket`.
pub fn send_fd(socket: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<(), FdPassError> {
    let data = [0u8; 1];
    let iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: 1,
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(FdPassError::Send(io::Error::other("CMSG_FIRSTHDR null")));
    }
    let raw = fd.as_raw_fd();
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize;
        std::ptr::copy_nonoverlapping(
            (&raw as *const RawFd).cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            size_of::<RawFd>(),
        );
    }

    let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
    if ret < 0 {
        Err(FdPassError::Send(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

/// Receive one file descriptor from `socket`, taking ownership of it.
pub fn recv_fd(socket: BorrowedFd<'_>) -> Result<OwnedFd, FdPassError> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: 1,
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space;

    let ret = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if ret < 0 {
        return Err(FdPassError::Recv(io::Error::last_os_error()));
    }
    if ret == 0 {
        return Err(FdPassError::Eof);
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(FdPassError::NoControlMessage);
    }

    unsafe {
        if (*cmsg).cmsg_len != libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize {
            return Err(FdPassError::BadLength);
        }
        if (*cmsg).cmsg_level != libc::SOL_SOCKET {
            return Err(FdPassError::BadLevel);
        }
        if (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(FdPassError::BadType);
        }
        let mut fd: RawFd = 0;
        std::ptr::copy_nonoverlapping(
            libc::CMSG_DATA(cmsg),
            (&mut fd as *mut RawFd).cast::<u8>(),
            size_of::<RawFd>(),
        );
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn socketpair_creation() {
        let (a, b) = socketpair().unwrap();
        assert!(a.as_raw_fd() >= 0);
        assert!(b.as_raw_fd() >= 0);
        assert_ne!(a.as_raw_fd(), b.as_raw_fd());
    }

    #[test]
    fn send_recv_round_trip() {
        let (parent, child) = socketpair().unwrap();
        let (pipe_r, pipe_w) = nix::unistd::pipe().unwrap();

        send_fd(child.as_fd(), pipe_r.as_fd()).unwrap();
        let received = recv_fd(parent.as_fd()).unwrap();
        drop(pipe_r);

        // Data written to the original write end must come out of the
        // received descriptor.
        let mut w = std::fs::File::from(pipe_w);
        w.write_all(b"ping").unwrap();
        drop(w);

        let mut r = std::fs::File::from(received);
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ping");
    }

    #[test]
    fn recv_reports_eof() {
        let (parent, child) = socketpair().unwrap();
        drop(child);
        match recv_fd(parent.as_fd()) {
            Err(FdPassError::Eof) => {}
            other => panic!("expected Eof, got {other:?}"),
        }
    }
}
