//! Forwarding relay-observed signals to the sandbox child.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Deliver a signal the relay drained from its signalfd to the child.
///
/// `SIGCHLD` is the relay's own termination condition and is not
/// re-delivered; a child that is already gone is not an error either.
pub fn forward(pid: Pid, signal: Signal) {
    if signal == Signal::SIGCHLD {
        return;
    }
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(signal = %signal, "forwarding signal: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::getpid;

    use super::*;

    #[test]
    fn sigchld_is_not_redelivered() {
        // Would be delivered to init otherwise; the early return is the test.
        forward(Pid::from_raw(1), Signal::SIGCHLD);
    }

    #[test]
    fn forwarding_to_self_is_harmless_for_ignored_signals() {
        // SIGURG is ignored by default.
        forward(getpid(), Signal::SIGURG);
    }
}
