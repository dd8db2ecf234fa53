//! nscage: privileged setup core for an unprivileged Linux namespace
//! sandbox launcher.
//!
//! A launcher that spawns a payload inside fresh namespaces cannot finish
//! the job from inside: the moment it unshares its user namespace it has
//! dropped the host-side credentials needed to install multi-range id maps,
//! bind-mount namespace files or move interfaces into the child's network
//! namespace. This crate implements the cross-process protocol that closes
//! that gap:
//!
//! - **[`outer`]**: a sibling helper forked while host credentials are
//!   still intact; it performs the privileged steps on behalf of the child
//!   and gates the child's startup on their completion
//! - **[`idmap`]**: uid/gid map resolution, projecting the requested map
//!   against `/etc/sub[ug]id` allocations and the caller's own
//!   `/proc/self/[ug]id_map`
//! - **[`cgroup`]**: a detached watcher that removes the launcher's
//!   ephemeral cgroup once the last process in it exits
//! - **[`tty`]**: controlling-terminal brokering; the child allocates the
//!   pty pair in its own namespaces and passes the master back over a
//!   socket, and the parent relays stdio with `splice`
//! - **[`capable`]**, **[`fdpass`]**, **[`nsfs`]**, **[`net`]**, **[`sig`]**:
//!   the capability gate, `SCM_RIGHTS` fd passing, namespace-file
//!   persistence, rtnetlink NIC creation and signal forwarding the above
//!   build on
//!
//! Every component is single-threaded within its process; concurrency is
//! `fork`, and all coordination runs over unix sockets, pipes, signals and
//! procfs. Linux only, by design.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod capable;
pub mod cgroup;
pub mod fdpass;
pub mod idmap;
pub mod net;
pub mod nsfs;
pub mod outer;
pub mod sig;
pub mod tty;

pub use capable::{make_capable, reset_capabilities, CapError, CapGuard};
pub use fdpass::{recv_fd, send_fd, socketpair, FdPassError};
pub use idmap::{Id, IdMap, IdMapError, IdRange};
pub use net::{IpvlanMode, MacvlanMode, NetError, NicKind, NicOptions};
pub use nsfs::{NsType, NS_COUNT};
pub use outer::{OuterHelper, OuterHelperOptions, SetupError};
pub use tty::{tty_child, TtyError, TtyParent};
