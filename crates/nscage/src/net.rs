//! Virtual NIC creation into a child's network namespace.
//!
//! Interfaces are created with a single `RTM_NEWLINK` request per NIC,
//! carrying `IFLA_NET_NS_PID` so the kernel materializes the device
//! directly inside the child's namespace. The request is driven over a
//! blocking route-netlink socket; the helper is a short-lived
//! single-threaded process and has no use for an async connection.

use std::io;

use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL,
    NLM_F_REQUEST,
};
use netlink_packet_route::link::nlas::{Info, InfoData, InfoIpVlan, InfoKind, InfoMacVlan, Nla};
use netlink_packet_route::{LinkMessage, RtnlMessage};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use nix::net::if_::if_nametoindex;
use nix::unistd::Pid;
use thiserror::Error;

/// Interface name limit, including the terminating NUL.
const IFNAMSIZ: usize = 16;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("rtnetlink socket: {0}")]
    Socket(#[source] io::Error),

    #[error("interface name {0:?} is too long")]
    NameTooLong(String),

    #[error("resolve host interface {link}: {source}")]
    ResolveLink {
        link: String,
        source: nix::errno::Errno,
    },

    #[error("send RTM_NEWLINK: {0}")]
    Send(#[source] io::Error),

    #[error("receive netlink reply: {0}")]
    Recv(#[source] io::Error),

    #[error("decode netlink reply: {0}")]
    Decode(String),

    #[error("create interface {name}: {source}")]
    Kernel { name: String, source: io::Error },

    #[error("unexpected netlink reply")]
    UnexpectedReply,
}

/// Kernel macvlan modes (`IFLA_MACVLAN_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacvlanMode {
    Private,
    Vepa,
    Bridge,
    Passthru,
}

impl MacvlanMode {
    fn as_raw(self) -> u32 {
        match self {
            MacvlanMode::Private => 1,
            MacvlanMode::Vepa => 2,
            MacvlanMode::Bridge => 4,
            MacvlanMode::Passthru => 8,
        }
    }
}

/// Kernel ipvlan modes (`IFLA_IPVLAN_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpvlanMode {
    L2,
    L3,
    L3s,
}

impl IpvlanMode {
    fn as_raw(self) -> u16 {
        match self {
            IpvlanMode::L2 => 0,
            IpvlanMode::L3 => 1,
            IpvlanMode::L3s => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicKind {
    Macvlan { mode: MacvlanMode },
    Ipvlan { mode: IpvlanMode },
}

/// One virtual interface to materialize inside the child's namespace.
#[derive(Debug, Clone)]
pub struct NicOptions {
    /// Name the device gets inside the child namespace.
    pub name: String,
    /// Host interface the virtual device hangs off.
    pub link: String,
    pub kind: NicKind,
}

/// Open and connect a blocking `NETLINK_ROUTE` socket.
pub fn init_rtnetlink_socket() -> Result<Socket, NetError> {
    let mut socket = Socket::new(NETLINK_ROUTE).map_err(NetError::Socket)?;
    socket.bind_auto().map_err(NetError::Socket)?;
    socket.connect(&SocketAddr::new(0, 0)).map_err(NetError::Socket)?;
    Ok(socket)
}

fn link_message(nic: &NicOptions, netns_pid: Pid) -> Result<LinkMessage, NetError> {
    if nic.name.len() >= IFNAMSIZ {
        return Err(NetError::NameTooLong(nic.name.clone()));
    }
    let parent = if_nametoindex(nic.link.as_str()).map_err(|e| NetError::ResolveLink {
        link: nic.link.clone(),
        source: e,
    })?;

    let info = match nic.kind {
        NicKind::Macvlan { mode } => vec![
            Info::Kind(InfoKind::MacVlan),
            Info::Data(InfoData::MacVlan(vec![InfoMacVlan::Mode(mode.as_raw())])),
        ],
        NicKind::Ipvlan { mode } => vec![
            Info::Kind(InfoKind::IpVlan),
            Info::Data(InfoData::IpVlan(vec![InfoIpVlan::Mode(mode.as_raw())])),
        ],
    };

    let mut link = LinkMessage::default();
    link.nlas = vec![
        Nla::IfName(nic.name.clone()),
        Nla::Link(parent),
        Nla::NetNsPid(netns_pid.as_raw() as u32),
        Nla::Info(info),
    ];
    Ok(link)
}

/// Create one interface with a single acked `RTM_NEWLINK` request.
///
/// Must run with `CAP_NET_ADMIN` effective in the host namespace; the
/// caller owns that envelope.
pub fn net_if_add(socket: &Socket, nic: &NicOptions, netns_pid: Pid) -> Result<(), NetError> {
    let link = link_message(nic, netns_pid)?;

    let mut req = NetlinkMessage {
        header: NetlinkHeader::default(),
        payload: NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)),
    };
    req.header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL;
    req.finalize();

    let mut buf = vec![0u8; req.header.length as usize];
    req.serialize(&mut buf);
    socket.send(&buf, 0).map_err(NetError::Send)?;

    let mut rbuf = vec![0u8; 4096];
    let n = socket.recv(&mut &mut rbuf[..], 0).map_err(NetError::Recv)?;
    let reply = NetlinkMessage::<RtnlMessage>::deserialize(&rbuf[..n])
        .map_err(|e| NetError::Decode(e.to_string()))?;

    match reply.payload {
        NetlinkPayload::Ack(_) => {
            tracing::debug!(name = %nic.name, link = %nic.link, "created interface");
            Ok(())
        }
        NetlinkPayload::Error(e) => Err(NetError::Kernel {
            name: nic.name.clone(),
            source: io::Error::from_raw_os_error(-e.code),
        }),
        _ => Err(NetError::UnexpectedReply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_stamps_the_child_netns() {
        let nic = NicOptions {
            name: "sb0".into(),
            link: "lo".into(),
            kind: NicKind::Macvlan {
                mode: MacvlanMode::Bridge,
            },
        };
        let link = link_message(&nic, Pid::from_raw(4321)).unwrap();
        assert!(link.nlas.contains(&Nla::IfName("sb0".into())));
        assert!(link.nlas.contains(&Nla::NetNsPid(4321)));
    }

    #[test]
    fn overlong_name_is_refused() {
        let nic = NicOptions {
            name: "a-name-way-past-ifnamsiz".into(),
            link: "lo".into(),
            kind: NicKind::Ipvlan { mode: IpvlanMode::L2 },
        };
        assert!(matches!(
            link_message(&nic, Pid::from_raw(1)),
            Err(NetError::NameTooLong(_))
        ));
    }

    #[test]
    fn mode_constants_match_the_kernel() {
        assert_eq!(MacvlanMode::Private.as_raw(), 1);
        assert_eq!(MacvlanMode::Vepa.as_raw(), 2);
        assert_eq!(MacvlanMode::Bridge.as_raw(), 4);
        assert_eq!(MacvlanMode::Passthru.as_raw(), 8);
        assert_eq!(IpvlanMode::L2.as_raw(), 0);
        assert_eq!(IpvlanMode::L3.as_raw(), 1);
        assert_eq!(IpvlanMode::L3s.as_raw(), 2);
    }
}
