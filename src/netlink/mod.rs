pub mod monitor;
pub mod netns;
pub mod queries;

use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};

use crate::ipam::IpNet;
use crate::model::MacAddr;

pub use monitor::{Event, NetworkMonitor};
pub use netns::NetnsWorker;

/// Kind reported for interfaces without link info (plain NICs).
pub const KIND_DEVICE: &str = "device";

/// Link-level attributes of one interface, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetIfAttrs {
    pub ifindex: u32,
    pub name: String,
    pub kind: String,
    pub mac: Option<MacAddr>,
    /// Burned-in address; bonding leaves it untouched.
    pub perm_mac: Option<MacAddr>,
    pub mtu: u32,
    pub admin_up: bool,
    pub lower_up: bool,
    pub enslaved: bool,
    pub master_index: Option<u32>,
}

impl NetIfAttrs {
    pub fn is_physical(&self) -> bool {
        self.kind == KIND_DEVICE && self.name != "lo"
    }

    /// Stable hardware identity: the permanent MAC, else the current one.
    pub fn hw_mac(&self) -> Option<MacAddr> {
        self.perm_mac.or(self.mac)
    }
}

/// Cached interface: link attributes plus assigned addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetIf {
    pub attrs: NetIfAttrs,
    pub addrs: Vec<IpNet>,
}

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Bridge => "bridge".to_string(),
        InfoKind::Bond => "bond".to_string(),
        InfoKind::Veth => "veth".to_string(),
        InfoKind::Vlan => "vlan".to_string(),
        InfoKind::Dummy => "dummy".to_string(),
        InfoKind::Other(other) => other.clone(),
        other => format!("{other:?}").to_lowercase(),
    }
}

/// Build interface attributes from a netlink LinkMessage; None without a name.
pub fn attrs_from_link_msg(msg: &LinkMessage) -> Option<NetIfAttrs> {
    let flags = msg.header.flags.bits();

    let mut name = None;
    let mut mac = None;
    let mut perm_mac = None;
    let mut mtu = 0;
    let mut master_index = None;
    let mut kind = KIND_DEVICE.to_string();

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = Some(n.clone()),
            LinkAttribute::Address(bytes) => mac = MacAddr::from_bytes(bytes),
            LinkAttribute::PermAddress(bytes) if bytes.iter().any(|b| *b != 0) => {
                perm_mac = MacAddr::from_bytes(bytes)
            }
            LinkAttribute::Mtu(m) => mtu = *m,
            LinkAttribute::Controller(idx) if *idx != 0 => master_index = Some(*idx),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(k) = info {
                        kind = kind_name(k);
                    }
                }
            }
            _ => {}
        }
    }

    Some(NetIfAttrs {
        ifindex: msg.header.index,
        name: name?,
        kind,
        mac,
        perm_mac,
        mtu,
        admin_up: flags & libc::IFF_UP as u32 != 0,
        lower_up: flags & libc::IFF_LOWER_UP as u32 != 0,
        enslaved: master_index.is_some() || flags & libc::IFF_SLAVE as u32 != 0,
        master_index,
    })
}

/// Extract `(ifindex, address/prefix)` from an address message.
pub fn addr_from_msg(msg: &AddressMessage) -> Option<(u32, IpNet)> {
    let prefix_len = msg.header.prefix_len;
    msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(ip) => {
            IpNet::new(*ip, prefix_len).map(|net| (msg.header.index, net))
        }
        _ => None,
    })
}

/// True if the rtnetlink error carries the given errno.
pub fn is_errno(err: &rtnetlink::Error, errno: i32) -> bool {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|c| c.get()) == Some(-errno),
        _ => false,
    }
}

/// "Already exists" answer to a create request.
pub fn is_exists(err: &rtnetlink::Error) -> bool {
    is_errno(err, libc::EEXIST)
}
