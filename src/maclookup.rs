//! Interface lookup by permanent MAC address.
//!
//! Bonding rewrites the MAC of enslaved NICs, so the address the kernel
//! currently reports is not a stable identity. Links carry their permanent
//! address in IFLA_PERM_ADDRESS and the current one is only the fallback.

use crate::model::MacAddr;
use crate::netlink::{NetIf, NetIfAttrs};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacIf {
    pub ifindex: u32,
    pub name: String,
    pub mac: MacAddr,
}

impl MacIf {
    pub fn from_attrs(attrs: &NetIfAttrs) -> Option<Self> {
        Some(Self {
            ifindex: attrs.ifindex,
            name: attrs.name.clone(),
            mac: attrs.hw_mac()?,
        })
    }
}

/// Interface with the given hardware MAC; physical interfaces win over bonds
/// and bridges that inherited the address.
pub fn by_mac<'a>(
    ifaces: impl IntoIterator<Item = &'a NetIf>,
    mac: MacAddr,
) -> Option<&'a NetIf> {
    let mut matching = ifaces
        .into_iter()
        .filter(|i| i.attrs.hw_mac() == Some(mac));
    let first = matching.next()?;
    if first.attrs.is_physical() {
        return Some(first);
    }
    Some(matching.find(|i| i.attrs.is_physical()).unwrap_or(first))
}

/// Physical interfaces whose hardware MAC starts with `prefix`.
pub fn by_mac_prefix<'a>(
    ifaces: impl IntoIterator<Item = &'a NetIf>,
    prefix: &[u8],
) -> impl Iterator<Item = &'a NetIf> {
    ifaces.into_iter().filter(move |i| {
        i.attrs.is_physical() && i.attrs.hw_mac().is_some_and(|mac| mac.has_prefix(prefix))
    })
}
