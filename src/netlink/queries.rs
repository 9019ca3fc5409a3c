use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;

use futures::{StreamExt, TryStreamExt};
use netlink_packet_core::{NLM_F_ACK, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::link::{
    AfSpecBridge, BridgeVlanInfo, BridgeVlanInfoFlags, InfoBridge, InfoData, InfoKind, LinkAttribute,
    LinkInfo, LinkMessage,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::{LinkUnspec, RouteMessageBuilder};
use tracing::debug;

use super::{NetIf, addr_from_msg, attrs_from_link_msg, is_errno, is_exists};
use crate::ipam::IpNet;
use crate::{Error, Result};

/// Full dump of links and addresses in the namespace of `handle`.
pub async fn dump_interfaces(handle: &rtnetlink::Handle) -> Result<BTreeMap<u32, NetIf>> {
    let mut ifaces = BTreeMap::new();

    let mut links = handle.link().get().execute();
    while let Some(msg) = links.try_next().await? {
        if let Some(attrs) = attrs_from_link_msg(&msg) {
            ifaces.insert(
                attrs.ifindex,
                NetIf {
                    attrs,
                    addrs: Vec::new(),
                },
            );
        }
    }

    let mut addrs = handle.address().get().execute();
    while let Some(msg) = addrs.try_next().await? {
        if let Some((ifindex, net)) = addr_from_msg(&msg)
            && let Some(iface) = ifaces.get_mut(&ifindex)
        {
            iface.addrs.push(net);
        }
    }

    debug!(count = ifaces.len(), "dumped interfaces");
    Ok(ifaces)
}

/// Look up a link by name; `None` when the kernel reports no such device.
pub async fn link_by_name(handle: &rtnetlink::Handle, name: &str) -> Result<Option<LinkMessage>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(msg) => Ok(msg),
        Err(e) if is_errno(&e, libc::ENODEV) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn link_index(handle: &rtnetlink::Handle, name: &str) -> Result<Option<u32>> {
    Ok(link_by_name(handle, name).await?.map(|msg| msg.header.index))
}

/// Index of a link that has to exist in the namespace of `handle`.
pub async fn require_link(handle: &rtnetlink::Handle, name: &str, netns: &str) -> Result<u32> {
    link_index(handle, name)
        .await?
        .ok_or_else(|| Error::LinkNotFound {
            name: name.to_string(),
            netns: netns.to_string(),
        })
}

/// Set a network interface up or down via rtnetlink.
pub async fn link_set_state(handle: &rtnetlink::Handle, ifindex: u32, up: bool) -> Result<()> {
    let builder = rtnetlink::LinkMessageBuilder::<LinkUnspec>::new().index(ifindex);
    let msg = if up { builder.up() } else { builder.down() }.build();
    handle.link().set(msg).execute().await?;
    Ok(())
}

async fn link_set_attr(handle: &rtnetlink::Handle, ifindex: u32, attr: LinkAttribute) -> Result<()> {
    let mut msg = rtnetlink::LinkMessageBuilder::<LinkUnspec>::new()
        .index(ifindex)
        .build();
    msg.attributes.push(attr);
    handle.link().set(msg).execute().await?;
    Ok(())
}

pub async fn link_set_mtu(handle: &rtnetlink::Handle, ifindex: u32, mtu: u32) -> Result<()> {
    link_set_attr(handle, ifindex, LinkAttribute::Mtu(mtu)).await
}

/// Enslave `ifindex` under `master`, or release it with `None`.
pub async fn link_set_master(
    handle: &rtnetlink::Handle,
    ifindex: u32,
    master: Option<u32>,
) -> Result<()> {
    link_set_attr(handle, ifindex, LinkAttribute::Controller(master.unwrap_or(0))).await
}

/// Move a link into the namespace referenced by `ns_file`.
pub async fn link_set_netns(
    handle: &rtnetlink::Handle,
    ifindex: u32,
    ns_file: &std::fs::File,
) -> Result<()> {
    link_set_attr(handle, ifindex, LinkAttribute::NetNsFd(ns_file.as_raw_fd())).await
}

/// Turn VLAN filtering of a bridge on or off.
pub async fn bridge_set_vlan_filtering(
    handle: &rtnetlink::Handle,
    ifindex: u32,
    enable: bool,
) -> Result<()> {
    let mut msg = rtnetlink::LinkMessageBuilder::<LinkUnspec>::new()
        .index(ifindex)
        .build();
    msg.attributes.push(LinkAttribute::LinkInfo(vec![
        LinkInfo::Kind(InfoKind::Bridge),
        LinkInfo::Data(InfoData::Bridge(vec![InfoBridge::VlanFiltering(enable)])),
    ]));
    // Bridge options change through RTM_NEWLINK on the existing link.
    handle
        .link()
        .add(msg)
        .set_flags(NLM_F_REQUEST | NLM_F_ACK)
        .execute()
        .await?;
    Ok(())
}

/// AF_BRIDGE link message carrying one VLAN entry for port `ifindex`.
fn bridge_vlan_msg(ifindex: u32, vid: u16, flags: BridgeVlanInfoFlags) -> LinkMessage {
    let mut msg = LinkMessage::default();
    msg.header.interface_family = AddressFamily::Bridge;
    msg.header.index = ifindex;
    msg.attributes
        .push(LinkAttribute::AfSpecBridge(vec![AfSpecBridge::VlanInfo(BridgeVlanInfo {
            flags,
            vid,
        })]));
    msg
}

/// Add VLAN `vid` to a bridge port: tagged, or as its untagged PVID when `access`.
pub async fn bridge_vlan_add(
    handle: &rtnetlink::Handle,
    ifindex: u32,
    vid: u16,
    access: bool,
) -> Result<()> {
    let flags = if access {
        BridgeVlanInfoFlags::Pvid | BridgeVlanInfoFlags::Untagged
    } else {
        BridgeVlanInfoFlags::empty()
    };
    handle
        .link()
        .set(bridge_vlan_msg(ifindex, vid, flags))
        .execute()
        .await?;
    Ok(())
}

/// Remove VLAN `vid` from a bridge port; a VLAN not present is accepted.
pub async fn bridge_vlan_del(handle: &rtnetlink::Handle, ifindex: u32, vid: u16) -> Result<()> {
    let msg = bridge_vlan_msg(ifindex, vid, BridgeVlanInfoFlags::empty());
    let mut req = NetlinkMessage::from(RouteNetlinkMessage::DelLink(msg));
    req.header.flags = NLM_F_REQUEST | NLM_F_ACK;

    let mut handle = handle.clone();
    let mut response = handle.request(req)?;
    while let Some(msg) = response.next().await {
        if let NetlinkPayload::Error(err) = msg.payload {
            let err = rtnetlink::Error::NetlinkError(err);
            if is_errno(&err, libc::ENOENT) {
                debug!(ifindex, vid, "VLAN already removed");
                return Ok(());
            }
            return Err(err.into());
        }
    }
    Ok(())
}

pub async fn link_add(handle: &rtnetlink::Handle, msg: LinkMessage) -> Result<()> {
    handle.link().add(msg).execute().await?;
    Ok(())
}

/// Delete a link by name; a missing link is not an error.
pub async fn link_del_by_name(handle: &rtnetlink::Handle, name: &str) -> Result<()> {
    let Some(ifindex) = link_index(handle, name).await? else {
        debug!(iface = %name, "link already gone");
        return Ok(());
    };
    handle.link().del(ifindex).execute().await?;
    Ok(())
}

/// Assign an address; an address already present is accepted.
pub async fn address_add(handle: &rtnetlink::Handle, ifindex: u32, net: IpNet) -> Result<()> {
    match handle
        .address()
        .add(ifindex, net.addr(), net.prefix_len())
        .execute()
        .await
    {
        Err(e) if !is_exists(&e) => Err(e.into()),
        _ => Ok(()),
    }
}

/// Add a route; one already present is accepted.
pub async fn route_add(handle: &rtnetlink::Handle, msg: RouteMessage) -> Result<()> {
    match handle.route().add(msg).execute().await {
        Err(e) if !is_exists(&e) => Err(e.into()),
        _ => Ok(()),
    }
}

/// Delete a route; one already gone is accepted.
pub async fn route_del(handle: &rtnetlink::Handle, msg: RouteMessage) -> Result<()> {
    match handle.route().del(msg).execute().await {
        Err(e) if !is_errno(&e, libc::ESRCH) && !is_errno(&e, libc::ENOENT) => Err(e.into()),
        _ => Ok(()),
    }
}

/// Policy rule `[from src] [to dst] lookup table` at `priority`.
pub async fn rule_add_v4(
    handle: &rtnetlink::Handle,
    src: Option<(Ipv4Addr, u8)>,
    dst: Option<(Ipv4Addr, u8)>,
    table: u32,
    priority: u32,
) -> Result<()> {
    let mut req = handle
        .rule()
        .add()
        .v4()
        .table_id(table)
        .priority(priority)
        .action(RuleAction::ToTable);
    if let Some((ip, len)) = src {
        req = req.source_prefix(ip, len);
    }
    if let Some((ip, len)) = dst {
        req = req.destination_prefix(ip, len);
    }
    match req.execute().await {
        Err(e) if !is_exists(&e) => Err(e.into()),
        _ => Ok(()),
    }
}

/// Remove the rule matching the same selector; a missing rule is accepted.
pub async fn rule_del_v4(
    handle: &rtnetlink::Handle,
    src: Option<(Ipv4Addr, u8)>,
    dst: Option<(Ipv4Addr, u8)>,
    table: u32,
    priority: u32,
) -> Result<()> {
    let msg = rule_message_v4(src, dst, table, priority);
    match handle.rule().del(msg).execute().await {
        Err(e) if !is_errno(&e, libc::ENOENT) => Err(e.into()),
        _ => Ok(()),
    }
}

fn rule_message_v4(
    src: Option<(Ipv4Addr, u8)>,
    dst: Option<(Ipv4Addr, u8)>,
    table: u32,
    priority: u32,
) -> RuleMessage {
    let mut msg = RuleMessage::default();
    msg.header.family = AddressFamily::Inet;
    msg.header.action = RuleAction::ToTable;
    if let Some((ip, len)) = src {
        msg.header.src_len = len;
        msg.attributes.push(RuleAttribute::Source(IpAddr::V4(ip)));
    }
    if let Some((ip, len)) = dst {
        msg.header.dst_len = len;
        msg.attributes.push(RuleAttribute::Destination(IpAddr::V4(ip)));
    }
    msg.attributes.push(RuleAttribute::Priority(priority));
    msg.attributes.push(RuleAttribute::Table(table));
    msg
}

/// IPv4 default gateway of the main routing table: `(gateway, ifindex)`.
pub async fn default_gateway_v4(handle: &rtnetlink::Handle) -> Result<Option<(IpAddr, u32)>> {
    let route_msg = RouteMessageBuilder::<Ipv4Addr>::new().build();
    let mut routes = handle.route().get(route_msg).execute();
    while let Some(msg) = routes.try_next().await? {
        if let Some(found) = parse_default_gateway(&msg, |a| match a {
            RouteAddress::Inet(ip) => Some(IpAddr::V4(*ip)),
            _ => None,
        }) {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Extract (gateway, ifindex) from a default route message (prefix_len == 0).
fn parse_default_gateway(
    msg: &RouteMessage,
    extract_gw: impl Fn(&RouteAddress) -> Option<IpAddr>,
) -> Option<(IpAddr, u32)> {
    if msg.header.destination_prefix_length != 0 {
        return None;
    }
    let mut gateway = None;
    let mut oif = None;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Gateway(addr) => gateway = extract_gw(addr),
            RouteAttribute::Oif(idx) => oif = Some(*idx),
            _ => {}
        }
    }
    gateway.zip(oif)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_gw(a: &RouteAddress) -> Option<IpAddr> {
        match a {
            RouteAddress::Inet(ip) => Some(IpAddr::V4(*ip)),
            _ => None,
        }
    }

    #[test]
    fn default_route_gateway() {
        let mut msg = RouteMessage::default();
        msg.attributes = vec![
            RouteAttribute::Gateway(RouteAddress::Inet(Ipv4Addr::new(192, 168, 0, 1))),
            RouteAttribute::Oif(2),
        ];
        assert_eq!(
            parse_default_gateway(&msg, v4_gw),
            Some((IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)), 2))
        );
    }

    #[test]
    fn rule_selector() {
        let msg = rule_message_v4(None, Some((Ipv4Addr::new(10, 0, 0, 0), 24)), 501, 500);
        assert_eq!(msg.header.family, AddressFamily::Inet);
        assert_eq!(msg.header.src_len, 0);
        assert_eq!(msg.header.dst_len, 24);
        assert_eq!(
            msg.attributes,
            vec![
                RuleAttribute::Destination(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0))),
                RuleAttribute::Priority(500),
                RuleAttribute::Table(501),
            ]
        );
    }

    #[test]
    fn non_default_route_is_ignored() {
        let mut msg = RouteMessage::default();
        msg.header.destination_prefix_length = 24;
        msg.attributes = vec![
            RouteAttribute::Gateway(RouteAddress::Inet(Ipv4Addr::new(10, 0, 0, 1))),
            RouteAttribute::Oif(2),
        ];
        assert_eq!(parse_default_gateway(&msg, v4_gw), None);
    }

    #[test]
    fn default_route_without_gateway() {
        let mut msg = RouteMessage::default();
        msg.attributes = vec![RouteAttribute::Oif(3)];
        assert_eq!(parse_default_gateway(&msg, v4_gw), None);
    }

    #[test]
    fn access_vlan_message() {
        let flags = BridgeVlanInfoFlags::Pvid | BridgeVlanInfoFlags::Untagged;
        let msg = bridge_vlan_msg(7, 100, flags);
        assert_eq!(msg.header.interface_family, AddressFamily::Bridge);
        assert_eq!(msg.header.index, 7);
        assert_eq!(
            msg.attributes,
            vec![LinkAttribute::AfSpecBridge(vec![AfSpecBridge::VlanInfo(
                BridgeVlanInfo { flags, vid: 100 }
            )])]
        );
    }
}
