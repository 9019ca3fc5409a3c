//! IP address bookkeeping for the internal links the agent creates.
//!
//! Addresses are handled as exact integers tagged with their byte length, so
//! stepping through a subnet never goes through floating point or truncating
//! casts.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::{Error, Result};

/// Base of the address block used for network-to-router veths (`240.0.0.0/4`).
pub const INTERNAL_IPV4_BASE: Ipv4Addr = Ipv4Addr::new(240, 0, 0, 0);
/// Prefix length of every network-to-router veth subnet.
pub const VETH_PREFIX_LEN: u8 = 30;

/// An IP address as an integer with a fixed byte length (4 or 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpInt {
    num: u128,
    len: u8,
}

impl IpInt {
    pub fn new(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                num: u32::from(v4) as u128,
                len: 4,
            },
            IpAddr::V6(v6) => Self {
                num: u128::from(v6),
                len: 16,
            },
        }
    }

    pub fn byte_len(&self) -> u8 {
        self.len
    }

    fn max(&self) -> u128 {
        if self.len == 4 { u32::MAX as u128 } else { u128::MAX }
    }

    /// Step forward by `n`; fails when leaving the address space.
    pub fn inc(&mut self, n: u128) -> Result<&mut Self> {
        self.num = self
            .num
            .checked_add(n)
            .filter(|num| *num <= IpInt::max(self))
            .ok_or_else(|| Error::Ipam(format!("{self} + {n} overflows the address space")))?;
        Ok(self)
    }

    /// Step back by `n`; fails when going below zero.
    pub fn dec(&mut self, n: u128) -> Result<&mut Self> {
        self.num = self
            .num
            .checked_sub(n)
            .ok_or_else(|| Error::Ipam(format!("{self} - {n} underflows the address space")))?;
        Ok(self)
    }

    pub fn to_ip(&self) -> IpAddr {
        if self.len == 4 {
            IpAddr::V4(Ipv4Addr::from(self.num as u32))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.num))
        }
    }
}

impl From<IpAddr> for IpInt {
    fn from(ip: IpAddr) -> Self {
        Self::new(ip)
    }
}

impl fmt::Display for IpInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_ip().fmt(f)
    }
}

/// An address with a prefix length, e.g. `10.0.0.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpNet {
    addr: IpAddr,
    prefix_len: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid CIDR address: {0}")]
pub struct IpNetParseError(pub String);

impl IpNet {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Option<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (prefix_len <= max).then_some(Self { addr, prefix_len })
    }

    /// Host route (`/32` or `/128`).
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix_len }
    }

    /// `0.0.0.0/0` or `::/0`.
    pub fn default_route(ipv6: bool) -> Self {
        let addr = if ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        Self { addr, prefix_len: 0 }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    fn bits(&self) -> u8 {
        if self.addr.is_ipv4() { 32 } else { 128 }
    }

    pub fn host_bits(&self) -> u8 {
        self.bits() - self.prefix_len
    }

    fn host_mask(&self) -> u128 {
        let host_bits = self.host_bits() as u32;
        if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        }
    }

    /// Same prefix with the host bits cleared.
    pub fn network(&self) -> Self {
        let mut int = IpInt::new(self.addr);
        int.num &= !self.host_mask();
        Self {
            addr: int.to_ip(),
            prefix_len: self.prefix_len,
        }
    }

    pub fn broadcast(&self) -> IpAddr {
        let mut int = IpInt::new(self.addr);
        int.num |= self.host_mask();
        int.to_ip()
    }

    /// Dotted netmask, e.g. `255.255.255.0` for a `/24`.
    pub fn netmask(&self) -> IpAddr {
        let mut int = IpInt::new(self.addr);
        int.num = IpInt::max(&int) & !self.host_mask();
        int.to_ip()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        if ip.is_ipv4() != self.addr.is_ipv4() {
            return false;
        }
        let mask = !self.host_mask();
        IpInt::new(ip).num & mask == IpInt::new(self.addr).num & mask
    }

    pub fn overlaps(&self, other: &IpNet) -> bool {
        self.contains(other.network().addr) || other.contains(self.network().addr)
    }
}

impl FromStr for IpNet {
    type Err = IpNetParseError;

    /// Parses `addr/len`; the result keeps the address as written.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let err = || IpNetParseError(s.to_string());
        let (addr, len) = s.split_once('/').ok_or_else(err)?;
        let addr: IpAddr = addr.parse().map_err(|_| err())?;
        let len: u8 = len.parse().map_err(|_| err())?;
        Self::new(addr, len).ok_or_else(err)
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Inclusive range of addresses handed out by a DHCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRange {
    pub from: IpAddr,
    pub to: IpAddr,
}

/// The two ends of the `/30` link between a network's namespace and the
/// router: `(namespace side, main namespace side)`.
pub fn veth_ips_for_network(index: u32, ipv6: bool) -> Result<(IpNet, IpNet)> {
    if ipv6 {
        return Err(Error::NotImplemented("IPv6 internal veth allocation"));
    }
    let mut base = IpInt::new(IpAddr::V4(INTERNAL_IPV4_BASE));
    base.inc(4 * index as u128)?;
    let inner = base.inc(1)?.to_ip();
    let outer = base.inc(1)?.to_ip();
    Ok((
        IpNet::new(inner, VETH_PREFIX_LEN).ok_or_else(|| Error::Ipam(inner.to_string()))?,
        IpNet::new(outer, VETH_PREFIX_LEN).ok_or_else(|| Error::Ipam(outer.to_string()))?,
    ))
}

/// Gateway for an endpoint: first host of the subnet, or the second one if
/// the endpoint already took the first.
pub fn endpoint_gateway(subnet: &IpNet, endpoint_ip: IpAddr) -> Result<IpNet> {
    let mut gw = IpInt::new(subnet.network().addr());
    gw.inc(1)?;
    if gw == IpInt::new(endpoint_ip) {
        gw.inc(1)?;
    }
    let ip = gw.to_ip();
    if !subnet.contains(ip) {
        return Err(Error::Ipam(format!(
            "not enough room in the subnet {subnet} for gateway IP"
        )));
    }
    IpNet::new(ip, subnet.prefix_len()).ok_or_else(|| Error::Ipam(ip.to_string()))
}

/// Usable host range of a subnet: first host up to the address before broadcast.
pub fn subnet_host_range(subnet: &IpNet) -> Result<IpRange> {
    let network = subnet.network().addr();
    if subnet.host_bits() < 2 {
        return Ok(IpRange {
            from: network,
            to: network,
        });
    }
    let mut first = IpInt::new(network);
    first.inc(1)?;
    let mut last = IpInt::new(subnet.broadcast());
    last.dec(1)?;
    Ok(IpRange {
        from: first.to_ip(),
        to: last.to_ip(),
    })
}

/// Stable network-label to index assignment.
///
/// A label keeps its index for as long as it stays in the model; new labels
/// take the smallest free index.
#[derive(Debug, Default, Clone)]
pub struct NetworkIndexes {
    by_label: BTreeMap<String, u32>,
}

impl NetworkIndexes {
    pub fn allocate<'a>(&mut self, labels: impl IntoIterator<Item = &'a str>) {
        let labels: Vec<&str> = labels.into_iter().collect();
        self.by_label.retain(|label, _| labels.contains(&label.as_str()));
        for label in labels {
            if self.by_label.contains_key(label) {
                continue;
            }
            let used: Vec<u32> = self.by_label.values().copied().collect();
            let index = (0..).find(|i| !used.contains(i)).unwrap_or_default();
            self.by_label.insert(label.to_string(), index);
        }
    }

    pub fn get(&self, label: &str) -> Result<u32> {
        self.by_label
            .get(label)
            .copied()
            .ok_or_else(|| Error::Ipam(format!("missing index for network {label}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn int_round_trip_and_steps() {
        for ip in ["0.0.0.1", "10.0.0.255", "192.168.1.1", "255.255.255.254", "fd00::1"] {
            let addr = v4(ip);
            let mut int = IpInt::new(addr);
            assert_eq!(int.to_ip(), addr);
            int.dec(1).unwrap().inc(1).unwrap();
            assert_eq!(int.to_ip(), addr);
        }
        let mut int = IpInt::new(v4("10.0.0.255"));
        int.inc(1).unwrap();
        assert_eq!(int.to_ip(), v4("10.0.1.0"));
    }

    #[test]
    fn int_bounds() {
        let mut top = IpInt::new(v4("255.255.255.255"));
        assert!(top.inc(1).is_err());
        let mut zero = IpInt::new(v4("0.0.0.0"));
        assert!(zero.dec(1).is_err());
    }

    #[test]
    fn parse_cidr() {
        let net: IpNet = "172.22.10.7/24".parse().unwrap();
        assert_eq!(net.network().to_string(), "172.22.10.0/24");
        assert_eq!(net.broadcast(), v4("172.22.10.255"));
        assert_eq!(net.netmask(), v4("255.255.255.0"));
        assert!(net.contains(v4("172.22.10.200")));
        assert!(!net.contains(v4("172.22.11.1")));
        assert!("172.22.10.0".parse::<IpNet>().is_err());
        assert!("172.22.10.0/33".parse::<IpNet>().is_err());
    }

    #[test]
    fn veth_subnets_do_not_overlap() {
        let nets: Vec<IpNet> = (0..64)
            .map(|i| veth_ips_for_network(i, false).unwrap().0.network())
            .collect();
        for (i, a) in nets.iter().enumerate() {
            for b in &nets[i + 1..] {
                assert!(!a.overlaps(b), "{a} overlaps {b}");
            }
        }
        let (inner, outer) = veth_ips_for_network(2, false).unwrap();
        assert_eq!(inner.to_string(), "240.0.0.9/30");
        assert_eq!(outer.to_string(), "240.0.0.10/30");
        assert!(veth_ips_for_network(0, true).is_err());
    }

    #[test]
    fn gateway_skips_endpoint_ip() {
        let subnet: IpNet = "10.16.16.0/24".parse().unwrap();
        let gw = endpoint_gateway(&subnet, v4("10.16.16.25")).unwrap();
        assert_eq!(gw.to_string(), "10.16.16.1/24");
        let gw = endpoint_gateway(&subnet, v4("10.16.16.1")).unwrap();
        assert_eq!(gw.to_string(), "10.16.16.2/24");
    }

    #[test]
    fn gateway_fails_when_subnet_too_small() {
        let subnet: IpNet = "10.16.16.0/31".parse().unwrap();
        assert!(endpoint_gateway(&subnet, v4("10.16.16.1")).is_err());
        let subnet: IpNet = "10.16.16.4/32".parse().unwrap();
        assert!(endpoint_gateway(&subnet, v4("10.16.16.4")).is_err());
    }

    #[test]
    fn host_range() {
        let range = subnet_host_range(&"172.22.10.0/24".parse().unwrap()).unwrap();
        assert_eq!((range.from, range.to), (v4("172.22.10.1"), v4("172.22.10.254")));
        let range = subnet_host_range(&"172.22.10.4/31".parse().unwrap()).unwrap();
        assert_eq!((range.from, range.to), (v4("172.22.10.4"), v4("172.22.10.4")));
    }

    #[test]
    fn network_indexes_are_stable() {
        let mut idx = NetworkIndexes::default();
        idx.allocate(["a", "b", "c"]);
        assert_eq!((idx.get("a").unwrap(), idx.get("b").unwrap(), idx.get("c").unwrap()), (0, 1, 2));
        idx.allocate(["c", "d"]);
        assert_eq!(idx.get("c").unwrap(), 2);
        assert_eq!(idx.get("d").unwrap(), 0);
        assert!(idx.get("a").is_err());
    }
}
