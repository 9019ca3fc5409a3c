//! Cross-referenced index over every labeled element of a network model.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use super::validate::{self, ValidationError};
use super::{
    Bond, Bridge, Client, DnsServer, Endpoint, ExplicitProxy, HttpServer, NetbootServer, Network,
    NetworkModel, NtpServer, Port, ADAM_IP_REF, ENDPOINT_FQDN_REF_PREFIX, ENDPOINT_IP_REF_PREFIX,
    NETWORK_BRIDGE_REF_PREFIX, PORT_MASTER_REF,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemType {
    Port,
    Bond,
    Bridge,
    Network,
    Endpoint,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Port => "port",
            ItemType::Bond => "bond",
            ItemType::Bridge => "bridge",
            ItemType::Network => "network",
            ItemType::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointCategory {
    Client,
    DnsServer,
    NtpServer,
    HttpServer,
    ExplicitProxy,
    NetbootServer,
}

impl EndpointCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::Client => "client",
            EndpointCategory::DnsServer => "dns-server",
            EndpointCategory::NtpServer => "ntp-server",
            EndpointCategory::HttpServer => "http-server",
            EndpointCategory::ExplicitProxy => "explicit-proxy",
            EndpointCategory::NetbootServer => "netboot-server",
        }
    }
}

impl fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(type, logical label)`: the identity of a model element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId {
    pub item_type: ItemType,
    pub label: String,
}

impl ItemId {
    pub fn new(item_type: ItemType, label: impl Into<String>) -> Self {
        Self {
            item_type,
            label: label.into(),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_type, self.label)
    }
}

/// Outgoing reference declared by a labeled item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRef {
    pub target: ItemId,
    /// Required category of the target endpoint, if any.
    pub category: Option<EndpointCategory>,
    pub ref_key: String,
}

impl LabelRef {
    fn new(item_type: ItemType, label: &str, ref_key: impl Into<String>) -> Self {
        Self {
            target: ItemId::new(item_type, label),
            category: None,
            ref_key: ref_key.into(),
        }
    }

    fn endpoint(category: EndpointCategory, label: &str, ref_key: impl Into<String>) -> Self {
        Self {
            category: Some(category),
            ..Self::new(ItemType::Endpoint, label, ref_key)
        }
    }
}

/// Every kind of model element that carries a logical label.
#[derive(Debug, Clone, PartialEq)]
pub enum LabeledItem {
    Port(Port),
    Bond(Bond),
    Bridge(Bridge),
    Network(Network),
    Client(Client),
    DnsServer(DnsServer),
    NtpServer(NtpServer),
    HttpServer(HttpServer),
    ExplicitProxy(ExplicitProxy),
    NetbootServer(NetbootServer),
}

impl LabeledItem {
    pub fn item_type(&self) -> ItemType {
        match self {
            LabeledItem::Port(_) => ItemType::Port,
            LabeledItem::Bond(_) => ItemType::Bond,
            LabeledItem::Bridge(_) => ItemType::Bridge,
            LabeledItem::Network(_) => ItemType::Network,
            _ => ItemType::Endpoint,
        }
    }

    pub fn category(&self) -> Option<EndpointCategory> {
        match self {
            LabeledItem::Client(_) => Some(EndpointCategory::Client),
            LabeledItem::DnsServer(_) => Some(EndpointCategory::DnsServer),
            LabeledItem::NtpServer(_) => Some(EndpointCategory::NtpServer),
            LabeledItem::HttpServer(_) => Some(EndpointCategory::HttpServer),
            LabeledItem::ExplicitProxy(_) => Some(EndpointCategory::ExplicitProxy),
            LabeledItem::NetbootServer(_) => Some(EndpointCategory::NetbootServer),
            _ => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            LabeledItem::Port(p) => &p.logical_label,
            LabeledItem::Bond(b) => &b.logical_label,
            LabeledItem::Bridge(b) => &b.logical_label,
            LabeledItem::Network(n) => &n.logical_label,
            other => other.endpoint().map_or("", |ep| ep.logical_label.as_str()),
        }
    }

    pub fn id(&self) -> ItemId {
        ItemId::new(self.item_type(), self.label())
    }

    /// Common endpoint attributes, for endpoint variants.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            LabeledItem::Client(e) => Some(&e.endpoint),
            LabeledItem::DnsServer(e) => Some(&e.endpoint),
            LabeledItem::NtpServer(e) => Some(&e.endpoint),
            LabeledItem::HttpServer(e) => Some(&e.endpoint),
            LabeledItem::ExplicitProxy(e) => Some(&e.endpoint),
            LabeledItem::NetbootServer(e) => Some(&e.endpoint),
            _ => None,
        }
    }

    pub fn references(&self) -> Vec<LabelRef> {
        match self {
            LabeledItem::Port(_)
            | LabeledItem::Client(_)
            | LabeledItem::NtpServer(_)
            | LabeledItem::NetbootServer(_) => Vec::new(),
            LabeledItem::Bond(bond) => bond
                .ports
                .iter()
                .map(|port| LabelRef::new(ItemType::Port, port, PORT_MASTER_REF))
                .collect(),
            LabeledItem::Bridge(bridge) => bridge
                .ports
                .iter()
                .map(|port| LabelRef::new(ItemType::Port, port, PORT_MASTER_REF))
                .chain(
                    bridge
                        .bonds
                        .iter()
                        .map(|bond| LabelRef::new(ItemType::Bond, bond, PORT_MASTER_REF)),
                )
                .collect(),
            LabeledItem::Network(network) => network_references(network),
            LabeledItem::DnsServer(dns) => {
                let ll = &dns.endpoint.logical_label;
                let mut refs = Vec::new();
                for (i, entry) in dns.static_entries.iter().enumerate() {
                    if let Some(target) = entry.fqdn.strip_prefix(ENDPOINT_FQDN_REF_PREFIX) {
                        refs.push(LabelRef::new(
                            ItemType::Endpoint,
                            target,
                            format!("dns-server-{ll}-entry-{i}-fqdn"),
                        ));
                    }
                    if let Some(target) = entry.ip.strip_prefix(ENDPOINT_IP_REF_PREFIX) {
                        refs.push(LabelRef::new(
                            ItemType::Endpoint,
                            target,
                            format!("dns-server-{ll}-entry-{i}-ip"),
                        ));
                    }
                }
                refs
            }
            LabeledItem::HttpServer(srv) => srv
                .dns
                .private_dns
                .iter()
                .map(|dns| {
                    LabelRef::endpoint(
                        EndpointCategory::DnsServer,
                        dns,
                        format!("http-server-{}", srv.endpoint.logical_label),
                    )
                })
                .collect(),
            LabeledItem::ExplicitProxy(proxy) => proxy
                .dns
                .private_dns
                .iter()
                .map(|dns| {
                    LabelRef::endpoint(
                        EndpointCategory::DnsServer,
                        dns,
                        format!("explicit-proxy-{}", proxy.endpoint.logical_label),
                    )
                })
                .collect(),
        }
    }
}

fn network_references(network: &Network) -> Vec<LabelRef> {
    let ll = &network.logical_label;
    let bridge_key = if network.vlan_id == 0 {
        NETWORK_BRIDGE_REF_PREFIX.to_string()
    } else {
        format!("{NETWORK_BRIDGE_REF_PREFIX}-vlan{}", network.vlan_id)
    };
    let mut refs = vec![LabelRef::new(ItemType::Bridge, &network.bridge, bridge_key)];

    let dhcp = &network.dhcp;
    if dhcp.enable {
        for dns in &dhcp.dns.private_dns {
            refs.push(LabelRef::endpoint(
                EndpointCategory::DnsServer,
                dns,
                format!("dns-for-network-{ll}"),
            ));
        }
        if !dhcp.private_ntp.is_empty() {
            refs.push(LabelRef::endpoint(
                EndpointCategory::NtpServer,
                &dhcp.private_ntp,
                format!("ntp-for-network-{ll}"),
            ));
        }
        if !dhcp.netboot_server.is_empty() {
            refs.push(LabelRef::endpoint(
                EndpointCategory::NetbootServer,
                &dhcp.netboot_server,
                format!("netboot-for-network-{ll}"),
            ));
        }
    }
    if let Some(router) = &network.router {
        let key = format!("reachable-by-network-{ll}");
        for ep in &router.reachable_endpoints {
            refs.push(LabelRef::new(ItemType::Endpoint, ep, key.clone()));
        }
        for net in &router.reachable_networks {
            refs.push(LabelRef::new(ItemType::Network, net, key.clone()));
        }
    }
    refs
}

/// A labeled item together with its resolved references in both directions.
#[derive(Debug, Clone)]
pub struct IndexedItem {
    pub item: LabeledItem,
    /// Items referenced by this one, in declaration order.
    pub referencing: Vec<(ItemId, String)>,
    /// Ref-key to the item that claimed it.
    pub referenced_by: BTreeMap<String, ItemId>,
}

/// A model that passed reference resolution and validation.
#[derive(Debug, Clone)]
pub struct ParsedModel {
    pub model: NetworkModel,
    pub items: BTreeMap<ItemId, IndexedItem>,
    /// First globally routable host IP; substituted for [`ADAM_IP_REF`].
    pub host_ip: IpAddr,
}

impl ParsedModel {
    /// Index, cross-reference, and validate a submitted model.
    pub fn parse(model: NetworkModel) -> Result<Self, ValidationError> {
        let items = index_labeled_items(labeled_items(&model))?;
        let mut parsed = ParsedModel {
            model,
            items,
            host_ip: IpAddr::from([0, 0, 0, 0]),
        };
        validate::validate(&mut parsed)?;
        Ok(parsed)
    }

    pub fn get(&self, item_type: ItemType, label: &str) -> Option<&IndexedItem> {
        self.items.get(&ItemId::new(item_type, label))
    }

    /// Endpoint attributes by label, whatever the category.
    pub fn endpoint(&self, label: &str) -> Option<&Endpoint> {
        self.get(ItemType::Endpoint, label)
            .and_then(|indexed| indexed.item.endpoint())
    }

    /// Resolve the IP of a DNS static entry (literal, endpoint reference, or host IP).
    pub fn resolve_entry_ip(&self, ip: &str) -> Option<IpAddr> {
        if ip == ADAM_IP_REF {
            return Some(self.host_ip);
        }
        match ip.strip_prefix(ENDPOINT_IP_REF_PREFIX) {
            Some(label) => self.endpoint(label)?.ip.parse().ok(),
            None => ip.parse().ok(),
        }
    }

    /// Resolve the FQDN of a DNS static entry (literal or endpoint reference).
    pub fn resolve_entry_fqdn(&self, fqdn: &str) -> Option<String> {
        match fqdn.strip_prefix(ENDPOINT_FQDN_REF_PREFIX) {
            Some(label) => self.endpoint(label).map(|ep| ep.fqdn.clone()),
            None => Some(fqdn.to_string()),
        }
    }
}

/// Flatten every labeled collection of the model, in a fixed order.
pub fn labeled_items(model: &NetworkModel) -> Vec<LabeledItem> {
    let eps = &model.endpoints;
    let mut items = Vec::new();
    items.extend(model.ports.iter().cloned().map(LabeledItem::Port));
    items.extend(model.bonds.iter().cloned().map(LabeledItem::Bond));
    items.extend(model.bridges.iter().cloned().map(LabeledItem::Bridge));
    items.extend(model.networks.iter().cloned().map(LabeledItem::Network));
    items.extend(eps.dns_servers.iter().cloned().map(LabeledItem::DnsServer));
    items.extend(eps.ntp_servers.iter().cloned().map(LabeledItem::NtpServer));
    items.extend(eps.netboot_servers.iter().cloned().map(LabeledItem::NetbootServer));
    items.extend(eps.http_servers.iter().cloned().map(LabeledItem::HttpServer));
    items.extend(eps.explicit_proxies.iter().cloned().map(LabeledItem::ExplicitProxy));
    items.extend(eps.clients.iter().cloned().map(LabeledItem::Client));
    items
}

/// Two passes: register every item, then resolve every reference.
pub fn index_labeled_items(
    items: Vec<LabeledItem>,
) -> Result<BTreeMap<ItemId, IndexedItem>, ValidationError> {
    let mut index = BTreeMap::new();
    for item in &items {
        let id = item.id();
        if id.label.is_empty() {
            return Err(ValidationError::EmptyLabel(id.item_type));
        }
        if index.contains_key(&id) {
            return Err(ValidationError::DuplicateLabel(id));
        }
        index.insert(
            id,
            IndexedItem {
                item: item.clone(),
                referencing: Vec::new(),
                referenced_by: BTreeMap::new(),
            },
        );
    }

    for item in &items {
        let id = item.id();
        for reference in item.references() {
            let target = index.get_mut(&reference.target).ok_or_else(|| {
                ValidationError::MissingReference {
                    from: id.clone(),
                    target: reference.target.clone(),
                    ref_key: reference.ref_key.clone(),
                }
            })?;
            if let Some(category) = reference.category
                && target.item.category() != Some(category)
            {
                return Err(ValidationError::CategoryMismatch {
                    target: reference.target.clone(),
                    expected: category,
                    found: target.item.category(),
                });
            }
            if let Some(previous) = target.referenced_by.get(&reference.ref_key) {
                return Err(ValidationError::RefKeyCollision {
                    target: reference.target.clone(),
                    ref_key: reference.ref_key.clone(),
                    first: previous.clone(),
                    second: id.clone(),
                });
            }
            target
                .referenced_by
                .insert(reference.ref_key.clone(), id.clone());
        }
        let referencing = item
            .references()
            .into_iter()
            .map(|reference| (reference.target, reference.ref_key))
            .collect();
        if let Some(indexed) = index.get_mut(&id) {
            indexed.referencing = referencing;
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DnsEntry, Router};

    fn port(ll: &str, mac: &str) -> Port {
        Port {
            logical_label: ll.into(),
            mac: mac.into(),
            ..Default::default()
        }
    }

    fn bridge(ll: &str, ports: &[&str]) -> Bridge {
        Bridge {
            logical_label: ll.into(),
            ports: ports.iter().map(|p| p.to_string()).collect(),
            bonds: Vec::new(),
        }
    }

    fn endpoint(ll: &str) -> Endpoint {
        Endpoint {
            logical_label: ll.into(),
            fqdn: format!("{ll}.sdn"),
            subnet: "10.20.0.0/24".into(),
            ip: "10.20.0.10".into(),
            mtu: 0,
        }
    }

    fn model() -> NetworkModel {
        let mut m = NetworkModel::default();
        m.ports = vec![port("eth1", "02:00:00:00:00:01"), port("eth2", "02:00:00:00:00:02")];
        m.bridges = vec![bridge("br0", &["eth1"])];
        m.networks = vec![Network {
            logical_label: "lan".into(),
            bridge: "br0".into(),
            subnet: "172.22.1.0/24".into(),
            gw_ip: "172.22.1.1".into(),
            ..Default::default()
        }];
        m.endpoints.clients = vec![Client { endpoint: endpoint("web") }];
        m
    }

    #[test]
    fn duplicate_label_rejected_in_any_order() {
        let mut m = model();
        m.bridges.push(bridge("br0", &["eth2"]));
        let err = index_labeled_items(labeled_items(&m)).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateLabel(ItemId::new(ItemType::Bridge, "br0")));

        m.bridges.reverse();
        assert!(matches!(
            index_labeled_items(labeled_items(&m)),
            Err(ValidationError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn endpoints_share_one_label_space() {
        let mut m = model();
        m.endpoints.dns_servers.push(DnsServer {
            endpoint: endpoint("web"),
            ..Default::default()
        });
        assert!(matches!(
            index_labeled_items(labeled_items(&m)),
            Err(ValidationError::DuplicateLabel(id)) if id.item_type == ItemType::Endpoint
        ));
    }

    #[test]
    fn references_resolve_both_ways() {
        let items = index_labeled_items(labeled_items(&model())).unwrap();
        let port = &items[&ItemId::new(ItemType::Port, "eth1")];
        assert_eq!(
            port.referenced_by.get(PORT_MASTER_REF),
            Some(&ItemId::new(ItemType::Bridge, "br0"))
        );
        let bridge = &items[&ItemId::new(ItemType::Bridge, "br0")];
        assert_eq!(
            bridge.referenced_by.get(NETWORK_BRIDGE_REF_PREFIX),
            Some(&ItemId::new(ItemType::Network, "lan"))
        );
        assert_eq!(bridge.referencing.len(), 1);
    }

    #[test]
    fn port_claimed_by_two_bridges() {
        let mut m = model();
        m.bridges.push(bridge("br1", &["eth1"]));
        let err = index_labeled_items(labeled_items(&m)).unwrap_err();
        match err {
            ValidationError::RefKeyCollision { target, ref_key, .. } => {
                assert_eq!(target, ItemId::new(ItemType::Port, "eth1"));
                assert_eq!(ref_key, PORT_MASTER_REF);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_static_entry_endpoint_is_named() {
        let mut m = model();
        m.endpoints.dns_servers.push(DnsServer {
            endpoint: endpoint("dns1"),
            static_entries: vec![DnsEntry {
                fqdn: "endpoint-fqdn.missing-client".into(),
                ip: "10.0.0.1".into(),
            }],
            upstream_servers: Vec::new(),
        });
        let err = index_labeled_items(labeled_items(&m)).unwrap_err();
        assert!(err.to_string().contains("endpoint/missing-client"), "{err}");
    }

    #[test]
    fn private_dns_must_be_a_dns_server() {
        let mut m = model();
        m.networks[0].dhcp.enable = true;
        m.networks[0].dhcp.dns.private_dns = vec!["web".into()];
        assert!(matches!(
            index_labeled_items(labeled_items(&m)),
            Err(ValidationError::CategoryMismatch { expected: EndpointCategory::DnsServer, .. })
        ));
    }

    #[test]
    fn router_references_are_checked() {
        let mut m = model();
        m.networks[0].router = Some(Router {
            outside_reachability: true,
            reachable_endpoints: vec!["web".into()],
            reachable_networks: vec!["nope".into()],
        });
        let err = index_labeled_items(labeled_items(&m)).unwrap_err();
        assert!(matches!(err, ValidationError::MissingReference { ref target, .. }
            if *target == ItemId::new(ItemType::Network, "nope")));
    }

    #[test]
    fn vlan_networks_use_distinct_ref_keys() {
        let mut m = model();
        let mut second = m.networks[0].clone();
        m.networks[0].vlan_id = 10;
        second.logical_label = "lan2".into();
        second.vlan_id = 20;
        m.networks.push(second);
        let items = index_labeled_items(labeled_items(&m)).unwrap();
        let bridge = &items[&ItemId::new(ItemType::Bridge, "br0")];
        assert!(bridge.referenced_by.contains_key("bridge-network-vlan10"));
        assert!(bridge.referenced_by.contains_key("bridge-network-vlan20"));

        m.networks[1].vlan_id = 10;
        assert!(matches!(
            index_labeled_items(labeled_items(&m)),
            Err(ValidationError::RefKeyCollision { .. })
        ));
    }
}
