//! Semantic checks run after references resolve.
//!
//! Any error here rejects the whole model before the agent touches the OS.

use std::collections::HashSet;
use std::net::IpAddr;

use super::parse::{EndpointCategory, ItemId, ItemType, ParsedModel};
use super::{
    ENDPOINT_IP_REF_PREFIX, Endpoint, MacAddr, NETWORK_BRIDGE_REF_PREFIX, ProxyRule, ADAM_IP_REF,
};
use crate::ipam::IpNet;

/// Largest MTU accepted for ports and endpoints.
pub const MAX_MTU: u16 = 9000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} with empty logical label")]
    EmptyLabel(ItemType),

    #[error("duplicate logical label: {0}")]
    DuplicateLabel(ItemId),

    #[error("referenced item {target} does not exist (ref-key: {ref_key}, referenced by {from})")]
    MissingReference {
        from: ItemId,
        target: ItemId,
        ref_key: String,
    },

    #[error("category mismatch for referenced item {target}: expected {expected}, found {}",
        .found.map_or("none", |c| c.as_str()))]
    CategoryMismatch {
        target: ItemId,
        expected: EndpointCategory,
        found: Option<EndpointCategory>,
    },

    #[error("colliding referencing to logical label {target} (ref-key: {ref_key}) from {first} and {second}")]
    RefKeyCollision {
        target: ItemId,
        ref_key: String,
        first: ItemId,
        second: ItemId,
    },

    /// Any other semantic problem, tied to the offending element.
    #[error("{item}: {reason}")]
    Invalid { item: String, reason: String },

    #[error("missing host configuration")]
    MissingHostConfig,

    #[error("eden SDN requires at least one routable host IP address")]
    NoRoutableHostIp,

    #[error("missing controller port")]
    MissingControllerPort,
}

fn invalid(item: impl std::fmt::Display, reason: impl Into<String>) -> ValidationError {
    ValidationError::Invalid {
        item: item.to_string(),
        reason: reason.into(),
    }
}

pub(super) fn validate(parsed: &mut ParsedModel) -> Result<(), ValidationError> {
    validate_ports(parsed)?;
    parsed.host_ip = validate_host_config(parsed)?;
    validate_networks(parsed)?;
    validate_endpoints(parsed)?;
    validate_firewall(parsed)
}

fn validate_ports(parsed: &ParsedModel) -> Result<(), ValidationError> {
    let mut macs = HashSet::new();
    for port in &parsed.model.ports {
        let id = ItemId::new(ItemType::Port, &port.logical_label);
        let mac: MacAddr = port
            .mac
            .parse()
            .map_err(|e| invalid(&id, format!("invalid MAC address: {e}")))?;
        if !macs.insert(mac) {
            return Err(invalid(&id, format!("duplicate MAC address {mac}")));
        }
        if mac.has_prefix(&MacAddr::HOST_PORT_PREFIX) {
            return Err(invalid(&id, "MAC address with prefix reserved for the host port"));
        }
        if let Some(eve) = &port.eve_connect
            && let Err(e) = eve.mac.parse::<MacAddr>()
        {
            return Err(invalid(&id, format!("EVE-side has invalid MAC address: {e}")));
        }
        if port.mtu > MAX_MTU {
            return Err(invalid(&id, format!("MTU {} is too large", port.mtu)));
        }
    }
    Ok(())
}

fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || (v6.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}

fn validate_host_config(parsed: &ParsedModel) -> Result<IpAddr, ValidationError> {
    let host = parsed
        .model
        .host
        .as_ref()
        .ok_or(ValidationError::MissingHostConfig)?;
    let mut host_ip = None;
    for raw in &host.host_ips {
        let ip: IpAddr = raw
            .parse()
            .map_err(|_| invalid("host", format!("failed to parse host IP address {raw}")))?;
        if is_global_unicast(&ip) {
            host_ip = Some(ip);
            break;
        }
    }
    let host_ip = host_ip.ok_or(ValidationError::NoRoutableHostIp)?;
    if host.controller_port == 0 {
        return Err(ValidationError::MissingControllerPort);
    }
    Ok(host_ip)
}

fn parse_ip(item: &ItemId, what: &str, raw: &str) -> Result<IpAddr, ValidationError> {
    raw.parse()
        .map_err(|_| invalid(item, format!("invalid {what} ({raw})")))
}

fn looks_like_pem(pem: &str, kind: &str) -> bool {
    pem.contains("-----BEGIN ")
        && pem.contains("-----END ")
        && (kind.is_empty() || pem.contains(kind))
}

fn check_cert_pair(item: &ItemId, cert: &str, key: &str) -> Result<(), ValidationError> {
    if !looks_like_pem(cert, "CERTIFICATE") {
        return Err(invalid(item, "failed to decode PEM certificate"));
    }
    if !looks_like_pem(key, "PRIVATE KEY") {
        return Err(invalid(item, "failed to decode PEM private key"));
    }
    Ok(())
}

fn check_unique_rules(item: &ItemId, rules: &[ProxyRule]) -> Result<(), ValidationError> {
    let mut hosts = HashSet::new();
    if rules.iter().all(|rule| hosts.insert(rule.req_host.as_str())) {
        Ok(())
    } else {
        Err(invalid(item, "proxy has duplicate rules"))
    }
}

fn validate_networks(parsed: &ParsedModel) -> Result<(), ValidationError> {
    for network in &parsed.model.networks {
        let id = ItemId::new(ItemType::Network, &network.logical_label);
        let subnet: IpNet = network
            .subnet
            .parse()
            .map_err(|e| invalid(&id, format!("invalid subnet: {e}")))?;
        parse_ip(&id, "gateway IP", &network.gw_ip)?;

        let dhcp = &network.dhcp;
        if dhcp.enable {
            if !dhcp.ip_range.from_ip.is_empty() {
                let from = parse_ip(&id, "DHCP range FromIP", &dhcp.ip_range.from_ip)?;
                let to = parse_ip(&id, "DHCP range ToIP", &dhcp.ip_range.to_ip)?;
                if !subnet.contains(from) || !subnet.contains(to) {
                    return Err(invalid(&id, "DHCP IP range outside of the subnet"));
                }
                if from > to {
                    return Err(invalid(&id, "DHCP IP range where FromIP > ToIP"));
                }
            }
            for dns in &dhcp.dns.public_dns {
                parse_ip(&id, "public DNS server IP", dns)?;
            }
            if !dhcp.private_ntp.is_empty() && !dhcp.public_ntp.is_empty() {
                return Err(invalid(&id, "both public and private NTP configured"));
            }
        }

        if let Some(proxy) = &network.transparent_proxy {
            check_cert_pair(&id, &proxy.ca_cert_pem, &proxy.ca_key_pem)?;
            check_unique_rules(&id, &proxy.proxy_rules)?;
        }
    }

    for bridge in &parsed.model.bridges {
        let Some(indexed) = parsed.get(ItemType::Bridge, &bridge.logical_label) else {
            continue;
        };
        let (mut with_vlan, mut without_vlan) = (false, false);
        for (ref_key, network) in &indexed.referenced_by {
            if !ref_key.starts_with(NETWORK_BRIDGE_REF_PREFIX) {
                continue;
            }
            if network.item_type != ItemType::Network {
                continue;
            }
            if ref_key == NETWORK_BRIDGE_REF_PREFIX {
                without_vlan = true;
            } else {
                with_vlan = true;
            }
        }
        if with_vlan && without_vlan {
            return Err(invalid(
                ItemId::new(ItemType::Bridge, &bridge.logical_label),
                "bridge with both VLAN and non-VLAN networks",
            ));
        }
    }
    Ok(())
}

fn validate_endpoint(endpoint: &Endpoint) -> Result<ItemId, ValidationError> {
    let id = ItemId::new(ItemType::Endpoint, &endpoint.logical_label);
    let subnet: IpNet = endpoint
        .subnet
        .parse()
        .map_err(|_| invalid(&id, format!("invalid subnet '{}'", endpoint.subnet)))?;
    if subnet.host_bits() < 2 {
        return Err(invalid(
            &id,
            format!("subnet with less than 2 host IPs ({})", endpoint.subnet),
        ));
    }
    let ip = parse_ip(&id, "IP address", &endpoint.ip)?;
    if !subnet.contains(ip) {
        return Err(invalid(
            &id,
            format!(
                "IP ({}) address outside of the configured subnet ({})",
                endpoint.ip, endpoint.subnet
            ),
        ));
    }
    if endpoint.mtu > MAX_MTU {
        return Err(invalid(&id, format!("MTU {} is too large", endpoint.mtu)));
    }
    Ok(id)
}

fn validate_endpoints(parsed: &ParsedModel) -> Result<(), ValidationError> {
    let eps = &parsed.model.endpoints;
    for client in &eps.clients {
        validate_endpoint(&client.endpoint)?;
    }
    for ntp in &eps.ntp_servers {
        validate_endpoint(&ntp.endpoint)?;
    }
    for netboot in &eps.netboot_servers {
        validate_endpoint(&netboot.endpoint)?;
    }

    for dns in &eps.dns_servers {
        let id = validate_endpoint(&dns.endpoint)?;
        for upstream in &dns.upstream_servers {
            parse_ip(&id, "upstream server IP", upstream)?;
        }
        for entry in &dns.static_entries {
            if entry.fqdn.is_empty() {
                return Err(invalid(&id, "static entry with empty FQDN"));
            }
            if entry.ip.starts_with(ENDPOINT_IP_REF_PREFIX) || entry.ip == ADAM_IP_REF {
                continue;
            }
            parse_ip(&id, "static entry IP", &entry.ip)?;
        }
    }

    for proxy in &eps.explicit_proxies {
        let id = validate_endpoint(&proxy.endpoint)?;
        for dns in &proxy.dns.public_dns {
            parse_ip(&id, "public DNS server IP", dns)?;
        }
        if proxy.users.iter().any(|user| user.username.is_empty()) {
            return Err(invalid(&id, "proxy with empty username"));
        }
        if !proxy.proxy.ca_cert_pem.is_empty() {
            check_cert_pair(&id, &proxy.proxy.ca_cert_pem, &proxy.proxy.ca_key_pem)?;
        }
        check_unique_rules(&id, &proxy.proxy.proxy_rules)?;
        if proxy.http_port == 0 && proxy.https_port == 0 {
            return Err(invalid(&id, "proxy without port numbers"));
        }
    }

    for srv in &eps.http_servers {
        let id = validate_endpoint(&srv.endpoint)?;
        if srv.http_port == 0 && srv.https_port == 0 {
            return Err(invalid(&id, "HTTP server without port numbers"));
        }
        if srv.http_port != 0 && srv.http_port == srv.https_port {
            return Err(invalid(&id, "HTTP server with colliding ports"));
        }
        if !srv.cert_pem.is_empty() {
            check_cert_pair(&id, &srv.cert_pem, &srv.key_pem)?;
        } else if srv.https_port != 0 {
            return Err(invalid(&id, "HTTPS server without certificate"));
        }
    }
    Ok(())
}

fn validate_firewall(parsed: &ParsedModel) -> Result<(), ValidationError> {
    for rule in &parsed.model.firewall.rules {
        for subnet in [&rule.src_subnet, &rule.dst_subnet] {
            subnet.parse::<IpNet>().map_err(|e| invalid("firewall rule", e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Bridge, Client, DnsEntry, DnsServer, EveConnect, HostConfig, HttpServer, Network,
        NetworkModel, Port,
    };

    fn valid_model() -> NetworkModel {
        NetworkModel {
            ports: vec![Port {
                logical_label: "eth1".into(),
                mac: "02:fe:00:00:00:01".into(),
                mtu: 1500,
                admin_up: true,
                eve_connect: Some(EveConnect {
                    eve_instance: "eve".into(),
                    mac: "02:fe:00:00:01:01".into(),
                }),
            }],
            bridges: vec![Bridge {
                logical_label: "br0".into(),
                ports: vec!["eth1".into()],
                bonds: Vec::new(),
            }],
            networks: vec![Network {
                logical_label: "lan".into(),
                bridge: "br0".into(),
                subnet: "172.22.1.0/24".into(),
                gw_ip: "172.22.1.1".into(),
                ..Default::default()
            }],
            endpoints: crate::model::Endpoints {
                clients: vec![Client {
                    endpoint: Endpoint {
                        logical_label: "web".into(),
                        fqdn: "web.sdn".into(),
                        subnet: "10.20.0.0/24".into(),
                        ip: "10.20.0.10".into(),
                        mtu: 0,
                    },
                }],
                ..Default::default()
            },
            host: Some(HostConfig {
                host_ips: vec!["127.0.0.1".into(), "192.168.0.10".into()],
                controller_port: 3333,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_valid_model_and_picks_host_ip() {
        let parsed = ParsedModel::parse(valid_model()).unwrap();
        assert_eq!(parsed.host_ip, "192.168.0.10".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rejects_reserved_and_duplicate_macs() {
        let mut m = valid_model();
        m.ports[0].mac = "08:33:33:00:00:07".into();
        let err = ParsedModel::parse(m).unwrap_err();
        assert!(err.to_string().contains("port/eth1"), "{err}");

        let mut m = valid_model();
        let mut second = m.ports[0].clone();
        second.logical_label = "eth2".into();
        m.ports.push(second);
        let err = ParsedModel::parse(m).unwrap_err();
        assert!(err.to_string().contains("duplicate MAC"), "{err}");
    }

    #[test]
    fn rejects_large_mtu() {
        let mut m = valid_model();
        m.ports[0].mtu = 9001;
        assert!(ParsedModel::parse(m).is_err());
    }

    #[test]
    fn host_config_rules() {
        let mut m = valid_model();
        m.host = None;
        assert_eq!(ParsedModel::parse(m).unwrap_err(), ValidationError::MissingHostConfig);

        let mut m = valid_model();
        m.host.as_mut().unwrap().host_ips = vec!["127.0.0.1".into()];
        assert_eq!(ParsedModel::parse(m).unwrap_err(), ValidationError::NoRoutableHostIp);

        let mut m = valid_model();
        m.host.as_mut().unwrap().controller_port = 0;
        assert_eq!(ParsedModel::parse(m).unwrap_err(), ValidationError::MissingControllerPort);
    }

    #[test]
    fn dhcp_range_must_fit_subnet() {
        let mut m = valid_model();
        let dhcp = &mut m.networks[0].dhcp;
        dhcp.enable = true;
        dhcp.ip_range.from_ip = "172.22.1.50".into();
        dhcp.ip_range.to_ip = "172.22.2.10".into();
        assert!(ParsedModel::parse(m.clone()).is_err());

        let dhcp = &mut m.networks[0].dhcp;
        dhcp.ip_range.from_ip = "172.22.1.60".into();
        dhcp.ip_range.to_ip = "172.22.1.50".into();
        let err = ParsedModel::parse(m).unwrap_err();
        assert!(err.to_string().contains("FromIP > ToIP"), "{err}");
    }

    #[test]
    fn bridge_cannot_mix_vlan_and_untagged_networks() {
        let mut m = valid_model();
        let mut tagged = m.networks[0].clone();
        tagged.logical_label = "lan-vlan".into();
        tagged.vlan_id = 100;
        m.networks.push(tagged);
        let err = ParsedModel::parse(m).unwrap_err();
        assert!(err.to_string().contains("bridge/br0"), "{err}");
    }

    #[test]
    fn endpoint_ip_outside_subnet() {
        let mut m = valid_model();
        m.endpoints.clients[0].endpoint.ip = "10.21.0.10".into();
        let err = ParsedModel::parse(m).unwrap_err();
        assert!(err.to_string().contains("endpoint/web"), "{err}");
    }

    #[test]
    fn endpoint_subnet_needs_two_host_bits() {
        let mut m = valid_model();
        m.endpoints.clients[0].endpoint.subnet = "10.20.0.10/31".into();
        assert!(ParsedModel::parse(m).is_err());
    }

    #[test]
    fn dns_static_entries() {
        let mut m = valid_model();
        m.endpoints.dns_servers.push(DnsServer {
            endpoint: Endpoint {
                logical_label: "dns1".into(),
                fqdn: "dns1.sdn".into(),
                subnet: "10.30.0.0/24".into(),
                ip: "10.30.0.2".into(),
                mtu: 0,
            },
            static_entries: vec![
                DnsEntry {
                    fqdn: "endpoint-fqdn.web".into(),
                    ip: "endpoint-ip.web".into(),
                },
                DnsEntry {
                    fqdn: "controller".into(),
                    ip: ADAM_IP_REF.into(),
                },
            ],
            upstream_servers: vec!["1.1.1.1".into()],
        });
        let parsed = ParsedModel::parse(m.clone()).unwrap();
        assert_eq!(
            parsed.resolve_entry_ip("endpoint-ip.web"),
            Some("10.20.0.10".parse().unwrap())
        );
        assert_eq!(parsed.resolve_entry_ip(ADAM_IP_REF), Some(parsed.host_ip));
        assert_eq!(parsed.resolve_entry_fqdn("endpoint-fqdn.web").as_deref(), Some("web.sdn"));

        m.endpoints.dns_servers[0].upstream_servers = vec!["not-an-ip".into()];
        assert!(ParsedModel::parse(m).is_err());
    }

    #[test]
    fn https_server_needs_certificate() {
        let mut m = valid_model();
        m.endpoints.http_servers.push(HttpServer {
            endpoint: Endpoint {
                logical_label: "srv".into(),
                fqdn: "srv.sdn".into(),
                subnet: "10.40.0.0/24".into(),
                ip: "10.40.0.5".into(),
                mtu: 0,
            },
            https_port: 443,
            ..Default::default()
        });
        let err = ParsedModel::parse(m).unwrap_err();
        assert!(err.to_string().contains("without certificate"), "{err}");
    }

    #[test]
    fn firewall_subnets_parse() {
        let mut m = valid_model();
        m.firewall.rules.push(crate::model::FwRule {
            src_subnet: "10.0.0.0/8".into(),
            dst_subnet: "bogus".into(),
            ..Default::default()
        });
        assert!(ParsedModel::parse(m).is_err());
    }
}
