//! Wire format of the network model submitted by the operator.
//!
//! Field names follow the JSON document (`camelCase`). Addresses stay as
//! strings here; [`validate`] parses them and reports the offending label.

mod mac;
pub mod parse;
pub mod validate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use mac::{MacAddr, MacParseError};
pub use parse::{EndpointCategory, ItemId, ItemType, LabeledItem, ParsedModel};
pub use validate::ValidationError;

/// Prefix of a DNS static entry FQDN that refers to an endpoint's FQDN.
pub const ENDPOINT_FQDN_REF_PREFIX: &str = "endpoint-fqdn.";
/// Prefix of a DNS static entry IP that refers to an endpoint's IP.
pub const ENDPOINT_IP_REF_PREFIX: &str = "endpoint-ip.";
/// DNS static entry IP standing for the controller (host) IP.
pub const ADAM_IP_REF: &str = "adam-ip";
/// Ref-key used by bridges and bonds to claim a port.
pub const PORT_MASTER_REF: &str = "port-master";
/// Ref-key prefix used by networks to attach to a bridge.
pub const NETWORK_BRIDGE_REF_PREFIX: &str = "bridge-network";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkModel {
    pub ports: Vec<Port>,
    pub bonds: Vec<Bond>,
    pub bridges: Vec<Bridge>,
    pub networks: Vec<Network>,
    pub endpoints: Endpoints,
    pub firewall: Firewall,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<HostConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Port {
    pub logical_label: String,
    pub mac: String,
    pub mtu: u16,
    #[serde(rename = "adminUP")]
    pub admin_up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eve_connect: Option<EveConnect>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EveConnect {
    pub eve_instance: String,
    pub mac: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Bond {
    pub logical_label: String,
    pub ports: Vec<String>,
    pub mode: BondMode,
    pub lacp_rate: LacpRate,
    #[serde(rename = "miiMonitor")]
    pub mii_monitor: BondMiiMonitor,
    #[serde(rename = "arpMonitor")]
    pub arp_monitor: BondArpMonitor,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondMode {
    #[default]
    #[serde(rename = "balance-rr", alias = "")]
    BalanceRr,
    #[serde(rename = "active-backup")]
    ActiveBackup,
    #[serde(rename = "balance-xor")]
    BalanceXor,
    #[serde(rename = "broadcast")]
    Broadcast,
    #[serde(rename = "802.3ad")]
    Ieee8023Ad,
    #[serde(rename = "balance-tlb")]
    BalanceTlb,
    #[serde(rename = "balance-alb")]
    BalanceAlb,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LacpRate {
    #[default]
    #[serde(alias = "")]
    Slow,
    Fast,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BondMiiMonitor {
    pub enabled: bool,
    pub interval: u32,
    pub up_delay: u32,
    pub down_delay: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BondArpMonitor {
    pub enabled: bool,
    pub interval: u32,
    #[serde(rename = "ipTargets")]
    pub ip_targets: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Bridge {
    pub logical_label: String,
    pub ports: Vec<String>,
    pub bonds: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Network {
    pub logical_label: String,
    pub bridge: String,
    #[serde(rename = "vlanID")]
    pub vlan_id: u16,
    pub subnet: String,
    #[serde(rename = "gwIP")]
    pub gw_ip: String,
    pub dhcp: Dhcp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transparent_proxy: Option<Proxy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router: Option<Router>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Dhcp {
    pub enable: bool,
    pub ip_range: IpRange,
    pub domain_name: String,
    #[serde(flatten)]
    pub dns: DnsClientConfig,
    #[serde(rename = "publicNTP")]
    pub public_ntp: String,
    #[serde(rename = "privateNTP")]
    pub private_ntp: String,
    pub wpad: String,
    pub netboot_server: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IpRange {
    #[serde(rename = "fromIP")]
    pub from_ip: String,
    #[serde(rename = "toIP")]
    pub to_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsClientConfig {
    #[serde(rename = "publicDNS")]
    pub public_dns: Vec<String>,
    #[serde(rename = "privateDNS")]
    pub private_dns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Proxy {
    #[serde(rename = "caCertPEM")]
    pub ca_cert_pem: String,
    #[serde(rename = "caKeyPEM")]
    pub ca_key_pem: String,
    #[serde(rename = "proxyRules")]
    pub proxy_rules: Vec<ProxyRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyRule {
    pub req_host: String,
    pub action: ProxyAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyAction {
    #[default]
    #[serde(alias = "")]
    Forward,
    Reject,
    Mitm,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Router {
    pub outside_reachability: bool,
    pub reachable_endpoints: Vec<String>,
    pub reachable_networks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Endpoints {
    pub clients: Vec<Client>,
    pub dns_servers: Vec<DnsServer>,
    pub ntp_servers: Vec<NtpServer>,
    pub http_servers: Vec<HttpServer>,
    pub explicit_proxies: Vec<ExplicitProxy>,
    pub netboot_servers: Vec<NetbootServer>,
}

/// Attributes shared by every endpoint category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Endpoint {
    pub logical_label: String,
    pub fqdn: String,
    pub subnet: String,
    pub ip: String,
    pub mtu: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Client {
    #[serde(flatten)]
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DnsServer {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub static_entries: Vec<DnsEntry>,
    pub upstream_servers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsEntry {
    pub fqdn: String,
    pub ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NtpServer {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub upstream_servers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpServer {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    #[serde(flatten)]
    pub dns: DnsClientConfig,
    pub http_port: u16,
    pub https_port: u16,
    #[serde(rename = "certPEM")]
    pub cert_pem: String,
    #[serde(rename = "keyPEM")]
    pub key_pem: String,
    pub paths: BTreeMap<String, HttpContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpContent {
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExplicitProxy {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    #[serde(flatten)]
    pub proxy: Proxy,
    #[serde(flatten)]
    pub dns: DnsClientConfig,
    pub http_port: u16,
    pub https_port: u16,
    pub users: Vec<UserCredentials>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetbootServer {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub tftp_artifacts: Vec<NetbootArtifact>,
    pub http_artifacts: Vec<NetbootArtifact>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetbootArtifact {
    pub filename: String,
    #[serde(rename = "downloadFromURL")]
    pub download_from_url: String,
    pub entrypoint: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Firewall {
    pub rules: Vec<FwRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FwRule {
    pub src_subnet: String,
    pub dst_subnet: String,
    pub protocol: FwProto,
    pub ports: Vec<u16>,
    pub action: FwAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FwProto {
    #[default]
    #[serde(alias = "")]
    Any,
    Icmp,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FwAction {
    #[default]
    #[serde(alias = "")]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(rename = "hostIPs")]
    pub host_ips: Vec<String>,
    pub network_type: NetworkType,
    pub controller_port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    #[default]
    #[serde(rename = "ipv4-only", alias = "")]
    Ipv4Only,
    #[serde(rename = "ipv6-only")]
    Ipv6Only,
    #[serde(rename = "dual-stack")]
    DualStack,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_model_document() {
        let json = r#"{
            "ports": [{"logicalLabel": "eveport0", "mac": "02:fe:00:00:00:01", "adminUP": true,
                       "eveConnect": {"eveInstance": "eve", "mac": "02:fe:00:00:01:01"}}],
            "bonds": [{"logicalLabel": "bond0", "ports": ["eveport0"], "mode": "802.3ad",
                       "lacpRate": "fast", "miiMonitor": {"enabled": true, "interval": 200}}],
            "networks": [{"logicalLabel": "lan", "bridge": "br0", "vlanID": 10,
                          "subnet": "172.22.10.0/24", "gwIP": "172.22.10.1",
                          "dhcp": {"enable": true, "publicDNS": ["1.1.1.1"],
                                   "privateDNS": ["dns1"], "ipRange": {"fromIP": "172.22.10.10", "toIP": "172.22.10.20"}}}],
            "endpoints": {
                "dnsServers": [{"logicalLabel": "dns1", "fqdn": "dns1.sdn", "subnet": "10.16.16.0/24",
                                "ip": "10.16.16.25", "staticEntries": [{"fqdn": "endpoint-fqdn.web", "ip": "endpoint-ip.web"}],
                                "upstreamServers": ["8.8.8.8"]}],
                "explicitProxies": [{"logicalLabel": "proxy", "subnet": "10.17.17.0/24", "ip": "10.17.17.10",
                                     "httpPort": 9090, "privateDNS": ["dns1"],
                                     "proxyRules": [{"reqHost": "example.com", "action": "reject"}],
                                     "users": [{"username": "u", "password": "p"}]}]
            },
            "host": {"hostIPs": ["192.168.0.10"], "networkType": "ipv4-only", "controllerPort": 3333}
        }"#;
        let model: NetworkModel = serde_json::from_str(json).unwrap();

        assert_eq!(model.ports[0].eve_connect.as_ref().unwrap().eve_instance, "eve");
        assert_eq!(model.bonds[0].mode, BondMode::Ieee8023Ad);
        assert_eq!(model.bonds[0].lacp_rate, LacpRate::Fast);
        assert_eq!(model.bonds[0].mii_monitor.interval, 200);
        let lan = &model.networks[0];
        assert_eq!(lan.vlan_id, 10);
        assert_eq!(lan.dhcp.dns.public_dns, vec!["1.1.1.1"]);
        assert_eq!(lan.dhcp.ip_range.to_ip, "172.22.10.20");
        let dns = &model.endpoints.dns_servers[0];
        assert_eq!(dns.endpoint.fqdn, "dns1.sdn");
        assert_eq!(dns.static_entries[0].ip, "endpoint-ip.web");
        let proxy = &model.endpoints.explicit_proxies[0];
        assert_eq!(proxy.proxy.proxy_rules[0].action, ProxyAction::Reject);
        assert_eq!(proxy.dns.private_dns, vec!["dns1"]);
        assert_eq!(model.host.unwrap().controller_port, 3333);
    }

    #[test]
    fn empty_enum_strings_take_defaults() {
        let rule: FwRule = serde_json::from_str(r#"{"protocol": "", "action": ""}"#).unwrap();
        assert_eq!(rule.protocol, FwProto::Any);
        assert_eq!(rule.action, FwAction::Allow);
    }
}
