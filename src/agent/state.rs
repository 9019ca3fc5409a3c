//! Derivation of the intended and current item graphs from a parsed model.

use std::net::IpAddr;

use super::naming::{
    bond_if_name, bridge_if_name, endpoint_netns, endpoint_veth, network_bridge_veth,
    network_netns, network_router_veth,
};
use crate::config::HostPortConfig;
use crate::configitems::route::MAIN_TABLE;
use crate::configitems::{
    Bond, Bridge, DhcpClient, DhcpServer, DnsEntry, DnsServer, HttpProxy, IfHandle, IfUsage,
    IpForwarding, IpRule, MasterBridge, NetNamespace, PhysIf, ResolvConf, Route, RouteOutIf, Veth,
    VethPeer,
};
use crate::graph::ConfigGraph;
use crate::ipam::{self, IpNet, IpRange, NetworkIndexes};
use crate::model::validate::MAX_MTU;
use crate::model::{
    DnsClientConfig, Endpoint, ItemType, MacAddr, NETWORK_BRIDGE_REF_PREFIX, Network,
    PORT_MASTER_REF, ParsedModel, Port, ValidationError,
};
use crate::netlink::netns::MAIN_NETNS;
use crate::{Error, Result};

pub const CONFIG_GRAPH_NAME: &str = "SDN-Config";

/// Priority of the rules steering network traffic into per-network tables.
pub const NETWORK_IP_RULE_PRIORITY: u32 = 500;
/// Routing table of a network is this base plus the network index.
pub const NETWORK_RT_BASE: u32 = 500;

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// The interface connecting the agent with the host, when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostUplink {
    pub mac: MacAddr,
    /// Default gateway learned over the uplink (by DHCP).
    pub gateway: Option<IpAddr>,
}

fn invalid(item: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::Validation(ValidationError::Invalid {
        item: item.into(),
        reason: reason.into(),
    })
}

fn parse_net(item: &str, subnet: &str) -> Result<IpNet> {
    let net: IpNet = subnet
        .parse()
        .map_err(|_| invalid(item, format!("invalid subnet {subnet}")))?;
    Ok(net.network())
}

fn parse_ip(item: &str, ip: &str) -> Result<IpAddr> {
    ip.parse()
        .map_err(|_| invalid(item, format!("invalid IP address {ip}")))
}

/// Builds the graphs for one model; borrows everything it reads.
pub struct StateBuilder<'a> {
    pub model: &'a ParsedModel,
    pub indexes: &'a NetworkIndexes,
    pub host_port: &'a HostPortConfig,
    pub uplink: Option<&'a HostUplink>,
}

impl StateBuilder<'_> {
    /// Everything the model asks for.
    pub fn intended(&self) -> Result<ConfigGraph> {
        let mut graph = ConfigGraph::new(CONFIG_GRAPH_NAME);
        self.put_phys_ifs(&mut graph)?;
        self.put_host_connectivity(&mut graph);
        self.put_bridges(&mut graph)?;
        for network in &self.model.model.networks {
            self.put_network(&mut graph, network)?;
        }
        let eps = &self.model.model.endpoints;
        for client in &eps.clients {
            self.put_endpoint_common(&mut graph, &client.endpoint, None)?;
        }
        for dns in &eps.dns_servers {
            self.put_dns_server(&mut graph, dns)?;
        }
        for ntp in &eps.ntp_servers {
            self.put_endpoint_common(&mut graph, &ntp.endpoint, None)?;
        }
        for http in &eps.http_servers {
            self.put_endpoint_common(&mut graph, &http.endpoint, Some(&http.dns))?;
        }
        for proxy in &eps.explicit_proxies {
            self.put_explicit_proxy(&mut graph, proxy)?;
        }
        for netboot in &eps.netboot_servers {
            self.put_endpoint_common(&mut graph, &netboot.endpoint, None)?;
        }
        Ok(graph)
    }

    /// Physical interfaces that are present right now.
    pub fn current(&self, present: impl Fn(MacAddr) -> bool) -> Result<ConfigGraph> {
        let mut graph = ConfigGraph::new(CONFIG_GRAPH_NAME);
        if let Some(host) = self.host_phys_if() {
            graph.put(host);
        }
        for port in &self.model.model.ports {
            let phys = port_phys_if(port)?;
            if present(phys.mac) {
                graph.put(phys);
            }
        }
        Ok(graph)
    }

    fn host_phys_if(&self) -> Option<PhysIf> {
        self.uplink.map(|uplink| PhysIf {
            mac: uplink.mac,
            logical_label: self.host_port.logical_label.clone(),
        })
    }

    fn port(&self, label: &str) -> Option<&Port> {
        self.model
            .model
            .ports
            .iter()
            .find(|p| p.logical_label == label)
    }

    fn network(&self, label: &str) -> Option<&Network> {
        self.model
            .model
            .networks
            .iter()
            .find(|n| n.logical_label == label)
    }

    fn endpoint(&self, label: &str) -> Result<&Endpoint> {
        self.model
            .endpoint(label)
            .ok_or_else(|| invalid(label, "endpoint does not exist"))
    }

    fn endpoint_ip(&self, label: &str) -> Result<IpAddr> {
        parse_ip(label, &self.endpoint(label)?.ip)
    }

    fn dns_servers(&self, dns: &DnsClientConfig) -> Result<Vec<IpAddr>> {
        let mut servers = Vec::new();
        for public in &dns.public_dns {
            servers.push(parse_ip("public DNS", public)?);
        }
        for private in &dns.private_dns {
            servers.push(self.endpoint_ip(private)?);
        }
        Ok(servers)
    }

    fn put_phys_ifs(&self, graph: &mut ConfigGraph) -> Result<()> {
        graph.put(NetNamespace::new(MAIN_NETNS));
        if let Some(host) = self.host_phys_if() {
            graph.put(host);
        }
        for port in &self.model.model.ports {
            graph.put(port_phys_if(port)?);
        }
        Ok(())
    }

    fn put_host_connectivity(&self, graph: &mut ConfigGraph) {
        // Nothing to connect without the uplink.
        let Some(host) = self.host_phys_if() else {
            return;
        };
        graph.put(IfHandle {
            phys_if: host.clone(),
            usage: IfUsage::L3,
            parent_ll: String::new(),
            admin_up: true,
            mtu: MAX_MTU,
        });
        graph.put(IpForwarding {
            netns: MAIN_NETNS.to_string(),
            enable_ipv4: true,
            enable_ipv6: true,
        });
        graph.put(DhcpClient {
            phys_if: host,
            log_file: self.host_port.dhcp_log_file.to_string_lossy().into_owned(),
        });
    }

    fn put_bridges(&self, graph: &mut ConfigGraph) -> Result<()> {
        for port in &self.model.model.ports {
            let Some(master) = self
                .model
                .get(ItemType::Port, &port.logical_label)
                .and_then(|indexed| indexed.referenced_by.get(PORT_MASTER_REF))
            else {
                // Not used by anything.
                continue;
            };
            let usage = match master.item_type {
                ItemType::Bridge => IfUsage::Bridged,
                ItemType::Bond => IfUsage::Aggregated,
                _ => continue,
            };
            graph.put(IfHandle {
                phys_if: port_phys_if(port)?,
                usage,
                parent_ll: master.label.clone(),
                admin_up: port.admin_up,
                mtu: if port.mtu == 0 { MAX_MTU } else { port.mtu },
            });
        }

        for bond in &self.model.model.bonds {
            let mut aggregated = Vec::new();
            if let Some(indexed) = self.model.get(ItemType::Bond, &bond.logical_label) {
                for (target, ref_key) in &indexed.referencing {
                    if ref_key != PORT_MASTER_REF || target.item_type != ItemType::Port {
                        continue;
                    }
                    if let Some(port) = self.port(&target.label) {
                        aggregated.push(port_phys_if(port)?);
                    }
                }
            }
            graph.put(Bond {
                if_name: bond_if_name(&bond.logical_label),
                logical_label: bond.logical_label.clone(),
                mode: bond.mode,
                lacp_rate: bond.lacp_rate,
                mii_monitor: bond.mii_monitor.clone(),
                arp_monitor: bond.arp_monitor.clone(),
                aggregated,
                mtu: MAX_MTU,
            });
        }

        for bridge in &self.model.model.bridges {
            let Some(indexed) = self.model.get(ItemType::Bridge, &bridge.logical_label) else {
                continue;
            };
            let mut vlans = Vec::new();
            for (ref_key, by) in &indexed.referenced_by {
                if !ref_key.starts_with(NETWORK_BRIDGE_REF_PREFIX) {
                    continue;
                }
                if let Some(network) = self.network(&by.label)
                    && network.vlan_id != 0
                {
                    vlans.push(network.vlan_id);
                }
            }
            let mut phys_ifs = Vec::new();
            let mut bond_ifs = Vec::new();
            for (target, ref_key) in &indexed.referencing {
                if ref_key != PORT_MASTER_REF {
                    continue;
                }
                match target.item_type {
                    ItemType::Port => {
                        if let Some(port) = self.port(&target.label) {
                            phys_ifs.push(port_phys_if(port)?);
                        }
                    }
                    ItemType::Bond => bond_ifs.push(bond_if_name(&target.label)),
                    _ => {}
                }
            }
            graph.put(Bridge {
                if_name: bridge_if_name(&bridge.logical_label),
                logical_label: bridge.logical_label.clone(),
                phys_ifs,
                bond_ifs,
                vlans,
                mtu: MAX_MTU,
            });
        }
        Ok(())
    }

    fn put_network(&self, graph: &mut ConfigGraph, network: &Network) -> Result<()> {
        let ll = network.logical_label.as_str();
        let index = self.indexes.get(ll)?;
        let table = NETWORK_RT_BASE + index;
        let subnet = parse_net(ll, &network.subnet)?;
        let ipv6 = subnet.is_ipv6();
        let gw_ip = parse_ip(ll, &network.gw_ip)?;
        let gw = IpNet::new(gw_ip, subnet.prefix_len())
            .ok_or_else(|| invalid(ll, format!("invalid gateway {gw_ip}")))?;
        let default_dst = IpNet::default_route(ipv6);

        // Namespace attached to the bridge.
        let ns = network_netns(ll);
        let br = network_bridge_veth(ll);
        graph.put(NetNamespace::new(&ns));
        graph.put(Veth {
            veth_name: br.veth.clone(),
            peer1: VethPeer {
                if_name: br.inner.clone(),
                netns: ns.clone(),
                ip_addresses: vec![gw],
                mtu: 0,
                master_bridge: None,
            },
            peer2: VethPeer {
                if_name: br.outer.clone(),
                netns: MAIN_NETNS.to_string(),
                ip_addresses: Vec::new(),
                mtu: 0,
                master_bridge: Some(MasterBridge {
                    if_name: bridge_if_name(&network.bridge),
                    vlan: network.vlan_id,
                }),
            },
        });

        // Link towards the router in the main namespace.
        let rt = network_router_veth(ll);
        let (inner_ip, outer_ip) = ipam::veth_ips_for_network(index, ipv6)?;
        graph.put(Veth {
            veth_name: rt.veth.clone(),
            peer1: VethPeer {
                if_name: rt.inner.clone(),
                netns: ns.clone(),
                ip_addresses: vec![inner_ip],
                mtu: MAX_MTU,
                master_bridge: None,
            },
            peer2: VethPeer {
                if_name: rt.outer.clone(),
                netns: MAIN_NETNS.to_string(),
                ip_addresses: vec![outer_ip],
                mtu: MAX_MTU,
                master_bridge: None,
            },
        });

        let dhcp = &network.dhcp;
        if dhcp.enable {
            let ip_range = if dhcp.ip_range.from_ip.is_empty() {
                ipam::subnet_host_range(&subnet)?
            } else {
                IpRange {
                    from: parse_ip(ll, &dhcp.ip_range.from_ip)?,
                    to: parse_ip(ll, &dhcp.ip_range.to_ip)?,
                }
            };
            let ntp_server = if dhcp.private_ntp.is_empty() {
                dhcp.public_ntp.clone()
            } else {
                self.endpoint(&dhcp.private_ntp)?.ip.clone()
            };
            graph.put(DhcpServer {
                server_name: ll.to_string(),
                netns: ns.clone(),
                veth_name: br.veth.clone(),
                veth_peer_if_name: br.inner.clone(),
                subnet,
                ip_range,
                gateway_ip: Some(gw_ip),
                domain_name: dhcp.domain_name.clone(),
                dns_servers: self.dns_servers(&dhcp.dns)?,
                ntp_server,
                wpad: dhcp.wpad.clone(),
            });
        }

        if let Some(proxy) = &network.transparent_proxy {
            let controller_port = self
                .model
                .model
                .host
                .as_ref()
                .map_or(HTTPS_PORT, |host| host.controller_port);
            let mut https_ports = vec![HTTPS_PORT];
            if controller_port != HTTPS_PORT {
                https_ports.push(controller_port);
            }
            graph.put(HttpProxy {
                proxy_name: format!("tproxy-{ll}"),
                netns: ns.clone(),
                veth_name: String::new(),
                listen_ip: None,
                http_port: HTTP_PORT,
                https_ports,
                transparent: true,
                ca_cert_pem: proxy.ca_cert_pem.clone(),
                ca_key_pem: proxy.ca_key_pem.clone(),
                proxy_rules: proxy.proxy_rules.clone(),
                users: Vec::new(),
            });
        }

        graph.put(IpRule {
            src_net: Some(subnet),
            dst_net: None,
            table,
            priority: NETWORK_IP_RULE_PRIORITY,
        });
        graph.put(IpRule {
            src_net: None,
            dst_net: Some(subnet),
            table,
            priority: NETWORK_IP_RULE_PRIORITY,
        });

        // Default route from inside the namespace.
        graph.put(Route {
            netns: ns.clone(),
            dst_net: default_dst,
            out_if: RouteOutIf {
                veth_name: rt.veth.clone(),
                veth_peer_if_name: rt.inner.clone(),
                phys_if: None,
            },
            gw_ip: Some(outer_ip.addr()),
            table: MAIN_TABLE,
            metric: 0,
        });

        let router = network.router.as_ref();
        for indexed in self.model.items.values() {
            let Some(ep) = indexed.item.endpoint() else {
                continue;
            };
            let dst_net = parse_net(&ep.logical_label, &ep.subnet)?;
            let reachable =
                router.is_none_or(|r| r.reachable_endpoints.contains(&ep.logical_label));
            let route = if reachable {
                let names = endpoint_veth(&ep.logical_label);
                routed(
                    dst_net,
                    table,
                    names.veth,
                    names.outer,
                    parse_ip(&ep.logical_label, &ep.ip)?,
                )
            } else {
                unreachable(dst_net, table, 0)
            };
            graph.put(route);
        }

        for other in &self.model.model.networks {
            let other_ll = other.logical_label.as_str();
            let dst_net = parse_net(other_ll, &other.subnet)?;
            let reachable = other_ll == ll
                || router.is_none_or(|r| r.reachable_networks.iter().any(|n| n == other_ll));
            let route = if reachable {
                let names = network_router_veth(other_ll);
                let (other_inner, _) =
                    ipam::veth_ips_for_network(self.indexes.get(other_ll)?, ipv6)?;
                routed(dst_net, table, names.veth, names.outer, other_inner.addr())
            } else {
                unreachable(dst_net, table, 0)
            };
            graph.put(route);
        }

        let outside = router.is_none_or(|r| r.outside_reachability);
        if outside
            && let Some(host) = self.host_phys_if()
            && let Some(gateway) = self.uplink.and_then(|u| u.gateway)
            && gateway.is_ipv6() == ipv6
        {
            graph.put(Route {
                netns: MAIN_NETNS.to_string(),
                dst_net: default_dst,
                out_if: RouteOutIf {
                    phys_if: Some(host),
                    ..Default::default()
                },
                gw_ip: Some(gateway),
                table,
                metric: 0,
            });
        }

        // Everything else is unreachable, at the lowest priority.
        graph.put(unreachable(default_dst, table, u32::MAX));
        Ok(())
    }

    /// Namespace, veth and default route shared by every endpoint.
    fn put_endpoint_common(
        &self,
        graph: &mut ConfigGraph,
        ep: &Endpoint,
        dns: Option<&DnsClientConfig>,
    ) -> Result<()> {
        let ll = ep.logical_label.as_str();
        let subnet = parse_net(ll, &ep.subnet)?;
        let ip = parse_ip(ll, &ep.ip)?;
        let ep_ip = IpNet::new(ip, subnet.prefix_len())
            .ok_or_else(|| invalid(ll, format!("invalid endpoint IP {ip}")))?;
        let gw = ipam::endpoint_gateway(&subnet, ip)?;
        let ns = endpoint_netns(ll);
        let names = endpoint_veth(ll);

        let mut netns = NetNamespace::new(&ns);
        if let Some(dns) = dns {
            netns.resolv_conf = ResolvConf {
                create: true,
                dns_servers: self.dns_servers(dns)?,
            };
        }
        graph.put(netns);
        graph.put(Veth {
            veth_name: names.veth.clone(),
            peer1: VethPeer {
                if_name: names.inner.clone(),
                netns: ns.clone(),
                ip_addresses: vec![ep_ip],
                mtu: ep.mtu,
                master_bridge: None,
            },
            peer2: VethPeer {
                if_name: names.outer.clone(),
                netns: MAIN_NETNS.to_string(),
                ip_addresses: vec![gw],
                mtu: ep.mtu,
                master_bridge: None,
            },
        });
        graph.put(Route {
            netns: ns,
            dst_net: IpNet::default_route(subnet.is_ipv6()),
            out_if: RouteOutIf {
                veth_name: names.veth,
                veth_peer_if_name: names.inner,
                phys_if: None,
            },
            gw_ip: Some(gw.addr()),
            table: MAIN_TABLE,
            metric: 0,
        });
        Ok(())
    }

    fn put_dns_server(&self, graph: &mut ConfigGraph, dns: &crate::model::DnsServer) -> Result<()> {
        self.put_endpoint_common(graph, &dns.endpoint, None)?;
        let ll = dns.endpoint.logical_label.as_str();
        let mut static_entries = Vec::new();
        for entry in &dns.static_entries {
            let fqdn = self
                .model
                .resolve_entry_fqdn(&entry.fqdn)
                .ok_or_else(|| invalid(ll, format!("unresolved static entry {}", entry.fqdn)))?;
            let ip = self
                .model
                .resolve_entry_ip(&entry.ip)
                .ok_or_else(|| invalid(ll, format!("unresolved static entry IP {}", entry.ip)))?;
            static_entries.push(DnsEntry { fqdn, ip });
        }
        let mut upstream_servers = Vec::new();
        for upstream in &dns.upstream_servers {
            upstream_servers.push(parse_ip(ll, upstream)?);
        }
        let names = endpoint_veth(ll);
        graph.put(DnsServer {
            server_name: ll.to_string(),
            netns: endpoint_netns(ll),
            veth_name: names.veth,
            veth_peer_if_name: names.inner,
            static_entries,
            upstream_servers,
        });
        Ok(())
    }

    fn put_explicit_proxy(
        &self,
        graph: &mut ConfigGraph,
        proxy: &crate::model::ExplicitProxy,
    ) -> Result<()> {
        self.put_endpoint_common(graph, &proxy.endpoint, Some(&proxy.dns))?;
        let ll = proxy.endpoint.logical_label.as_str();
        let https_ports = if proxy.https_port == 0 {
            Vec::new()
        } else {
            vec![proxy.https_port]
        };
        graph.put(HttpProxy {
            proxy_name: ll.to_string(),
            netns: endpoint_netns(ll),
            veth_name: endpoint_veth(ll).veth,
            listen_ip: Some(parse_ip(ll, &proxy.endpoint.ip)?),
            http_port: proxy.http_port,
            https_ports,
            transparent: false,
            ca_cert_pem: proxy.proxy.ca_cert_pem.clone(),
            ca_key_pem: proxy.proxy.ca_key_pem.clone(),
            proxy_rules: proxy.proxy.proxy_rules.clone(),
            users: proxy.users.clone(),
        });
        Ok(())
    }
}

fn port_phys_if(port: &Port) -> Result<PhysIf> {
    let mac = port
        .mac
        .parse()
        .map_err(|_| invalid(&port.logical_label, format!("invalid MAC address {}", port.mac)))?;
    Ok(PhysIf {
        mac,
        logical_label: port.logical_label.clone(),
    })
}

/// Route in a network's table via the main-namespace end of a veth.
fn routed(dst_net: IpNet, table: u32, veth: String, peer: String, gw: IpAddr) -> Route {
    Route {
        netns: MAIN_NETNS.to_string(),
        dst_net,
        out_if: RouteOutIf {
            veth_name: veth,
            veth_peer_if_name: peer,
            phys_if: None,
        },
        gw_ip: Some(gw),
        table,
        metric: 0,
    }
}

fn unreachable(dst_net: IpNet, table: u32, metric: u32) -> Route {
    Route {
        netns: MAIN_NETNS.to_string(),
        dst_net,
        out_if: RouteOutIf::default(),
        gw_ip: None,
        table,
        metric,
    }
}
