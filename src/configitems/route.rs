use std::net::{IpAddr, Ipv4Addr};

use netlink_packet_route::route::{RouteMessage, RouteType};
use rtnetlink::RouteMessageBuilder;
use tracing::info;

use super::netns::norm_netns_name;
use super::{
    Completion, Configurator, Context, Dependency, IfUsage, Item, ItemKind, MustSatisfy, PhysIf,
    netns_dependency,
};
use crate::ipam::IpNet;
use crate::netlink::queries;
use crate::{Error, Result};

/// Main routing table.
pub const MAIN_TABLE: u32 = 254;

/// Where a route sends traffic. Neither a veth nor a NIC means unreachable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOutIf {
    pub veth_name: String,
    /// End of the veth inside the route's namespace.
    pub veth_peer_if_name: String,
    pub phys_if: Option<PhysIf>,
}

impl RouteOutIf {
    fn reference(&self) -> Option<String> {
        if !self.veth_name.is_empty() {
            return Some(self.veth_name.clone());
        }
        self.phys_if.as_ref().map(|p| p.mac.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub netns: String,
    pub dst_net: IpNet,
    pub out_if: RouteOutIf,
    pub gw_ip: Option<IpAddr>,
    pub table: u32,
    pub metric: u32,
}

impl Item for Route {
    const KIND: ItemKind = ItemKind::Route;

    fn name(&self) -> String {
        let ns = norm_netns_name(&self.netns);
        match self.out_if.reference() {
            Some(out) => format!("{ns}/{}/{}/{out}", self.table, self.dst_net),
            None => format!("{ns}/{}/{}", self.table, self.dst_net),
        }
    }

    fn label(&self) -> String {
        let ns = norm_netns_name(&self.netns);
        match self.out_if.reference() {
            Some(out) => {
                let via = self.gw_ip.map(|gw| gw.to_string()).unwrap_or_else(|| "<nil>".into());
                format!("IP route ns {ns} table {} dst {} dev {out} via {via}", self.table, self.dst_net)
            }
            None => format!(
                "IP route ns {ns} table {} dst {} is unreachable",
                self.table, self.dst_net
            ),
        }
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let mut deps = vec![netns_dependency(&self.netns)];
        if !self.out_if.veth_name.is_empty() {
            deps.push(Dependency::new(
                ItemKind::Veth,
                self.out_if.veth_name.clone(),
                "veth interface must exist",
            ));
        } else if let Some(phys) = &self.out_if.phys_if {
            deps.push(
                Dependency::new(
                    ItemKind::IfHandle,
                    phys.mac.to_string(),
                    "Physical network interface must exist and be used in the L3 mode",
                )
                .satisfying(MustSatisfy::IfHandleUsage {
                    usage: IfUsage::L3,
                    parent: None,
                }),
            );
        }
        deps
    }

    fn equal(&self, other: &Self) -> bool {
        self.gw_ip == other.gw_ip && self.metric == other.metric
    }
}

/// Kernel route for `route`, leaving through `oif` or unreachable without one.
fn route_message(route: &Route, oif: Option<u32>) -> Result<RouteMessage> {
    let IpAddr::V4(dst) = route.dst_net.addr() else {
        return Err(Error::NotImplemented("IPv6 routes"));
    };
    let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
        .destination_prefix(dst, route.dst_net.prefix_len())
        .table_id(route.table)
        .priority(route.metric);
    match oif {
        Some(oif) => {
            builder = builder.output_interface(oif);
            match route.gw_ip {
                Some(IpAddr::V4(gw)) => builder = builder.gateway(gw),
                Some(IpAddr::V6(_)) => return Err(Error::NotImplemented("IPv6 gateways")),
                None => {}
            }
        }
        None => builder = builder.kind(RouteType::Unreachable),
    }
    Ok(builder.build())
}

pub struct RouteConfigurator {
    ctx: Context,
}

impl RouteConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Resolve the output interface, then add or remove the route inside
    /// its namespace.
    async fn apply(&self, route: &Route, add: bool) -> Result<()> {
        let netns = norm_netns_name(&route.netns);
        let phys_index = match &route.out_if.phys_if {
            Some(phys) if route.out_if.veth_peer_if_name.is_empty() => {
                Some(self.ctx.phys_if(phys.mac).await?.ifindex)
            }
            _ => None,
        };
        let route = route.clone();
        let job_ns = netns.clone();
        self.ctx
            .netns
            .run(&netns, move |h| async move {
                let oif = if route.out_if.veth_peer_if_name.is_empty() {
                    phys_index
                } else {
                    Some(queries::require_link(&h, &route.out_if.veth_peer_if_name, &job_ns).await?)
                };
                let msg = route_message(&route, oif)?;
                if add {
                    queries::route_add(&h, msg).await
                } else {
                    queries::route_del(&h, msg).await
                }
            })
            .await
    }
}

impl Configurator for RouteConfigurator {
    type Item = Route;

    async fn create(&self, item: &Route) -> Result<Completion> {
        self.apply(item, true).await?;
        info!(route = %item.label(), "route added");
        Ok(Completion::Done)
    }

    async fn modify(&self, _old: &Route, _new: &Route) -> Result<Completion> {
        Err(Error::NotImplemented("route modification"))
    }

    async fn delete(&self, item: &Route) -> Result<Completion> {
        self.apply(item, false).await?;
        info!(route = %item.label(), "route removed");
        Ok(Completion::Done)
    }

    fn needs_recreate(&self, _old: &Route, _new: &Route) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable() -> Route {
        Route {
            netns: String::new(),
            dst_net: "0.0.0.0/0".parse().unwrap(),
            out_if: RouteOutIf::default(),
            gw_ip: None,
            table: 501,
            metric: u32::MAX,
        }
    }

    fn via_veth() -> Route {
        Route {
            netns: "network-lan".into(),
            dst_net: "0.0.0.0/0".parse().unwrap(),
            out_if: RouteOutIf {
                veth_name: "net-rt-lan".into(),
                veth_peer_if_name: "net-rt-in-lan".into(),
                phys_if: None,
            },
            gw_ip: Some("169.254.0.2".parse().unwrap()),
            table: MAIN_TABLE,
            metric: 0,
        }
    }

    #[test]
    fn names_and_labels() {
        assert_eq!(unreachable().name(), "main/501/0.0.0.0/0");
        assert_eq!(
            unreachable().label(),
            "IP route ns main table 501 dst 0.0.0.0/0 is unreachable"
        );
        assert_eq!(via_veth().name(), "network-lan/254/0.0.0.0/0/net-rt-lan");
        assert_eq!(
            via_veth().label(),
            "IP route ns network-lan table 254 dst 0.0.0.0/0 dev net-rt-lan via 169.254.0.2"
        );
    }

    #[test]
    fn output_interface_dependencies() {
        assert_eq!(unreachable().dependencies().len(), 1);
        let deps = via_veth().dependencies();
        assert_eq!(deps[1].required.to_string(), "Veth/net-rt-lan");

        let mut uplink = unreachable();
        uplink.out_if.phys_if = Some(PhysIf {
            mac: "02:fe:00:00:00:09".parse().unwrap(),
            logical_label: "host-port".into(),
        });
        let deps = uplink.dependencies();
        assert_eq!(
            deps[1].must_satisfy,
            Some(MustSatisfy::IfHandleUsage {
                usage: IfUsage::L3,
                parent: None,
            })
        );
        assert!(uplink.name().ends_with("/02:fe:00:00:00:09"));
    }

    #[test]
    fn kernel_messages() {
        let msg = route_message(&unreachable(), None).unwrap();
        assert_eq!(msg.header.kind, RouteType::Unreachable);
        assert_eq!(msg.header.destination_prefix_length, 0);

        let msg = route_message(&via_veth(), Some(7)).unwrap();
        assert_eq!(msg.header.kind, RouteType::Unicast);

        let mut v6 = unreachable();
        v6.dst_net = "::/0".parse().unwrap();
        assert!(matches!(route_message(&v6, None), Err(Error::NotImplemented(_))));
    }

    #[test]
    fn gateway_and_metric_are_compared() {
        let a = via_veth();
        let mut b = a.clone();
        b.out_if.veth_name = "other".into();
        assert!(a.equal(&b));
        b.metric = 10;
        assert!(!a.equal(&b));
    }
}
