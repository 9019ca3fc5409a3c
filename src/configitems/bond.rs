use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use netlink_packet_route::link::BondMode as NlBondMode;
use tracing::{info, warn};

use super::{
    Completion, Configurator, Context, DEFAULT_MTU, Dependency, IfUsage, Item, ItemKind,
    MustSatisfy, PhysIf, in_background,
};
use crate::Result;
use crate::config::BondDefaults;
use crate::graph::ItemRef;
use crate::model::{BondArpMonitor, BondMiiMonitor, BondMode, LacpRate};
use crate::netlink::netns::MAIN_NETNS;
use crate::netlink::queries;

/// Bond interface aggregating physical ports.
#[derive(Debug, Clone, PartialEq)]
pub struct Bond {
    pub if_name: String,
    pub logical_label: String,
    pub mode: BondMode,
    pub lacp_rate: LacpRate,
    pub mii_monitor: BondMiiMonitor,
    pub arp_monitor: BondArpMonitor,
    pub aggregated: Vec<PhysIf>,
    pub mtu: u16,
}

/// Link monitoring configured at creation; MII wins when both are enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Monitoring {
    None,
    Mii {
        interval: u32,
        up_delay: u32,
        down_delay: u32,
    },
    Arp {
        interval: u32,
        targets: Vec<Ipv4Addr>,
    },
}

impl Bond {
    fn same_attrs(&self, other: &Bond) -> bool {
        self.mode == other.mode
            && self.lacp_rate == other.lacp_rate
            && self.mii_monitor == other.mii_monitor
            && self.arp_monitor == other.arp_monitor
    }

    fn monitoring(&self, defaults: &BondDefaults) -> Monitoring {
        let or_default = |value: u32, default: u32| if value == 0 { default } else { value };
        if self.mii_monitor.enabled {
            return Monitoring::Mii {
                interval: or_default(self.mii_monitor.interval, defaults.miimon_interval),
                up_delay: self.mii_monitor.up_delay,
                down_delay: self.mii_monitor.down_delay,
            };
        }
        if self.arp_monitor.enabled {
            let targets = self
                .arp_monitor
                .ip_targets
                .iter()
                .filter_map(|target| match target.parse::<Ipv4Addr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!(bond = %self.if_name, "skipping invalid ARP target {target:?}");
                        None
                    }
                })
                .collect();
            return Monitoring::Arp {
                interval: or_default(self.arp_monitor.interval, defaults.arp_interval),
                targets,
            };
        }
        Monitoring::None
    }
}

fn netlink_mode(mode: BondMode) -> NlBondMode {
    match mode {
        BondMode::BalanceRr => NlBondMode::BalanceRr,
        BondMode::ActiveBackup => NlBondMode::ActiveBackup,
        BondMode::BalanceXor => NlBondMode::BalanceXor,
        BondMode::Broadcast => NlBondMode::Broadcast,
        BondMode::Ieee8023Ad => NlBondMode::Ieee8023Ad,
        BondMode::BalanceTlb => NlBondMode::BalanceTlb,
        BondMode::BalanceAlb => NlBondMode::BalanceAlb,
    }
}

fn lacp_rate_value(rate: LacpRate) -> u8 {
    match rate {
        LacpRate::Slow => 0,
        LacpRate::Fast => 1,
    }
}

impl Item for Bond {
    const KIND: ItemKind = ItemKind::Bond;

    fn name(&self) -> String {
        self.if_name.clone()
    }

    fn label(&self) -> String {
        format!("{} (bond)", self.logical_label)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        self.aggregated
            .iter()
            .map(|phys| {
                Dependency::new(
                    ItemKind::IfHandle,
                    phys.mac.to_string(),
                    "Aggregated physical interface must exist",
                )
                .satisfying(MustSatisfy::IfHandleUsage {
                    usage: IfUsage::Aggregated,
                    parent: Some(self.logical_label.clone()),
                })
            })
            .collect()
    }

    fn equal(&self, other: &Self) -> bool {
        self.same_attrs(other) && self.aggregated == other.aggregated && self.mtu == other.mtu
    }
}

pub struct BondConfigurator {
    ctx: Context,
}

impl BondConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    async fn member_indexes(&self, members: &[PhysIf]) -> Result<Vec<u32>> {
        let mut indexes = Vec::with_capacity(members.len());
        for phys in members {
            indexes.push(self.ctx.phys_if(phys.mac).await?.ifindex);
        }
        Ok(indexes)
    }
}

/// Enslave each member: down, attach, up.
pub(crate) async fn attach_members(
    handle: &rtnetlink::Handle,
    master: u32,
    members: &[u32],
) -> Result<()> {
    for &member in members {
        queries::link_set_state(handle, member, false).await?;
        queries::link_set_master(handle, member, Some(master)).await?;
        queries::link_set_state(handle, member, true).await?;
    }
    Ok(())
}

/// Release each member and bring it back up on its own.
pub(crate) async fn release_members(handle: &rtnetlink::Handle, members: &[u32]) -> Result<()> {
    for &member in members {
        queries::link_set_master(handle, member, None).await?;
        queries::link_set_state(handle, member, true).await?;
    }
    Ok(())
}

impl Configurator for BondConfigurator {
    type Item = Bond;

    async fn create(&self, item: &Bond) -> Result<Completion> {
        let members = self.member_indexes(&item.aggregated).await?;
        let monitoring = item.monitoring(&self.ctx.config.bond);
        let bond = item.clone();
        let name = item.if_name.clone();
        let netns = self.ctx.netns.clone();
        Ok(in_background(
            ItemRef::new(ItemKind::Bond, item.name()),
            "create",
            async move {
                netns
                    .run(MAIN_NETNS, move |h| async move {
                        let mut builder = rtnetlink::LinkBond::new(&bond.if_name)
                            .mode(netlink_mode(bond.mode));
                        if bond.mode == BondMode::Ieee8023Ad {
                            builder = builder.ad_lacp_rate(lacp_rate_value(bond.lacp_rate));
                        }
                        builder = match monitoring {
                            Monitoring::Mii {
                                interval,
                                up_delay,
                                down_delay,
                            } => builder.miimon(interval).updelay(up_delay).downdelay(down_delay),
                            Monitoring::Arp { interval, targets } => {
                                builder.arp_interval(interval).arp_ip_target(targets)
                            }
                            Monitoring::None => builder,
                        };
                        queries::link_add(&h, builder.build()).await?;

                        let index = queries::require_link(&h, &bond.if_name, MAIN_NETNS).await?;
                        let mtu = if bond.mtu == 0 { DEFAULT_MTU } else { bond.mtu };
                        queries::link_set_mtu(&h, index, mtu as u32).await?;
                        queries::link_set_state(&h, index, true).await?;
                        attach_members(&h, index, &members).await
                    })
                    .await?;
                info!(bond = %name, "bond created");
                Ok(())
            },
        ))
    }

    async fn modify(&self, old: &Bond, new: &Bond) -> Result<Completion> {
        let old_macs: BTreeSet<_> = old.aggregated.iter().map(|p| p.mac).collect();
        let new_macs: BTreeSet<_> = new.aggregated.iter().map(|p| p.mac).collect();
        let removed: Vec<PhysIf> = old
            .aggregated
            .iter()
            .filter(|p| !new_macs.contains(&p.mac))
            .cloned()
            .collect();
        let added: Vec<PhysIf> = new
            .aggregated
            .iter()
            .filter(|p| !old_macs.contains(&p.mac))
            .cloned()
            .collect();
        let removed = self.member_indexes(&removed).await?;
        let added = self.member_indexes(&added).await?;
        let name = new.if_name.clone();
        let mtu = (old.mtu != new.mtu).then_some(if new.mtu == 0 { DEFAULT_MTU } else { new.mtu });

        self.ctx
            .netns
            .run(MAIN_NETNS, move |h| async move {
                let index = queries::require_link(&h, &name, MAIN_NETNS).await?;
                release_members(&h, &removed).await?;
                attach_members(&h, index, &added).await?;
                if let Some(mtu) = mtu {
                    queries::link_set_mtu(&h, index, mtu as u32).await?;
                }
                Ok(())
            })
            .await?;
        info!(bond = %new.if_name, "bond members updated");
        Ok(Completion::Done)
    }

    async fn delete(&self, item: &Bond) -> Result<Completion> {
        let members = self.member_indexes(&item.aggregated).await?;
        let name = item.if_name.clone();
        let netns = self.ctx.netns.clone();
        Ok(in_background(
            ItemRef::new(ItemKind::Bond, item.name()),
            "delete",
            async move {
                netns
                    .run(MAIN_NETNS, {
                        let name = name.clone();
                        move |h| async move {
                            release_members(&h, &members).await?;
                            queries::link_del_by_name(&h, &name).await
                        }
                    })
                    .await?;
                info!(bond = %name, "bond deleted");
                Ok(())
            },
        ))
    }

    fn needs_recreate(&self, old: &Bond, new: &Bond) -> bool {
        !old.same_attrs(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(ll: &str, mac: &str) -> PhysIf {
        PhysIf {
            mac: mac.parse().unwrap(),
            logical_label: ll.into(),
        }
    }

    fn bond() -> Bond {
        Bond {
            if_name: "bond-bond0".into(),
            logical_label: "bond0".into(),
            mode: BondMode::Ieee8023Ad,
            lacp_rate: LacpRate::Fast,
            mii_monitor: BondMiiMonitor::default(),
            arp_monitor: BondArpMonitor::default(),
            aggregated: vec![
                member("eth1", "02:fe:00:00:00:01"),
                member("eth2", "02:fe:00:00:00:02"),
            ],
            mtu: 9000,
        }
    }

    #[test]
    fn members_must_be_aggregated_under_this_bond() {
        let deps = bond().dependencies();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[1].required.to_string(), "Interface-Handle/02:fe:00:00:00:02");
        assert_eq!(
            deps[1].must_satisfy,
            Some(MustSatisfy::IfHandleUsage {
                usage: IfUsage::Aggregated,
                parent: Some("bond0".into()),
            })
        );
    }

    #[test]
    fn monitoring_defaults_and_precedence() {
        let defaults = BondDefaults::default();
        let mut b = bond();
        assert_eq!(b.monitoring(&defaults), Monitoring::None);

        b.arp_monitor = BondArpMonitor {
            enabled: true,
            interval: 0,
            ip_targets: vec!["192.168.1.1".into(), "not-an-ip".into(), "fd00::1".into()],
        };
        assert_eq!(
            b.monitoring(&defaults),
            Monitoring::Arp {
                interval: 1000,
                targets: vec![Ipv4Addr::new(192, 168, 1, 1)],
            }
        );

        b.mii_monitor = BondMiiMonitor {
            enabled: true,
            interval: 0,
            up_delay: 200,
            down_delay: 300,
        };
        assert_eq!(
            b.monitoring(&defaults),
            Monitoring::Mii {
                interval: 100,
                up_delay: 200,
                down_delay: 300,
            }
        );
    }

    #[tokio::test]
    async fn member_changes_are_applied_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let c = BondConfigurator::new(super::super::test_context(dir.path()));
        let old = bond();
        let mut new = old.clone();
        new.aggregated.pop();
        assert!(!old.equal(&new));
        assert!(!c.needs_recreate(&old, &new));

        new.lacp_rate = LacpRate::Slow;
        assert!(c.needs_recreate(&old, &new));
    }

    #[test]
    fn mode_mapping() {
        assert_eq!(netlink_mode(BondMode::ActiveBackup), NlBondMode::ActiveBackup);
        assert_eq!(lacp_rate_value(LacpRate::Fast), 1);
    }
}
