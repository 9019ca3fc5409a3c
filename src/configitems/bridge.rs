use std::collections::BTreeSet;

use tracing::info;

use super::bond::{attach_members, release_members};
use super::{
    Completion, Configurator, Context, DEFAULT_MTU, Dependency, IfUsage, Item, ItemKind,
    MustSatisfy, PhysIf,
};
use crate::Result;
use crate::netlink::netns::MAIN_NETNS;
use crate::netlink::queries;

/// Linux bridge joining physical ports and bonds, optionally VLAN-aware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    pub if_name: String,
    pub logical_label: String,
    pub phys_ifs: Vec<PhysIf>,
    /// Interface names of bridged bonds.
    pub bond_ifs: Vec<String>,
    /// VLANs trunked over every port; empty disables VLAN filtering.
    pub vlans: Vec<u16>,
    pub mtu: u16,
}

impl Bridge {
    fn without_members(&self) -> Bridge {
        Bridge {
            phys_ifs: Vec::new(),
            bond_ifs: Vec::new(),
            vlans: Vec::new(),
            ..self.clone()
        }
    }
}

impl Item for Bridge {
    const KIND: ItemKind = ItemKind::Bridge;

    fn name(&self) -> String {
        self.if_name.clone()
    }

    fn label(&self) -> String {
        format!("{} (bridge)", self.logical_label)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let ports = self.phys_ifs.iter().map(|phys| {
            Dependency::new(
                ItemKind::IfHandle,
                phys.mac.to_string(),
                "Bridged physical interface must exist",
            )
            .satisfying(MustSatisfy::IfHandleUsage {
                usage: IfUsage::Bridged,
                parent: Some(self.logical_label.clone()),
            })
        });
        let bonds = self.bond_ifs.iter().map(|bond| {
            Dependency::new(ItemKind::Bond, bond.clone(), "Bridged bond interface must exist")
        });
        ports.chain(bonds).collect()
    }

    fn equal(&self, other: &Self) -> bool {
        self.phys_ifs == other.phys_ifs
            && self.bond_ifs == other.bond_ifs
            && self.vlans == other.vlans
            && self.mtu == other.mtu
    }
}

/// Members present in `new` but not in `old`, and the other way round.
fn split<T: Ord + Clone>(old: &[T], new: &[T]) -> (Vec<T>, Vec<T>) {
    let old_set: BTreeSet<_> = old.iter().collect();
    let new_set: BTreeSet<_> = new.iter().collect();
    let added = new.iter().filter(|x| !old_set.contains(x)).cloned().collect();
    let removed = old.iter().filter(|x| !new_set.contains(x)).cloned().collect();
    (added, removed)
}

/// VLAN membership changes of one bridge port.
#[derive(Debug, PartialEq, Eq)]
struct PortVlans {
    port: String,
    add: Vec<u16>,
    del: Vec<u16>,
}

/// Kept ports move by the VLAN difference; `new_ports` get the full set.
fn port_vlans(
    ports: &[String],
    new_ports: &BTreeSet<String>,
    old: &Bridge,
    new: &Bridge,
) -> Vec<PortVlans> {
    let (added, removed) = split(&old.vlans, &new.vlans);
    ports
        .iter()
        .map(|port| {
            let (add, del) = if new_ports.contains(port) {
                (new.vlans.clone(), Vec::new())
            } else {
                (added.clone(), removed.clone())
            };
            PortVlans {
                port: port.clone(),
                add,
                del,
            }
        })
        .filter(|change| !change.add.is_empty() || !change.del.is_empty())
        .collect()
}

pub struct BridgeConfigurator {
    ctx: Context,
}

impl BridgeConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Interface name and index of each physical port.
    async fn resolve(&self, ports: &[PhysIf]) -> Result<Vec<(String, u32)>> {
        let mut resolved = Vec::with_capacity(ports.len());
        for phys in ports {
            let found = self.ctx.phys_if(phys.mac).await?;
            resolved.push((found.name, found.ifindex));
        }
        Ok(resolved)
    }

    /// Move the bridge from the `old` member and VLAN set to the `new` one.
    async fn apply(&self, old: &Bridge, new: &Bridge) -> Result<()> {
        let bridge = new.if_name.clone();
        let filtering =
            (old.vlans.is_empty() != new.vlans.is_empty()).then_some(!new.vlans.is_empty());

        let old_macs: Vec<_> = old.phys_ifs.iter().map(|p| p.mac).collect();
        let new_macs: Vec<_> = new.phys_ifs.iter().map(|p| p.mac).collect();
        let (added_macs, removed_macs) = split(&old_macs, &new_macs);
        let pick = |macs: &[crate::model::MacAddr], from: &[PhysIf]| -> Vec<PhysIf> {
            from.iter().filter(|p| macs.contains(&p.mac)).cloned().collect()
        };
        let added_phys = self.resolve(&pick(&added_macs, &new.phys_ifs)).await?;
        let removed_phys = self.resolve(&pick(&removed_macs, &old.phys_ifs)).await?;
        let (added_bonds, removed_bonds) = split(&old.bond_ifs, &new.bond_ifs);

        let new_ports: BTreeSet<String> = added_phys
            .iter()
            .map(|(name, _)| name.clone())
            .chain(added_bonds.iter().cloned())
            .collect();
        let mut ports: Vec<String> = self
            .resolve(&new.phys_ifs)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        ports.extend(new.bond_ifs.iter().cloned());
        let vlan_changes = port_vlans(&ports, &new_ports, old, new);

        let added_phys: Vec<u32> = added_phys.iter().map(|(_, idx)| *idx).collect();
        let removed_phys: Vec<u32> = removed_phys.iter().map(|(_, idx)| *idx).collect();
        self.ctx
            .netns
            .run(MAIN_NETNS, move |h| async move {
                let master = queries::require_link(&h, &bridge, MAIN_NETNS).await?;
                if let Some(enable) = filtering {
                    queries::bridge_set_vlan_filtering(&h, master, enable).await?;
                }

                let mut released = removed_phys;
                for bond in &removed_bonds {
                    if let Some(idx) = queries::link_index(&h, bond).await? {
                        released.push(idx);
                    }
                }
                release_members(&h, &released).await?;
                let mut attached = added_phys;
                for bond in &added_bonds {
                    attached.push(queries::require_link(&h, bond, MAIN_NETNS).await?);
                }
                attach_members(&h, master, &attached).await?;

                for change in &vlan_changes {
                    let index = queries::require_link(&h, &change.port, MAIN_NETNS).await?;
                    for vid in &change.del {
                        queries::bridge_vlan_del(&h, index, *vid).await?;
                    }
                    for vid in &change.add {
                        queries::bridge_vlan_add(&h, index, *vid, false).await?;
                    }
                }
                Ok(())
            })
            .await
    }
}

impl Configurator for BridgeConfigurator {
    type Item = Bridge;

    async fn create(&self, item: &Bridge) -> Result<Completion> {
        let name = item.if_name.clone();
        let mtu = if item.mtu == 0 { DEFAULT_MTU } else { item.mtu };
        self.ctx
            .netns
            .run(MAIN_NETNS, move |h| async move {
                queries::link_add(&h, rtnetlink::LinkBridge::new(&name).build()).await?;
                let index = queries::require_link(&h, &name, MAIN_NETNS).await?;
                queries::link_set_mtu(&h, index, mtu as u32).await?;
                queries::link_set_state(&h, index, true).await
            })
            .await?;
        self.apply(&item.without_members(), item).await?;
        info!(bridge = %item.if_name, "bridge created");
        Ok(Completion::Done)
    }

    async fn modify(&self, old: &Bridge, new: &Bridge) -> Result<Completion> {
        self.apply(old, new).await?;
        if old.mtu != new.mtu {
            let name = new.if_name.clone();
            let mtu = if new.mtu == 0 { DEFAULT_MTU } else { new.mtu };
            self.ctx
                .netns
                .run(MAIN_NETNS, move |h| async move {
                    let index = queries::require_link(&h, &name, MAIN_NETNS).await?;
                    queries::link_set_mtu(&h, index, mtu as u32).await
                })
                .await?;
        }
        info!(bridge = %new.if_name, "bridge updated");
        Ok(Completion::Done)
    }

    async fn delete(&self, item: &Bridge) -> Result<Completion> {
        self.apply(item, &item.without_members()).await?;
        let name = item.if_name.clone();
        self.ctx
            .netns
            .run(MAIN_NETNS, move |h| async move {
                queries::link_del_by_name(&h, &name).await
            })
            .await?;
        info!(bridge = %item.if_name, "bridge deleted");
        Ok(Completion::Done)
    }

    fn needs_recreate(&self, _old: &Bridge, _new: &Bridge) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> Bridge {
        Bridge {
            if_name: "br-lan".into(),
            logical_label: "lan".into(),
            phys_ifs: vec![PhysIf {
                mac: "02:fe:00:00:00:03".parse().unwrap(),
                logical_label: "eth3".into(),
            }],
            bond_ifs: vec!["bond-bond0".into()],
            vlans: vec![10, 20],
            mtu: 1500,
        }
    }

    #[test]
    fn ports_and_bonds_are_dependencies() {
        let deps = bridge().dependencies();
        assert_eq!(deps.len(), 2);
        assert_eq!(
            deps[0].must_satisfy,
            Some(MustSatisfy::IfHandleUsage {
                usage: IfUsage::Bridged,
                parent: Some("lan".into()),
            })
        );
        assert_eq!(deps[1].required.to_string(), "Bond/bond-bond0");
        assert_eq!(deps[1].description, "Bridged bond interface must exist");
    }

    #[test]
    fn member_split() {
        let (added, removed) = split(&[10u16, 20, 30], &[20, 40]);
        assert_eq!(added, vec![40]);
        assert_eq!(removed, vec![10, 30]);
        let (added, removed) = split::<u16>(&[], &[]);
        assert!(added.is_empty() && removed.is_empty());
    }

    #[test]
    fn vlan_changes_per_port() {
        let old = bridge();
        let mut new = bridge();
        new.vlans = vec![20, 30];
        let ports = ["eth3".to_string(), "eth4".to_string(), "bond-bond0".to_string()];
        let new_ports = BTreeSet::from(["eth4".to_string()]);
        assert_eq!(
            port_vlans(&ports, &new_ports, &old, &new),
            [
                PortVlans {
                    port: "eth3".into(),
                    add: vec![30],
                    del: vec![10],
                },
                PortVlans {
                    port: "eth4".into(),
                    add: vec![20, 30],
                    del: Vec::new(),
                },
                PortVlans {
                    port: "bond-bond0".into(),
                    add: vec![30],
                    del: vec![10],
                },
            ]
        );
        assert!(port_vlans(&ports, &BTreeSet::new(), &old, &old).is_empty());
    }

    #[test]
    fn emptied_bridge_keeps_identity() {
        let b = bridge();
        let empty = b.without_members();
        assert_eq!(empty.name(), b.name());
        assert!(empty.phys_ifs.is_empty() && empty.vlans.is_empty());
        assert!(!b.equal(&empty));
    }

    #[tokio::test]
    async fn bridges_are_modified_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let c = BridgeConfigurator::new(super::super::test_context(dir.path()));
        assert!(!c.needs_recreate(&bridge(), &bridge().without_members()));
    }
}
