use tracing::info;

use super::netns::norm_netns_name;
use super::{Completion, Configurator, Context, DEFAULT_MTU, Dependency, Item, ItemKind, netns_dependency};
use crate::ipam::IpNet;
use crate::netlink::netns::{MAIN_NETNS, is_main, open_netns};
use crate::netlink::queries;
use crate::{Error, Result};

/// Bridge a veth end is attached to, as an access port of `vlan` (0: untagged).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterBridge {
    pub if_name: String,
    pub vlan: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPeer {
    pub if_name: String,
    pub netns: String,
    pub ip_addresses: Vec<IpNet>,
    pub mtu: u16,
    pub master_bridge: Option<MasterBridge>,
}

impl VethPeer {
    fn dependencies(&self) -> Vec<Dependency> {
        let mut deps = vec![netns_dependency(&self.netns)];
        if let Some(master) = &self.master_bridge {
            deps.push(Dependency::new(
                ItemKind::Bridge,
                master.if_name.clone(),
                "Bridge interface must exist",
            ));
        }
        deps
    }
}

/// Virtual ethernet pair, usually linking a namespace with the main one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veth {
    pub veth_name: String,
    pub peer1: VethPeer,
    pub peer2: VethPeer,
}

impl Veth {
    /// The end whose interface is named `if_name`.
    pub fn peer(&self, if_name: &str) -> Option<&VethPeer> {
        [&self.peer1, &self.peer2]
            .into_iter()
            .find(|p| p.if_name == if_name)
    }
}

impl Item for Veth {
    const KIND: ItemKind = ItemKind::Veth;

    fn name(&self) -> String {
        self.veth_name.clone()
    }

    fn label(&self) -> String {
        format!("{} (veth)", self.veth_name)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let mut deps = self.peer1.dependencies();
        deps.extend(self.peer2.dependencies());
        deps
    }

    fn equal(&self, other: &Self) -> bool {
        self.peer1 == other.peer1 && self.peer2 == other.peer2
    }
}

pub struct VethConfigurator {
    ctx: Context,
}

impl VethConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    async fn configure_peer(&self, peer: &VethPeer) -> Result<()> {
        let netns = norm_netns_name(&peer.netns);
        if !is_main(&netns) {
            let ns_file = open_netns(self.ctx.netns.run_dir(), &netns)?;
            let name = peer.if_name.clone();
            self.ctx
                .netns
                .run(MAIN_NETNS, move |h| async move {
                    let index = queries::require_link(&h, &name, MAIN_NETNS).await?;
                    queries::link_set_netns(&h, index, &ns_file).await
                })
                .await?;
        }

        let p = peer.clone();
        let job_ns = netns.clone();
        self.ctx
            .netns
            .run(&netns, move |h| async move {
                let index = queries::require_link(&h, &p.if_name, &job_ns).await?;
                if let Some(master) = &p.master_bridge {
                    let bridge = queries::require_link(&h, &master.if_name, &job_ns).await?;
                    queries::link_set_master(&h, index, Some(bridge)).await?;
                    if master.vlan != 0 {
                        queries::bridge_vlan_add(&h, index, master.vlan, true).await?;
                    }
                }
                queries::link_set_state(&h, index, true).await?;
                for addr in &p.ip_addresses {
                    queries::address_add(&h, index, *addr).await?;
                }
                let mtu = if p.mtu == 0 { DEFAULT_MTU } else { p.mtu };
                queries::link_set_mtu(&h, index, mtu as u32).await
            })
            .await
    }
}

impl Configurator for VethConfigurator {
    type Item = Veth;

    async fn create(&self, item: &Veth) -> Result<Completion> {
        let (name1, name2) = (item.peer1.if_name.clone(), item.peer2.if_name.clone());
        self.ctx
            .netns
            .run(MAIN_NETNS, move |h| async move {
                queries::link_add(&h, rtnetlink::LinkVeth::new(&name1, &name2).build()).await
            })
            .await?;
        self.configure_peer(&item.peer1).await?;
        self.configure_peer(&item.peer2).await?;
        info!(veth = %item.veth_name, "veth created");
        Ok(Completion::Done)
    }

    async fn modify(&self, _old: &Veth, _new: &Veth) -> Result<Completion> {
        Err(Error::NotImplemented("veth modification"))
    }

    async fn delete(&self, item: &Veth) -> Result<Completion> {
        // Removing one end removes the pair.
        let name = item.peer1.if_name.clone();
        self.ctx
            .netns
            .run(&norm_netns_name(&item.peer1.netns), move |h| async move {
                queries::link_del_by_name(&h, &name).await
            })
            .await?;
        info!(veth = %item.veth_name, "veth deleted");
        Ok(Completion::Done)
    }

    fn needs_recreate(&self, _old: &Veth, _new: &Veth) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn veth() -> Veth {
        Veth {
            veth_name: "net-br-lan".into(),
            peer1: VethPeer {
                if_name: "net-br-in-lan".into(),
                netns: "network-lan".into(),
                ip_addresses: vec!["10.0.0.1/24".parse().unwrap()],
                mtu: 0,
                master_bridge: None,
            },
            peer2: VethPeer {
                if_name: "net-br-out-lan".into(),
                netns: String::new(),
                ip_addresses: Vec::new(),
                mtu: 0,
                master_bridge: Some(MasterBridge {
                    if_name: "br-lan".into(),
                    vlan: 100,
                }),
            },
        }
    }

    #[test]
    fn both_ends_contribute_dependencies() {
        let deps: Vec<String> = veth()
            .dependencies()
            .iter()
            .map(|d| d.required.to_string())
            .collect();
        assert_eq!(
            deps,
            [
                "Network-Namespace/network-lan",
                "Network-Namespace/main",
                "Bridge/br-lan"
            ]
        );
    }

    #[test]
    fn peer_by_interface_name() {
        let v = veth();
        assert_eq!(
            v.peer("net-br-out-lan").and_then(|p| p.master_bridge.as_ref()).map(|m| m.vlan),
            Some(100)
        );
        assert_eq!(v.peer("net-br-in-lan").map(|p| p.netns.as_str()), Some("network-lan"));
        assert!(v.peer("eth0").is_none());
    }

    #[tokio::test]
    async fn changes_recreate_the_pair() {
        let dir = tempfile::tempdir().unwrap();
        let c = VethConfigurator::new(super::super::test_context(dir.path()));
        let old = veth();
        let mut new = old.clone();
        new.peer2.mtu = 9000;
        assert!(!old.equal(&new));
        assert!(c.needs_recreate(&old, &new));
        assert!(matches!(
            c.modify(&old, &new).await,
            Err(Error::NotImplemented(_))
        ));
    }
}
