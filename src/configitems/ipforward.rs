use tracing::info;

use super::netns::norm_netns_name;
use super::{Completion, Configurator, Dependency, Item, ItemKind, netns_dependency};
use crate::Result;
use crate::netlink::netns::is_main;
use crate::process::{namespaced_command, run_command};

/// IP forwarding switches of one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpForwarding {
    pub netns: String,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
}

impl Item for IpForwarding {
    const KIND: ItemKind = ItemKind::IpForwarding;

    fn name(&self) -> String {
        norm_netns_name(&self.netns)
    }

    fn label(&self) -> String {
        format!("IP Forwarding in {} ns", self.name())
    }

    fn dependencies(&self) -> Vec<Dependency> {
        if is_main(&self.netns) {
            Vec::new()
        } else {
            vec![netns_dependency(&self.netns)]
        }
    }

    fn equal(&self, other: &Self) -> bool {
        self.enable_ipv4 == other.enable_ipv4 && self.enable_ipv6 == other.enable_ipv6
    }
}

fn sysctl_settings(ipv4: bool, ipv6: bool) -> [String; 2] {
    let flag = |on: bool| if on { 1 } else { 0 };
    [
        format!("net.ipv4.ip_forward={}", flag(ipv4)),
        format!("net.ipv6.conf.all.forwarding={}", flag(ipv6)),
    ]
}

pub struct IpForwardingConfigurator;

impl IpForwardingConfigurator {
    async fn apply(netns: &str, ipv4: bool, ipv6: bool) -> Result<()> {
        let netns = norm_netns_name(netns);
        for setting in sysctl_settings(ipv4, ipv6) {
            run_command(namespaced_command(&netns, "sysctl", ["-w", setting.as_str()])).await?;
        }
        info!(%netns, ipv4, ipv6, "IP forwarding set");
        Ok(())
    }
}

impl Configurator for IpForwardingConfigurator {
    type Item = IpForwarding;

    async fn create(&self, item: &IpForwarding) -> Result<Completion> {
        Self::apply(&item.netns, item.enable_ipv4, item.enable_ipv6).await?;
        Ok(Completion::Done)
    }

    async fn modify(&self, _old: &IpForwarding, new: &IpForwarding) -> Result<Completion> {
        Self::apply(&new.netns, new.enable_ipv4, new.enable_ipv6).await?;
        Ok(Completion::Done)
    }

    async fn delete(&self, item: &IpForwarding) -> Result<Completion> {
        Self::apply(&item.netns, false, false).await?;
        Ok(Completion::Done)
    }

    fn needs_recreate(&self, _old: &IpForwarding, _new: &IpForwarding) -> bool {
        false
    }
}
