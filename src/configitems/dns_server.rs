use std::fmt::Write as _;
use std::net::IpAddr;

use tracing::info;

use super::dhcp_server::{start_dnsmasq, stop_dnsmasq, write_dnsmasq_config};
use super::{
    Completion, Configurator, Context, Dependency, Item, ItemKind, in_background, netns_dependency,
};
use crate::config::DaemonConfig;
use crate::graph::ItemRef;
use crate::{Error, Result};

const NAME_PREFIX: &str = "dnssrv-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsEntry {
    pub fqdn: String,
    pub ip: IpAddr,
}

/// dnsmasq answering DNS only: static entries, everything else forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsServer {
    pub server_name: String,
    pub netns: String,
    pub veth_name: String,
    pub veth_peer_if_name: String,
    pub static_entries: Vec<DnsEntry>,
    pub upstream_servers: Vec<IpAddr>,
}

impl DnsServer {
    fn instance(&self) -> String {
        format!("{NAME_PREFIX}{}", self.server_name)
    }

    fn render_config(&self, dnsmasq: &DaemonConfig) -> String {
        let name = self.instance();
        let mut conf = String::new();
        let _ = writeln!(conf, "pid-file={}", dnsmasq.pid_file(&name).display());
        let _ = writeln!(conf, "interface={}", self.veth_peer_if_name);
        let _ = writeln!(conf, "no-dhcp-interface={}", self.veth_peer_if_name);
        conf.push_str("log-queries\n");
        let _ = writeln!(conf, "log-facility={}", dnsmasq.log_file(&name).display());
        for upstream in &self.upstream_servers {
            let _ = writeln!(conf, "server={upstream}");
        }
        conf.push_str("no-resolv\n");
        for entry in &self.static_entries {
            let _ = writeln!(conf, "address=/{}/{}", entry.fqdn, entry.ip);
        }
        conf.push_str("no-hosts\n");
        conf
    }
}

impl Item for DnsServer {
    const KIND: ItemKind = ItemKind::DnsServer;

    fn name(&self) -> String {
        self.server_name.clone()
    }

    fn label(&self) -> String {
        format!("{} (DNS server)", self.server_name)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            netns_dependency(&self.netns),
            Dependency::new(ItemKind::Veth, self.veth_name.clone(), "veth interface must exist"),
        ]
    }

    fn equal(&self, other: &Self) -> bool {
        self == other
    }
}

pub struct DnsServerConfigurator {
    ctx: Context,
}

impl DnsServerConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

impl Configurator for DnsServerConfigurator {
    type Item = DnsServer;

    async fn create(&self, item: &DnsServer) -> Result<Completion> {
        let dnsmasq = self.ctx.config.dnsmasq.clone();
        let name = item.instance();
        write_dnsmasq_config(&dnsmasq, &name, &item.render_config(&dnsmasq)).await?;
        let netns = item.netns.clone();
        Ok(in_background(
            ItemRef::new(ItemKind::DnsServer, item.name()),
            "create",
            async move {
                start_dnsmasq(&dnsmasq, &name, &netns).await?;
                info!(server = %name, "DNS server started");
                Ok(())
            },
        ))
    }

    async fn modify(&self, _old: &DnsServer, _new: &DnsServer) -> Result<Completion> {
        Err(Error::NotImplemented("DNS server modification"))
    }

    async fn delete(&self, item: &DnsServer) -> Result<Completion> {
        let dnsmasq = self.ctx.config.dnsmasq.clone();
        let name = item.instance();
        Ok(in_background(
            ItemRef::new(ItemKind::DnsServer, item.name()),
            "delete",
            async move {
                stop_dnsmasq(&dnsmasq, &name).await?;
                info!(server = %name, "DNS server stopped");
                Ok(())
            },
        ))
    }

    fn needs_recreate(&self, _old: &DnsServer, _new: &DnsServer) -> bool {
        true
    }
}
