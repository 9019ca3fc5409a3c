use std::net::IpAddr;
use std::path::PathBuf;

use tracing::info;

use super::{Completion, Configurator, Context, Item, ItemKind};
use crate::netlink::netns::{MAIN_NETNS, is_main};
use crate::netlink::queries;
use crate::process::{namespaced_command, run_command};
use crate::{Error, Result};

/// Canonical namespace name: the empty name means the main namespace.
pub fn norm_netns_name(netns: &str) -> String {
    if is_main(netns) {
        MAIN_NETNS.to_string()
    } else {
        netns.to_string()
    }
}

/// Resolver configuration installed for processes of a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    pub create: bool,
    pub dns_servers: Vec<IpAddr>,
}

impl ResolvConf {
    pub fn render(&self) -> String {
        let mut out = String::from("# Generated by SDN agent\n# Do not edit\n");
        for server in &self.dns_servers {
            out.push_str(&format!("nameserver {server}\n"));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetNamespace {
    pub ns_name: String,
    pub resolv_conf: ResolvConf,
}

impl NetNamespace {
    pub fn new(ns_name: &str) -> Self {
        Self {
            ns_name: norm_netns_name(ns_name),
            resolv_conf: ResolvConf::default(),
        }
    }
}

impl Item for NetNamespace {
    const KIND: ItemKind = ItemKind::NetNamespace;

    fn name(&self) -> String {
        norm_netns_name(&self.ns_name)
    }

    fn label(&self) -> String {
        format!("{} (net namespace)", self.name())
    }

    fn equal(&self, other: &Self) -> bool {
        self.resolv_conf == other.resolv_conf
    }
}

pub struct NetNamespaceConfigurator {
    ctx: Context,
}

impl NetNamespaceConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// `/etc/netns/<ns>`, read by `ip netns exec` in place of `/etc`.
    fn config_dir(&self, netns: &str) -> PathBuf {
        self.ctx.config.netns_etc_dir.join(netns)
    }

    fn resolv_conf_path(&self, netns: &str) -> PathBuf {
        if is_main(netns) {
            PathBuf::from("/etc/resolv.conf")
        } else {
            self.config_dir(netns).join("resolv.conf")
        }
    }

    async fn write_resolv_conf(&self, item: &NetNamespace) -> Result<()> {
        if !item.resolv_conf.create {
            return Ok(());
        }
        let path = self.resolv_conf_path(&item.name());
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, item.resolv_conf.render()).await?;
        info!(path = %path.display(), "resolv.conf written");
        Ok(())
    }
}

impl Configurator for NetNamespaceConfigurator {
    type Item = NetNamespace;

    async fn create(&self, item: &NetNamespace) -> Result<Completion> {
        let netns = item.name();
        if !is_main(&netns) {
            // Leftovers from a previous run must not leak into the new namespace.
            let dir = self.config_dir(&netns);
            match tokio::fs::remove_dir_all(&dir).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
            tokio::fs::create_dir_all(&dir).await?;
        }
        self.write_resolv_conf(item).await?;
        if !is_main(&netns) {
            run_command(namespaced_command(MAIN_NETNS, "ip", ["netns", "add", &netns])).await?;
            let job_ns = netns.clone();
            self.ctx
                .netns
                .run(&netns, move |h| async move {
                    let lo = queries::require_link(&h, "lo", &job_ns).await?;
                    queries::link_set_state(&h, lo, true).await
                })
                .await?;
            info!(%netns, "network namespace created");
        }
        Ok(Completion::Done)
    }

    async fn modify(&self, _old: &NetNamespace, new: &NetNamespace) -> Result<Completion> {
        self.write_resolv_conf(new).await?;
        Ok(Completion::Done)
    }

    async fn delete(&self, item: &NetNamespace) -> Result<Completion> {
        let netns = item.name();
        if is_main(&netns) {
            return Err(Error::Namespace {
                netns,
                reason: "the main namespace cannot be deleted".into(),
            });
        }
        run_command(namespaced_command(MAIN_NETNS, "ip", ["netns", "del", &netns])).await?;
        match tokio::fs::remove_dir_all(self.config_dir(&netns)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        info!(%netns, "network namespace deleted");
        Ok(Completion::Done)
    }

    fn needs_recreate(&self, _old: &NetNamespace, _new: &NetNamespace) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_normalized() {
        assert_eq!(norm_netns_name(""), "main");
        assert_eq!(norm_netns_name("endpoint-dns"), "endpoint-dns");
        let ns = NetNamespace::new("");
        assert_eq!(ns.name(), "main");
        assert_eq!(ns.label(), "main (net namespace)");
    }

    #[test]
    fn resolv_conf_content() {
        let conf = ResolvConf {
            create: true,
            dns_servers: vec!["10.16.16.25".parse().unwrap(), "1.1.1.1".parse().unwrap()],
        };
        assert_eq!(
            conf.render(),
            "# Generated by SDN agent\n# Do not edit\nnameserver 10.16.16.25\nnameserver 1.1.1.1\n"
        );
    }

    #[tokio::test]
    async fn resolv_conf_is_written_under_namespace_dir() {
        let dir = tempfile::tempdir().unwrap();
        let c = NetNamespaceConfigurator::new(super::super::test_context(dir.path()));
        let mut ns = NetNamespace::new("endpoint-proxy");
        ns.resolv_conf = ResolvConf {
            create: true,
            dns_servers: vec!["10.18.18.2".parse().unwrap()],
        };
        c.modify(&NetNamespace::new("endpoint-proxy"), &ns)
            .await
            .unwrap();
        let written =
            std::fs::read_to_string(dir.path().join("etc/netns/endpoint-proxy/resolv.conf"))
                .unwrap();
        assert!(written.ends_with("nameserver 10.18.18.2\n"));
        assert!(!c.needs_recreate(&ns, &NetNamespace::new("endpoint-proxy")));
    }

    #[tokio::test]
    async fn main_namespace_is_never_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let c = NetNamespaceConfigurator::new(super::super::test_context(dir.path()));
        let err = c.delete(&NetNamespace::new("main")).await.unwrap_err();
        assert!(matches!(err, Error::Namespace { .. }), "{err}");
    }
}
