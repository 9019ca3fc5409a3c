use std::ffi::OsStr;
use std::fmt::Write as _;
use std::net::IpAddr;

use tracing::{error, info};

use super::{
    Completion, Configurator, Context, Dependency, Item, ItemKind, in_background, netns_dependency,
};
use crate::config::DaemonConfig;
use crate::graph::ItemRef;
use crate::ipam::{IpNet, IpRange};
use crate::process::{namespaced_command, remove_files, start_process, stop_process};
use crate::{Error, Result};

const NAME_PREFIX: &str = "dhcpsrv-";

/// dnsmasq serving DHCP on the namespace side of a veth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpServer {
    pub server_name: String,
    pub netns: String,
    pub veth_name: String,
    pub veth_peer_if_name: String,
    pub subnet: IpNet,
    pub ip_range: IpRange,
    pub gateway_ip: Option<IpAddr>,
    pub domain_name: String,
    pub dns_servers: Vec<IpAddr>,
    pub ntp_server: String,
    pub wpad: String,
}

impl DhcpServer {
    fn instance(&self) -> String {
        format!("{NAME_PREFIX}{}", self.server_name)
    }

    fn render_config(&self, dnsmasq: &DaemonConfig) -> String {
        let name = self.instance();
        let ipv6 = self.subnet.is_ipv6();
        let mut conf = String::new();
        let _ = writeln!(conf, "pid-file={}", dnsmasq.pid_file(&name).display());
        if ipv6 {
            let _ = writeln!(conf, "dhcp-range={},ra-stateless", self.subnet);
        } else {
            let _ = writeln!(
                conf,
                "dhcp-range={},{},{},60m",
                self.ip_range.from,
                self.ip_range.to,
                self.subnet.netmask()
            );
        }
        let _ = writeln!(conf, "dhcp-leasefile={}", dnsmasq.lease_file(&name).display());
        conf.push_str("port=0\n");
        let _ = writeln!(conf, "interface={}", self.veth_peer_if_name);
        conf.push_str("log-dhcp\n");
        let _ = writeln!(conf, "log-facility={}", dnsmasq.log_file(&name).display());
        if !self.domain_name.is_empty() {
            let option = if ipv6 { "domain-search" } else { "domain-name" };
            let _ = writeln!(conf, "dhcp-option=option:{option},{}", self.domain_name);
        }
        if let Some(gw) = self.gateway_ip
            && !ipv6
        {
            let _ = writeln!(conf, "dhcp-option=option:router,{gw}");
        }
        if !self.dns_servers.is_empty() {
            let servers: Vec<String> = self.dns_servers.iter().map(|ip| ip.to_string()).collect();
            let _ = writeln!(conf, "dhcp-option=option:dns-server,{}", servers.join(","));
        }
        if !self.ntp_server.is_empty() {
            let _ = writeln!(conf, "dhcp-option=option:ntp-server,{}", self.ntp_server);
        }
        if !self.wpad.is_empty() {
            let _ = writeln!(conf, "dhcp-option=252,{}", self.wpad);
        }
        conf
    }
}

impl Item for DhcpServer {
    const KIND: ItemKind = ItemKind::DhcpServer;

    fn name(&self) -> String {
        self.server_name.clone()
    }

    fn label(&self) -> String {
        format!("{} (DHCP server)", self.server_name)
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

/// Write `<conf_dir>/<name>.conf`.
pub(crate) async fn write_dnsmasq_config(
    dnsmasq: &DaemonConfig,
    name: &str,
    content: &str,
) -> Result<()> {
    tokio::fs::create_dir_all(&dnsmasq.conf_dir).await?;
    let path = dnsmasq.conf_file(name);
    tokio::fs::write(&path, content).await.map_err(|e| {
        error!(path = %path.display(), "failed to write dnsmasq config: {e}");
        Error::from(e)
    })
}

/// Run `nohup dnsmasq -C <conf>` in `netns` and wait for its PID file.
pub(crate) async fn start_dnsmasq(dnsmasq: &DaemonConfig, name: &str, netns: &str) -> Result<()> {
    tokio::fs::create_dir_all(&dnsmasq.run_dir).await?;
    let conf = dnsmasq.conf_file(name);
    let cmd = namespaced_command(
        netns,
        "nohup",
        [dnsmasq.binary.as_os_str(), OsStr::new("-C"), conf.as_os_str()],
    );
    start_process(cmd, &dnsmasq.pid_file(name), dnsmasq.start_timeout, false).await
}

/// Stop the instance; its files go only once it is gone.
pub(crate) async fn stop_dnsmasq(dnsmasq: &DaemonConfig, name: &str) -> Result<()> {
    let pid_file = dnsmasq.pid_file(name);
    stop_process(&pid_file, dnsmasq.stop_timeout, dnsmasq.kill_timeout).await?;
    let (conf, lease, log) = (
        dnsmasq.conf_file(name),
        dnsmasq.lease_file(name),
        dnsmasq.log_file(name),
    );
    remove_files(&[&conf, &lease, &log, &pid_file]).await;
    Ok(())
}

pub struct DhcpServerConfigurator {
    ctx: Context,
}

impl DhcpServerConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

impl Configurator for DhcpServerConfigurator {
    type Item = DhcpServer;

    async fn create(&self, item: &DhcpServer) -> Result<Completion> {
        let dnsmasq = self.ctx.config.dnsmasq.clone();
        let name = item.instance();
        write_dnsmasq_config(&dnsmasq, &name, &item.render_config(&dnsmasq)).await?;
        let netns = item.netns.clone();
        Ok(in_background(
            ItemRef::new(ItemKind::DhcpServer, item.name()),
            "create",
            async move {
                start_dnsmasq(&dnsmasq, &name, &netns).await?;
                info!(server = %name, "DHCP server started");
                Ok(())
            },
        ))
    }

    async fn modify(&self, _old: &DhcpServer, _new: &DhcpServer) -> Result<Completion> {
        Err(Error::NotImplemented("DHCP server modification"))
    }

    async fn delete(&self, item: &DhcpServer) -> Result<Completion> {
        let dnsmasq = self.ctx.config.dnsmasq.clone();
        let name = item.instance();
        Ok(in_background(
            ItemRef::new(ItemKind::DhcpServer, item.name()),
            "delete",
            async move {
                stop_dnsmasq(&dnsmasq, &name).await?;
                info!(server = %name, "DHCP server stopped");
                Ok(())
            },
        ))
    }

    fn needs_recreate(&self, _old: &DhcpServer, _new: &DhcpServer) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn server() -> DhcpServer {
        DhcpServer {
            server_name: "lan".into(),
            netns: "network-lan".into(),
            veth_name: "net-br-lan".into(),
            veth_peer_if_name: "net-br-in-lan".into(),
            subnet: "172.22.12.0/24".parse().unwrap(),
            ip_range: IpRange {
                from: "172.22.12.10".parse().unwrap(),
                to: "172.22.12.20".parse().unwrap(),
            },
            gateway_ip: Some("172.22.12.1".parse().unwrap()),
            domain_name: "sdn".into(),
            dns_servers: vec!["10.16.16.25".parse().unwrap(), "1.1.1.1".parse().unwrap()],
            ntp_server: "132.163.96.5".into(),
            wpad: String::new(),
        }
    }

    #[test]
    fn dnsmasq_config() {
        let dnsmasq = Config::default().dnsmasq;
        assert_eq!(
            server().render_config(&dnsmasq),
            "pid-file=/run/dnsmasq/dhcpsrv-lan.pid\n\
             dhcp-range=172.22.12.10,172.22.12.20,255.255.255.0,60m\n\
             dhcp-leasefile=/run/dnsmasq/dhcpsrv-lan.leases\n\
             port=0\n\
             interface=net-br-in-lan\n\
             log-dhcp\n\
             log-facility=/run/dnsmasq/dhcpsrv-lan.log\n\
             dhcp-option=option:domain-name,sdn\n\
             dhcp-option=option:router,172.22.12.1\n\
             dhcp-option=option:dns-server,10.16.16.25,1.1.1.1\n\
             dhcp-option=option:ntp-server,132.163.96.5\n"
        );
    }

    #[test]
    fn ipv6_uses_stateless_ra() {
        let mut s = server();
        s.subnet = "fd00:12::/64".parse().unwrap();
        s.dns_servers.clear();
        s.ntp_server.clear();
        s.wpad = "http://wpad.sdn/wpad.dat".into();
        let conf = s.render_config(&Config::default().dnsmasq);
        assert!(conf.contains("dhcp-range=fd00:12::/64,ra-stateless\n"));
        assert!(conf.contains("dhcp-option=option:domain-search,sdn\n"));
        assert!(!conf.contains("option:router"));
        assert!(conf.ends_with("dhcp-option=252,http://wpad.sdn/wpad.dat\n"));
    }

    #[test]
    fn any_change_counts() {
        let a = server();
        let mut b = a.clone();
        assert!(a.equal(&b));
        b.domain_name = "other".into();
        assert!(!a.equal(&b));
        let deps: Vec<String> = a.dependencies().iter().map(|d| d.required.to_string()).collect();
        assert_eq!(deps, ["Network-Namespace/network-lan", "Veth/net-br-lan"]);
    }

    #[tokio::test]
    async fn config_file_is_written_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = super::super::test_context(dir.path());
        let s = server();
        write_dnsmasq_config(&ctx.config.dnsmasq, &s.instance(), &s.render_config(&ctx.config.dnsmasq))
            .await
            .unwrap();
        let written =
            std::fs::read_to_string(dir.path().join("etc/dnsmasq/dhcpsrv-lan.conf")).unwrap();
        assert!(written.starts_with(&format!(
            "pid-file={}",
            dir.path().join("run/dnsmasq/dhcpsrv-lan.pid").display()
        )));
    }
}
