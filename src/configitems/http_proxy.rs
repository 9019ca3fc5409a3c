use std::ffi::OsStr;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use super::{
    Completion, Configurator, Context, Dependency, Item, ItemKind, in_background, netns_dependency,
};
use crate::config::DaemonConfig;
use crate::graph::ItemRef;
use crate::model::{ProxyRule, UserCredentials};
use crate::process::{namespaced_command, remove_files, start_process, stop_process};
use crate::{Error, Result};

/// goproxy instance, either explicit (clients configure it) or transparent
/// (traffic is redirected to it).
#[derive(Debug, Clone, PartialEq)]
pub struct HttpProxy {
    pub proxy_name: String,
    pub netns: String,
    /// Empty for a proxy that does not sit behind its own veth.
    pub veth_name: String,
    pub listen_ip: Option<IpAddr>,
    pub http_port: u16,
    pub https_ports: Vec<u16>,
    pub transparent: bool,
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    pub proxy_rules: Vec<ProxyRule>,
    pub users: Vec<UserCredentials>,
}

/// Configuration file passed to goproxy with `-c`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoproxyConfig<'a> {
    #[serde(rename = "listenIP")]
    listen_ip: String,
    http_port: u16,
    https_ports: &'a [u16],
    transparent: bool,
    log_file: PathBuf,
    pid_file: PathBuf,
    verbose: bool,
    #[serde(rename = "caCertPEM")]
    ca_cert_pem: &'a str,
    #[serde(rename = "caKeyPEM")]
    ca_key_pem: &'a str,
    proxy_rules: &'a [ProxyRule],
    users: &'a [UserCredentials],
}

impl HttpProxy {
    fn render_config(&self, goproxy: &DaemonConfig) -> Result<String> {
        let config = GoproxyConfig {
            listen_ip: self.listen_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            http_port: self.http_port,
            https_ports: &self.https_ports,
            transparent: self.transparent,
            log_file: goproxy.log_file(&self.proxy_name),
            pid_file: goproxy.pid_file(&self.proxy_name),
            verbose: true,
            ca_cert_pem: &self.ca_cert_pem,
            ca_key_pem: &self.ca_key_pem,
            proxy_rules: &self.proxy_rules,
            users: &self.users,
        };
        Ok(serde_json::to_string_pretty(&config)?)
    }
}

impl Item for HttpProxy {
    const KIND: ItemKind = ItemKind::HttpProxy;

    fn name(&self) -> String {
        self.proxy_name.clone()
    }

    fn label(&self) -> String {
        format!("{} (HTTP proxy)", self.proxy_name)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let mut deps = vec![netns_dependency(&self.netns)];
        if !self.veth_name.is_empty() {
            deps.push(Dependency::new(
                ItemKind::Veth,
                self.veth_name.clone(),
                "veth interface must exist",
            ));
        }
        deps
    }

    fn equal(&self, other: &Self) -> bool {
        self == other
    }
}

pub struct HttpProxyConfigurator {
    ctx: Context,
}

impl HttpProxyConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

impl Configurator for HttpProxyConfigurator {
    type Item = HttpProxy;

    async fn create(&self, item: &HttpProxy) -> Result<Completion> {
        let goproxy = self.ctx.config.goproxy.clone();
        let name = item.proxy_name.clone();
        tokio::fs::create_dir_all(&goproxy.conf_dir).await?;
        let conf = goproxy.conf_file(&name);
        tokio::fs::write(&conf, item.render_config(&goproxy)?).await?;
        let netns = item.netns.clone();
        Ok(in_background(
            ItemRef::new(ItemKind::HttpProxy, item.name()),
            "create",
            async move {
                tokio::fs::create_dir_all(&goproxy.run_dir).await?;
                let cmd = namespaced_command(
                    &netns,
                    &goproxy.binary.to_string_lossy(),
                    [OsStr::new("-c"), conf.as_os_str()],
                );
                start_process(cmd, &goproxy.pid_file(&name), goproxy.start_timeout, true).await?;
                info!(proxy = %name, "HTTP proxy started");
                Ok(())
            },
        ))
    }

    async fn modify(&self, _old: &HttpProxy, _new: &HttpProxy) -> Result<Completion> {
        Err(Error::NotImplemented("HTTP proxy modification"))
    }

    async fn delete(&self, item: &HttpProxy) -> Result<Completion> {
        let goproxy = self.ctx.config.goproxy.clone();
        let name = item.proxy_name.clone();
        Ok(in_background(
            ItemRef::new(ItemKind::HttpProxy, item.name()),
            "delete",
            async move {
                let pid_file = goproxy.pid_file(&name);
                stop_process(&pid_file, goproxy.stop_timeout, goproxy.kill_timeout).await?;
                let (conf, log) = (goproxy.conf_file(&name), goproxy.log_file(&name));
                remove_files(&[&conf, &log, &pid_file]).await;
                info!(proxy = %name, "HTTP proxy stopped");
                Ok(())
            },
        ))
    }

    fn needs_recreate(&self, _old: &HttpProxy, _new: &HttpProxy) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::ProxyAction;

    fn proxy() -> HttpProxy {
        HttpProxy {
            proxy_name: "my-proxy".into(),
            netns: "endpoint-my-proxy".into(),
            veth_name: "ep-my-proxy".into(),
            listen_ip: Some("10.18.18.5".parse().unwrap()),
            http_port: 9090,
            https_ports: vec![9091],
            transparent: false,
            ca_cert_pem: String::new(),
            ca_key_pem: String::new(),
            proxy_rules: vec![ProxyRule {
                req_host: "zededa.com".into(),
                action: ProxyAction::Reject,
            }],
            users: vec![UserCredentials {
                username: "user".into(),
                password: "pass".into(),
            }],
        }
    }

    #[test]
    fn goproxy_config_json() {
        let json = proxy().render_config(&Config::default().goproxy).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["listenIP"], "10.18.18.5");
        assert_eq!(value["httpPort"], 9090);
        assert_eq!(value["httpsPorts"], serde_json::json!([9091]));
        assert_eq!(value["pidFile"], "/run/goproxy/my-proxy.pid");
        assert_eq!(value["logFile"], "/run/goproxy/my-proxy.log");
        assert_eq!(value["verbose"], true);
        assert_eq!(value["proxyRules"][0]["reqHost"], "zededa.com");
        assert_eq!(value["proxyRules"][0]["action"], "reject");
        assert_eq!(value["users"][0]["username"], "user");
    }

    #[test]
    fn transparent_proxy_has_no_veth_dependency() {
        let mut p = proxy();
        assert_eq!(p.dependencies().len(), 2);
        p.veth_name.clear();
        p.listen_ip = None;
        let deps = p.dependencies();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].required.to_string(), "Network-Namespace/endpoint-my-proxy");
        let json = p.render_config(&Config::default().goproxy).unwrap();
        assert!(json.contains("\"listenIP\": \"\""));
    }

    #[test]
    fn rule_change_is_detected() {
        let a = proxy();
        let mut b = a.clone();
        b.proxy_rules[0].action = ProxyAction::Forward;
        assert!(!a.equal(&b));
    }
}
