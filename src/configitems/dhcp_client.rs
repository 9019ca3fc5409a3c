use std::time::Duration;

use tokio::process::Command;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use super::{
    Completion, Configurator, Context, Dependency, IfUsage, Item, ItemKind, MustSatisfy, PhysIf,
    in_background,
};
use crate::graph::ItemRef;
use crate::process::{is_running, poll_until, run_command, start_process};
use crate::{Error, Result};

const RELEASE_RETRY: Duration = Duration::from_secs(1);

/// dhcpcd running on a physical interface used in the L3 mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpClient {
    pub phys_if: PhysIf,
    pub log_file: String,
}

impl Item for DhcpClient {
    const KIND: ItemKind = ItemKind::DhcpClient;

    fn name(&self) -> String {
        self.phys_if.mac.to_string()
    }

    fn label(&self) -> String {
        format!("dhcpcd for {}", self.phys_if.logical_label)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::new(
                ItemKind::IfHandle,
                self.phys_if.mac.to_string(),
                "Physical network interface must exist and be used in the L3 mode",
            )
            .satisfying(MustSatisfy::IfHandleUsage {
                usage: IfUsage::L3,
                parent: None,
            }),
        ]
    }

    fn equal(&self, other: &Self) -> bool {
        self.log_file == other.log_file && self.phys_if.logical_label == other.phys_if.logical_label
    }
}

pub struct DhcpClientConfigurator {
    ctx: Context,
}

impl DhcpClientConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.ctx.config.dhcpcd.binary);
        cmd.args(args);
        cmd
    }

    fn start_command(&self, client: &DhcpClient, ifname: &str) -> Command {
        let mut args = Vec::new();
        if !client.log_file.is_empty() {
            args.extend(["-j", client.log_file.as_str()]);
        }
        // Keep trying to obtain a lease forever.
        args.extend(["-t", "0", ifname]);
        self.command(&args)
    }
}

impl Configurator for DhcpClientConfigurator {
    type Item = DhcpClient;

    async fn create(&self, item: &DhcpClient) -> Result<Completion> {
        let ifname = self.ctx.phys_if(item.phys_if.mac).await?.name;
        let pid_file = self.ctx.config.dhcpcd.pid_file(&ifname);
        let timeout = self.ctx.config.dhcpcd.start_timeout;
        let cmd = self.start_command(item, &ifname);
        Ok(in_background(
            ItemRef::new(ItemKind::DhcpClient, item.name()),
            "create",
            async move {
                if is_running(&pid_file).await {
                    let err = Error::Process(format!("dhcpcd for interface {ifname} is already running"));
                    error!("{err}");
                    return Err(err);
                }
                start_process(cmd, &pid_file, timeout, true).await?;
                info!(iface = %ifname, "dhcpcd started");
                Ok(())
            },
        ))
    }

    async fn modify(&self, _old: &DhcpClient, _new: &DhcpClient) -> Result<Completion> {
        Err(Error::NotImplemented("DHCP client modification"))
    }

    async fn delete(&self, item: &DhcpClient) -> Result<Completion> {
        let ifname = self.ctx.phys_if(item.phys_if.mac).await?.name;
        let dhcpcd = self.ctx.config.dhcpcd.clone();
        Ok(in_background(
            ItemRef::new(ItemKind::DhcpClient, item.name()),
            "delete",
            async move {
                let pid_file = dhcpcd.pid_file(&ifname);
                let dhcpcd_cmd = |op: &str| {
                    let mut cmd = Command::new(&dhcpcd.binary);
                    cmd.args([op, ifname.as_str()]);
                    cmd
                };
                let started = Instant::now();
                loop {
                    if let Err(e) = run_command(dhcpcd_cmd("--release")).await {
                        warn!(iface = %ifname, elapsed = ?started.elapsed(), "dhcpcd release failed: {e}");
                    }
                    if !is_running(&pid_file).await {
                        debug!(iface = %ifname, elapsed = ?started.elapsed(), "dhcpcd released");
                        return Ok(());
                    }
                    if started.elapsed() > dhcpcd.release_timeout {
                        break;
                    }
                    sleep(RELEASE_RETRY).await;
                }

                warn!(iface = %ifname, "dhcpcd still running after release, asking it to exit");
                run_command(dhcpcd_cmd("--exit")).await?;
                let pid_file = &pid_file;
                if poll_until(dhcpcd.exit_timeout, || async move { !is_running(pid_file).await }).await {
                    info!(iface = %ifname, "dhcpcd exited");
                    return Ok(());
                }
                let err = Error::Timeout {
                    what: format!("exit of dhcpcd for interface {ifname}"),
                    timeout: dhcpcd.release_timeout + dhcpcd.exit_timeout,
                };
                error!("{err}");
                Err(err)
            },
        ))
    }

    fn needs_recreate(&self, _old: &DhcpClient, _new: &DhcpClient) -> bool {
        true
    }
}
