use std::net::{IpAddr, Ipv4Addr};

use tracing::info;

use super::{Completion, Configurator, Context, Item, ItemKind};
use crate::ipam::IpNet;
use crate::netlink::netns::MAIN_NETNS;
use crate::netlink::queries;
use crate::{Error, Result};

/// Policy routing rule in the main namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRule {
    pub src_net: Option<IpNet>,
    pub dst_net: Option<IpNet>,
    pub table: u32,
    pub priority: u32,
}

impl Item for IpRule {
    const KIND: ItemKind = ItemKind::IpRule;

    fn name(&self) -> String {
        match (&self.src_net, &self.dst_net) {
            (None, Some(dst)) => format!("{dst}/to/{}", self.table),
            (Some(src), None) => format!("{src}/from/{}", self.table),
            (Some(src), Some(dst)) => format!("{src}/from/{dst}/to/{}", self.table),
            (None, None) => format!("all/{}", self.table),
        }
    }

    fn label(&self) -> String {
        let selector = match (&self.src_net, &self.dst_net) {
            (None, Some(dst)) => format!("To {dst}"),
            (Some(src), None) => format!("From {src}"),
            (Some(src), Some(dst)) => format!("From {src} to {dst}"),
            (None, None) => "All traffic".to_string(),
        };
        format!("{selector} use table {} with prio {}", self.table, self.priority)
    }

    fn equal(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

fn v4_selector(net: Option<&IpNet>) -> Result<Option<(Ipv4Addr, u8)>> {
    match net.map(|n| (n.addr(), n.prefix_len())) {
        None => Ok(None),
        Some((IpAddr::V4(ip), len)) => Ok(Some((ip, len))),
        Some((IpAddr::V6(_), _)) => Err(Error::NotImplemented("IPv6 policy routing")),
    }
}

pub struct IpRuleConfigurator {
    ctx: Context,
}

impl IpRuleConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

impl Configurator for IpRuleConfigurator {
    type Item = IpRule;

    async fn create(&self, item: &IpRule) -> Result<Completion> {
        let src = v4_selector(item.src_net.as_ref())?;
        let dst = v4_selector(item.dst_net.as_ref())?;
        let (table, priority) = (item.table, item.priority);
        self.ctx
            .netns
            .run(MAIN_NETNS, move |h| async move {
                queries::rule_add_v4(&h, src, dst, table, priority).await
            })
            .await?;
        info!(rule = %item.label(), "IP rule added");
        Ok(Completion::Done)
    }

    async fn modify(&self, _old: &IpRule, _new: &IpRule) -> Result<Completion> {
        Err(Error::NotImplemented("IP rule modification"))
    }

    async fn delete(&self, item: &IpRule) -> Result<Completion> {
        let src = v4_selector(item.src_net.as_ref())?;
        let dst = v4_selector(item.dst_net.as_ref())?;
        let (table, priority) = (item.table, item.priority);
        self.ctx
            .netns
            .run(MAIN_NETNS, move |h| async move {
                queries::rule_del_v4(&h, src, dst, table, priority).await
            })
            .await?;
        info!(rule = %item.label(), "IP rule removed");
        Ok(Completion::Done)
    }

    fn needs_recreate(&self, _old: &IpRule, _new: &IpRule) -> bool {
        true
    }
}
