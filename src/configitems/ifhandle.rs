use std::fmt;

use tracing::info;

use super::{Completion, Configurator, Context, DEFAULT_MTU, Dependency, Item, ItemKind, PhysIf};
use crate::Result;
use crate::netlink::netns::MAIN_NETNS;
use crate::netlink::queries;

/// How a physical interface is being used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IfUsage {
    #[default]
    Unspecified,
    /// Carries IP configuration directly.
    L3,
    /// Port of a bridge.
    Bridged,
    /// Member of a bond.
    Aggregated,
}

impl fmt::Display for IfUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IfUsage::Unspecified => "unspecified",
            IfUsage::L3 => "L3",
            IfUsage::Bridged => "bridged",
            IfUsage::Aggregated => "aggregated",
        })
    }
}

/// Exclusive claim on a physical interface: one usage, one owner.
///
/// Items that need the NIC in a particular mode depend on the handle with a
/// usage predicate, so changing the usage recreates them as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfHandle {
    pub phys_if: PhysIf,
    pub usage: IfUsage,
    /// Logical label of the bridge or bond owning the interface.
    pub parent_ll: String,
    pub admin_up: bool,
    pub mtu: u16,
}

impl Item for IfHandle {
    const KIND: ItemKind = ItemKind::IfHandle;

    fn name(&self) -> String {
        self.phys_if.mac.to_string()
    }

    fn label(&self) -> String {
        format!("{} (handle)", self.phys_if.logical_label)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::new(
            ItemKind::PhysIf,
            self.phys_if.mac.to_string(),
            "Underlying physical network interface must exist",
        )]
    }

    fn equal(&self, other: &Self) -> bool {
        self.usage == other.usage
            && self.parent_ll == other.parent_ll
            && self.admin_up == other.admin_up
            && self.mtu == other.mtu
    }
}

pub struct IfHandleConfigurator {
    ctx: Context,
}

impl IfHandleConfigurator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    async fn set_properties(&self, handle: &IfHandle, admin_up: bool, mtu: u16) -> Result<()> {
        let phys = self.ctx.phys_if(handle.phys_if.mac).await?;
        let mtu = if mtu == 0 { DEFAULT_MTU } else { mtu };
        let ifindex = phys.ifindex;
        self.ctx
            .netns
            .run(MAIN_NETNS, move |h| async move {
                queries::link_set_state(&h, ifindex, admin_up).await?;
                queries::link_set_mtu(&h, ifindex, mtu as u32).await
            })
            .await?;
        info!(iface = %phys.name, admin_up, mtu, "interface properties set");
        Ok(())
    }
}

impl Configurator for IfHandleConfigurator {
    type Item = IfHandle;

    async fn create(&self, item: &IfHandle) -> Result<Completion> {
        self.set_properties(item, item.admin_up, item.mtu).await?;
        Ok(Completion::Done)
    }

    async fn modify(&self, _old: &IfHandle, new: &IfHandle) -> Result<Completion> {
        self.set_properties(new, new.admin_up, new.mtu).await?;
        Ok(Completion::Done)
    }

    async fn delete(&self, item: &IfHandle) -> Result<Completion> {
        self.set_properties(item, false, 0).await?;
        Ok(Completion::Done)
    }

    fn needs_recreate(&self, old: &IfHandle, new: &IfHandle) -> bool {
        old.usage != new.usage || old.parent_ll != new.parent_ll
    }
}
