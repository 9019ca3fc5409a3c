//! Configuration items: one value type plus one configurator per network
//! primitive the agent manages.
//!
//! Items are plain values derived from the network model on every pass.
//! Identity lives in [`ConfigItem::name`]; [`ConfigItem::equal`] compares the
//! remaining attributes. Configurators turn items into kernel state and
//! processes; the engine that decides which operation to call, and in which
//! order, is not part of this crate.

pub mod bond;
pub mod bridge;
pub mod dhcp_client;
pub mod dhcp_server;
pub mod dns_server;
pub mod http_proxy;
pub mod ifhandle;
pub mod ipforward;
pub mod iprule;
pub mod netns;
pub mod physif;
pub mod route;
pub mod veth;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::graph::ItemRef;
use crate::maclookup::MacIf;
use crate::model::MacAddr;
use crate::netlink::{NetnsWorker, NetworkMonitor};
use crate::{Error, Result};

pub use bond::{Bond, BondConfigurator};
pub use bridge::{Bridge, BridgeConfigurator};
pub use dhcp_client::{DhcpClient, DhcpClientConfigurator};
pub use dhcp_server::{DhcpServer, DhcpServerConfigurator};
pub use dns_server::{DnsEntry, DnsServer, DnsServerConfigurator};
pub use http_proxy::{HttpProxy, HttpProxyConfigurator};
pub use ifhandle::{IfHandle, IfHandleConfigurator, IfUsage};
pub use ipforward::{IpForwarding, IpForwardingConfigurator};
pub use iprule::{IpRule, IpRuleConfigurator};
pub use netns::{NetNamespace, NetNamespaceConfigurator, ResolvConf};
pub use physif::{PhysIf, PhysIfConfigurator};
pub use route::{Route, RouteConfigurator, RouteOutIf};
pub use veth::{MasterBridge, Veth, VethConfigurator, VethPeer};

/// MTU applied when an item leaves it unset.
pub const DEFAULT_MTU: u16 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemKind {
    PhysIf,
    IfHandle,
    Bond,
    Bridge,
    Veth,
    DhcpClient,
    DhcpServer,
    DnsServer,
    HttpProxy,
    NetNamespace,
    IpForwarding,
    IpRule,
    Route,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::PhysIf => "Physical-Interface",
            ItemKind::IfHandle => "Interface-Handle",
            ItemKind::Bond => "Bond",
            ItemKind::Bridge => "Bridge",
            ItemKind::Veth => "Veth",
            ItemKind::DhcpClient => "DHCP-Client",
            ItemKind::DhcpServer => "DHCP-Server",
            ItemKind::DnsServer => "DNS-Server",
            ItemKind::HttpProxy => "HTTP-Proxy",
            ItemKind::NetNamespace => "Network-Namespace",
            ItemKind::IpForwarding => "IP-Forwarding",
            ItemKind::IpRule => "IP-Rule",
            ItemKind::Route => "Route",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra condition a required item must meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MustSatisfy {
    /// The interface handle is used in the given mode, owned by `parent`
    /// when set.
    IfHandleUsage {
        usage: IfUsage,
        parent: Option<String>,
    },
}

impl MustSatisfy {
    pub fn satisfied_by(&self, item: &ConfigItem) -> bool {
        match (self, item) {
            (MustSatisfy::IfHandleUsage { usage, parent }, ConfigItem::IfHandle(handle)) => {
                handle.usage == *usage
                    && parent.as_ref().is_none_or(|parent| handle.parent_ll == *parent)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub required: ItemRef,
    pub must_satisfy: Option<MustSatisfy>,
    pub description: &'static str,
}

impl Dependency {
    pub fn new(kind: ItemKind, name: impl Into<String>, description: &'static str) -> Self {
        Self {
            required: ItemRef::new(kind, name),
            must_satisfy: None,
            description,
        }
    }

    pub fn satisfying(mut self, condition: MustSatisfy) -> Self {
        self.must_satisfy = Some(condition);
        self
    }
}

/// Dependency on the namespace named `netns`.
pub(crate) fn netns_dependency(netns: &str) -> Dependency {
    Dependency::new(
        ItemKind::NetNamespace,
        netns::norm_netns_name(netns),
        "Network namespace must exist",
    )
}

/// Behaviour shared by every item type.
pub trait Item {
    const KIND: ItemKind;

    fn name(&self) -> String;

    fn label(&self) -> String;

    /// Items learned from the OS rather than created by the agent.
    fn external(&self) -> bool {
        false
    }

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Compare everything except the identity carried by the name.
    fn equal(&self, other: &Self) -> bool;
}

macro_rules! config_items {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        /// Any configuration item.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ConfigItem {
            $($variant($ty)),*
        }

        impl ConfigItem {
            pub fn kind(&self) -> ItemKind {
                match self {
                    $(ConfigItem::$variant(_) => <$ty as Item>::KIND),*
                }
            }

            pub fn name(&self) -> String {
                match self {
                    $(ConfigItem::$variant(item) => item.name()),*
                }
            }

            pub fn label(&self) -> String {
                match self {
                    $(ConfigItem::$variant(item) => item.label()),*
                }
            }

            pub fn external(&self) -> bool {
                match self {
                    $(ConfigItem::$variant(item) => item.external()),*
                }
            }

            pub fn dependencies(&self) -> Vec<Dependency> {
                match self {
                    $(ConfigItem::$variant(item) => item.dependencies()),*
                }
            }

            /// Items of different kinds are never equal.
            pub fn equal(&self, other: &ConfigItem) -> bool {
                match (self, other) {
                    $((ConfigItem::$variant(a), ConfigItem::$variant(b)) => a.equal(b),)*
                    _ => false,
                }
            }
        }

        $(
            impl From<$ty> for ConfigItem {
                fn from(item: $ty) -> Self {
                    ConfigItem::$variant(item)
                }
            }
        )*
    };
}

config_items! {
    PhysIf(PhysIf),
    IfHandle(IfHandle),
    Bond(Bond),
    Bridge(Bridge),
    Veth(Veth),
    DhcpClient(DhcpClient),
    DhcpServer(DhcpServer),
    DnsServer(DnsServer),
    HttpProxy(HttpProxy),
    NetNamespace(NetNamespace),
    IpForwarding(IpForwarding),
    IpRule(IpRule),
    Route(Route),
}

impl ConfigItem {
    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(self.kind(), self.name())
    }
}

/// Outcome of a configurator operation.
///
/// Operations that wait on processes or walk long kernel sequences finish in
/// a spawned task; its handle resolves exactly once.
#[derive(Debug)]
pub enum Completion {
    Done,
    InBackground(JoinHandle<Result<()>>),
}

impl Completion {
    pub fn background<F>(work: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Completion::InBackground(tokio::spawn(work))
    }

    pub async fn wait(self) -> Result<()> {
        match self {
            Completion::Done => Ok(()),
            Completion::InBackground(handle) => handle.await?,
        }
    }
}

/// Create, modify and delete one item type.
pub trait Configurator {
    type Item;

    fn create(&self, item: &Self::Item) -> impl Future<Output = Result<Completion>> + Send;

    fn modify(
        &self,
        old: &Self::Item,
        new: &Self::Item,
    ) -> impl Future<Output = Result<Completion>> + Send;

    fn delete(&self, item: &Self::Item) -> impl Future<Output = Result<Completion>> + Send;

    /// Whether moving from `old` to `new` requires delete + create.
    fn needs_recreate(&self, old: &Self::Item, new: &Self::Item) -> bool;
}

/// Everything configurators share: settings, interface data, namespace access.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub monitor: NetworkMonitor,
    pub netns: NetnsWorker,
}

impl Context {
    /// Resolve a physical interface by its permanent MAC.
    pub async fn phys_if(&self, mac: MacAddr) -> Result<MacIf> {
        self.monitor
            .lookup_by_mac(mac)
            .await
            .and_then(|iface| MacIf::from_attrs(&iface.attrs))
            .ok_or(Error::InterfaceNotFound(mac))
    }
}

/// The configurator of every item type, dispatched by item kind.
pub struct Configurators {
    phys_if: PhysIfConfigurator,
    if_handle: IfHandleConfigurator,
    bond: BondConfigurator,
    bridge: BridgeConfigurator,
    veth: VethConfigurator,
    dhcp_client: DhcpClientConfigurator,
    dhcp_server: DhcpServerConfigurator,
    dns_server: DnsServerConfigurator,
    http_proxy: HttpProxyConfigurator,
    netns: NetNamespaceConfigurator,
    ip_forwarding: IpForwardingConfigurator,
    ip_rule: IpRuleConfigurator,
    route: RouteConfigurator,
}

macro_rules! dispatch {
    ($self:ident, $item:expr, $c:ident, $i:ident => $call:expr) => {
        match $item {
            ConfigItem::PhysIf($i) => { let $c = &$self.phys_if; $call }
            ConfigItem::IfHandle($i) => { let $c = &$self.if_handle; $call }
            ConfigItem::Bond($i) => { let $c = &$self.bond; $call }
            ConfigItem::Bridge($i) => { let $c = &$self.bridge; $call }
            ConfigItem::Veth($i) => { let $c = &$self.veth; $call }
            ConfigItem::DhcpClient($i) => { let $c = &$self.dhcp_client; $call }
            ConfigItem::DhcpServer($i) => { let $c = &$self.dhcp_server; $call }
            ConfigItem::DnsServer($i) => { let $c = &$self.dns_server; $call }
            ConfigItem::HttpProxy($i) => { let $c = &$self.http_proxy; $call }
            ConfigItem::NetNamespace($i) => { let $c = &$self.netns; $call }
            ConfigItem::IpForwarding($i) => { let $c = &$self.ip_forwarding; $call }
            ConfigItem::IpRule($i) => { let $c = &$self.ip_rule; $call }
            ConfigItem::Route($i) => { let $c = &$self.route; $call }
        }
    };
}

macro_rules! dispatch_pair {
    ($self:ident, $old:expr, $new:expr, $c:ident, $a:ident, $b:ident => $call:expr, $mismatch:expr) => {
        match ($old, $new) {
            (ConfigItem::PhysIf($a), ConfigItem::PhysIf($b)) => { let $c = &$self.phys_if; $call }
            (ConfigItem::IfHandle($a), ConfigItem::IfHandle($b)) => { let $c = &$self.if_handle; $call }
            (ConfigItem::Bond($a), ConfigItem::Bond($b)) => { let $c = &$self.bond; $call }
            (ConfigItem::Bridge($a), ConfigItem::Bridge($b)) => { let $c = &$self.bridge; $call }
            (ConfigItem::Veth($a), ConfigItem::Veth($b)) => { let $c = &$self.veth; $call }
            (ConfigItem::DhcpClient($a), ConfigItem::DhcpClient($b)) => { let $c = &$self.dhcp_client; $call }
            (ConfigItem::DhcpServer($a), ConfigItem::DhcpServer($b)) => { let $c = &$self.dhcp_server; $call }
            (ConfigItem::DnsServer($a), ConfigItem::DnsServer($b)) => { let $c = &$self.dns_server; $call }
            (ConfigItem::HttpProxy($a), ConfigItem::HttpProxy($b)) => { let $c = &$self.http_proxy; $call }
            (ConfigItem::NetNamespace($a), ConfigItem::NetNamespace($b)) => { let $c = &$self.netns; $call }
            (ConfigItem::IpForwarding($a), ConfigItem::IpForwarding($b)) => { let $c = &$self.ip_forwarding; $call }
            (ConfigItem::IpRule($a), ConfigItem::IpRule($b)) => { let $c = &$self.ip_rule; $call }
            (ConfigItem::Route($a), ConfigItem::Route($b)) => { let $c = &$self.route; $call }
            _ => $mismatch,
        }
    };
}

impl Configurators {
    pub fn new(ctx: Context) -> Self {
        Self {
            phys_if: PhysIfConfigurator,
            if_handle: IfHandleConfigurator::new(ctx.clone()),
            bond: BondConfigurator::new(ctx.clone()),
            bridge: BridgeConfigurator::new(ctx.clone()),
            veth: VethConfigurator::new(ctx.clone()),
            dhcp_client: DhcpClientConfigurator::new(ctx.clone()),
            dhcp_server: DhcpServerConfigurator::new(ctx.clone()),
            dns_server: DnsServerConfigurator::new(ctx.clone()),
            http_proxy: HttpProxyConfigurator::new(ctx.clone()),
            netns: NetNamespaceConfigurator::new(ctx.clone()),
            ip_forwarding: IpForwardingConfigurator,
            ip_rule: IpRuleConfigurator::new(ctx.clone()),
            route: RouteConfigurator::new(ctx),
        }
    }

    pub async fn create(&self, item: &ConfigItem) -> Result<Completion> {
        debug!(item = %item.item_ref(), "create");
        let result = dispatch!(self, item, c, i => c.create(i).await);
        result.map_err(|e| e.for_item(item.item_ref(), "create"))
    }

    pub async fn modify(&self, old: &ConfigItem, new: &ConfigItem) -> Result<Completion> {
        debug!(item = %new.item_ref(), "modify");
        let result = dispatch_pair!(self, old, new, c, a, b => c.modify(a, b).await,
            Err(Error::ItemTypeMismatch(old.kind().as_str())));
        result.map_err(|e| e.for_item(new.item_ref(), "modify"))
    }

    pub async fn delete(&self, item: &ConfigItem) -> Result<Completion> {
        debug!(item = %item.item_ref(), "delete");
        let result = dispatch!(self, item, c, i => c.delete(i).await);
        result.map_err(|e| e.for_item(item.item_ref(), "delete"))
    }

    /// Items of different kinds can only be replaced.
    pub fn needs_recreate(&self, old: &ConfigItem, new: &ConfigItem) -> bool {
        dispatch_pair!(self, old, new, c, a, b => c.needs_recreate(a, b), true)
    }
}

/// Error wrapper for background completions, so the failing item stays named.
pub(crate) fn in_background<F>(item: ItemRef, op: &'static str, work: F) -> Completion
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    Completion::background(async move { work.await.map_err(|e| e.for_item(item, op)) })
}

/// Context rooted in a scratch directory; needs a tokio runtime.
#[cfg(test)]
pub(crate) fn test_context(root: &std::path::Path) -> Context {
    let mut config = Config::default();
    config.dnsmasq.conf_dir = root.join("etc/dnsmasq");
    config.dnsmasq.run_dir = root.join("run/dnsmasq");
    config.goproxy.conf_dir = root.join("etc/goproxy");
    config.goproxy.run_dir = root.join("run/goproxy");
    config.dhcpcd.run_dir = root.join("run");
    config.netns_run_dir = root.join("netns");
    config.netns_etc_dir = root.join("etc/netns");
    Context {
        netns: NetnsWorker::spawn(config.netns_run_dir.clone()).unwrap(),
        config: Arc::new(config),
        monitor: NetworkMonitor::detached(8, Vec::new()),
    }
}
