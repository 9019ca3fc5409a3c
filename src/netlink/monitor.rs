//! Cached view of the interfaces in the agent's namespace.
//!
//! Readers get snapshots out of a cache guarded by one mutex. A stale cache
//! is resynced from a full netlink dump before it is read. The background
//! watcher listens on the link and address multicast groups, marks the cache
//! stale and fans every change out to subscribers without ever blocking on a
//! slow one.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::AsyncSocket;
use rtnetlink::constants::{RTMGRP_IPV4_IFADDR, RTMGRP_IPV6_IFADDR, RTMGRP_LINK};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{NetIf, NetIfAttrs, addr_from_msg, attrs_from_link_msg, queries};
use crate::Result;
use crate::ipam::IpNet;
use crate::maclookup;
use crate::model::MacAddr;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    NetIfChange {
        attrs: NetIfAttrs,
        added: bool,
        deleted: bool,
    },
    AddrChange {
        ifindex: u32,
        addr: IpNet,
        deleted: bool,
    },
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Cache {
    stale: bool,
    ifaces: BTreeMap<u32, NetIf>,
    /// Last published link attributes per ifindex.
    last_change: HashMap<u32, NetIfAttrs>,
    subscribers: Vec<Subscriber>,
}

impl Cache {
    fn new() -> Self {
        Self {
            stale: true,
            ..Default::default()
        }
    }

    /// Record a link update; `None` when it repeats the last published one.
    fn link_update(&mut self, attrs: NetIfAttrs, deleted: bool) -> Option<Event> {
        let ifindex = attrs.ifindex;
        if deleted {
            self.last_change.remove(&ifindex);
            self.stale = true;
            return Some(Event::NetIfChange {
                attrs,
                added: false,
                deleted: true,
            });
        }
        if self.last_change.get(&ifindex) == Some(&attrs) {
            return None;
        }
        let added =
            !self.ifaces.contains_key(&ifindex) && !self.last_change.contains_key(&ifindex);
        self.last_change.insert(ifindex, attrs.clone());
        self.stale = true;
        Some(Event::NetIfChange {
            attrs,
            added,
            deleted: false,
        })
    }

    /// Best-effort fan-out; closed subscribers are dropped.
    fn publish(&mut self, event: &Event) {
        self.subscribers
            .retain(|sub| match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %sub.name, "subscriber buffer full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = %sub.name, "subscriber gone");
                    false
                }
            });
    }

    fn replace(&mut self, ifaces: BTreeMap<u32, NetIf>) {
        for iface in ifaces.values() {
            self.last_change
                .entry(iface.attrs.ifindex)
                .or_insert_with(|| iface.attrs.clone());
        }
        self.ifaces = ifaces;
        self.stale = false;
    }
}

struct Inner {
    /// `None` for a detached monitor that only serves what it was given.
    handle: Option<rtnetlink::Handle>,
    cache: Mutex<Cache>,
    buffer: usize,
}

/// Shared handle to the interface cache; cheap to clone.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
}

impl NetworkMonitor {
    /// Open a netlink connection for queries; the watcher starts with [`Self::start`].
    pub fn new(buffer: usize) -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);
        Ok(Self {
            inner: Arc::new(Inner {
                handle: Some(handle),
                cache: Mutex::new(Cache::new()),
                buffer: buffer.max(1),
            }),
        })
    }

    /// Monitor over a fixed set of interfaces, without a netlink connection.
    #[cfg(test)]
    pub(crate) fn detached(buffer: usize, ifaces: impl IntoIterator<Item = NetIf>) -> Self {
        let mut cache = Cache::new();
        cache.replace(
            ifaces
                .into_iter()
                .map(|iface| (iface.attrs.ifindex, iface))
                .collect(),
        );
        Self {
            inner: Arc::new(Inner {
                handle: None,
                cache: Mutex::new(cache),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Spawn the watcher; it resubscribes forever when its stream ends.
    pub fn start(&self) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                match monitor.watch().await {
                    Ok(()) => warn!("netlink subscription closed, resubscribing"),
                    Err(e) => warn!("netlink subscription failed: {e}"),
                }
                monitor.inner.cache.lock().await.stale = true;
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        })
    }

    async fn watch(&self) -> Result<()> {
        let (mut conn, _handle, mut messages) = rtnetlink::new_connection()?;

        let mgroup_flags = RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR;
        let addr = netlink_sys::SocketAddr::new(0, mgroup_flags);
        conn.socket_mut().socket_mut().bind(&addr)?;

        tokio::spawn(conn);
        debug!("netlink watcher started, groups mask: 0x{:x}", mgroup_flags);

        while let Some((msg, _)) = messages.next().await {
            if let NetlinkPayload::InnerMessage(inner) = msg.payload {
                self.handle_message(inner).await;
            }
        }
        Ok(())
    }

    async fn handle_message(&self, msg: RouteNetlinkMessage) {
        match &msg {
            RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::DelLink(link) => {
                let deleted = matches!(msg, RouteNetlinkMessage::DelLink(_));
                let Some(attrs) = attrs_from_link_msg(link) else {
                    return;
                };
                let mut cache = self.inner.cache.lock().await;
                if let Some(event) = cache.link_update(attrs, deleted) {
                    if let Event::NetIfChange { attrs, added, deleted } = &event {
                        info!(ifindex = attrs.ifindex, iface = %attrs.name, added, deleted, "link changed");
                    }
                    cache.publish(&event);
                }
            }
            RouteNetlinkMessage::NewAddress(addr) | RouteNetlinkMessage::DelAddress(addr) => {
                let deleted = matches!(msg, RouteNetlinkMessage::DelAddress(_));
                let Some((ifindex, net)) = addr_from_msg(addr) else {
                    return;
                };
                let mut cache = self.inner.cache.lock().await;
                cache.stale = true;
                self.resync(&mut cache).await;
                debug!(ifindex, addr = %net, deleted, "address changed");
                cache.publish(&Event::AddrChange {
                    ifindex,
                    addr: net,
                    deleted,
                });
            }
            _ => {}
        }
    }

    /// Reload the cache if stale; on failure the previous content stays.
    async fn resync(&self, cache: &mut Cache) {
        if !cache.stale {
            return;
        }
        let Some(handle) = &self.inner.handle else {
            return;
        };
        match queries::dump_interfaces(handle).await {
            Ok(ifaces) => cache.replace(ifaces),
            Err(e) => warn!("failed to resync interface cache: {e}"),
        }
    }

    async fn with_cache<T>(&self, f: impl FnOnce(&BTreeMap<u32, NetIf>) -> T) -> T {
        let mut cache = self.inner.cache.lock().await;
        self.resync(&mut cache).await;
        f(&cache.ifaces)
    }

    pub async fn list_interfaces(&self) -> Vec<NetIf> {
        self.with_cache(|ifaces| ifaces.values().cloned().collect())
            .await
    }

    pub async fn lookup_by_index(&self, ifindex: u32) -> Option<NetIf> {
        self.with_cache(|ifaces| ifaces.get(&ifindex).cloned()).await
    }

    pub async fn lookup_by_name(&self, name: &str) -> Option<NetIf> {
        self.with_cache(|ifaces| ifaces.values().find(|i| i.attrs.name == name).cloned())
            .await
    }

    /// Interface with the given hardware MAC; see [`maclookup::by_mac`].
    pub async fn lookup_by_mac(&self, mac: MacAddr) -> Option<NetIf> {
        self.with_cache(|ifaces| maclookup::by_mac(ifaces.values(), mac).cloned())
            .await
    }

    /// Physical interfaces whose hardware MAC starts with `prefix`.
    pub async fn lookup_by_mac_prefix(&self, prefix: &[u8]) -> Vec<NetIf> {
        self.with_cache(|ifaces| {
            maclookup::by_mac_prefix(ifaces.values(), prefix)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn default_gateway(&self) -> Result<Option<(IpAddr, u32)>> {
        match &self.inner.handle {
            Some(handle) => queries::default_gateway_v4(handle).await,
            None => Ok(None),
        }
    }

    /// Register a subscriber; dropping the receiver unsubscribes.
    pub async fn watch_events(&self, name: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.inner.cache.lock().await.subscribers.push(Subscriber {
            name: name.to_string(),
            tx,
        });
        debug!(subscriber = %name, "registered event subscriber");
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::KIND_DEVICE;

    fn attrs(ifindex: u32, name: &str, kind: &str, mac: &str) -> NetIfAttrs {
        NetIfAttrs {
            ifindex,
            name: name.into(),
            kind: kind.into(),
            mac: Some(mac.parse().unwrap()),
            perm_mac: None,
            mtu: 1500,
            admin_up: true,
            lower_up: true,
            enslaved: false,
            master_index: None,
        }
    }

    #[test]
    fn repeated_link_update_is_suppressed() {
        let mut cache = Cache::new();
        let a = attrs(2, "eth0", KIND_DEVICE, "02:00:00:00:00:01");
        assert!(matches!(
            cache.link_update(a.clone(), false),
            Some(Event::NetIfChange { added: true, .. })
        ));
        cache.stale = false;
        assert_eq!(cache.link_update(a.clone(), false), None);
        assert!(!cache.stale);

        let mut down = a.clone();
        down.admin_up = false;
        assert!(matches!(
            cache.link_update(down, false),
            Some(Event::NetIfChange { added: false, deleted: false, .. })
        ));
        assert!(cache.stale);
    }

    #[test]
    fn deleted_link_forgets_last_change() {
        let mut cache = Cache::new();
        let a = attrs(2, "eth0", KIND_DEVICE, "02:00:00:00:00:01");
        cache.link_update(a.clone(), false);
        assert!(matches!(
            cache.link_update(a.clone(), true),
            Some(Event::NetIfChange { deleted: true, .. })
        ));
        assert!(matches!(
            cache.link_update(a, false),
            Some(Event::NetIfChange { added: true, .. })
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_events() {
        let mut cache = Cache::new();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        cache.subscribers.push(Subscriber {
            name: "slow".into(),
            tx: slow_tx,
        });
        cache.subscribers.push(Subscriber {
            name: "fast".into(),
            tx: fast_tx,
        });

        for i in 0..3 {
            cache.publish(&Event::AddrChange {
                ifindex: i,
                addr: "10.0.0.1/24".parse().unwrap(),
                deleted: false,
            });
        }

        assert_eq!(cache.subscribers.len(), 2);
        assert!(matches!(slow_rx.recv().await, Some(Event::AddrChange { ifindex: 0, .. })));
        assert!(slow_rx.try_recv().is_err());
        for i in 0..3 {
            assert!(matches!(fast_rx.recv().await, Some(Event::AddrChange { ifindex, .. }) if ifindex == i));
        }
    }

    #[test]
    fn closed_subscriber_is_removed() {
        let mut cache = Cache::new();
        let (tx, rx) = mpsc::channel(1);
        cache.subscribers.push(Subscriber {
            name: "gone".into(),
            tx,
        });
        drop(rx);
        cache.publish(&Event::AddrChange {
            ifindex: 1,
            addr: "10.0.0.1/24".parse().unwrap(),
            deleted: true,
        });
        assert!(cache.subscribers.is_empty());
    }

    #[tokio::test]
    async fn detached_monitor_lookups() {
        let mut eth = attrs(3, "eth1", KIND_DEVICE, "02:fe:00:00:00:09");
        eth.perm_mac = Some("02:fe:00:00:00:01".parse().unwrap());
        let monitor = NetworkMonitor::detached(
            4,
            [
                attrs(2, "eth0", KIND_DEVICE, "08:33:33:00:00:01"),
                eth,
                attrs(4, "bond-lan", "bond", "02:fe:00:00:00:09"),
            ]
            .into_iter()
            .map(|attrs| NetIf {
                attrs,
                addrs: Vec::new(),
            }),
        );

        assert_eq!(monitor.list_interfaces().await.len(), 3);
        assert_eq!(
            monitor.lookup_by_index(4).await.map(|i| i.attrs.name),
            Some("bond-lan".to_string())
        );
        assert_eq!(
            monitor.lookup_by_name("eth0").await.map(|i| i.attrs.ifindex),
            Some(2)
        );
        assert_eq!(
            monitor
                .lookup_by_mac("02:fe:00:00:00:01".parse().unwrap())
                .await
                .map(|i| i.attrs.name),
            Some("eth1".to_string())
        );
        let uplinks = monitor.lookup_by_mac_prefix(&MacAddr::HOST_PORT_PREFIX).await;
        assert_eq!(uplinks.len(), 1);
        assert_eq!(uplinks[0].attrs.ifindex, 2);
        assert!(monitor.lookup_by_name("eth9").await.is_none());
        assert_eq!(monitor.default_gateway().await.unwrap(), None);
    }

    #[test]
    fn resync_keeps_published_state() {
        let mut cache = Cache::new();
        let a = attrs(2, "eth0", KIND_DEVICE, "02:00:00:00:00:01");
        let mut dump = BTreeMap::new();
        dump.insert(2, NetIf { attrs: a.clone(), addrs: Vec::new() });
        cache.replace(dump);
        assert!(!cache.stale);
        assert_eq!(cache.link_update(a, false), None);
    }
}
