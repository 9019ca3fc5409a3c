//! The agent: keeps the accepted network model, derives item graphs from it
//! and publishes them for the reconciler.

pub mod naming;
pub mod state;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::graph::{ConfigGraph, ItemRef};
use crate::ipam::NetworkIndexes;
use crate::model::{MacAddr, NetworkModel, ParsedModel};
use crate::netlink::{Event, NetworkMonitor};
use crate::Result;

pub use state::{HostUplink, StateBuilder};

/// Current and intended state, always published together.
#[derive(Debug, Clone, Default)]
pub struct Graphs {
    pub current: ConfigGraph,
    pub intended: ConfigGraph,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigError {
    pub item_ref: String,
    pub err_msg: String,
}

/// Body of `GET /sdn-status.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SdnStatus {
    #[serde(rename = "mgmtIPAddress")]
    pub mgmt_ip_address: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub config_errors: Vec<ConfigError>,
}

/// Host-side facts a pass depends on.
#[derive(Debug, Clone, Default)]
pub struct HostView {
    pub uplink: Option<HostUplink>,
    pub mgmt_ip: Option<IpAddr>,
    /// Permanent MACs of the physical interfaces present.
    pub present: BTreeSet<MacAddr>,
}

struct AgentState {
    model: NetworkModel,
    parsed: Option<ParsedModel>,
    indexes: NetworkIndexes,
    config_errors: BTreeMap<ItemRef, String>,
    mgmt_ip: Option<IpAddr>,
}

/// Derive both graphs, allocating indexes for new networks into `indexes`.
pub fn plan(
    config: &Config,
    parsed: &ParsedModel,
    indexes: &mut NetworkIndexes,
    view: &HostView,
) -> Result<Graphs> {
    indexes.allocate(parsed.model.networks.iter().map(|n| n.logical_label.as_str()));
    let builder = StateBuilder {
        model: parsed,
        indexes,
        host_port: &config.host_port,
        uplink: view.uplink.as_ref(),
    };
    let intended = builder.intended()?;
    intended.check_dependencies()?;
    let current = builder.current(|mac| view.present.contains(&mac))?;
    Ok(Graphs { current, intended })
}

pub struct Agent {
    config: Arc<Config>,
    monitor: NetworkMonitor,
    state: Mutex<AgentState>,
    graphs: watch::Sender<Graphs>,
}

impl Agent {
    pub fn new(config: Arc<Config>, monitor: NetworkMonitor) -> Self {
        let (graphs, _) = watch::channel(Graphs::default());
        Self {
            config,
            monitor,
            state: Mutex::new(AgentState {
                model: NetworkModel::default(),
                parsed: None,
                indexes: NetworkIndexes::default(),
                config_errors: BTreeMap::new(),
                mgmt_ip: None,
            }),
            graphs,
        }
    }

    /// Receiver of every published pair of graphs.
    pub fn subscribe(&self) -> watch::Receiver<Graphs> {
        self.graphs.subscribe()
    }

    async fn observe(&self) -> HostView {
        let present = self
            .monitor
            .list_interfaces()
            .await
            .iter()
            .filter(|i| i.attrs.is_physical())
            .filter_map(|i| i.attrs.hw_mac())
            .collect();

        let uplink = self
            .monitor
            .lookup_by_mac_prefix(&self.config.host_port.mac_prefix)
            .await
            .into_iter()
            .find_map(|i| i.attrs.hw_mac().map(|mac| (i, mac)));
        let Some((host, host_mac)) = uplink else {
            debug!("no uplink towards the host");
            return HostView {
                present,
                ..Default::default()
            };
        };
        let mgmt_ip = host.addrs.iter().map(|a| a.addr()).find(IpAddr::is_ipv4);
        let gateway = match self.monitor.default_gateway().await {
            Ok(Some((gw, ifindex))) if ifindex == host.attrs.ifindex => Some(gw),
            Ok(_) => None,
            Err(e) => {
                warn!("failed to read the default gateway: {e}");
                None
            }
        };
        HostView {
            uplink: Some(HostUplink {
                mac: host_mac,
                gateway,
            }),
            mgmt_ip,
            present,
        }
    }

    /// Validate and apply a new model. On error the previous model stays.
    pub async fn apply_model(&self, model: NetworkModel) -> Result<()> {
        let parsed = ParsedModel::parse(model.clone()).inspect_err(|e| {
            warn!("rejected network model: {e}");
        })?;
        let view = self.observe().await;
        let mut state = self.state.lock().await;
        let mut indexes = state.indexes.clone();
        let graphs = plan(&self.config, &parsed, &mut indexes, &view).inspect_err(|e| {
            warn!("rejected network model: {e}");
        })?;

        state
            .config_errors
            .retain(|item, _| graphs.intended.get(item).is_some());
        state.model = model;
        state.parsed = Some(parsed);
        state.indexes = indexes;
        state.mgmt_ip = view.mgmt_ip;
        info!(
            intended = graphs.intended.len(),
            current = graphs.current.len(),
            "network model applied"
        );
        self.graphs.send_replace(graphs);
        Ok(())
    }

    /// Rebuild the graphs of the accepted model against fresh host state.
    pub async fn refresh(&self) -> Result<()> {
        let view = self.observe().await;
        let mut state = self.state.lock().await;
        state.mgmt_ip = view.mgmt_ip;
        let Some(parsed) = state.parsed.clone() else {
            return Ok(());
        };
        let mut indexes = state.indexes.clone();
        let graphs = plan(&self.config, &parsed, &mut indexes, &view)?;
        state.indexes = indexes;
        let changed = {
            let published = self.graphs.borrow();
            published.current != graphs.current || published.intended != graphs.intended
        };
        if changed {
            debug!("host state changed, republishing graphs");
            self.graphs.send_replace(graphs);
        }
        Ok(())
    }

    /// React to interface changes until the monitor goes away.
    pub async fn watch_interfaces(self: Arc<Self>) {
        let mut events = self.monitor.watch_events("agent").await;
        while let Some(event) = events.recv().await {
            if let Event::NetIfChange { attrs, .. } = &event
                && !attrs.is_physical()
            {
                continue;
            }
            if let Err(e) = self.refresh().await {
                error!("failed to refresh state: {e}");
            }
        }
        warn!("interface event stream closed");
    }

    pub async fn model(&self) -> NetworkModel {
        self.state.lock().await.model.clone()
    }

    /// Intended graph in DOT.
    pub fn intended_dot(&self) -> String {
        self.graphs.borrow().intended.to_dot()
    }

    /// Remember the outcome of an operation on `item`.
    pub async fn record_result(&self, item: ItemRef, result: &Result<()>) {
        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                state.config_errors.remove(&item);
            }
            Err(e) => {
                error!(%item, "configuration failed: {e}");
                state.config_errors.insert(item, e.to_string());
            }
        }
    }

    pub async fn status(&self) -> SdnStatus {
        let state = self.state.lock().await;
        SdnStatus {
            mgmt_ip_address: state.mgmt_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            config_errors: state
                .config_errors
                .iter()
                .map(|(item, msg)| ConfigError {
                    item_ref: item.to_string(),
                    err_msg: msg.clone(),
                })
                .collect(),
        }
    }
}
