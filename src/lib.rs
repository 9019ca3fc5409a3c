pub mod agent;
pub mod config;
pub mod configitems;
pub mod graph;
pub mod http;
pub mod ipam;
pub mod maclookup;
pub mod model;
pub mod netlink;
pub mod process;

use std::time::Duration;

use crate::graph::ItemRef;
use crate::model::MacAddr;
use crate::model::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Netlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system call failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid network model: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to get physical interface with MAC {0}")]
    InterfaceNotFound(MacAddr),

    #[error("interface {name} not found in namespace {netns}")]
    LinkNotFound { name: String, netns: String },

    #[error("command `{command}` failed: {output}")]
    Command { command: String, output: String },

    #[error("{what} did not complete within {timeout:?}")]
    Timeout { what: String, timeout: Duration },

    #[error("process {0}")]
    Process(String),

    #[error("network namespace {netns}: {reason}")]
    Namespace { netns: String, reason: String },

    #[error("IP allocation failed: {0}")]
    Ipam(String),

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("{0} is external and cannot be changed by the agent")]
    ExternalItem(ItemRef),

    #[error("operation does not match item type {0}")]
    ItemTypeMismatch(&'static str),

    #[error("unresolved dependencies: {}", .0.join("; "))]
    Dependencies(Vec<String>),

    #[error("{op} {item}: {source}")]
    Item {
        item: ItemRef,
        op: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach the item reference and the failed operation.
    pub fn for_item(self, item: ItemRef, op: &'static str) -> Self {
        Error::Item {
            item,
            op,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
