//! Item graphs handed to the reconciler: items keyed by reference, edges
//! given by each item's dependencies.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};

use crate::configitems::{ConfigItem, Dependency, ItemKind};
use crate::{Error, Result};

/// Type plus name: the identity of an item within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemRef {
    pub kind: ItemKind,
    pub name: String,
}

impl ItemRef {
    pub fn new(kind: ItemKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigGraph {
    name: String,
    items: BTreeMap<ItemRef, ConfigItem>,
}

impl ConfigGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace; returns the replaced item.
    pub fn put(&mut self, item: impl Into<ConfigItem>) -> Option<ConfigItem> {
        let item = item.into();
        self.items.insert(item.item_ref(), item)
    }

    pub fn get(&self, item: &ItemRef) -> Option<&ConfigItem> {
        self.items.get(item)
    }

    pub fn items(&self) -> impl Iterator<Item = &ConfigItem> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn resolves(&self, dep: &Dependency) -> bool {
        match (self.items.get(&dep.required), &dep.must_satisfy) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(item), Some(cond)) => cond.satisfied_by(item),
        }
    }

    /// One message per dependency that is missing or fails its predicate.
    pub fn unresolved(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (item_ref, item) in &self.items {
            for dep in item.dependencies() {
                if self.resolves(&dep) {
                    continue;
                }
                let state = if self.items.contains_key(&dep.required) {
                    "does not satisfy the requirement"
                } else {
                    "is missing"
                };
                problems.push(format!(
                    "{item_ref} requires {} which {state} ({})",
                    dep.required, dep.description
                ));
            }
        }
        problems
    }

    pub fn check_dependencies(&self) -> Result<()> {
        let problems = self.unresolved();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Dependencies(problems))
        }
    }

    /// Graphviz rendering.
    pub fn to_dot(&self) -> String {
        let mut dot = String::new();
        let _ = writeln!(dot, "digraph \"{}\" {{", escape(&self.name));
        dot.push_str("  rankdir=LR;\n  node [shape=box];\n");
        let mut missing = BTreeSet::new();
        for (item_ref, item) in &self.items {
            let style = if item.external() { ", style=dashed" } else { "" };
            let _ = writeln!(
                dot,
                "  \"{}\" [label=\"{}\"{style}];",
                escape(&item_ref.to_string()),
                escape(&item.label())
            );
        }
        for (item_ref, item) in &self.items {
            for dep in item.dependencies() {
                let color = if self.resolves(&dep) {
                    ""
                } else {
                    if !self.items.contains_key(&dep.required) {
                        missing.insert(dep.required.clone());
                    }
                    ", color=red"
                };
                let _ = writeln!(
                    dot,
                    "  \"{}\" -> \"{}\" [tooltip=\"{}\"{color}];",
                    escape(&item_ref.to_string()),
                    escape(&dep.required.to_string()),
                    escape(dep.description)
                );
            }
        }
        for item_ref in missing {
            let _ = writeln!(
                dot,
                "  \"{}\" [label=\"{} (missing)\", color=red, fontcolor=red];",
                escape(&item_ref.to_string()),
                escape(&item_ref.to_string())
            );
        }
        dot.push_str("}\n");
        dot
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configitems::{DhcpClient, IfHandle, IfUsage, NetNamespace, PhysIf};

    fn phys() -> PhysIf {
        PhysIf {
            mac: "02:fe:00:00:00:01".parse().unwrap(),
            logical_label: "host-port".into(),
        }
    }

    fn handle(usage: IfUsage) -> IfHandle {
        IfHandle {
            phys_if: phys(),
            usage,
            parent_ll: String::new(),
            admin_up: true,
            mtu: 9000,
        }
    }

    fn dhcp_client() -> DhcpClient {
        DhcpClient {
            phys_if: phys(),
            log_file: "/run/dhcpcd.log".into(),
        }
    }

    #[test]
    fn put_replaces_by_reference() {
        let mut g = ConfigGraph::new("intended");
        assert!(g.put(handle(IfUsage::L3)).is_none());
        let replaced = g.put(handle(IfUsage::Bridged));
        assert!(matches!(replaced, Some(ConfigItem::IfHandle(h)) if h.usage == IfUsage::L3));
        assert_eq!(g.len(), 1);
        let r = ItemRef::new(ItemKind::IfHandle, "02:fe:00:00:00:01");
        assert_eq!(r.to_string(), "Interface-Handle/02:fe:00:00:00:01");
        assert!(g.get(&r).is_some());
    }

    #[test]
    fn dhcp_client_needs_l3_handle() {
        let mut g = ConfigGraph::new("intended");
        g.put(phys());
        g.put(dhcp_client());
        let err = g.check_dependencies().unwrap_err();
        assert!(err.to_string().contains("is missing"), "{err}");

        g.put(handle(IfUsage::Bridged));
        let problems = g.unresolved();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("does not satisfy"), "{}", problems[0]);

        g.put(handle(IfUsage::L3));
        g.check_dependencies().unwrap();
    }

    #[test]
    fn dot_marks_external_and_missing() {
        let mut g = ConfigGraph::new("intended");
        g.put(phys());
        g.put(NetNamespace::new("main"));
        g.put(dhcp_client());
        let dot = g.to_dot();
        assert!(dot.starts_with("digraph \"intended\" {"));
        assert!(dot.contains(
            "\"Physical-Interface/02:fe:00:00:00:01\" [label=\"host-port\", style=dashed];"
        ));
        assert!(dot.contains("\"DHCP-Client/02:fe:00:00:00:01\" -> \"Interface-Handle/02:fe:00:00:00:01\""));
        assert!(dot.contains("(missing)\", color=red"));
        assert!(dot.ends_with("}\n"));
    }

    #[test]
    fn labels_are_escaped() {
        assert_eq!(escape(r#"a "b" \c"#), r#"a \"b\" \\c"#);
    }
}
