use super::{Completion, Configurator, Item, ItemKind};
use crate::model::MacAddr;
use crate::{Error, Result};

/// A physical NIC, identified by its permanent MAC. Observed, never created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysIf {
    pub mac: MacAddr,
    pub logical_label: String,
}

impl Item for PhysIf {
    const KIND: ItemKind = ItemKind::PhysIf;

    fn name(&self) -> String {
        self.mac.to_string()
    }

    fn label(&self) -> String {
        self.logical_label.clone()
    }

    fn external(&self) -> bool {
        true
    }

    fn equal(&self, other: &Self) -> bool {
        self.logical_label == other.logical_label
    }
}

pub struct PhysIfConfigurator;

impl PhysIfConfigurator {
    fn refuse(item: &PhysIf) -> Result<Completion> {
        Err(Error::ExternalItem(crate::graph::ItemRef::new(
            ItemKind::PhysIf,
            item.name(),
        )))
    }
}

impl Configurator for PhysIfConfigurator {
    type Item = PhysIf;

    async fn create(&self, item: &PhysIf) -> Result<Completion> {
        Self::refuse(item)
    }

    async fn modify(&self, _old: &PhysIf, new: &PhysIf) -> Result<Completion> {
        Self::refuse(new)
    }

    async fn delete(&self, item: &PhysIf) -> Result<Completion> {
        Self::refuse(item)
    }

    fn needs_recreate(&self, _old: &PhysIf, _new: &PhysIf) -> bool {
        false
    }
}
