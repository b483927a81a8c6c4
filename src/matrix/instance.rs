//! A single row of a matrix.

use std::collections::BTreeMap;

use serde::Serialize;

/// One row of a [`super::Matrix`], uniquely keyed within it.
///
/// An instance carries string labels and an `exportable` flag. Plugins may
/// clear the flag to suppress the row from every exporter for the rest of
/// the cycle. The slot index into the dense value store is managed by the
/// owning matrix and stays stable for the lifetime of the instance.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    #[serde(skip)]
    pub(crate) slot: usize,
    labels: BTreeMap<String, String>,
    exportable: bool,
}

impl Instance {
    pub(crate) fn new(slot: usize) -> Self {
        Self {
            slot,
            labels: BTreeMap::new(),
            exportable: true,
        }
    }

    /// Slot index into the dense value store.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Label value, or `""` when the label is not set.
    pub fn label(&self, name: &str) -> &str {
        self.labels.get(name).map_or("", String::as_str)
    }

    /// Whether the label is set at all (distinct from an empty value).
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.contains_key(name)
    }

    pub fn set_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(name.into(), value.into());
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Replace all labels at once; used by aggregation plugins.
    pub fn set_labels(&mut self, labels: BTreeMap<String, String>) {
        self.labels = labels;
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    /// Copy labels and exportable flag into a fresh instance at `slot`.
    pub(crate) fn clone_for(&self, slot: usize) -> Self {
        Self {
            slot,
            labels: self.labels.clone(),
            exportable: self.exportable,
        }
    }
}
