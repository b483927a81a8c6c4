//! Metric descriptors and their dense value columns.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// How the published value of a metric is derived from raw samples.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MetricKind {
    /// Published as sampled.
    Raw,
    /// `now - prev`; absent on the first cycle.
    Delta,
    /// `(now - prev) / (now_ts - prev_ts)`, per second.
    Rate,
    /// `(now_num - prev_num) / (now_den - prev_den) * 100` against a base metric.
    Percent,
    /// `(now_sum - prev_sum) / (now_count - prev_count)` against a base metric.
    Average,
    /// One histogram bucket, treated as an independent delta.
    HistogramBucket,
}

impl MetricKind {
    /// Kinds that need the previous snapshot to publish a value.
    pub fn is_derived(self) -> bool {
        !matches!(self, Self::Raw)
    }

    /// Kinds that require a base metric reference.
    pub fn needs_base(self) -> bool {
        matches!(self, Self::Percent | Self::Average)
    }
}

/// One column of a matrix: descriptor plus its dense value vector.
///
/// The raw vector holds what the collector sampled this cycle; the cooked
/// vector holds what [`super::Matrix::publish_prepare`] derived for export.
/// Both use a parallel present-bit vector instead of sentinel floats.
#[derive(Debug, Clone)]
pub struct Metric {
    name: String,
    display: Option<String>,
    kind: MetricKind,
    base: Option<String>,
    bucket: Option<String>,
    exportable: bool,
    pub(crate) values: Vec<f64>,
    pub(crate) present: Vec<bool>,
    pub(crate) cooked: Vec<f64>,
    pub(crate) cooked_present: Vec<bool>,
}

impl Metric {
    pub(crate) fn new(name: impl Into<String>, kind: MetricKind, slots: usize) -> Self {
        Self {
            name: name.into(),
            display: None,
            kind,
            base: None,
            bucket: None,
            exportable: true,
            values: vec![0.0; slots],
            present: vec![false; slots],
            cooked: vec![0.0; slots],
            cooked_present: vec![false; slots],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Name used on the wire; falls back to the metric name.
    pub fn export_name(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.name)
    }

    pub fn set_display(&mut self, display: impl Into<String>) {
        self.display = Some(display.into());
    }

    /// Base metric reference for percent/average derivation.
    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    pub fn set_base(&mut self, base: impl Into<String>) {
        self.base = Some(base.into());
    }

    /// Histogram dimension, rendered as a `bucket` label on export.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn set_bucket(&mut self, bucket: impl Into<String>) {
        self.bucket = Some(bucket.into());
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    /// Copy the descriptor with an empty value store of `slots` cells.
    pub(crate) fn clone_schema(&self, slots: usize) -> Self {
        let mut m = Self::new(self.name.clone(), self.kind, slots);
        m.display = self.display.clone();
        m.base = self.base.clone();
        m.bucket = self.bucket.clone();
        m.exportable = self.exportable;
        m
    }

    // Dense store maintenance, driven by the owning matrix.

    pub(crate) fn grow(&mut self, slots: usize) {
        self.values.resize(slots, 0.0);
        self.present.resize(slots, false);
        self.cooked.resize(slots, 0.0);
        self.cooked_present.resize(slots, false);
    }

    pub(crate) fn clear_slot(&mut self, slot: usize) {
        self.present[slot] = false;
        self.cooked_present[slot] = false;
    }

    pub(crate) fn set(&mut self, slot: usize, value: f64) {
        self.values[slot] = value;
        self.present[slot] = true;
    }

    pub(crate) fn get(&self, slot: usize) -> Option<f64> {
        self.present[slot].then(|| self.values[slot])
    }

    pub(crate) fn get_cooked(&self, slot: usize) -> Option<f64> {
        self.cooked_present[slot].then(|| self.cooked[slot])
    }

    /// Value an exporter should publish for this cell, if any.
    ///
    /// Raw metrics publish the sampled value; derived metrics publish the
    /// cooked value computed by the last `publish_prepare`.
    pub(crate) fn export_value(&self, slot: usize) -> Option<f64> {
        if self.kind.is_derived() {
            self.get_cooked(slot)
        } else {
            self.get(slot)
        }
    }
}
