//! The Matrix table and its derived-counter machinery.

use std::collections::{BTreeMap, HashMap};

use crate::errors::PollerError;

use super::instance::Instance;
use super::metric::{Metric, MetricKind};

/// Previous raw snapshot used to cook delta/rate/percent/average values.
///
/// Kept alongside the matrix rather than per cell, so committing it is a
/// bulk copy of the raw vectors.
#[derive(Debug, Clone)]
struct Snapshot {
    ts: f64,
    values: BTreeMap<String, (Vec<f64>, Vec<bool>)>,
}

/// Columnar table keyed by (metric, instance).
///
/// Owned exclusively by one collector while being mutated; handed read-only
/// to the plugin chain outputs' consumers and to exporters for the rest of
/// the cycle.
#[derive(Debug, Clone)]
pub struct Matrix {
    object: String,
    identifier: String,
    global_labels: BTreeMap<String, String>,
    instances: HashMap<String, Instance>,
    // Insertion order of live instance keys; gives exporters a stable row order.
    key_order: Vec<String>,
    metrics: BTreeMap<String, Metric>,
    // Dense store capacity; freed slots are reused before growing.
    slots: usize,
    free: Vec<usize>,
    exportable: bool,
    // Derived matrices built by plugins hold already-published values;
    // for them export_value reads the raw store regardless of metric kind.
    publish_raw: bool,
    prepared: bool,
    snapshot: Option<Snapshot>,
}

impl Matrix {
    /// Create an empty matrix for one object type.
    ///
    /// `identifier` names the producing collector (e.g. `Rest:volume`) and
    /// ends up as a telemetry tag, not on exported samples.
    pub fn new(object: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            identifier: identifier.into(),
            global_labels: BTreeMap::new(),
            instances: HashMap::new(),
            key_order: Vec::new(),
            metrics: BTreeMap::new(),
            slots: 0,
            free: Vec::new(),
            exportable: true,
            publish_raw: false,
            prepared: false,
            snapshot: None,
        }
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn set_object(&mut self, object: impl Into<String>) {
        self.object = object.into();
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Retag a derived matrix so it is tracked separately from its source.
    pub fn set_identifier(&mut self, identifier: impl Into<String>) {
        self.identifier = identifier.into();
    }

    /// Whether exporters should publish this matrix at all. Some data is
    /// collected only to be aggregated by plugins.
    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    // --- Global labels ---

    pub fn set_global_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.global_labels.insert(name.into(), value.into());
    }

    pub fn global_labels(&self) -> &BTreeMap<String, String> {
        &self.global_labels
    }

    // --- Instances ---

    /// Add an instance under `key`, reusing a freed slot when available.
    ///
    /// Fails when the key is already present.
    pub fn add_instance(&mut self, key: &str) -> Result<&mut Instance, PollerError> {
        if self.instances.contains_key(key) {
            return Err(PollerError::InvalidParam(format!(
                "duplicate instance key: {key}"
            )));
        }
        let slot = match self.free.pop() {
            Some(slot) => {
                for metric in self.metrics.values_mut() {
                    metric.clear_slot(slot);
                }
                slot
            }
            None => {
                self.slots += 1;
                for metric in self.metrics.values_mut() {
                    metric.grow(self.slots);
                }
                self.slots - 1
            }
        };
        self.key_order.push(key.to_string());
        Ok(self
            .instances
            .entry(key.to_string())
            .or_insert(Instance::new(slot)))
    }

    /// Remove an instance and reclaim its slot for later reuse.
    pub fn remove_instance(&mut self, key: &str) -> bool {
        match self.instances.remove(key) {
            Some(instance) => {
                for metric in self.metrics.values_mut() {
                    metric.clear_slot(instance.slot);
                }
                // Invalidate the snapshot cells too, so an instance that
                // later reuses this slot never derives against the dead
                // instance's previous values.
                if let Some(snapshot) = &mut self.snapshot {
                    for (_, present) in snapshot.values.values_mut() {
                        if let Some(bit) = present.get_mut(instance.slot) {
                            *bit = false;
                        }
                    }
                }
                self.free.push(instance.slot);
                self.key_order.retain(|k| k != key);
                true
            }
            None => false,
        }
    }

    pub fn instance(&self, key: &str) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn instance_mut(&mut self, key: &str) -> Option<&mut Instance> {
        self.instances.get_mut(key)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Live instance keys in insertion order.
    pub fn instance_keys(&self) -> impl Iterator<Item = &str> {
        self.key_order.iter().map(String::as_str)
    }

    /// (key, instance) pairs in insertion order.
    pub fn instances(&self) -> impl Iterator<Item = (&str, &Instance)> {
        self.key_order.iter().filter_map(|k| {
            self.instances
                .get(k)
                .map(|instance| (k.as_str(), instance))
        })
    }

    /// Mutable access to every instance; iteration order is unspecified.
    pub fn instances_mut(&mut self) -> impl Iterator<Item = (&str, &mut Instance)> {
        self.instances
            .iter_mut()
            .map(|(k, instance)| (k.as_str(), instance))
    }

    /// Mark every raw cell absent, keeping instances and descriptors.
    pub fn reset_data(&mut self) {
        for metric in self.metrics.values_mut() {
            for bit in &mut metric.present {
                *bit = false;
            }
        }
    }

    // --- Labels (convenience over instance lookup) ---

    pub fn set_label(
        &mut self,
        key: &str,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), PollerError> {
        self.instances
            .get_mut(key)
            .map(|instance| instance.set_label(name, value))
            .ok_or_else(|| PollerError::InvalidParam(format!("unknown instance: {key}")))
    }

    pub fn get_label<'a>(&'a self, key: &str, name: &str) -> Option<&'a str> {
        self.instances.get(key).map(|instance| instance.label(name))
    }

    // --- Metrics ---

    /// Add a metric descriptor; idempotent on an identical (name, kind).
    ///
    /// A name that already exists with a different kind is a schema
    /// conflict.
    pub fn add_metric(&mut self, name: &str, kind: MetricKind) -> Result<&mut Metric, PollerError> {
        if let Some(existing) = self.metrics.get(name) {
            if existing.kind() != kind {
                return Err(PollerError::SchemaConflict(format!(
                    "metric {name} exists as {} but requested as {kind}",
                    existing.kind()
                )));
            }
        } else {
            self.metrics
                .insert(name.to_string(), Metric::new(name, kind, self.slots));
        }
        Ok(self
            .metrics
            .get_mut(name)
            .ok_or_else(|| PollerError::InvalidParam(format!("metric {name} vanished")))?)
    }

    pub fn remove_metric(&mut self, name: &str) -> bool {
        self.metrics.remove(name).is_some()
    }

    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(name)
    }

    pub fn metric_mut(&mut self, name: &str) -> Option<&mut Metric> {
        self.metrics.get_mut(name)
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    /// Metric descriptors in name order.
    pub fn metrics(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.values()
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    // --- Cell access ---

    pub fn set_value(&mut self, metric: &str, key: &str, value: f64) -> Result<(), PollerError> {
        let slot = self
            .instances
            .get(key)
            .map(|instance| instance.slot)
            .ok_or_else(|| PollerError::InvalidParam(format!("unknown instance: {key}")))?;
        self.metrics
            .get_mut(metric)
            .map(|m| m.set(slot, value))
            .ok_or_else(|| PollerError::InvalidParam(format!("unknown metric: {metric}")))
    }

    /// Parse `raw` as f64 and store it; the caller maps the error to a
    /// skipped cell.
    pub fn set_value_string(
        &mut self,
        metric: &str,
        key: &str,
        raw: &str,
    ) -> Result<(), PollerError> {
        let value: f64 = raw.trim().parse().map_err(|_| {
            PollerError::ParseValue(format!("{metric}[{key}]: not a number: {raw:?}"))
        })?;
        self.set_value(metric, key, value)
    }

    /// Add `value` into the cell, treating an absent cell as zero.
    pub fn add_value(&mut self, metric: &str, key: &str, value: f64) -> Result<(), PollerError> {
        let current = self.get_value(metric, key).unwrap_or(0.0);
        self.set_value(metric, key, current + value)
    }

    pub fn get_value(&self, metric: &str, key: &str) -> Option<f64> {
        let slot = self.instances.get(key)?.slot;
        self.metrics.get(metric)?.get(slot)
    }

    /// The value an exporter publishes for this cell: cooked for derived
    /// metrics, raw otherwise. Matrices flagged with
    /// [`Matrix::set_publish_raw`] always publish the raw store.
    pub fn export_value(&self, metric: &str, key: &str) -> Option<f64> {
        let slot = self.instances.get(key)?.slot;
        let m = self.metrics.get(metric)?;
        if self.publish_raw {
            m.get(slot)
        } else {
            m.export_value(slot)
        }
    }

    /// Mark this matrix as carrying already-published values (set by
    /// plugins on the derived matrices they emit).
    pub fn set_publish_raw(&mut self, publish_raw: bool) {
        self.publish_raw = publish_raw;
    }

    // --- Cloning ---

    /// Clone object, global labels and metric descriptors with an empty
    /// value store. With `with_instances`, instance keys, labels and
    /// exportable flags are copied too; cell data never is.
    ///
    /// This is the contract plugins rely on when building derived matrices.
    pub fn clone_schema(&self, with_instances: bool) -> Matrix {
        let mut clone = Matrix::new(self.object.clone(), self.identifier.clone());
        clone.global_labels = self.global_labels.clone();
        clone.exportable = self.exportable;
        if with_instances {
            for (key, instance) in self.instances() {
                let slot = clone.slots;
                clone.slots += 1;
                clone.key_order.push(key.to_string());
                clone
                    .instances
                    .insert(key.to_string(), instance.clone_for(slot));
            }
        }
        for (name, metric) in &self.metrics {
            clone
                .metrics
                .insert(name.clone(), metric.clone_schema(clone.slots));
        }
        clone
    }

    // --- Derived-counter pipeline ---

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Cook delta/rate/percent/average values from the previous snapshot.
    ///
    /// Must be called exactly once per cycle before the exporter fan-out;
    /// a second call without an intervening [`Matrix::snapshot_commit`] is
    /// a collector bug and rejected.
    pub fn publish_prepare(&mut self, now: f64) -> Result<(), PollerError> {
        if self.prepared {
            return Err(PollerError::InvalidParam(format!(
                "publish_prepare called twice in one cycle for {}",
                self.object
            )));
        }
        self.prepared = true;

        for metric in self.metrics.values_mut() {
            for bit in &mut metric.cooked_present {
                *bit = false;
            }
        }

        let Some(snapshot) = &self.snapshot else {
            // First cycle: nothing to derive from.
            return Ok(());
        };
        if now <= snapshot.ts {
            if self.metrics.values().any(|m| m.kind().is_derived()) {
                tracing::warn!(
                    object = %self.object,
                    now_ts = now,
                    prev_ts = snapshot.ts,
                    "source clock did not advance, publishing no derived values this cycle"
                );
            }
            return Ok(());
        }
        let dt = now - snapshot.ts;

        // Compute into temporaries first: percent/average read their base
        // metric's raw vectors while we fill the target's cooked vectors.
        let mut results: Vec<(String, Vec<f64>, Vec<bool>)> = Vec::new();

        for (name, metric) in &self.metrics {
            let kind = metric.kind();
            if !kind.is_derived() {
                continue;
            }
            let Some((prev_vals, prev_pres)) = snapshot.values.get(name) else {
                // Metric discovered this cycle; derives next cycle.
                continue;
            };

            let mut cooked = vec![0.0; self.slots];
            let mut present = vec![false; self.slots];

            match kind {
                MetricKind::Delta | MetricKind::HistogramBucket | MetricKind::Rate => {
                    for slot in 0..self.slots {
                        let cur_ok = metric.present.get(slot).copied().unwrap_or(false);
                        let prev_ok = prev_pres.get(slot).copied().unwrap_or(false);
                        if !(cur_ok && prev_ok) {
                            continue;
                        }
                        let delta = metric.values[slot] - prev_vals[slot];
                        if delta < 0.0 {
                            // Counter reset; skip the cell this cycle.
                            continue;
                        }
                        cooked[slot] = if kind == MetricKind::Rate {
                            delta / dt
                        } else {
                            delta
                        };
                        present[slot] = true;
                    }
                }
                MetricKind::Percent | MetricKind::Average => {
                    let Some(base_name) = metric.base() else {
                        tracing::warn!(
                            object = %self.object,
                            metric = %name,
                            "derived metric has no base metric, skipping"
                        );
                        continue;
                    };
                    let Some(base) = self.metrics.get(base_name) else {
                        tracing::warn!(
                            object = %self.object,
                            metric = %name,
                            base = %base_name,
                            "base metric missing from matrix, skipping"
                        );
                        continue;
                    };
                    let Some((base_prev_vals, base_prev_pres)) = snapshot.values.get(base_name)
                    else {
                        continue;
                    };
                    for slot in 0..self.slots {
                        let cur_ok = metric.present.get(slot).copied().unwrap_or(false)
                            && base.present.get(slot).copied().unwrap_or(false);
                        let prev_ok = prev_pres.get(slot).copied().unwrap_or(false)
                            && base_prev_pres.get(slot).copied().unwrap_or(false);
                        if !(cur_ok && prev_ok) {
                            continue;
                        }
                        let num = metric.values[slot] - prev_vals[slot];
                        let den = base.values[slot] - base_prev_vals[slot];
                        if num < 0.0 || den <= 0.0 {
                            continue;
                        }
                        cooked[slot] = if kind == MetricKind::Percent {
                            num / den * 100.0
                        } else {
                            num / den
                        };
                        present[slot] = true;
                    }
                }
                MetricKind::Raw => unreachable!("raw metrics are not derived"),
            }

            results.push((name.clone(), cooked, present));
        }

        for (name, cooked, present) in results {
            if let Some(metric) = self.metrics.get_mut(&name) {
                metric.cooked = cooked;
                metric.cooked_present = present;
            }
        }
        Ok(())
    }

    /// Copy the current raw values into the previous snapshot.
    ///
    /// Called once per cycle after the exporter fan-out finishes, whether
    /// or not individual exporters succeeded.
    pub fn snapshot_commit(&mut self, now: f64) {
        let values = self
            .metrics
            .iter()
            .map(|(name, metric)| {
                (name.clone(), (metric.values.clone(), metric.present.clone()))
            })
            .collect();
        self.snapshot = Some(Snapshot { ts: now, values });
        self.prepared = false;
    }
}


#[cfg(test)]
mod props {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        Remove(u8),
        Set(u8, f64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Add),
            (0u8..16).prop_map(Op::Remove),
            ((0u8..16), -1e9f64..1e9).prop_map(|(k, v)| Op::Set(k, v)),
        ]
    }

    proptest! {
        // Interleaved add/remove/set; reads return the last write for
        // every surviving (metric, instance) pair.
        #[test]
        fn schema_stability(ops in proptest::collection::vec(op_strategy(), 1..64)) {
            let mut m = Matrix::new("volume", "test");
            m.add_metric("v", MetricKind::Raw).unwrap();
            let mut model: std::collections::HashMap<String, Option<f64>> =
                std::collections::HashMap::new();

            for op in ops {
                match op {
                    Op::Add(k) => {
                        let key = format!("i{k}");
                        if m.instance(&key).is_none() {
                            m.add_instance(&key).unwrap();
                            model.insert(key, None);
                        }
                    }
                    Op::Remove(k) => {
                        let key = format!("i{k}");
                        m.remove_instance(&key);
                        model.remove(&key);
                    }
                    Op::Set(k, v) => {
                        let key = format!("i{k}");
                        if m.instance(&key).is_some() {
                            m.set_value("v", &key, v).unwrap();
                            model.insert(key, Some(v));
                        }
                    }
                }
            }

            for (key, expected) in &model {
                prop_assert_eq!(m.get_value("v", key), *expected);
            }
            prop_assert_eq!(m.instance_count(), model.len());
        }

        // A schema clone repopulated with the same keys and labels
        // enumerates identically to the matrix it was cloned from.
        #[test]
        fn clone_law(keys in proptest::collection::btree_set("[a-z]{1,6}", 1..8)) {
            let mut original = Matrix::new("volume", "test");
            original.add_metric("ops", MetricKind::Rate).unwrap();
            original.add_metric("used", MetricKind::Raw).unwrap();
            original.set_global_label("cluster", "c1");
            for (i, key) in keys.iter().enumerate() {
                original.add_instance(key).unwrap();
                original.set_label(key, "n", i.to_string()).unwrap();
            }

            let mut clone = original.clone_schema(false);
            for key in original.instance_keys().map(str::to_owned).collect::<Vec<_>>() {
                clone.add_instance(&key).unwrap();
                let n = original.get_label(&key, "n").unwrap().to_string();
                clone.set_label(&key, "n", n).unwrap();
            }

            let orig_rows: Vec<_> = original
                .instances()
                .map(|(k, i)| (k.to_owned(), i.labels().clone()))
                .collect();
            let clone_rows: Vec<_> = clone
                .instances()
                .map(|(k, i)| (k.to_owned(), i.labels().clone()))
                .collect();
            prop_assert_eq!(orig_rows, clone_rows);

            let orig_metrics: Vec<_> =
                original.metrics().map(|m| (m.name().to_owned(), m.kind())).collect();
            let clone_metrics: Vec<_> =
                clone.metrics().map(|m| (m.name().to_owned(), m.kind())).collect();
            prop_assert_eq!(orig_metrics, clone_metrics);
            prop_assert_eq!(original.global_labels(), clone.global_labels());
        }
    }
}
