// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Aggregation cache for pending device metrics.
//!
//! Coalesces bursts of updates: for every `(device, metric)` pair only the
//! most recent value since the last drain is kept. A drain swaps the whole
//! pending structure for an empty one under the same lock that guards
//! merges, so a concurrent writer lands either in the drained snapshot or in
//! the next one, never in both and never half-way.

use crate::value::{DeviceReadings, MetricMap};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Pending metrics per device, drained as a whole.
pub type Snapshot = HashMap<String, MetricMap>;

/// Thread-safe last-write-wins cache of device metrics.
#[derive(Debug, Default)]
pub struct AggregationCache {
    pending: Mutex<Snapshot>,
}

impl AggregationCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge metrics for a device, overwriting existing keys.
    ///
    /// Merging an empty map still registers the device; callers skip empty
    /// readings before getting here.
    pub fn merge(&self, device: &str, metrics: MetricMap) {
        let mut pending = self.pending.lock();
        match pending.get_mut(device) {
            Some(values) => values.extend(metrics),
            None => {
                pending.insert(device.to_string(), metrics);
            }
        }
    }

    /// Merge a decoded reading set.
    pub fn merge_readings(&self, readings: DeviceReadings) {
        self.merge(&readings.device, readings.metrics);
    }

    /// Take everything pending, leaving the cache empty.
    ///
    /// Returns `None` without touching the structure when nothing is pending.
    pub fn drain(&self) -> Option<Snapshot> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *pending))
    }

    /// Number of devices with pending metrics.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
