// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Metric values extracted from device payloads.
//!
//! A decoded message yields one [`DeviceReadings`]: the device identifier and
//! a flat map of metric name to [`MetricValue`]. This is also the exact shape
//! handed to a sink per device, so the same map type flows from decoder
//! through the aggregation cache to delivery.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Metric name to latest value, ordered by name.
pub type MetricMap = BTreeMap<String, MetricValue>;

/// A value that can be posted for a metric.
///
/// Serializes to the natural JSON type (number, string or boolean).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// 64-bit floating point.
    Float(f64),
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 string.
    String(String),
    /// Boolean value.
    Boolean(bool),
}

impl MetricValue {
    /// Convert a JSON value with type inference.
    ///
    /// Integral numbers stay integers, other numbers become floats. Null,
    /// arrays and objects have no metric representation.
    pub fn from_json(val: &serde_json::Value) -> Option<Self> {
        match val {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(MetricValue::Integer(i))
                } else {
                    n.as_f64().map(MetricValue::Float)
                }
            }
            serde_json::Value::String(s) => Some(MetricValue::String(s.clone())),
            serde_json::Value::Bool(b) => Some(MetricValue::Boolean(*b)),
            serde_json::Value::Null => None,
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Integer(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::String(v.to_string())
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Boolean(v)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Integer(v) => write!(f, "{}", v),
            MetricValue::String(v) => write!(f, "{}", v),
            MetricValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

/// Metrics produced for one device by a single decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReadings {
    /// Device identifier used as the sink node name.
    pub device: String,
    /// Metric name to value.
    pub metrics: MetricMap,
}

impl DeviceReadings {
    /// Create an empty reading set for a device.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            metrics: MetricMap::new(),
        }
    }

    /// Add a metric, replacing any previous value with the same name.
    pub fn with(mut self, metric: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.metrics.insert(metric.into(), value.into());
        self
    }

    /// Check if no metric was produced.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
