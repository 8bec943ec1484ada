// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! EV charger properties: `alfen/properties/<meter>/category/<category>`.
//!
//! The payload is a JSON array of `{"id": .., "value": ..}` objects. Only ids
//! present in the category table are kept; the meter name is the device id.

use super::{DecodeError, DecodeResult};
use crate::config::{AlfenConfig, AlfenMeterConfig};
use crate::value::{DeviceReadings, MetricValue};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;

const PROPERTIES_TOPIC: &str = r"^alfen/properties/(\S+)/category/(\S+)$";

#[derive(Debug, Deserialize)]
struct Property {
    id: serde_json::Value,
    #[serde(default)]
    value: serde_json::Value,
}

impl Property {
    /// Ids arrive either as strings or as numbers. Integral floats such as
    /// `7.0` map to the same key as `7`.
    fn key(&self) -> Option<String> {
        match &self.id {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => {
                if n.is_f64() {
                    let v = n.as_f64()?;
                    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                        return Some((v as i64).to_string());
                    }
                }
                Some(n.to_string())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlfenDecoder {
    properties: BTreeMap<String, AlfenMeterConfig>,
    properties_topic: Regex,
}

impl AlfenDecoder {
    pub fn new(config: &AlfenConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            properties: config.properties.clone(),
            properties_topic: Regex::new(PROPERTIES_TOPIC)?,
        })
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> DecodeResult {
        let caps = self
            .properties_topic
            .captures(topic)
            .ok_or_else(|| DecodeError::Topic(topic.to_string()))?;
        let meter = &caps[1];
        let category = &caps[2];

        let Some(meter_config) = self.properties.get(meter) else {
            tracing::debug!("No input handled for meter {} ({})", meter, topic);
            return Ok(None);
        };
        let Some(names) = meter_config.category.get(category) else {
            tracing::debug!("No input handled for category {} ({})", category, topic);
            return Ok(None);
        };

        let properties: Vec<Property> = serde_json::from_slice(payload)?;
        let mut readings = DeviceReadings::new(meter);
        for property in &properties {
            let Some(name) = property.key().and_then(|id| names.get(&id)) else {
                continue;
            };
            if let Some(value) = MetricValue::from_json(&property.value) {
                readings.metrics.insert(name.clone(), value);
            }
        }

        if readings.is_empty() {
            tracing::debug!("No mapped property in {}", topic);
            return Ok(None);
        }
        Ok(Some(readings))
    }
}
