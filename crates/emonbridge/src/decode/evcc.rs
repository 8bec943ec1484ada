// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Energy manager loadpoints: `evcc/loadpoints/<id>/<kind>[/<phase>]`.

use super::{parse_f64, payload_str, DecodeResult};
use crate::config::{EvccConfig, LoadpointConfig};
use crate::value::DeviceReadings;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct EvccDecoder {
    device: String,
    loadpoints: BTreeMap<String, LoadpointConfig>,
}

impl EvccDecoder {
    pub fn new(config: &EvccConfig) -> Self {
        Self {
            device: config.device.clone(),
            loadpoints: config.loadpoints.clone(),
        }
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> DecodeResult {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 4 || parts[1] != "loadpoints" {
            tracing::debug!("Not a loadpoint topic: {}", topic);
            return Ok(None);
        }

        let id = parts[2];
        let Some(loadpoint) = self.loadpoints.get(id) else {
            tracing::debug!("No loadpoint configured for id {}", id);
            return Ok(None);
        };

        let metric = match (parts[3], parts.get(4).copied(), parts.len()) {
            ("chargeCurrent", None, _) => &loadpoint.charge_current,
            ("chargePower", None, _) => &loadpoint.charge_power,
            ("chargeTotalImport", None, _) => &loadpoint.charge_total_import,
            ("phasesActive", None, _) => &loadpoint.phases_active,
            ("chargeCurrents", Some("l1"), 5) => &loadpoint.charge_current_1,
            ("chargeCurrents", Some("l2"), 5) => &loadpoint.charge_current_2,
            ("chargeCurrents", Some("l3"), 5) => &loadpoint.charge_current_3,
            _ => &None,
        };
        let Some(metric) = metric else {
            return Ok(None);
        };

        let text = payload_str(payload)?;
        if text.is_empty() {
            return Ok(None);
        }
        let value = parse_f64(text)?;
        tracing::debug!("Value for {} -> {}: {}", self.device, metric, value);

        Ok(Some(DeviceReadings::new(&self.device).with(metric, value)))
    }
}
