// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Smart-meter reader: `slimmelezer/sensor/<item>/state`, decimal payload.

use super::{parse_f64, payload_str, DecodeResult};
use crate::config::SlimmelezerConfig;
use crate::value::DeviceReadings;
use regex::Regex;
use std::collections::BTreeMap;

const STATE_TOPIC: &str = r"^slimmelezer/sensor/(\S+)/state$";

#[derive(Debug, Clone)]
pub struct SlimmelezerDecoder {
    device: String,
    items: BTreeMap<String, String>,
    state_topic: Regex,
}

impl SlimmelezerDecoder {
    pub fn new(config: &SlimmelezerConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            device: config.device.clone(),
            items: config.items.clone(),
            state_topic: Regex::new(STATE_TOPIC)?,
        })
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> DecodeResult {
        let Some(caps) = self.state_topic.captures(topic) else {
            tracing::debug!("Not a sensor state topic: {}", topic);
            return Ok(None);
        };

        let item = &caps[1];
        let Some(metric) = self.items.get(item) else {
            tracing::debug!("No metric mapped for item {} ({})", item, topic);
            return Ok(None);
        };

        let value = parse_f64(payload_str(payload)?)?;
        Ok(Some(DeviceReadings::new(&self.device).with(metric, value)))
    }
}
