// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bus-wired sensors: `qbus/<n>/sensor/<type>/<id>/state`, integer payload.
//!
//! Readings are posted under the device `qbus-<type>`.
//!
//! Output names are not learned from the controller's
//! `qbus/<n>/info/outputs/<type>` announcements. Every output id has to be
//! mapped by hand under `[qbus.types.<type>]`; unmapped outputs are ignored.

use super::{parse_i64, payload_str, DecodeError, DecodeResult};
use crate::config::QbusConfig;
use crate::value::DeviceReadings;
use regex::Regex;
use std::collections::HashMap;

const STATE_TOPIC: &str = r"^qbus/\d+/sensor/(\S+)/(\d+)/state$";

#[derive(Debug, Clone)]
pub struct QbusDecoder {
    /// Sensor type to (output id to metric name).
    types: HashMap<String, HashMap<u32, String>>,
    state_topic: Regex,
}

impl QbusDecoder {
    pub fn new(config: &QbusConfig) -> Result<Self, regex::Error> {
        let types = config
            .types
            .iter()
            .map(|(kind, ids)| {
                let ids = ids
                    .iter()
                    .filter_map(|(id, name)| Some((id.parse::<u32>().ok()?, name.clone())))
                    .collect();
                (kind.clone(), ids)
            })
            .collect();

        Ok(Self {
            types,
            state_topic: Regex::new(STATE_TOPIC)?,
        })
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> DecodeResult {
        if topic.split('/').nth(2) == Some("info") {
            tracing::debug!("Ignoring {}, output names come from config", topic);
            return Ok(None);
        }
        let caps = self
            .state_topic
            .captures(topic)
            .ok_or_else(|| DecodeError::Topic(topic.to_string()))?;
        let kind = &caps[1];

        let Some(names) = self.types.get(kind) else {
            tracing::debug!("Ignoring state on type {} since not in config", kind);
            return Ok(None);
        };
        let id: u32 = caps[2]
            .parse()
            .map_err(|_| DecodeError::Number(caps[2].to_string()))?;
        let Some(name) = names.get(&id) else {
            tracing::debug!("No metric mapped for {} output {}", kind, id);
            return Ok(None);
        };

        let value = parse_i64(payload_str(payload)?)?;
        tracing::debug!("Qbus state on {}: {}", topic, value);

        Ok(Some(
            DeviceReadings::new(format!("qbus-{}", kind)).with(name, value),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn decoder() -> QbusDecoder {
        let config = QbusConfig {
            enabled: true,
            types: BTreeMap::from([(
                "thermostats".to_string(),
                BTreeMap::from([("12".to_string(), "living".to_string())]),
            )]),
            ..Default::default()
        };
        QbusDecoder::new(&config).expect("decoder")
    }

    #[test]
    fn test_mapped_state() {
        let readings = decoder()
            .decode("qbus/1/sensor/thermostats/12/state", b"21")
            .expect("decode")
            .expect("mapped");
        assert_eq!(
            readings,
            DeviceReadings::new("qbus-thermostats").with("living", 21i64)
        );
    }

    #[test]
    fn test_unmapped_type_or_id() {
        let d = decoder();
        assert!(d
            .decode("qbus/1/sensor/dimmers/12/state", b"1")
            .expect("decode")
            .is_none());
        assert!(d
            .decode("qbus/1/sensor/thermostats/13/state", b"1")
            .expect("decode")
            .is_none());
    }

    #[test]
    fn test_info_announcements_ignored() {
        let result = decoder()
            .decode(
                "qbus/1/info/outputs/thermostats",
                br#"[{"id":12,"name":"Living"}]"#,
            )
            .expect("decode");
        assert!(result.is_none());
    }

    #[test]
    fn test_leading_zero_id() {
        let readings = decoder()
            .decode("qbus/1/sensor/thermostats/012/state", b"19")
            .expect("decode");
        assert!(readings.is_some());
    }

    #[test]
    fn test_errors() {
        let d = decoder();
        assert!(matches!(
            d.decode("qbus/1/sensor/thermostats/12/state", b"21.5"),
            Err(DecodeError::Number(_))
        ));
        assert!(matches!(
            d.decode("qbus/1/sensor/thermostats/state", b"21"),
            Err(DecodeError::Topic(_))
        ));
    }
}
