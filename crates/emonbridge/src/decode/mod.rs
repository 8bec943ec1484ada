// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device payload decoders.
//!
//! A decoder turns one `(topic, payload)` pair into the readings of a single
//! device. Decoders are pure: they hold their name tables and nothing else,
//! never perform I/O and never keep state between messages.
//!
//! `Ok(None)` means the topic is outside the configured scope and is expected
//! noise. `Err(_)` means the message was in scope but could not be parsed.

mod alfen;
mod evcc;
mod qbus;
mod slimmelezer;

pub use alfen::AlfenDecoder;
pub use evcc::EvccDecoder;
pub use qbus::QbusDecoder;
pub use slimmelezer::SlimmelezerDecoder;

use crate::value::DeviceReadings;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Payload or topic could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Invalid number '{0}'")]
    Number(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected topic shape: {0}")]
    Topic(String),
}

/// Result of decoding one message.
pub type DecodeResult = Result<Option<DeviceReadings>, DecodeError>;

/// Decode function for families not built in.
pub type DecodeFn = Arc<dyn Fn(&str, &[u8]) -> DecodeResult + Send + Sync>;

/// One decoder per device family.
#[derive(Clone)]
pub enum Decoder {
    Slimmelezer(SlimmelezerDecoder),
    Alfen(AlfenDecoder),
    Evcc(EvccDecoder),
    Qbus(QbusDecoder),
    Custom(DecodeFn),
}

impl Decoder {
    /// Build a decoder from a closure.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &[u8]) -> DecodeResult + Send + Sync + 'static,
    {
        Decoder::Custom(Arc::new(f))
    }

    /// Decode a message. Empty readings are reported as `None`.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> DecodeResult {
        let readings = match self {
            Decoder::Slimmelezer(d) => d.decode(topic, payload)?,
            Decoder::Alfen(d) => d.decode(topic, payload)?,
            Decoder::Evcc(d) => d.decode(topic, payload)?,
            Decoder::Qbus(d) => d.decode(topic, payload)?,
            Decoder::Custom(f) => f(topic, payload)?,
        };
        Ok(readings.filter(|r| !r.is_empty()))
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decoder::Slimmelezer(d) => f.debug_tuple("Slimmelezer").field(d).finish(),
            Decoder::Alfen(d) => f.debug_tuple("Alfen").field(d).finish(),
            Decoder::Evcc(d) => f.debug_tuple("Evcc").field(d).finish(),
            Decoder::Qbus(d) => f.debug_tuple("Qbus").field(d).finish(),
            Decoder::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn payload_str(payload: &[u8]) -> Result<&str, DecodeError> {
    Ok(std::str::from_utf8(payload)?.trim())
}

/// Parse a finite decimal; `NaN` and infinities have no JSON form.
fn parse_f64(text: &str) -> Result<f64, DecodeError> {
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DecodeError::Number(text.to_string()))
}

fn parse_i64(text: &str) -> Result<i64, DecodeError> {
    text.parse::<i64>()
        .map_err(|_| DecodeError::Number(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_decoder() {
        let decoder = Decoder::custom(|topic, payload| {
            let value = parse_f64(payload_str(payload)?)?;
            Ok(Some(DeviceReadings::new(topic).with("v", value)))
        });

        let readings = decoder.decode("d1", b" 1.5\n").expect("decode").expect("some");
        assert_eq!(readings, DeviceReadings::new("d1").with("v", 1.5));
        assert!(matches!(
            decoder.decode("d1", b"abc"),
            Err(DecodeError::Number(_))
        ));
    }

    #[test]
    fn test_empty_readings_become_none() {
        let decoder = Decoder::custom(|_, _| Ok(Some(DeviceReadings::new("d1"))));
        assert!(decoder.decode("t", b"").expect("decode").is_none());
    }

    #[test]
    fn test_utf8_error() {
        let decoder = Decoder::custom(|_, payload| {
            payload_str(payload)?;
            Ok(None)
        });
        assert!(matches!(
            decoder.decode("t", &[0xff, 0xfe]),
            Err(DecodeError::Utf8(_))
        ));
    }
}
