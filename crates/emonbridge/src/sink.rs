// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sink boundary.
//!
//! A sink receives one call per device with a flat metric map. Delivery is
//! best-effort: failures are logged and the data point is dropped, nothing
//! is retried or buffered.

use crate::cache::Snapshot;
use crate::value::MetricMap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default bound on a single delivery call.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Sink delivery errors.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sink answered with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Sink rejected delivery: {0}")]
    Rejected(String),
}

/// External metrics-ingestion endpoint.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver the metrics of one device.
    async fn deliver(&self, device: &str, metrics: &MetricMap) -> Result<(), SinkError>;
}

/// Outcome of delivering a drained snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Devices delivered successfully.
    pub delivered: usize,
    /// Devices whose delivery failed (data dropped).
    pub failed: usize,
}

impl DeliveryReport {
    /// Total number of sink calls made.
    pub fn calls(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Deliver one device's metrics with a bounded timeout.
///
/// Errors are logged here and never propagated.
pub async fn deliver_one(
    sink: &dyn Sink,
    device: &str,
    metrics: &MetricMap,
    timeout: Duration,
) -> bool {
    let result = match tokio::time::timeout(timeout, sink.deliver(device, metrics)).await {
        Ok(result) => result,
        Err(_) => Err(SinkError::Timeout(timeout)),
    };

    match result {
        Ok(()) => {
            tracing::debug!(device, metrics = metrics.len(), "delivered");
            true
        }
        Err(err) => {
            tracing::warn!(device, "Delivery failed, dropping metrics: {}", err);
            false
        }
    }
}

/// Deliver every device of a drained snapshot, one sink call per device.
pub async fn deliver_snapshot(
    sink: Arc<dyn Sink>,
    snapshot: Snapshot,
    timeout: Duration,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for (device, metrics) in &snapshot {
        if deliver_one(sink.as_ref(), device, metrics, timeout).await {
            report.delivered += 1;
        } else {
            report.failed += 1;
        }
    }
    report
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that records every call, optionally failing or stalling.
    #[derive(Default)]
    pub struct RecordingSink {
        pub calls: Mutex<Vec<(String, MetricMap)>>,
        pub fail: bool,
        pub stall: Option<Duration>,
    }

    impl RecordingSink {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<(String, MetricMap)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn deliver(&self, device: &str, metrics: &MetricMap) -> Result<(), SinkError> {
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            self.calls.lock().push((device.to_string(), metrics.clone()));
            if self.fail {
                return Err(SinkError::Rejected("test failure".into()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::value::MetricValue;

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "d1".into(),
            MetricMap::from([("a".to_string(), MetricValue::Float(1.0))]),
        );
        snapshot.insert(
            "d2".into(),
            MetricMap::from([("b".to_string(), MetricValue::Integer(2))]),
        );
        snapshot
    }

    #[tokio::test]
    async fn test_deliver_snapshot_one_call_per_device() {
        let sink = Arc::new(RecordingSink::default());
        let report = deliver_snapshot(sink.clone(), snapshot(), DEFAULT_DELIVERY_TIMEOUT).await;

        assert_eq!(report, DeliveryReport { delivered: 2, failed: 0 });
        let mut devices: Vec<_> = sink.calls().into_iter().map(|(d, _)| d).collect();
        devices.sort();
        assert_eq!(devices, vec!["d1", "d2"]);
    }

    #[tokio::test]
    async fn test_deliver_snapshot_swallows_failures() {
        let sink = Arc::new(RecordingSink::failing());
        let report = deliver_snapshot(sink.clone(), snapshot(), DEFAULT_DELIVERY_TIMEOUT).await;

        assert_eq!(report.failed, 2);
        assert_eq!(report.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_one_times_out() {
        let sink = RecordingSink {
            stall: Some(Duration::from_secs(120)),
            ..Default::default()
        };
        let metrics = MetricMap::from([("a".to_string(), MetricValue::Float(1.0))]);

        let ok = deliver_one(&sink, "d1", &metrics, Duration::from_secs(30)).await;
        assert!(!ok);
        assert!(sink.calls().is_empty());
    }
}
