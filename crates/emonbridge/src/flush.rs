// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic cache flushing.
//!
//! Each batched router entry gets one [`Flusher`]. A tick drains the cache
//! and hands the snapshot to a spawned delivery task, so a slow sink never
//! delays the next tick or message ingestion.

use crate::cache::AggregationCache;
use crate::route::RouteStats;
use crate::sink::{deliver_snapshot, DeliveryReport, Sink, DEFAULT_DELIVERY_TIMEOUT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shortest flush period; zero periods are raised to it.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Drains one cache to the sink on a fixed period.
pub struct Flusher {
    name: String,
    cache: Arc<AggregationCache>,
    sink: Arc<dyn Sink>,
    interval: Duration,
    timeout: Duration,
    stats: Option<Arc<RouteStats>>,
}

impl Flusher {
    /// Create a flusher for `cache`.
    pub fn new(
        name: impl Into<String>,
        cache: Arc<AggregationCache>,
        sink: Arc<dyn Sink>,
        interval: Duration,
    ) -> Self {
        let name = name.into();
        let interval = if interval.is_zero() {
            tracing::warn!(
                "{}: zero flush interval, using {:?}",
                name,
                MIN_FLUSH_INTERVAL
            );
            MIN_FLUSH_INTERVAL
        } else {
            interval
        };
        Self {
            name,
            cache,
            sink,
            interval,
            timeout: DEFAULT_DELIVERY_TIMEOUT,
            stats: None,
        }
    }

    /// Bound on each sink call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Count delivery outcomes in `stats`.
    pub fn with_stats(mut self, stats: Arc<RouteStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Run a single flush.
    ///
    /// Returns `None` when nothing was pending, otherwise the handle of the
    /// delivery task working on the drained snapshot.
    pub fn tick(&self) -> Option<JoinHandle<DeliveryReport>> {
        let Some(snapshot) = self.cache.drain() else {
            tracing::debug!("{}: stale, not sending", self.name);
            return None;
        };
        tracing::debug!("{}: flushing {} device(s)", self.name, snapshot.len());

        let sink = Arc::clone(&self.sink);
        let stats = self.stats.clone();
        let timeout = self.timeout;
        Some(tokio::spawn(async move {
            let report = deliver_snapshot(sink, snapshot, timeout).await;
            if let Some(stats) = stats {
                for _ in 0..report.delivered {
                    stats.record_delivery(true);
                }
                for _ in 0..report.failed {
                    stats.record_delivery(false);
                }
            }
            report
        }))
    }

    /// Tick every `interval` until `shutdown` turns true.
    ///
    /// The first tick fires one interval after the start.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!("{}: flushing every {:?}", self.name, self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("{}: flusher stopped", self.name);
        })
    }
}

impl std::fmt::Debug for Flusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flusher")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::RecordingSink;
    use crate::value::{MetricMap, MetricValue};

    fn metrics(key: &str, v: f64) -> MetricMap {
        MetricMap::from([(key.to_string(), MetricValue::Float(v))])
    }

    #[tokio::test]
    async fn test_stale_tick_skips_sink() {
        let sink = Arc::new(RecordingSink::default());
        let cache = Arc::new(AggregationCache::new());
        let flusher = Flusher::new("t", cache.clone(), sink.clone(), Duration::from_secs(5));

        cache.merge("d1", metrics("a", 1.0));
        let report = flusher.tick().expect("pending").await.expect("join");
        assert_eq!(report.delivered, 1);

        // No merge between ticks.
        assert!(flusher.tick().is_none());
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_counts_into_stats() {
        let stats = Arc::new(RouteStats::new("t"));
        let cache = Arc::new(AggregationCache::new());
        let flusher = Flusher::new(
            "t",
            cache.clone(),
            Arc::new(RecordingSink::failing()),
            Duration::from_secs(5),
        )
        .with_stats(stats.clone());

        cache.merge("d1", metrics("a", 1.0));
        cache.merge("d2", metrics("a", 2.0));
        flusher.tick().expect("pending").await.expect("join");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.deliveries_failed, 2);
        assert_eq!(snapshot.deliveries_ok, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_flusher_ticks_and_stops() {
        let sink = Arc::new(RecordingSink::default());
        let cache = Arc::new(AggregationCache::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Flusher::new("t", cache.clone(), sink.clone(), Duration::from_secs(5))
            .spawn(shutdown_rx);

        cache.merge("d1", metrics("a", 1.0));
        cache.merge("d1", metrics("a", 2.0));

        tokio::time::sleep(Duration::from_secs(6)).await;
        // Let the delivery task run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.calls(), vec![("d1".to_string(), metrics("a", 2.0))]);

        // Quiet period: stale ticks only.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.calls().len(), 1);

        shutdown_tx.send(true).expect("send");
        handle.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_flushes() {
        let sink = Arc::new(RecordingSink::default());
        let cache = Arc::new(AggregationCache::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle =
            Flusher::new("t", cache.clone(), sink.clone(), Duration::ZERO).spawn(shutdown_rx);

        cache.merge("d1", metrics("a", 1.0));
        tokio::time::sleep(MIN_FLUSH_INTERVAL + Duration::from_millis(500)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.calls().len(), 1);
        assert!(cache.is_empty());

        shutdown_tx.send(true).expect("send");
        handle.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_does_not_block_ticks() {
        let sink = Arc::new(RecordingSink {
            stall: Some(Duration::from_secs(12)),
            ..Default::default()
        });
        let cache = Arc::new(AggregationCache::new());
        let flusher = Flusher::new("t", cache.clone(), sink.clone(), Duration::from_secs(5));

        cache.merge("d1", metrics("a", 1.0));
        let first = flusher.tick().expect("pending");

        // The cache is usable while the first delivery is stalled.
        cache.merge("d1", metrics("a", 2.0));
        let second = flusher.tick().expect("pending");

        assert_eq!(first.await.expect("join").delivered, 1);
        assert_eq!(second.await.expect("join").delivered, 1);
        assert_eq!(sink.calls().len(), 2);
    }
}
