// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Router entry definition and statistics.

use crate::cache::AggregationCache;
use crate::config::DeliveryConfig;
use crate::decode::Decoder;
use crate::flush::MIN_FLUSH_INTERVAL;
use crate::topic::TopicFilter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How decoded readings reach the sink.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// One sink call per decoded message.
    Immediate,

    /// Merge into a cache drained by a flusher every `interval`.
    Batched {
        cache: Arc<AggregationCache>,
        interval: Duration,
    },
}

impl Delivery {
    /// Batched delivery through a fresh cache.
    ///
    /// A zero interval is raised to [`MIN_FLUSH_INTERVAL`].
    pub fn batched(interval: Duration) -> Self {
        Delivery::Batched {
            cache: Arc::new(AggregationCache::new()),
            interval: interval.max(MIN_FLUSH_INTERVAL),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        match config {
            DeliveryConfig::Immediate => Delivery::Immediate,
            DeliveryConfig::Batched {
                flush_interval_secs,
            } => Delivery::batched(Duration::from_secs(*flush_interval_secs)),
        }
    }

    pub fn is_batched(&self) -> bool {
        matches!(self, Delivery::Batched { .. })
    }
}

/// A device family bound to one topic prefix.
#[derive(Debug)]
pub struct RouterEntry {
    /// Family name used in logs and statistics.
    pub name: String,

    /// Literal topic prefix used for dispatch.
    pub prefix: String,

    /// Filters subscribed at connect time.
    pub subscriptions: Vec<TopicFilter>,

    /// Disabled entries contribute no subscriptions and never decode.
    pub enabled: bool,

    /// Payload decoder.
    pub decoder: Decoder,

    /// Delivery mode.
    pub delivery: Delivery,

    /// Entry statistics.
    pub stats: Arc<RouteStats>,
}

impl RouterEntry {
    /// Create an enabled entry with immediate delivery and no subscriptions.
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, decoder: Decoder) -> Self {
        let name = name.into();
        Self {
            stats: Arc::new(RouteStats::new(name.clone())),
            name,
            prefix: prefix.into(),
            subscriptions: Vec::new(),
            enabled: true,
            decoder,
            delivery: Delivery::Immediate,
        }
    }

    /// Add a subscription filter.
    pub fn subscribe(mut self, filter: TopicFilter) -> Self {
        self.subscriptions.push(filter);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Check if this entry handles a given topic.
    pub fn matches_topic(&self, topic: &str) -> bool {
        topic.starts_with(&self.prefix)
    }

    /// Cache written by this entry, if batched.
    pub fn cache(&self) -> Option<&Arc<AggregationCache>> {
        match &self.delivery {
            Delivery::Batched { cache, .. } => Some(cache),
            Delivery::Immediate => None,
        }
    }

    pub fn record_routed(&self) {
        self.stats.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self) {
        self.stats.messages_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Statistics for a router entry.
#[derive(Debug)]
pub struct RouteStats {
    /// Entry name.
    pub name: String,

    /// Messages dispatched to this entry.
    pub messages_routed: AtomicU64,

    /// Messages that produced readings.
    pub messages_decoded: AtomicU64,

    /// Messages dropped (disabled or out of scope).
    pub messages_dropped: AtomicU64,

    /// Messages whose decoding failed.
    pub decode_errors: AtomicU64,

    /// Successful sink calls.
    pub deliveries_ok: AtomicU64,

    /// Failed sink calls.
    pub deliveries_failed: AtomicU64,

    /// Entry creation time.
    pub created: Instant,
}

impl RouteStats {
    /// Create new stats.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages_routed: AtomicU64::new(0),
            messages_decoded: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            deliveries_ok: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Record the outcome of one sink call.
    pub fn record_delivery(&self, ok: bool) {
        if ok {
            self.deliveries_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> RouteStatsSnapshot {
        RouteStatsSnapshot {
            name: self.name.clone(),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_decoded: self.messages_decoded.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            deliveries_ok: self.deliveries_ok.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

/// Snapshot of entry statistics.
#[derive(Debug, Clone)]
pub struct RouteStatsSnapshot {
    pub name: String,
    pub messages_routed: u64,
    pub messages_decoded: u64,
    pub messages_dropped: u64,
    pub decode_errors: u64,
    pub deliveries_ok: u64,
    pub deliveries_failed: u64,
    pub uptime_secs: u64,
}

impl RouteStatsSnapshot {
    /// Calculate messages per second.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.messages_routed as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}
