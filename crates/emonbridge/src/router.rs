// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic router.
//!
//! Dispatches each inbound message to the first registered entry whose
//! prefix is a literal prefix of the topic. Registration order decides,
//! not prefix length. Nothing on this path performs I/O: batched readings
//! are merged into the entry's cache, immediate readings are handed to a
//! spawned delivery task.

use crate::route::{Delivery, RouteStatsSnapshot, RouterEntry};
use crate::sink::{deliver_one, Sink, DEFAULT_DELIVERY_TIMEOUT};
use crate::topic::TopicFilter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// What happened to a dispatched message.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No entry prefix matched the topic.
    Unmatched,

    /// The matching entry is disabled.
    Disabled,

    /// The topic is outside the configured scope of the entry.
    Ignored,

    /// Decoding failed; the message is consumed anyway.
    DecodeFailed,

    /// Readings were merged into the entry's cache.
    Merged,

    /// Readings are being delivered by a spawned task.
    Delivering(JoinHandle<bool>),
}

/// Ordered list of router entries plus the sink used for immediate delivery.
pub struct TopicRouter {
    entries: Vec<RouterEntry>,
    sink: Arc<dyn Sink>,
    delivery_timeout: Duration,
}

impl TopicRouter {
    /// Create a router without entries.
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            entries: Vec::new(),
            sink,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    /// Bound on each immediate delivery call.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Register an entry after all existing ones.
    pub fn register(&mut self, entry: RouterEntry) {
        tracing::debug!(
            "Registered entry '{}' on prefix '{}' (enabled: {})",
            entry.name,
            entry.prefix,
            entry.enabled
        );
        self.entries.push(entry);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_entry(mut self, entry: RouterEntry) -> Self {
        self.register(entry);
        self
    }

    pub fn entries(&self) -> &[RouterEntry] {
        &self.entries
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    /// Union of the subscriptions of all enabled entries, first occurrence kept.
    pub fn subscriptions(&self) -> Vec<TopicFilter> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .flat_map(|e| e.subscriptions.iter())
            .filter(|f| seen.insert(f.as_str().to_string()))
            .cloned()
            .collect()
    }

    /// Statistics of every entry in registration order.
    pub fn stats(&self) -> Vec<RouteStatsSnapshot> {
        self.entries.iter().map(|e| e.stats.snapshot()).collect()
    }

    /// Dispatch one message.
    ///
    /// Never fails: decode errors are logged here and do not reach the caller.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let Some(entry) = self.entries.iter().find(|e| e.matches_topic(topic)) else {
            tracing::debug!("Don't know how to handle topic {}", topic);
            return DispatchOutcome::Unmatched;
        };
        entry.record_routed();

        if !entry.enabled {
            tracing::debug!("{} is disabled, dropping {}", entry.name, topic);
            entry.record_dropped();
            return DispatchOutcome::Disabled;
        }

        let readings = match entry.decoder.decode(topic, payload) {
            Ok(Some(readings)) => readings,
            Ok(None) => {
                entry.record_dropped();
                return DispatchOutcome::Ignored;
            }
            Err(e) => {
                tracing::warn!("Could not parse message on topic {}: {}", topic, e);
                entry.record_decode_error();
                return DispatchOutcome::DecodeFailed;
            }
        };
        entry.record_decoded();

        match &entry.delivery {
            Delivery::Batched { cache, .. } => {
                cache.merge_readings(readings);
                DispatchOutcome::Merged
            }
            Delivery::Immediate => {
                let sink = Arc::clone(&self.sink);
                let stats = Arc::clone(&entry.stats);
                let timeout = self.delivery_timeout;
                DispatchOutcome::Delivering(tokio::spawn(async move {
                    let ok =
                        deliver_one(sink.as_ref(), &readings.device, &readings.metrics, timeout)
                            .await;
                    stats.record_delivery(ok);
                    ok
                }))
            }
        }
    }
}

impl std::fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRouter")
            .field("entries", &self.entries)
            .field("delivery_timeout", &self.delivery_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodeError, Decoder};
    use crate::sink::testing::RecordingSink;
    use crate::value::{DeviceReadings, MetricMap, MetricValue};

    fn tagging(tag: &'static str) -> Decoder {
        Decoder::custom(move |_, _| Ok(Some(DeviceReadings::new("d").with("hit", tag))))
    }

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::new(s).expect("filter")
    }

    fn batched(name: &str, prefix: &str, decoder: Decoder) -> RouterEntry {
        RouterEntry::new(name, prefix, decoder).delivery(Delivery::batched(Duration::from_secs(5)))
    }

    fn drained(entry: &RouterEntry) -> Option<MetricMap> {
        entry
            .cache()
            .and_then(|c| c.drain())
            .and_then(|mut s| s.remove("d"))
    }

    #[test]
    fn test_first_match_wins() {
        let sink = Arc::new(RecordingSink::default());
        let router = TopicRouter::new(sink)
            .with_entry(batched("a", "a/", tagging("a")))
            .with_entry(batched("ab", "a/b/", tagging("ab")));

        assert!(matches!(router.dispatch("a/b/c", b"1"), DispatchOutcome::Merged));

        let [a, ab] = router.entries() else {
            panic!("two entries");
        };
        assert_eq!(
            drained(a),
            Some(MetricMap::from([("hit".to_string(), MetricValue::from("a"))]))
        );
        assert!(drained(ab).is_none());
    }

    #[test]
    fn test_unmatched_topic() {
        let router = TopicRouter::new(Arc::new(RecordingSink::default()))
            .with_entry(batched("a", "a/", tagging("a")));

        assert!(matches!(router.dispatch("b/c", b"1"), DispatchOutcome::Unmatched));
        assert_eq!(router.stats()[0].messages_routed, 0);
    }

    #[test]
    fn test_disabled_entry_never_decodes() {
        let decoder = Decoder::custom(|_, _| panic!("decoder must not run"));
        let router = TopicRouter::new(Arc::new(RecordingSink::default()))
            .with_entry(batched("a", "a/", decoder).enabled(false));

        assert!(matches!(router.dispatch("a/x", b"1"), DispatchOutcome::Disabled));
        let stats = &router.stats()[0];
        assert_eq!(stats.messages_routed, 1);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[test]
    fn test_decode_failure_is_contained() {
        let failing = Decoder::custom(|_, payload| {
            if payload == b"bad" {
                return Err(DecodeError::Number("bad".into()));
            }
            Ok(Some(DeviceReadings::new("d").with("v", 1.0)))
        });
        let router = TopicRouter::new(Arc::new(RecordingSink::default()))
            .with_entry(batched("a", "a/", failing))
            .with_entry(batched("b", "b/", tagging("b")));

        assert!(matches!(router.dispatch("a/x", b"bad"), DispatchOutcome::DecodeFailed));
        assert!(matches!(router.dispatch("a/x", b"ok"), DispatchOutcome::Merged));
        assert!(matches!(router.dispatch("b/x", b"ok"), DispatchOutcome::Merged));

        let stats = router.stats();
        assert_eq!(stats[0].decode_errors, 1);
        assert_eq!(stats[0].messages_decoded, 1);
        assert_eq!(stats[1].messages_decoded, 1);
    }

    #[test]
    fn test_ignored_readings_do_not_merge() {
        let router = TopicRouter::new(Arc::new(RecordingSink::default()))
            .with_entry(batched("a", "a/", Decoder::custom(|_, _| Ok(None))));

        assert!(matches!(router.dispatch("a/x", b"1"), DispatchOutcome::Ignored));
        assert!(router.entries()[0].cache().expect("batched").is_empty());
    }

    #[tokio::test]
    async fn test_immediate_delivery() {
        let sink = Arc::new(RecordingSink::default());
        let router = TopicRouter::new(sink.clone())
            .with_entry(RouterEntry::new("a", "a/", tagging("a")));

        let DispatchOutcome::Delivering(handle) = router.dispatch("a/x", b"1") else {
            panic!("expected immediate delivery");
        };
        assert!(handle.await.expect("join"));

        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "d");
        assert_eq!(router.stats()[0].deliveries_ok, 1);
    }

    #[tokio::test]
    async fn test_immediate_delivery_failure_is_counted() {
        let router = TopicRouter::new(Arc::new(RecordingSink::failing()))
            .with_entry(RouterEntry::new("a", "a/", tagging("a")));

        let DispatchOutcome::Delivering(handle) = router.dispatch("a/x", b"1") else {
            panic!("expected immediate delivery");
        };
        assert!(!handle.await.expect("join"));
        assert_eq!(router.stats()[0].deliveries_failed, 1);
    }

    #[test]
    fn test_subscriptions_union_of_enabled_entries() {
        let router = TopicRouter::new(Arc::new(RecordingSink::default()))
            .with_entry(
                RouterEntry::new("a", "a/", tagging("a"))
                    .subscribe(filter("a/#"))
                    .subscribe(filter("shared/+")),
            )
            .with_entry(
                RouterEntry::new("b", "b/", tagging("b"))
                    .subscribe(filter("b/#"))
                    .subscribe(filter("shared/+")),
            )
            .with_entry(
                RouterEntry::new("c", "c/", tagging("c"))
                    .subscribe(filter("c/#"))
                    .enabled(false),
            );

        let subs: Vec<String> = router
            .subscriptions()
            .iter()
            .map(|f| f.to_string())
            .collect();
        assert_eq!(subs, vec!["a/#", "shared/+", "b/#"]);
    }
}
