// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge assembly.
//!
//! Builds the sink, router entries, flushers and bus connection from a
//! [`BridgeConfig`] and runs them until stopped.

use crate::config::{BridgeConfig, ConfigError};
use crate::connection::{ConnectionError, ConnectionManager, ConnectionState};
use crate::decode::{AlfenDecoder, Decoder, EvccDecoder, QbusDecoder, SlimmelezerDecoder};
use crate::emoncms::EmoncmsSink;
use crate::flush::Flusher;
use crate::route::{Delivery, RouteStatsSnapshot, RouterEntry};
use crate::router::TopicRouter;
use crate::sink::{Sink, SinkError};
use crate::topic::{InvalidTopicFilter, TopicFilter};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Topic pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Filter(#[from] InvalidTopicFilter),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Bridge not running")]
    NotRunning,

    #[error("Bridge already running")]
    AlreadyRunning,
}

/// Build the router entries of every device family, in dispatch order.
pub fn build_entries(config: &BridgeConfig) -> Result<Vec<RouterEntry>, BridgeError> {
    let slimmelezer = &config.slimmelezer;
    let alfen = &config.alfen;
    let evcc = &config.evcc;
    let qbus = &config.qbus;

    Ok(vec![
        RouterEntry::new(
            "slimmelezer",
            "slimmelezer/",
            Decoder::Slimmelezer(SlimmelezerDecoder::new(slimmelezer)?),
        )
        .subscribe(TopicFilter::new("slimmelezer/sensor/+/state")?)
        .enabled(slimmelezer.enabled)
        .delivery(Delivery::from_config(&slimmelezer.delivery)),
        RouterEntry::new(
            "alfen",
            "alfen/properties/",
            Decoder::Alfen(AlfenDecoder::new(alfen)?),
        )
        .subscribe(TopicFilter::new("alfen/properties/+/category/+")?)
        .enabled(alfen.enabled)
        .delivery(Delivery::from_config(&alfen.delivery)),
        RouterEntry::new("evcc", "evcc/", Decoder::Evcc(EvccDecoder::new(evcc)))
            .subscribe(TopicFilter::new("evcc/#")?)
            .enabled(evcc.enabled)
            .delivery(Delivery::from_config(&evcc.delivery)),
        RouterEntry::new("qbus", "qbus/", Decoder::Qbus(QbusDecoder::new(qbus)?))
            .subscribe(TopicFilter::new("qbus/+/sensor/#")?)
            .enabled(qbus.enabled)
            .delivery(Delivery::from_config(&qbus.delivery)),
    ])
}

/// Build the topic router over `sink`.
pub fn build_router(
    config: &BridgeConfig,
    sink: Arc<dyn Sink>,
) -> Result<TopicRouter, BridgeError> {
    let mut router = TopicRouter::new(sink).with_delivery_timeout(config.emoncms.timeout());
    for entry in build_entries(config)? {
        router.register(entry);
    }
    Ok(router)
}

/// The running telemetry bridge.
pub struct Bridge {
    config: BridgeConfig,
    sink: Arc<dyn Sink>,
    router: Arc<TopicRouter>,
    connection: Option<ConnectionManager>,
    running: Arc<AtomicBool>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    flushers: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Create a bridge posting to the configured emoncms endpoint.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let sink = Arc::new(EmoncmsSink::new(&config.emoncms)?);
        if sink.is_enabled() {
            tracing::info!("emoncms: {}", sink.url());
        } else {
            tracing::info!("emoncms disabled, drained metrics are discarded");
        }
        Self::with_sink(config, sink)
    }

    /// Create a bridge over any sink.
    pub fn with_sink(config: BridgeConfig, sink: Arc<dyn Sink>) -> Result<Self, BridgeError> {
        config.validate()?;
        let router = Arc::new(build_router(&config, Arc::clone(&sink))?);
        let connection = config
            .mqtt
            .enabled
            .then(|| ConnectionManager::new(config.mqtt.clone(), Arc::clone(&router)));

        Ok(Self {
            config,
            sink,
            router,
            connection,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            flushers: Mutex::new(Vec::new()),
        })
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Bus connection state; `Disconnected` when MQTT is disabled.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map(ConnectionManager::state)
            .unwrap_or_default()
    }

    /// Statistics of every router entry.
    pub fn route_stats(&self) -> Vec<RouteStatsSnapshot> {
        self.router.stats()
    }

    /// Spawn the flushers and the bus connection.
    pub fn start(&self) -> Result<(), BridgeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut flushers = self.flushers.lock();
        for entry in self.router.entries().iter().filter(|e| e.enabled) {
            if let Delivery::Batched { cache, interval } = &entry.delivery {
                let flusher = Flusher::new(
                    entry.name.clone(),
                    Arc::clone(cache),
                    Arc::clone(&self.sink),
                    *interval,
                )
                .with_timeout(self.config.emoncms.timeout())
                .with_stats(Arc::clone(&entry.stats));
                flushers.push(flusher.spawn(shutdown_rx.clone()));
            }
        }
        *self.shutdown.lock() = Some(shutdown_tx);

        match &self.connection {
            Some(connection) => connection.start(),
            None => tracing::warn!("MQTT is disabled"),
        }

        tracing::info!("Bridge started with {} flusher(s)", flushers.len());
        Ok(())
    }

    /// Stop timers and disconnect.
    ///
    /// Deliveries already in flight finish on their own timeout.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::NotRunning);
        }

        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        if let Some(connection) = &self.connection {
            match connection.stop().await {
                Ok(()) | Err(ConnectionError::NotRunning) => {}
                Err(e) => tracing::warn!("Error stopping connection: {}", e),
            }
        }

        let flushers = std::mem::take(&mut *self.flushers.lock());
        for handle in flushers {
            if let Err(e) = handle.await {
                tracing::warn!("Flusher task failed: {}", e);
            }
        }

        tracing::info!("Bridge stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("router", &self.router)
            .field("connection", &self.connection)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::sink::testing::RecordingSink;
    use std::time::Duration;

    fn offline_config() -> BridgeConfig {
        let mut config = BridgeConfig::example();
        config.mqtt.enabled = false;
        config
    }

    #[test]
    fn test_entries_registration_order() {
        let entries = build_entries(&BridgeConfig::example()).expect("entries");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["slimmelezer", "alfen", "evcc", "qbus"]);

        let alfen = &entries[1];
        assert_eq!(alfen.prefix, "alfen/properties/");
        assert!(!alfen.delivery.is_batched());
        assert!(entries[0].delivery.is_batched());
        assert!(entries[2].delivery.is_batched());
        assert!(entries[3].delivery.is_batched());
    }

    #[test]
    fn test_disabled_family_not_subscribed() {
        let mut config = BridgeConfig::example();
        config.qbus.enabled = false;
        let router = build_router(&config, Arc::new(RecordingSink::default())).expect("router");

        let subs: Vec<String> = router
            .subscriptions()
            .iter()
            .map(|f| f.to_string())
            .collect();
        assert_eq!(
            subs,
            vec![
                "slimmelezer/sensor/+/state",
                "alfen/properties/+/category/+",
                "evcc/#"
            ]
        );
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = BridgeConfig::example();
        config.emoncms.endpoint.clear();
        assert!(matches!(
            Bridge::new(config),
            Err(BridgeError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_with_sink_rejects_zero_flush_interval() {
        let mut config = offline_config();
        config.slimmelezer.delivery = DeliveryConfig::Batched {
            flush_interval_secs: 0,
        };
        let result = Bridge::with_sink(config, Arc::new(RecordingSink::default()));
        assert!(matches!(
            result,
            Err(BridgeError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_flush_stop() {
        let sink = Arc::new(RecordingSink::default());
        let bridge = Bridge::with_sink(offline_config(), sink.clone()).expect("bridge");
        assert_eq!(bridge.connection_state(), ConnectionState::Disconnected);

        bridge.start().expect("start");
        assert!(matches!(bridge.start(), Err(BridgeError::AlreadyRunning)));

        bridge.router().dispatch(
            "slimmelezer/sensor/power_consumed_phase_1/state",
            b"1200.5",
        );
        tokio::time::sleep(Duration::from_secs(6)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "slimmelezer");

        let stats = bridge.route_stats();
        assert_eq!(stats[0].messages_decoded, 1);
        assert_eq!(stats[0].deliveries_ok, 1);

        bridge.stop().await.expect("stop");
        assert!(!bridge.is_running());
        assert!(matches!(bridge.stop().await, Err(BridgeError::NotRunning)));
    }
}
