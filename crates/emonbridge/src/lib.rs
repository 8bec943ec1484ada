// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT to emoncms telemetry bridge
//!
//! Subscribes to home-automation telemetry on an MQTT broker, extracts named
//! values per device family and forwards them to an emoncms input endpoint.
//!
//! # Features
//!
//! - **Supervised connection**: reconnects forever after failed connects and
//!   dropped connections
//! - **First-match routing**: one router entry per device family, selected by
//!   topic prefix in registration order
//! - **Aggregation**: bursts of updates coalesce to the latest value per
//!   `(device, metric)` and are flushed periodically
//! - **Best-effort delivery**: failed posts are logged and dropped
//!
//! # Quick Start
//!
//! ```bash
//! # Write an example configuration
//! emonbridge gen-config --output emonbridge.toml
//!
//! # Run the bridge
//! emonbridge --config emonbridge.toml
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! [mqtt]
//! host = "127.0.0.1"
//! port = 1883
//!
//! [emoncms]
//! endpoint = "http://127.0.0.1/emoncms"
//! apikey = "..."
//!
//! [slimmelezer.items]
//! power_consumed_phase_1 = "power1"
//! ```

pub mod bridge;
pub mod cache;
pub mod config;
pub mod connection;
pub mod decode;
pub mod emoncms;
pub mod flush;
pub mod route;
pub mod router;
pub mod sink;
pub mod topic;
pub mod value;

pub use bridge::{Bridge, BridgeError};
pub use cache::{AggregationCache, Snapshot};
pub use config::{BridgeConfig, ConfigError, DeliveryConfig};
pub use connection::{ConnectionError, ConnectionManager, ConnectionState};
pub use decode::{DecodeError, Decoder};
pub use emoncms::EmoncmsSink;
pub use flush::Flusher;
pub use route::{Delivery, RouteStats, RouteStatsSnapshot, RouterEntry};
pub use router::{DispatchOutcome, TopicRouter};
pub use sink::{DeliveryReport, Sink, SinkError};
pub use topic::TopicFilter;
pub use value::{DeviceReadings, MetricMap, MetricValue};
