// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! emonbridge CLI
//!
//! Forwards MQTT home-automation telemetry to emoncms.
//!
//! # Usage
//!
//! ```bash
//! # Run with a configuration file
//! emonbridge --config emonbridge.toml
//!
//! # Override the broker address
//! emonbridge --config emonbridge.toml --mqtt-host 10.0.0.2 --mqtt-port 1884
//!
//! # Generate / validate configuration
//! emonbridge gen-config --output emonbridge.toml
//! emonbridge validate --config emonbridge.toml
//! ```

use clap::{Parser, Subcommand};
use emonbridge::{Bridge, BridgeConfig, BridgeError, ConfigError, DeliveryConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// MQTT to emoncms telemetry bridge
#[derive(Parser, Debug)]
#[command(name = "emonbridge")]
#[command(about = "emonbridge - MQTT home-automation telemetry to emoncms")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT broker host (overrides the configuration file)
    #[arg(long)]
    mqtt_host: Option<String>,

    /// MQTT broker port (overrides the configuration file)
    #[arg(long)]
    mqtt_port: Option<u16>,

    /// Statistics reporting interval (seconds, 0 to disable)
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "emonbridge.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle subcommands
    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;
    let bridge = Arc::new(Bridge::new(config)?);

    println!("emonbridge v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    for entry in bridge.router().entries() {
        println!(
            "{:<12} {:<20} {}",
            entry.name,
            entry.prefix,
            if entry.enabled { "enabled" } else { "disabled" }
        );
    }
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    bridge.start()?;

    // Stats reporting task
    let stats_interval = args.stats_interval;
    let stats_task = (stats_interval > 0).then(|| {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            let period = Duration::from_secs(stats_interval);
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                print_stats(&bridge);
            }
        })
    });

    wait_for_shutdown().await?;
    println!("\nShutting down...");
    if let Some(task) = stats_task {
        task.abort();
    }
    bridge.stop().await?;

    println!("\nFinal Statistics:");
    print_stats(&bridge);

    Ok(())
}

fn build_config(args: &Args) -> Result<BridgeConfig, BridgeError> {
    let config_path = args.config.as_ref().ok_or_else(|| {
        BridgeError::Config(ConfigError::Invalid(
            "Missing --config (use `gen-config` to create one)".into(),
        ))
    })?;
    let config = BridgeConfig::from_file_with(config_path, |config| {
        if let Some(ref host) = args.mqtt_host {
            config.mqtt.host = host.clone();
        }
        if let Some(port) = args.mqtt_port {
            config.mqtt.port = port;
        }
    })?;

    Ok(config)
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(&BridgeConfig::example())?;

    let content = format!(
        r#"# emonbridge configuration
# Generated by emonbridge gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match BridgeConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!(
                "MQTT:        {}:{} ({})",
                config.mqtt.host,
                config.mqtt.port,
                enabled(config.mqtt.enabled)
            );
            println!(
                "emoncms:     {} ({})",
                config.emoncms.endpoint,
                enabled(config.emoncms.enabled)
            );
            println!(
                "slimmelezer: {} item(s), {}",
                config.slimmelezer.items.len(),
                family(config.slimmelezer.enabled, &config.slimmelezer.delivery)
            );
            println!(
                "alfen:       {} meter(s), {}",
                config.alfen.properties.len(),
                family(config.alfen.enabled, &config.alfen.delivery)
            );
            println!(
                "evcc:        {} loadpoint(s), {}",
                config.evcc.loadpoints.len(),
                family(config.evcc.enabled, &config.evcc.delivery)
            );
            println!(
                "qbus:        {} type(s), {}",
                config.qbus.types.len(),
                family(config.qbus.enabled, &config.qbus.delivery)
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

fn family(flag: bool, delivery: &DeliveryConfig) -> String {
    if !flag {
        return "disabled".into();
    }
    match delivery {
        DeliveryConfig::Immediate => "immediate".into(),
        DeliveryConfig::Batched {
            flush_interval_secs,
        } => format!("batched every {}s", flush_interval_secs),
    }
}

fn print_stats(bridge: &Bridge) {
    println!("--- Route Statistics (MQTT {}) ---", bridge.connection_state());
    for stat in bridge.route_stats() {
        println!(
            "  {}: {} msgs ({:.1} msg/s), {} decoded, {} dropped, {} errors, {} posted, {} failed",
            stat.name,
            stat.messages_routed,
            stat.messages_per_second(),
            stat.messages_decoded,
            stat.messages_dropped,
            stat.decode_errors,
            stat.deliveries_ok,
            stat.deliveries_failed
        );
    }
}
