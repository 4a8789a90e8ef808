//! MQTT bridge for the Eastron SDM120 energy meter.
//!
//! Polls one meter over Modbus TCP and republishes readings to an MQTT
//! broker. Configuration errors abort startup; every runtime failure is
//! retried or degraded, never fatal.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use mqtt_bridge_sdm120::config::BridgeConfig;
use mqtt_bridge_sdm120::link::{LinkPolicy, LinkSupervisor, TcpProbe};
use mqtt_bridge_sdm120::poll::{PollLoop, PollSettings};
use mqtt_bridge_sdm120::publisher::{PublisherSettings, TelemetryPublisher};
use mqtt_bridge_sdm120::reader::{ModbusChannel, ReaderSettings, RegisterReader, RetryPolicy};
use mqtt_bridge_sdm120::{ShutdownFlag, init_tracing, mqtt};

/// MQTT bridge for the Eastron SDM120 energy meter (Modbus TCP).
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge-sdm120")]
#[command(about = "Polls an SDM120 energy meter and publishes to MQTT")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "sdm120.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The only fatal path: an invalid target must never be polled.
    let config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut log_config = config.logging.clone();
    if let Some(level) = &args.log_level {
        log_config.level = level.clone();
    }
    init_tracing(&log_config)?;

    let device_addr = config.device.socket_addr()?;
    info!(device = %device_addr, broker = %config.mqtt.host, "Starting mqtt-bridge-sdm120");

    let shutdown = ShutdownFlag::new();

    // Link supervision: one bounded wait at startup, then the monitor
    // self-heals in the background forever.
    let probe = TcpProbe::new(
        config.link.probe_addr(&config.device)?,
        config.link.probe_timeout(),
    );
    let supervisor = LinkSupervisor::new(
        probe,
        LinkPolicy {
            max_attempts: config.link.max_attempts,
            backoff: config.link.backoff(),
            monitor_interval: config.link.monitor_interval(),
        },
    );
    let link = supervisor.status();

    let state = supervisor.connect_and_wait(config.link.connect_timeout()).await;
    if state.is_connected() {
        info!("Link up at startup");
    } else {
        warn!(?state, "Link not up at startup, monitor keeps retrying");
    }
    let monitor = tokio::spawn(supervisor.run_monitor(shutdown.clone()));

    // Field-bus channel: best-effort eager dial, re-dialed on demand.
    let mut channel = ModbusChannel::new(
        device_addr,
        config.device.unit_id,
        config.device.response_timeout(),
    );
    match channel.connect().await {
        Ok(()) => info!("Modbus connection established"),
        Err(e) => warn!(error = %e, "Modbus connection pending, will retry on first read"),
    }

    // Broker session with its event-loop driver.
    let (broker, session, mqtt_driver) = mqtt::connect(&config.mqtt, shutdown.clone());

    let reader = RegisterReader::new(
        channel,
        link,
        ReaderSettings {
            retry: RetryPolicy {
                max_attempts: config.retry.max_attempts,
                base_delay: config.retry.base_delay(),
                step_delay: config.retry.step_delay(),
            },
            link_check_after_timeouts: config.retry.link_check_after_timeouts,
            inter_parameter_delay: config.device.inter_parameter_delay(),
            warmup_delay: config.device.warmup_delay(),
        },
    );

    let publisher = TelemetryPublisher::new(
        broker.clone(),
        session.clone(),
        PublisherSettings {
            topic_prefix: config.mqtt.topic_prefix.clone(),
            device_ip: config.device.host.clone(),
            individual_topics: config.mqtt.individual_topics,
            discovery_prefix: config
                .mqtt
                .discovery
                .enabled
                .then(|| config.mqtt.discovery.prefix.clone()),
            discovery_settle_delay: config.mqtt.discovery.settle_delay(),
        },
    );

    // For the explicit offline marker on graceful shutdown.
    let farewell = TelemetryPublisher::new(
        broker.clone(),
        session.clone(),
        PublisherSettings {
            topic_prefix: config.mqtt.topic_prefix.clone(),
            device_ip: config.device.host.clone(),
            individual_topics: false,
            discovery_prefix: None,
            discovery_settle_delay: Duration::ZERO,
        },
    );

    let poll = PollLoop::new(
        reader,
        publisher,
        PollSettings {
            period: config.poll.period(),
            recovery_delay: config.poll.recovery_delay(),
        },
        shutdown.clone(),
    );
    let poll_task = tokio::spawn(poll.run());

    info!("Bridge running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    shutdown.request();

    // Leave a retained offline marker while the event loop still runs,
    // then tear everything down.
    if session.is_connected() {
        farewell.publish_offline().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    broker.disconnect().await;

    poll_task.abort();
    monitor.abort();
    mqtt_driver.abort();

    info!("Bridge stopped");
    Ok(())
}
