//! MQTT session management.
//!
//! Owns the broker session state and the rumqttc event loop. The
//! session state cell is written only by the event-loop driver task;
//! the publisher reads it. Publishing is enqueue-only: delivery
//! confirmations surface here asynchronously and are never awaited.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ShutdownFlag;
use crate::config::MqttConfig;

/// Delay before re-polling the event loop after a connection error.
/// rumqttc redials on the next poll; this just paces the attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Broker session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

/// Shared view of the broker session.
///
/// Mutated only by the event-loop driver; everything else reads. A
/// (re)connection also arms the discovery-pending flag so the next
/// publish emits the discovery batch exactly once.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

#[derive(Debug, Default)]
struct SessionShared {
    connected: AtomicBool,
    discovery_pending: AtomicBool,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        if self.is_connected() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Driven by the broker event loop on a connection acknowledgment.
    pub fn set_connected(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.discovery_pending.store(true, Ordering::SeqCst);
    }

    /// Driven by the broker event loop on disconnect or error.
    pub fn set_disconnected(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    /// Consume the discovery-pending flag. Returns true at most once
    /// per (re)connection.
    pub fn take_discovery_pending(&self) -> bool {
        self.inner.discovery_pending.swap(false, Ordering::SeqCst)
    }
}

/// Quality of service for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
}

impl From<QosLevel> for QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => QoS::AtMostOnce,
            QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// Broker publish errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },
}

/// Publish access to the broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Enqueue one message. Returns once queued, not once delivered.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BrokerError>;
}

/// Production channel over a rumqttc client.
#[derive(Clone)]
pub struct MqttChannel {
    client: AsyncClient,
}

impl MqttChannel {
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "Broker disconnect while already closed");
        }
    }
}

#[async_trait]
impl BrokerChannel for MqttChannel {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.client
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| BrokerError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }
}

/// Build the broker session and spawn its event-loop driver.
///
/// The last-will message is registered here, at session setup: an
/// ungraceful disconnect makes the broker itself publish the retained
/// "offline" on the availability topic.
pub fn connect(
    config: &MqttConfig,
    shutdown: ShutdownFlag,
) -> (MqttChannel, SessionHandle, JoinHandle<()>) {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_last_will(LastWill::new(
        config.status_topic(),
        "offline",
        QoS::AtMostOnce,
        true,
    ));

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.clone());
        info!(username = %username, "Using MQTT authentication");
    } else {
        info!("Using anonymous MQTT connection");
    }

    let (client, mut eventloop) = AsyncClient::new(options, 16);
    let handle = SessionHandle::new();

    let driver_handle = handle.clone();
    let broker = format!("{}:{}", config.host, config.port);
    let driver = tokio::spawn(async move {
        loop {
            if shutdown.is_requested() {
                break;
            }

            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(broker = %broker, code = ?ack.code, "Connected to MQTT broker");
                    driver_handle.set_connected();
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!(broker = %broker, "MQTT broker closed the session");
                    driver_handle.set_disconnected();
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    debug!(pkid = ack.pkid, "Publish acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    driver_handle.set_disconnected();
                    warn!(broker = %broker, error = %e, "MQTT connection error");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }

        info!("MQTT event loop stopped");
    });

    (MqttChannel { client }, handle, driver)
}
