//! Telemetry publishing.
//!
//! One call to [`TelemetryPublisher::publish`] emits the whole message
//! set for a poll cycle: the aggregate JSON document, optionally one
//! plain-decimal message per parameter, and the retained availability
//! marker. Everything is enqueue-only; per-message failures are counted
//! and logged, never escalated.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::discovery;
use crate::mqtt::{BrokerChannel, QosLevel, SessionHandle};
use crate::registers::{MeterReading, PARAMETERS, SuccessBitmap};

/// Outcome of one publish cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The message set was enqueued; counts per message below.
    Published(PublishStats),
    /// Broker session down. Nothing is buffered; the next poll cycle
    /// simply tries again.
    NotConnected,
}

/// Counters for one batch of publishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub success: usize,
    pub failed: usize,
}

impl PublishStats {
    pub fn total(&self) -> usize {
        self.success + self.failed
    }
}

/// Publisher settings, fixed at startup.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Topic prefix for all telemetry.
    pub topic_prefix: String,
    /// Meter address, included in the aggregate payload.
    pub device_ip: String,
    /// Publish each parameter to its own subtopic.
    pub individual_topics: bool,
    /// Discovery prefix; `None` disables discovery.
    pub discovery_prefix: Option<String>,
    /// Delay between a connection event and the discovery batch.
    pub discovery_settle_delay: Duration,
}

/// Publishes meter readings to the broker.
pub struct TelemetryPublisher<C: BrokerChannel> {
    channel: C,
    session: SessionHandle,
    settings: PublisherSettings,
}

impl<C: BrokerChannel> TelemetryPublisher<C> {
    pub fn new(channel: C, session: SessionHandle, settings: PublisherSettings) -> Self {
        Self {
            channel,
            session,
            settings,
        }
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.settings.topic_prefix, suffix)
    }

    /// Publish one reading.
    ///
    /// The success bitmap is informational: fields whose read failed
    /// this cycle are published as zero like everything else. On the
    /// first publish after a broker (re)connection the discovery batch
    /// goes out first, after a short settling delay.
    pub async fn publish(&self, reading: &MeterReading, ok: SuccessBitmap) -> PublishOutcome {
        if !self.session.is_connected() {
            debug!("Broker session down, skipping publish");
            return PublishOutcome::NotConnected;
        }

        if self.session.take_discovery_pending() {
            if let Some(prefix) = &self.settings.discovery_prefix {
                tokio::time::sleep(self.settings.discovery_settle_delay).await;
                let stats = discovery::publish_discovery(
                    &self.channel,
                    prefix,
                    &self.settings.topic_prefix,
                    &self.settings.device_ip,
                )
                .await;
                info!(
                    sent = stats.success,
                    failed = stats.failed,
                    "Discovery batch published"
                );
            }
        }

        let mut stats = PublishStats::default();

        let aggregate = aggregate_payload(reading, &self.settings.device_ip);
        self.send(
            &self.topic("data"),
            aggregate.to_string().into_bytes(),
            false,
            &mut stats,
        )
        .await;

        if self.settings.individual_topics {
            for descriptor in &PARAMETERS {
                let value = format_value(reading.get(descriptor.id), descriptor.precision);
                self.send(
                    &self.topic(descriptor.id.field_name()),
                    value.into_bytes(),
                    false,
                    &mut stats,
                )
                .await;
            }
        }

        self.send(
            &self.topic("status"),
            b"online".to_vec(),
            true,
            &mut stats,
        )
        .await;

        debug!(
            sent = stats.success,
            failed = stats.failed,
            ok = ok.count(),
            "Reading published"
        );
        PublishOutcome::Published(stats)
    }

    /// Retained "offline" marker, for graceful shutdown. Ungraceful
    /// exits are covered by the last-will registered at session setup.
    pub async fn publish_offline(&self) {
        let mut stats = PublishStats::default();
        self.send(&self.topic("status"), b"offline".to_vec(), true, &mut stats)
            .await;
    }

    async fn send(&self, topic: &str, payload: Vec<u8>, retain: bool, stats: &mut PublishStats) {
        match self
            .channel
            .publish(topic, payload, QosLevel::AtMostOnce, retain)
            .await
        {
            Ok(()) => stats.success += 1,
            Err(e) => {
                stats.failed += 1;
                warn!(topic = %topic, error = %e, "Publish failed");
            }
        }
    }
}

/// Round to the wire precision before serialization; a raw f32 widened
/// to f64 would leak representation artifacts into the payload.
fn rounded(value: f32, precision: usize) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (f64::from(value) * factor).round() / factor
}

/// Fixed-precision plain-decimal payload for an individual topic.
fn format_value(value: f32, precision: usize) -> String {
    format!("{:.*}", precision, value)
}

/// The aggregate JSON document.
fn aggregate_payload(reading: &MeterReading, device_ip: &str) -> serde_json::Value {
    let mut payload = json!({
        "timestamp": reading.timestamp,
        "device_ip": device_ip,
    });

    for descriptor in &PARAMETERS {
        payload[descriptor.id.field_name()] =
            json!(rounded(reading.get(descriptor.id), descriptor.precision));
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Parameter;

    #[test]
    fn test_format_value_precision() {
        assert_eq!(format_value(230.2, 2), "230.20");
        assert_eq!(format_value(0.867, 3), "0.867");
        assert_eq!(format_value(0.0, 3), "0.000");
        assert_eq!(format_value(-0.5, 2), "-0.50");
    }

    #[test]
    fn test_rounded_strips_f32_artifacts() {
        // 230.2f32 widens to 230.1999969482422; the payload must not.
        assert_eq!(rounded(230.2, 2), 230.2);
        assert_eq!(rounded(0.8674999, 3), 0.867);
        assert_eq!(rounded(0.0, 3), 0.0);
    }

    #[test]
    fn test_aggregate_payload_keys() {
        let mut reading = MeterReading::new();
        reading.set(Parameter::Voltage, 230.2);
        reading.set(Parameter::Current, 4.321);

        let payload = aggregate_payload(&reading, "192.168.1.50");

        assert_eq!(payload["device_ip"], "192.168.1.50");
        assert_eq!(payload["timestamp"], reading.timestamp);
        assert_eq!(payload["voltage"], 230.2);
        assert_eq!(payload["current"], 4.321);
        // Failed fields are present and zero.
        assert_eq!(payload["frequency"], 0.0);
        assert_eq!(payload["total_energy"], 0.0);

        let object = payload.as_object().unwrap();
        assert_eq!(object.len(), 2 + Parameter::COUNT);
        for id in Parameter::ALL {
            assert!(object.contains_key(id.field_name()));
        }
    }
}
