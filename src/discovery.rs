//! Home Assistant MQTT discovery templating.
//!
//! One retained config message per sensor, published to
//! `<prefix>/sensor/sdm120_<host>/<object_id>/config` so a downstream
//! consumer can auto-configure all ten sensors. The publisher triggers
//! this exactly once per broker (re)connection.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::mqtt::{BrokerChannel, QosLevel};
use crate::publisher::PublishStats;
use crate::registers::Parameter;

/// Pacing between discovery messages so the burst does not overwhelm
/// the broker.
const MESSAGE_PACING: Duration = Duration::from_millis(50);

/// Discovery metadata for one sensor.
struct SensorMeta {
    id: Parameter,
    label: &'static str,
    device_class: &'static str,
    unit: &'static str,
    state_class: &'static str,
    icon: &'static str,
}

/// Sensor metadata, aligned with the parameter table.
const SENSORS: [SensorMeta; Parameter::COUNT] = [
    SensorMeta {
        id: Parameter::Voltage,
        label: "Voltage",
        device_class: "voltage",
        unit: "V",
        state_class: "measurement",
        icon: "mdi:flash",
    },
    SensorMeta {
        id: Parameter::Current,
        label: "Current",
        device_class: "current",
        unit: "A",
        state_class: "measurement",
        icon: "mdi:current-ac",
    },
    SensorMeta {
        id: Parameter::ActivePower,
        label: "Active Power",
        device_class: "power",
        unit: "W",
        state_class: "measurement",
        icon: "mdi:flash",
    },
    SensorMeta {
        id: Parameter::ApparentPower,
        label: "Apparent Power",
        device_class: "apparent_power",
        unit: "VA",
        state_class: "measurement",
        icon: "mdi:flash-outline",
    },
    SensorMeta {
        id: Parameter::ReactivePower,
        label: "Reactive Power",
        device_class: "reactive_power",
        unit: "var",
        state_class: "measurement",
        icon: "mdi:flash-outline",
    },
    SensorMeta {
        id: Parameter::PowerFactor,
        label: "Power Factor",
        device_class: "power_factor",
        unit: "",
        state_class: "measurement",
        icon: "mdi:cosine-wave",
    },
    SensorMeta {
        id: Parameter::Frequency,
        label: "Frequency",
        device_class: "frequency",
        unit: "Hz",
        state_class: "measurement",
        icon: "mdi:sine-wave",
    },
    SensorMeta {
        id: Parameter::ImportEnergy,
        label: "Import Energy",
        device_class: "energy",
        unit: "kWh",
        state_class: "total_increasing",
        icon: "mdi:transmission-tower-import",
    },
    SensorMeta {
        id: Parameter::ExportEnergy,
        label: "Export Energy",
        device_class: "energy",
        unit: "kWh",
        state_class: "total_increasing",
        icon: "mdi:transmission-tower-export",
    },
    SensorMeta {
        id: Parameter::TotalEnergy,
        label: "Total Energy",
        device_class: "energy",
        unit: "kWh",
        state_class: "total_increasing",
        icon: "mdi:lightning-bolt",
    },
];

/// Topic-safe device identifier derived from the meter address.
fn device_slug(host: &str) -> String {
    format!("sdm120_{}", host.replace('.', "_"))
}

/// Discovery config topic for one sensor.
pub fn config_topic(discovery_prefix: &str, host: &str, object_id: &str) -> String {
    format!(
        "{}/sensor/{}/{}/config",
        discovery_prefix,
        device_slug(host),
        object_id
    )
}

/// Device block shared by all sensors, grouping them under one device.
fn device_block(host: &str) -> serde_json::Value {
    json!({
        "identifiers": [device_slug(host)],
        "name": "SDM120 Energy Meter",
        "model": "SDM120",
        "manufacturer": "Eastron",
        "sw_version": concat!("mqtt-bridge-sdm120/", env!("CARGO_PKG_VERSION")),
        "configuration_url": format!("http://{}", host),
    })
}

/// Discovery config payload for one sensor.
fn config_payload(meta: &SensorMeta, topic_prefix: &str, host: &str) -> serde_json::Value {
    let object_id = meta.id.field_name();
    let unique_id = format!("{}_{}", device_slug(host), object_id);

    json!({
        "name": meta.label,
        "object_id": unique_id,
        "unique_id": unique_id,
        "state_topic": format!("{}/{}", topic_prefix, object_id),
        "availability_topic": format!("{}/status", topic_prefix),
        "device_class": meta.device_class,
        "unit_of_measurement": meta.unit,
        "state_class": meta.state_class,
        "icon": meta.icon,
        "value_template": "{{ value | float }}",
        "device": device_block(host),
    })
}

/// Publish the discovery batch: one retained config message per sensor.
pub async fn publish_discovery<C: BrokerChannel>(
    channel: &C,
    discovery_prefix: &str,
    topic_prefix: &str,
    host: &str,
) -> PublishStats {
    let mut stats = PublishStats::default();

    for meta in &SENSORS {
        let topic = config_topic(discovery_prefix, host, meta.id.field_name());
        let payload = config_payload(meta, topic_prefix, host);

        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                match channel
                    .publish(&topic, bytes, QosLevel::AtMostOnce, true)
                    .await
                {
                    Ok(()) => {
                        stats.success += 1;
                        debug!(sensor = meta.label, topic = %topic, "Discovery config published");
                    }
                    Err(e) => {
                        stats.failed += 1;
                        warn!(sensor = meta.label, error = %e, "Discovery publish failed");
                    }
                }
            }
            Err(e) => {
                stats.failed += 1;
                warn!(sensor = meta.label, error = %e, "Discovery payload encoding failed");
            }
        }

        tokio::time::sleep(MESSAGE_PACING).await;
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_topic_sanitizes_host() {
        assert_eq!(
            config_topic("homeassistant", "192.168.1.50", "voltage"),
            "homeassistant/sensor/sdm120_192_168_1_50/voltage/config"
        );
    }

    #[test]
    fn test_sensor_table_covers_all_parameters() {
        for (i, meta) in SENSORS.iter().enumerate() {
            assert_eq!(meta.id.index(), i);
        }
    }

    #[test]
    fn test_config_payload_shape() {
        let meta = &SENSORS[Parameter::Voltage.index()];
        let payload = config_payload(meta, "energy/sdm120", "192.168.1.50");

        assert_eq!(payload["name"], "Voltage");
        assert_eq!(payload["unique_id"], "sdm120_192_168_1_50_voltage");
        assert_eq!(payload["state_topic"], "energy/sdm120/voltage");
        assert_eq!(payload["availability_topic"], "energy/sdm120/status");
        assert_eq!(payload["device_class"], "voltage");
        assert_eq!(payload["unit_of_measurement"], "V");
        assert_eq!(payload["device"]["manufacturer"], "Eastron");
        assert_eq!(
            payload["device"]["identifiers"][0],
            "sdm120_192_168_1_50"
        );
        assert_eq!(
            payload["device"]["configuration_url"],
            "http://192.168.1.50"
        );
    }

    #[test]
    fn test_energy_sensors_are_total_increasing() {
        for meta in &SENSORS {
            if meta.unit == "kWh" {
                assert_eq!(meta.state_class, "total_increasing");
                assert_eq!(meta.device_class, "energy");
            }
        }
    }
}
