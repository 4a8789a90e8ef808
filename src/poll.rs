//! Fixed-cadence poll loop.
//!
//! Reads the whole parameter table, hands the result to the publisher,
//! sleeps, repeats. The only cadence change it ever makes is one extra
//! recovery delay after a cycle in which every read failed; publish
//! outcomes are logged and never steer the loop.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ShutdownFlag;
use crate::mqtt::BrokerChannel;
use crate::publisher::{PublishOutcome, TelemetryPublisher};
use crate::reader::{BatchOutcome, RegisterChannel, RegisterReader};

/// Poll cadence settings.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Delay between cycles.
    pub period: Duration,
    /// Extra delay after an all-failed cycle, giving the device and the
    /// link room to recover.
    pub recovery_delay: Duration,
}

/// Drives read-and-publish cycles until shutdown.
pub struct PollLoop<C: RegisterChannel, B: BrokerChannel> {
    reader: RegisterReader<C>,
    publisher: TelemetryPublisher<B>,
    settings: PollSettings,
    shutdown: ShutdownFlag,
}

impl<C: RegisterChannel, B: BrokerChannel> PollLoop<C, B> {
    pub fn new(
        reader: RegisterReader<C>,
        publisher: TelemetryPublisher<B>,
        settings: PollSettings,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            reader,
            publisher,
            settings,
            shutdown,
        }
    }

    /// Run until the shutdown flag is set. The flag is consulted only
    /// at cycle boundaries; a cycle in flight always completes.
    pub async fn run(mut self) {
        info!(
            period_ms = self.settings.period.as_millis() as u64,
            "Poll loop started"
        );
        let mut cycle: u64 = 0;

        while !self.shutdown.is_requested() {
            cycle += 1;
            let (reading, ok, outcome) = self.reader.read_all().await;

            match outcome {
                BatchOutcome::AllFailed => {
                    warn!(cycle, "Every parameter failed, delaying before the next cycle");
                    tokio::time::sleep(self.settings.recovery_delay).await;
                }
                BatchOutcome::Complete | BatchOutcome::Partial => {
                    info!(
                        cycle,
                        ok = ok.count(),
                        voltage = reading.voltage,
                        active_power = reading.active_power,
                        total_energy = reading.total_energy,
                        "Cycle read"
                    );

                    match self.publisher.publish(&reading, ok).await {
                        PublishOutcome::Published(stats) if stats.failed > 0 => {
                            warn!(cycle, failed = stats.failed, "Some publishes failed");
                        }
                        PublishOutcome::Published(stats) => {
                            debug!(cycle, sent = stats.success, "Cycle published");
                        }
                        PublishOutcome::NotConnected => {
                            debug!(cycle, "Broker session down, reading dropped this cycle");
                        }
                    }
                }
            }

            tokio::time::sleep(self.settings.period).await;
        }

        info!("Poll loop stopped");
    }
}
