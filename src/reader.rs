//! Batch register reading with per-parameter retry.
//!
//! One invocation of [`RegisterReader::read_all`] fetches the whole
//! parameter table. Each parameter gets its own bounded retry budget;
//! a parameter that exhausts it degrades to zero and the batch moves
//! on. Only a batch in which nothing succeeded is surfaced as
//! [`BatchOutcome::AllFailed`].

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::link::LinkStatus;
use crate::registers::{MeterReading, Parameter, ParameterDescriptor, PARAMETERS, SuccessBitmap};

/// Extra settling applies to this many parameters at the start of a
/// batch; the meter needs a moment after the first requests.
const WARMUP_PARAMS: usize = 3;

/// Energy counters above this many kWh usually mean a miswired
/// register map rather than a big installation.
const HIGH_ENERGY_NOTE_KWH: f32 = 10_000.0;

/// Error for a single field-bus read.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("read timed out")]
    Timeout,
    #[error("modbus exception: {0}")]
    Exception(String),
    #[error("transport error: {0}")]
    Io(String),
}

impl ReadError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReadError::Timeout)
    }
}

/// Synchronous read access to the meter's input registers.
#[async_trait]
pub trait RegisterChannel: Send {
    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ReadError>;
}

/// Production channel over one Modbus TCP connection.
///
/// The context is established lazily and kept for as long as it works.
/// After a timeout or transport error it is dropped and re-dialed on
/// the next read: a late response would desynchronize the transaction
/// stream otherwise.
pub struct ModbusChannel {
    target: SocketAddr,
    slave: Slave,
    response_timeout: Duration,
    ctx: Option<Context>,
}

impl ModbusChannel {
    pub fn new(target: SocketAddr, unit_id: u8, response_timeout: Duration) -> Self {
        Self {
            target,
            slave: Slave(unit_id),
            response_timeout,
            ctx: None,
        }
    }

    /// Establish the connection eagerly. Best-effort: a failure here is
    /// retried transparently on the first read.
    pub async fn connect(&mut self) -> Result<(), ReadError> {
        self.ensure_connected().await.map(|_| ())
    }

    async fn ensure_connected(&mut self) -> Result<&mut Context, ReadError> {
        if self.ctx.is_none() {
            let ctx = tokio::time::timeout(
                self.response_timeout,
                tcp::connect_slave(self.target, self.slave),
            )
            .await
            .map_err(|_| ReadError::Timeout)?
            .map_err(|e| ReadError::Io(e.to_string()))?;

            debug!(target = %self.target, "Modbus connection established");
            self.ctx = Some(ctx);
        }

        match self.ctx.as_mut() {
            Some(ctx) => Ok(ctx),
            None => Err(ReadError::Io("not connected".to_string())),
        }
    }
}

#[async_trait]
impl RegisterChannel for ModbusChannel {
    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ReadError> {
        let timeout = self.response_timeout;
        let outcome = {
            let ctx = self.ensure_connected().await?;
            tokio::time::timeout(timeout, ctx.read_input_registers(address, count)).await
        };

        match outcome {
            Err(_) => {
                self.ctx = None;
                Err(ReadError::Timeout)
            }
            Ok(Err(e)) => {
                self.ctx = None;
                Err(ReadError::Io(e.to_string()))
            }
            Ok(Ok(Err(exception))) => Err(ReadError::Exception(format!("{:?}", exception))),
            Ok(Ok(Ok(words))) => Ok(words),
        }
    }
}

/// Retry timing shared by every parameter read.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per parameter, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Additional delay per subsequent retry.
    pub step_delay: Duration,
}

impl RetryPolicy {
    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            attempts_made: 0,
            policy: *self,
        }
    }
}

/// Transient counter scoped to a single parameter read and discarded
/// afterwards.
#[derive(Debug)]
pub struct RetryBudget {
    attempts_made: u32,
    policy: RetryPolicy,
}

impl RetryBudget {
    /// Record the start of an attempt and return its 1-based number.
    pub fn start_attempt(&mut self) -> u32 {
        self.attempts_made += 1;
        self.attempts_made
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Delay before the next attempt, or `None` once the budget is
    /// spent. Delays grow linearly: base, base + step, base + 2*step...
    pub fn retry_delay(&self) -> Option<Duration> {
        if self.attempts_made < self.policy.max_attempts {
            let step = self.policy.step_delay * self.attempts_made.saturating_sub(1);
            Some(self.policy.base_delay + step)
        } else {
            None
        }
    }
}

/// Reader timing and diagnostics settings.
#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    pub retry: RetryPolicy,
    /// Consecutive timed-out parameters before the link state is
    /// consulted as a diagnostic.
    pub link_check_after_timeouts: u32,
    /// Settling delay between parameters.
    pub inter_parameter_delay: Duration,
    /// Extra settling after each of the first few parameters.
    pub warmup_delay: Duration,
}

/// Counters for one batch, for logs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub succeeded: u32,
    pub timeouts: u32,
    pub link_checks: u32,
}

/// Classification of a completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every parameter decoded.
    Complete,
    /// Some parameters decoded, the rest left at zero.
    Partial,
    /// Nothing decoded; the caller applies an extended recovery delay
    /// and must not publish the reading.
    AllFailed,
}

impl BatchOutcome {
    fn classify(ok: SuccessBitmap) -> Self {
        if ok.none_set() {
            BatchOutcome::AllFailed
        } else if ok.all_set() {
            BatchOutcome::Complete
        } else {
            BatchOutcome::Partial
        }
    }
}

/// Reads the full parameter table from the meter.
pub struct RegisterReader<C> {
    channel: C,
    link: LinkStatus,
    settings: ReaderSettings,
    stats: BatchStats,
}

impl<C: RegisterChannel> RegisterReader<C> {
    pub fn new(channel: C, link: LinkStatus, settings: ReaderSettings) -> Self {
        Self {
            channel,
            link,
            settings,
            stats: BatchStats::default(),
        }
    }

    /// Counters from the most recent batch.
    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    /// Read all parameters once, in table order.
    ///
    /// Never aborts the batch for one parameter: a failed read leaves
    /// its field at zero and its success bit clear. Values outside the
    /// plausibility ranges are stored anyway and only warned about.
    pub async fn read_all(&mut self) -> (MeterReading, SuccessBitmap, BatchOutcome) {
        let mut reading = MeterReading::new();
        let mut ok = SuccessBitmap::default();
        self.stats = BatchStats::default();
        let mut consecutive_timeouts = 0u32;

        for (index, descriptor) in PARAMETERS.iter().enumerate() {
            match self.read_parameter(descriptor).await {
                Ok(value) => {
                    reading.set(descriptor.id, value);
                    ok.set(descriptor.id);
                    self.stats.succeeded += 1;
                    consecutive_timeouts = 0;
                    debug!(
                        parameter = descriptor.name,
                        value,
                        unit = descriptor.unit,
                        "Parameter decoded"
                    );
                }
                Err(e) => {
                    warn!(
                        parameter = descriptor.name,
                        address = descriptor.address,
                        error = %e,
                        "Parameter read failed, field stays at zero"
                    );

                    if e.is_timeout() {
                        self.stats.timeouts += 1;
                        consecutive_timeouts += 1;
                        if consecutive_timeouts >= self.settings.link_check_after_timeouts {
                            // Diagnostic only; the read path is unchanged.
                            let connected = self.link.is_connected();
                            self.stats.link_checks += 1;
                            consecutive_timeouts = 0;
                            warn!(
                                link_connected = connected,
                                "Repeated timeouts, link state checked"
                            );
                        }
                    } else {
                        consecutive_timeouts = 0;
                    }
                }
            }

            if !self.settings.inter_parameter_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_parameter_delay).await;
            }
            if index < WARMUP_PARAMS && !self.settings.warmup_delay.is_zero() {
                tokio::time::sleep(self.settings.warmup_delay).await;
            }
        }

        let outcome = BatchOutcome::classify(ok);
        info!(
            succeeded = self.stats.succeeded,
            total = Parameter::COUNT,
            timeouts = self.stats.timeouts,
            ?outcome,
            "Batch finished"
        );
        if self.stats.timeouts as usize > Parameter::COUNT / 2 {
            warn!("High timeout rate, consider raising device.response_timeout_ms");
        }

        (reading, ok, outcome)
    }

    /// Read and decode one parameter within its retry budget.
    async fn read_parameter(&mut self, descriptor: &ParameterDescriptor) -> Result<f32, ReadError> {
        let mut budget = self.settings.retry.budget();

        loop {
            let attempt = budget.start_attempt();

            let result = self
                .channel
                .read_input_registers(descriptor.address, descriptor.count)
                .await
                .and_then(|words| {
                    descriptor.decode.decode(&words).ok_or_else(|| {
                        ReadError::Io(format!("short response: {} registers", words.len()))
                    })
                });

            match result {
                Ok(value) => {
                    if !descriptor.is_plausible(value) {
                        warn!(
                            parameter = descriptor.name,
                            value,
                            unit = descriptor.unit,
                            "Value outside plausible range, storing anyway"
                        );
                    }
                    if descriptor.unit == "kWh" && value > HIGH_ENERGY_NOTE_KWH {
                        info!(
                            parameter = descriptor.name,
                            value, "High energy reading, verify the register map"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => match budget.retry_delay() {
                    Some(delay) => {
                        warn!(
                            parameter = descriptor.name,
                            attempt,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Read attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkPolicy, LinkProbe, LinkSupervisor};
    use std::collections::HashMap;

    fn test_link() -> LinkStatus {
        struct NeverUp;

        #[async_trait]
        impl LinkProbe for NeverUp {
            async fn is_up(&self) -> bool {
                false
            }
        }

        LinkSupervisor::new(
            NeverUp,
            LinkPolicy {
                max_attempts: 1,
                backoff: Duration::ZERO,
                monitor_interval: Duration::from_secs(1),
            },
        )
        .status()
    }

    fn quick_settings(max_attempts: u32) -> ReaderSettings {
        ReaderSettings {
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::ZERO,
                step_delay: Duration::ZERO,
            },
            link_check_after_timeouts: 3,
            inter_parameter_delay: Duration::ZERO,
            warmup_delay: Duration::ZERO,
        }
    }

    /// Channel that answers per-address from a fixed script and counts
    /// attempts.
    struct ScriptedChannel {
        ok: HashMap<u16, Vec<u16>>,
        error: fn() -> ReadError,
        attempts: HashMap<u16, u32>,
    }

    impl ScriptedChannel {
        fn new(ok: HashMap<u16, Vec<u16>>, error: fn() -> ReadError) -> Self {
            Self {
                ok,
                error,
                attempts: HashMap::new(),
            }
        }

        fn attempts_for(&self, address: u16) -> u32 {
            self.attempts.get(&address).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl RegisterChannel for ScriptedChannel {
        async fn read_input_registers(
            &mut self,
            address: u16,
            _count: u16,
        ) -> Result<Vec<u16>, ReadError> {
            *self.attempts.entry(address).or_insert(0) += 1;
            match self.ok.get(&address) {
                Some(words) => Ok(words.clone()),
                None => Err((self.error)()),
            }
        }
    }

    fn all_ok_script() -> HashMap<u16, Vec<u16>> {
        // Every parameter decodes to 1.0.
        PARAMETERS
            .iter()
            .map(|d| (d.address, vec![0x0000, 0x3F80]))
            .collect()
    }

    #[test]
    fn test_retry_delays_grow_linearly() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            step_delay: Duration::from_millis(300),
        };
        let mut budget = policy.budget();

        assert_eq!(budget.start_attempt(), 1);
        assert_eq!(budget.retry_delay(), Some(Duration::from_millis(200)));
        assert_eq!(budget.start_attempt(), 2);
        assert_eq!(budget.retry_delay(), Some(Duration::from_millis(500)));
        assert_eq!(budget.start_attempt(), 3);
        assert_eq!(budget.retry_delay(), None);
    }

    #[tokio::test]
    async fn test_complete_batch() {
        let channel = ScriptedChannel::new(all_ok_script(), || ReadError::Timeout);
        let mut reader = RegisterReader::new(channel, test_link(), quick_settings(3));

        let (reading, ok, outcome) = reader.read_all().await;

        assert_eq!(outcome, BatchOutcome::Complete);
        assert!(ok.all_set());
        for id in Parameter::ALL {
            assert_eq!(reading.get(id), 1.0);
        }
        // One attempt per parameter, no retries consumed.
        for descriptor in &PARAMETERS {
            assert_eq!(reader.channel.attempts_for(descriptor.address), 1);
        }
    }

    #[tokio::test]
    async fn test_all_failed_batch() {
        let channel = ScriptedChannel::new(HashMap::new(), || ReadError::Timeout);
        let mut reader = RegisterReader::new(channel, test_link(), quick_settings(3));

        let (reading, ok, outcome) = reader.read_all().await;

        assert_eq!(outcome, BatchOutcome::AllFailed);
        assert!(ok.none_set());
        for id in Parameter::ALL {
            assert_eq!(reading.get(id), 0.0);
        }
    }

    #[tokio::test]
    async fn test_retry_budget_is_respected() {
        let channel = ScriptedChannel::new(HashMap::new(), || ReadError::Timeout);
        let mut reader = RegisterReader::new(channel, test_link(), quick_settings(3));

        reader.read_all().await;

        for descriptor in &PARAMETERS {
            assert_eq!(reader.channel.attempts_for(descriptor.address), 3);
        }
    }

    #[tokio::test]
    async fn test_partial_batch_marks_exact_bits() {
        let mut script = all_ok_script();
        // Fail current, frequency and total energy.
        script.remove(&0x0006);
        script.remove(&0x0046);
        script.remove(&0x0156);

        let channel = ScriptedChannel::new(script, || ReadError::Timeout);
        let mut reader = RegisterReader::new(channel, test_link(), quick_settings(2));

        let (reading, ok, outcome) = reader.read_all().await;

        assert_eq!(outcome, BatchOutcome::Partial);
        assert_eq!(ok.count(), 7);
        assert!(!ok.is_set(Parameter::Current));
        assert!(!ok.is_set(Parameter::Frequency));
        assert!(!ok.is_set(Parameter::TotalEnergy));
        assert_eq!(reading.current, 0.0);
        assert_eq!(reading.frequency, 0.0);
        assert_eq!(reading.total_energy, 0.0);
        assert_eq!(reading.voltage, 1.0);
        assert_eq!(reading.import_energy, 1.0);
    }

    #[tokio::test]
    async fn test_link_checked_after_consecutive_timeouts() {
        let channel = ScriptedChannel::new(HashMap::new(), || ReadError::Timeout);
        let mut reader = RegisterReader::new(channel, test_link(), quick_settings(1));

        reader.read_all().await;

        // 10 timed-out parameters, threshold 3: checked at 3, 6 and 9.
        assert_eq!(reader.stats().timeouts, 10);
        assert_eq!(reader.stats().link_checks, 3);
    }

    #[tokio::test]
    async fn test_non_timeout_failures_skip_link_check() {
        let channel =
            ScriptedChannel::new(HashMap::new(), || ReadError::Exception("Illegal".into()));
        let mut reader = RegisterReader::new(channel, test_link(), quick_settings(1));

        let (_, ok, outcome) = reader.read_all().await;

        assert_eq!(outcome, BatchOutcome::AllFailed);
        assert!(ok.none_set());
        assert_eq!(reader.stats().timeouts, 0);
        assert_eq!(reader.stats().link_checks, 0);
    }

    #[tokio::test]
    async fn test_success_resets_timeout_streak() {
        // Two timeouts, then a success, then two more timeouts: the
        // streak never reaches three.
        let mut script = all_ok_script();
        script.remove(&0x0000);
        script.remove(&0x0006);
        script.remove(&0x0012);
        script.remove(&0x0018);

        let channel = ScriptedChannel::new(script, || ReadError::Timeout);
        let mut reader = RegisterReader::new(channel, test_link(), quick_settings(1));

        reader.read_all().await;

        assert_eq!(reader.stats().timeouts, 4);
        assert_eq!(reader.stats().link_checks, 0);
    }

    #[tokio::test]
    async fn test_implausible_value_stored() {
        let mut script = all_ok_script();
        // Voltage decodes to -1.0, outside [0, 500].
        let bits = (-1.0f32).to_bits();
        script.insert(0x0000, vec![(bits & 0xFFFF) as u16, (bits >> 16) as u16]);

        let channel = ScriptedChannel::new(script, || ReadError::Timeout);
        let mut reader = RegisterReader::new(channel, test_link(), quick_settings(1));

        let (reading, ok, _) = reader.read_all().await;

        assert!(ok.is_set(Parameter::Voltage));
        assert_eq!(reading.voltage, -1.0);
    }
}
