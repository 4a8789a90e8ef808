//! MQTT bridge for the Eastron SDM120 energy meter.
//!
//! The bridge polls a single SDM120 over Modbus TCP, decodes the meter's
//! word-swapped IEEE-754 float encoding, and republishes readings to an
//! MQTT broker.
//!
//! # Topics
//!
//! ```text
//! <prefix>/data            complete reading as JSON
//! <prefix>/<field>         one plain-decimal value per parameter
//! <prefix>/status          retained availability ("online"/"offline")
//! ```
//!
//! Where `<field>` is one of `voltage`, `current`, `active_power`,
//! `apparent_power`, `reactive_power`, `power_factor`, `frequency`,
//! `import_energy`, `export_energy`, `total_energy`.
//!
//! Home Assistant discovery messages are additionally published under
//! the configured discovery prefix once per broker (re)connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod config;
pub mod discovery;
pub mod link;
pub mod mqtt;
pub mod poll;
pub mod publisher;
pub mod reader;
pub mod registers;

use crate::config::{LogFormat, LoggingConfig};

/// Cooperative shutdown flag shared by the long-running loops.
///
/// Loops never cancel work mid-flight; they consult the flag at each
/// iteration boundary.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Initialize tracing with the given configuration.
///
/// The level can be overridden through `RUST_LOG`.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
    }

    Ok(())
}
