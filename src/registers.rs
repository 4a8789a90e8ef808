//! SDM120 parameter table and register decoding.
//!
//! The meter exposes each electrical quantity as a pair of 16-bit input
//! registers holding one IEEE-754 float with its two words swapped on
//! the wire. Decoding swaps them back before reinterpretation; getting
//! the direction wrong produces plausible-looking values that are off
//! by dozens of orders of magnitude.

use chrono::Utc;

/// The fixed set of parameters read from the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    Voltage,
    Current,
    ActivePower,
    ApparentPower,
    ReactivePower,
    PowerFactor,
    Frequency,
    ImportEnergy,
    ExportEnergy,
    TotalEnergy,
}

impl Parameter {
    pub const COUNT: usize = 10;

    /// All parameters in read order.
    pub const ALL: [Parameter; Self::COUNT] = [
        Parameter::Voltage,
        Parameter::Current,
        Parameter::ActivePower,
        Parameter::ApparentPower,
        Parameter::ReactivePower,
        Parameter::PowerFactor,
        Parameter::Frequency,
        Parameter::ImportEnergy,
        Parameter::ExportEnergy,
        Parameter::TotalEnergy,
    ];

    /// Position in the table, also the parameter's bit in the success
    /// bitmap.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Field name used in payload keys and topic suffixes.
    pub fn field_name(self) -> &'static str {
        match self {
            Parameter::Voltage => "voltage",
            Parameter::Current => "current",
            Parameter::ActivePower => "active_power",
            Parameter::ApparentPower => "apparent_power",
            Parameter::ReactivePower => "reactive_power",
            Parameter::PowerFactor => "power_factor",
            Parameter::Frequency => "frequency",
            Parameter::ImportEnergy => "import_energy",
            Parameter::ExportEnergy => "export_energy",
            Parameter::TotalEnergy => "total_energy",
        }
    }
}

/// Register-to-value decoding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKind {
    /// IEEE-754 float across two registers, words swapped on the wire.
    F32WordSwapped,
}

impl DecodeKind {
    /// Decode raw register words. Returns `None` on a short response.
    pub fn decode(self, words: &[u16]) -> Option<f32> {
        match self {
            DecodeKind::F32WordSwapped => {
                if words.len() >= 2 {
                    Some(decode_f32_word_swapped([words[0], words[1]]))
                } else {
                    None
                }
            }
        }
    }
}

/// One entry of the fixed parameter table.
#[derive(Debug, Clone, Copy)]
pub struct ParameterDescriptor {
    pub id: Parameter,
    /// Human-readable label for logs.
    pub name: &'static str,
    /// Input-register start address.
    pub address: u16,
    /// Number of registers to read.
    pub count: u16,
    pub decode: DecodeKind,
    /// Decimal places used on the wire.
    pub precision: usize,
    /// Unit of measurement, for logs and discovery metadata.
    pub unit: &'static str,
    /// Advisory plausibility range; values outside are stored anyway
    /// and only warned about.
    pub plausible: Option<(f32, f32)>,
}

impl ParameterDescriptor {
    pub fn is_plausible(&self, value: f32) -> bool {
        match self.plausible {
            Some((lo, hi)) => value >= lo && value <= hi,
            None => true,
        }
    }
}

/// The SDM120 input-register map, in read order.
pub const PARAMETERS: [ParameterDescriptor; Parameter::COUNT] = [
    ParameterDescriptor {
        id: Parameter::Voltage,
        name: "Voltage",
        address: 0x0000,
        count: 2,
        decode: DecodeKind::F32WordSwapped,
        precision: 2,
        unit: "V",
        plausible: Some((0.0, 500.0)),
    },
    ParameterDescriptor {
        id: Parameter::Current,
        name: "Current",
        address: 0x0006,
        count: 2,
        decode: DecodeKind::F32WordSwapped,
        precision: 3,
        unit: "A",
        plausible: None,
    },
    ParameterDescriptor {
        id: Parameter::ActivePower,
        name: "Active Power",
        address: 0x000C,
        count: 2,
        decode: DecodeKind::F32WordSwapped,
        precision: 2,
        unit: "W",
        plausible: None,
    },
    ParameterDescriptor {
        id: Parameter::ApparentPower,
        name: "Apparent Power",
        address: 0x0012,
        count: 2,
        decode: DecodeKind::F32WordSwapped,
        precision: 2,
        unit: "VA",
        plausible: None,
    },
    ParameterDescriptor {
        id: Parameter::ReactivePower,
        name: "Reactive Power",
        address: 0x0018,
        count: 2,
        decode: DecodeKind::F32WordSwapped,
        precision: 2,
        unit: "VAr",
        plausible: None,
    },
    ParameterDescriptor {
        id: Parameter::PowerFactor,
        name: "Power Factor",
        address: 0x001E,
        count: 2,
        decode: DecodeKind::F32WordSwapped,
        precision: 3,
        unit: "",
        plausible: Some((-1.1, 1.1)),
    },
    ParameterDescriptor {
        id: Parameter::Frequency,
        name: "Frequency",
        address: 0x0046,
        count: 2,
        decode: DecodeKind::F32WordSwapped,
        precision: 2,
        unit: "Hz",
        plausible: Some((45.0, 65.0)),
    },
    ParameterDescriptor {
        id: Parameter::ImportEnergy,
        name: "Import Active Energy",
        address: 0x0048,
        count: 2,
        decode: DecodeKind::F32WordSwapped,
        precision: 3,
        unit: "kWh",
        plausible: None,
    },
    ParameterDescriptor {
        id: Parameter::ExportEnergy,
        name: "Export Active Energy",
        address: 0x004A,
        count: 2,
        decode: DecodeKind::F32WordSwapped,
        precision: 3,
        unit: "kWh",
        plausible: None,
    },
    ParameterDescriptor {
        id: Parameter::TotalEnergy,
        name: "Total Active Energy",
        address: 0x0156,
        count: 2,
        decode: DecodeKind::F32WordSwapped,
        precision: 3,
        unit: "kWh",
        plausible: None,
    },
];

/// Swap the two 16-bit halves of a 32-bit value.
pub fn swap_words(raw: u32) -> u32 {
    raw.rotate_left(16)
}

/// Decode a word-swapped IEEE-754 float from register words as
/// received.
pub fn decode_f32_word_swapped(words: [u16; 2]) -> f32 {
    f32::from_bits((u32::from(words[1]) << 16) | u32::from(words[0]))
}

/// Per-parameter success bits for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuccessBitmap(u16);

impl SuccessBitmap {
    pub fn set(&mut self, id: Parameter) {
        self.0 |= 1 << id.index();
    }

    pub fn is_set(self, id: Parameter) -> bool {
        self.0 & (1 << id.index()) != 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn none_set(self) -> bool {
        self.0 == 0
    }

    pub fn all_set(self) -> bool {
        self.count() == Parameter::COUNT
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

/// One complete meter reading.
///
/// Created fresh and zero-initialized for every poll cycle; a field
/// holds its decoded value only if the corresponding read succeeded
/// this cycle, and zero otherwise. A failed read never leaves a field
/// partially overwritten.
#[derive(Debug, Clone)]
pub struct MeterReading {
    /// Capture timestamp, epoch milliseconds.
    pub timestamp: i64,
    pub voltage: f32,
    pub current: f32,
    pub active_power: f32,
    pub apparent_power: f32,
    pub reactive_power: f32,
    pub power_factor: f32,
    pub frequency: f32,
    pub import_energy: f32,
    pub export_energy: f32,
    pub total_energy: f32,
}

impl MeterReading {
    /// A zeroed reading stamped with the current time.
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            voltage: 0.0,
            current: 0.0,
            active_power: 0.0,
            apparent_power: 0.0,
            reactive_power: 0.0,
            power_factor: 0.0,
            frequency: 0.0,
            import_energy: 0.0,
            export_energy: 0.0,
            total_energy: 0.0,
        }
    }

    /// Store a decoded value in the field for `id`.
    pub fn set(&mut self, id: Parameter, value: f32) {
        match id {
            Parameter::Voltage => self.voltage = value,
            Parameter::Current => self.current = value,
            Parameter::ActivePower => self.active_power = value,
            Parameter::ApparentPower => self.apparent_power = value,
            Parameter::ReactivePower => self.reactive_power = value,
            Parameter::PowerFactor => self.power_factor = value,
            Parameter::Frequency => self.frequency = value,
            Parameter::ImportEnergy => self.import_energy = value,
            Parameter::ExportEnergy => self.export_energy = value,
            Parameter::TotalEnergy => self.total_energy = value,
        }
    }

    pub fn get(&self, id: Parameter) -> f32 {
        match id {
            Parameter::Voltage => self.voltage,
            Parameter::Current => self.current,
            Parameter::ActivePower => self.active_power,
            Parameter::ApparentPower => self.apparent_power,
            Parameter::ReactivePower => self.reactive_power,
            Parameter::PowerFactor => self.power_factor,
            Parameter::Frequency => self.frequency,
            Parameter::ImportEnergy => self.import_energy,
            Parameter::ExportEnergy => self.export_energy,
            Parameter::TotalEnergy => self.total_energy,
        }
    }
}

impl Default for MeterReading {
    fn default() -> Self {
        Self::new()
    }
}
