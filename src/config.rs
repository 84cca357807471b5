//! Bus description loaded from TOML.
//!
//! ```toml
//! [bus]
//! baud_rate = 115200
//! settle_delay_ms = 5
//! reply_timeout_ms = 200
//!
//! [collector]
//! poll_order = [1, 2]
//!
//! [[peripheral]]
//! address = 1
//! name = "LRF"
//! devices = ["A", "B", "K", "U"]
//! ```
//!
//! Every section is optional; missing values fall back to the two-facility
//! installation the system was first deployed on.

use crate::protocol::{DeviceTag, PeripheralAddress, MAX_DEVICES};
use crate::responder::DrainPolicy;
use crate::scheduler::{PollOrder, PollOrderError};
use crate::sensors::SamplingCadence;
use crate::telemetry::HistoryWindows;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

// Start, eight data bits, stop.
const BITS_PER_BYTE: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("rendering configuration: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("peripheral address {0} configured twice")]
    DuplicateAddress(PeripheralAddress),
    #[error("peripheral {address} lists device `{tag}` twice")]
    DuplicateDevice {
        address: PeripheralAddress,
        tag: DeviceTag,
    },
    #[error("peripheral {address} has more than {limit} devices")]
    TooManyDevices {
        address: PeripheralAddress,
        limit: usize,
    },
    #[error("poll order entry {0} has no configured peripheral")]
    UnknownPollAddress(PeripheralAddress),
    #[error(transparent)]
    PollOrder(#[from] PollOrderError),
    #[error("invalid timing: {0}")]
    InvalidTiming(String),
    #[error("sampling cadence for {0} must be at least 1")]
    InvalidCadence(&'static str),
}

/// Physical layer and protocol timings, in the units the file uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub baud_rate: u32,
    /// Hold time on either side of a write while the driver is enabled.
    pub settle_delay_ms: u64,
    /// Quiet time a node leaves after the last byte it heard before it
    /// enables its own driver. Must exceed `settle_delay_ms`.
    pub turnaround_ms: u64,
    pub reply_timeout_ms: u64,
    pub drain_window_ms: u64,
    /// Minimum period between the starts of two poll cycles.
    pub cycle_interval_ms: u64,
    pub read_poll_interval_ms: u64,
    pub drain_policy: DrainPolicy,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            settle_delay_ms: 5,
            turnaround_ms: 10,
            reply_timeout_ms: 200,
            drain_window_ms: 200,
            cycle_interval_ms: 100,
            read_poll_interval_ms: 1,
            drain_policy: DrainPolicy::Neighbor,
        }
    }
}

impl BusSettings {
    pub fn timing(&self) -> Timing {
        Timing {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            turnaround: Duration::from_millis(self.turnaround_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            drain_window: Duration::from_millis(self.drain_window_ms),
            cycle_interval: Duration::from_millis(self.cycle_interval_ms),
            read_poll_interval: Duration::from_millis(self.read_poll_interval_ms),
            byte_time: byte_time(self.baud_rate),
        }
    }
}

fn byte_time(baud_rate: u32) -> Duration {
    let baud = u64::from(baud_rate.max(1));
    Duration::from_nanos(BITS_PER_BYTE * 1_000_000_000 / baud)
}

/// [`BusSettings`] resolved to durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub settle_delay: Duration,
    pub turnaround: Duration,
    pub reply_timeout: Duration,
    pub drain_window: Duration,
    pub cycle_interval: Duration,
    pub read_poll_interval: Duration,
    /// Time one byte occupies the wire.
    pub byte_time: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        BusSettings::default().timing()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub poll_order: Vec<PeripheralAddress>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            poll_order: vec![LRF, VISE],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralConfig {
    pub address: PeripheralAddress,
    #[serde(default)]
    pub name: String,
    pub devices: Vec<DeviceTag>,
}

impl PeripheralConfig {
    /// Name for display; falls back to the address.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("peripheral {}", self.address)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub bus: BusSettings,
    pub collector: CollectorSettings,
    pub cadence: SamplingCadence,
    pub history: HistoryWindows,
    #[serde(rename = "peripheral")]
    pub peripherals: Vec<PeripheralConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        let devices: Vec<DeviceTag> = ['A', 'B', 'K', 'U']
            .into_iter()
            .filter_map(DeviceTag::new)
            .collect();
        Self {
            bus: BusSettings::default(),
            collector: CollectorSettings::default(),
            cadence: SamplingCadence::default(),
            history: HistoryWindows::default(),
            peripherals: vec![
                PeripheralConfig {
                    address: LRF,
                    name: "LRF".to_string(),
                    devices: devices.clone(),
                },
                PeripheralConfig {
                    address: VISE,
                    name: "Vise".to_string(),
                    devices,
                },
            ],
        }
    }
}

const fn facility(value: u8) -> PeripheralAddress {
    match PeripheralAddress::new(value) {
        Some(address) => address,
        None => panic!("facility address out of range"),
    }
}

const LRF: PeripheralAddress = facility(1);
const VISE: PeripheralAddress = facility(2);

impl BusConfig {
    /// Reads, parses and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!("loaded bus configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: Vec<PeripheralAddress> = Vec::new();
        for peripheral in &self.peripherals {
            if seen.contains(&peripheral.address) {
                return Err(ConfigError::DuplicateAddress(peripheral.address));
            }
            seen.push(peripheral.address);

            if peripheral.devices.len() > MAX_DEVICES {
                return Err(ConfigError::TooManyDevices {
                    address: peripheral.address,
                    limit: MAX_DEVICES,
                });
            }
            for (index, tag) in peripheral.devices.iter().enumerate() {
                if peripheral.devices[..index].contains(tag) {
                    return Err(ConfigError::DuplicateDevice {
                        address: peripheral.address,
                        tag: *tag,
                    });
                }
            }
        }

        for address in &self.collector.poll_order {
            if !seen.contains(address) {
                return Err(ConfigError::UnknownPollAddress(*address));
            }
        }
        PollOrder::new(&self.collector.poll_order)?;

        self.validate_timing()?;

        let cadence = &self.cadence;
        for (name, every) in [
            ("temperature", cadence.temperature_every),
            ("acceleration", cadence.acceleration_every),
            ("pressure", cadence.pressure_every),
        ] {
            if every == 0 {
                return Err(ConfigError::InvalidCadence(name));
            }
        }
        Ok(())
    }

    fn validate_timing(&self) -> Result<(), ConfigError> {
        let bus = &self.bus;
        let invalid = |reason: &str| Err(ConfigError::InvalidTiming(reason.to_string()));
        if bus.baud_rate == 0 {
            return invalid("baud_rate must be positive");
        }
        if bus.reply_timeout_ms == 0 {
            return invalid("reply_timeout_ms must be positive");
        }
        if bus.read_poll_interval_ms == 0 || bus.read_poll_interval_ms >= bus.reply_timeout_ms {
            return invalid("read_poll_interval_ms must be positive and below reply_timeout_ms");
        }
        if bus.turnaround_ms <= bus.settle_delay_ms {
            return invalid("turnaround_ms must exceed settle_delay_ms");
        }
        if bus.drain_window_ms == 0 || bus.drain_window_ms > bus.reply_timeout_ms {
            return invalid("drain_window_ms must be positive and no longer than reply_timeout_ms");
        }
        // A late reply is waited out until the line goes quiet for one
        // turnaround; the gap between two bytes of a frame must read as busy.
        let timing = bus.timing();
        if timing.turnaround <= timing.byte_time + timing.read_poll_interval {
            return invalid("turnaround_ms must exceed one byte time plus read_poll_interval_ms");
        }
        Ok(())
    }

    pub fn timing(&self) -> Timing {
        self.bus.timing()
    }

    /// The validated poll order.
    pub fn poll_order(&self) -> Result<PollOrder, ConfigError> {
        Ok(PollOrder::new(&self.collector.poll_order)?)
    }

    pub fn peripheral(&self, address: PeripheralAddress) -> Option<&PeripheralConfig> {
        self.peripherals.iter().find(|p| p.address == address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = PeripheralAddress> + '_ {
        self.peripherals.iter().map(|p| p.address)
    }
}
