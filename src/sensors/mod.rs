pub mod accelerometer;
pub mod pressure;
pub mod thermocouple;

pub use accelerometer::Accelerometer;
pub use pressure::PressureTransducer;
pub use thermocouple::Thermocouple;

use crate::protocol::{DeviceClass, DeviceTag, Reading, MAX_DEVICES};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SensorError {
    #[error("device not responding")]
    NotResponding,
    #[error("thermocouple open circuit")]
    OpenCircuit,
    #[error("value {0} outside the representable range")]
    OutOfRange(f64),
    #[error("driver error: {0}")]
    Driver(String),
}

/// Raw floating-point output of a device driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawReading {
    Scalar(f64),
    Triaxial([f64; 3]),
}

/// A locally attached device. Drivers are opaque; all this crate needs is
/// the class and a fallible read.
pub trait Sensor {
    fn class(&self) -> DeviceClass;
    fn read(&mut self) -> Result<RawReading, SensorError>;
}

/// How often each class is re-read, in sampling passes. A value of `n`
/// samples the class on every `n`-th pass, starting with the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingCadence {
    pub temperature_every: u16,
    pub acceleration_every: u16,
    pub pressure_every: u16,
}

impl Default for SamplingCadence {
    fn default() -> Self {
        Self {
            temperature_every: 4,
            acceleration_every: 1,
            pressure_every: 1,
        }
    }
}

impl SamplingCadence {
    pub fn interval(&self, class: DeviceClass) -> u16 {
        match class {
            DeviceClass::Temperature => self.temperature_every,
            DeviceClass::Acceleration => self.acceleration_every,
            DeviceClass::Pressure => self.pressure_every,
        }
    }

    pub fn is_due(&self, class: DeviceClass, pass: u64) -> bool {
        let interval = u64::from(self.interval(class).max(1));
        pass % interval == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("device tag `{0}` already attached")]
    DuplicateTag(DeviceTag),
    #[error("tag `{tag}` is reserved for {expected} devices, got a {actual} sensor")]
    ClassMismatch {
        tag: DeviceTag,
        expected: DeviceClass,
        actual: DeviceClass,
    },
    #[error("at most {0} devices per peripheral")]
    TooManyDevices(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub reads: u32,
    pub failures: u32,
}

/// Outcome of one sampling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplePass {
    pub sampled: usize,
    pub failed: usize,
}

struct Device {
    tag: DeviceTag,
    sensor: Box<dyn Sensor>,
    cached: Reading,
    stats: DeviceStats,
}

/// The devices attached to one peripheral with their last known readings.
pub struct SensorArray {
    devices: Vec<Device>,
    cadence: SamplingCadence,
    passes: u64,
}

impl core::fmt::Debug for SensorArray {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SensorArray")
            .field("tags", &self.tags().collect::<Vec<_>>())
            .field("cadence", &self.cadence)
            .field("passes", &self.passes)
            .finish()
    }
}

impl SensorArray {
    pub fn new(cadence: SamplingCadence) -> Self {
        Self {
            devices: Vec::new(),
            cadence,
            passes: 0,
        }
    }

    pub fn attach(&mut self, tag: DeviceTag, sensor: Box<dyn Sensor>) -> Result<(), AttachError> {
        if self.devices.iter().any(|d| d.tag == tag) {
            return Err(AttachError::DuplicateTag(tag));
        }
        if sensor.class() != tag.class() {
            return Err(AttachError::ClassMismatch {
                tag,
                expected: tag.class(),
                actual: sensor.class(),
            });
        }
        if self.devices.len() >= MAX_DEVICES {
            return Err(AttachError::TooManyDevices(MAX_DEVICES));
        }
        self.devices.push(Device {
            tag,
            sensor,
            cached: Reading::Unavailable,
            stats: DeviceStats::default(),
        });
        Ok(())
    }

    /// Re-reads every device whose class is due on this pass. Devices that
    /// are not due keep their previous reading. A failed read replaces the
    /// cached value with [`Reading::Unavailable`].
    pub fn sample(&mut self) -> SamplePass {
        let pass = self.passes;
        self.passes = self.passes.wrapping_add(1);

        let mut outcome = SamplePass::default();
        for device in &mut self.devices {
            let class = device.tag.class();
            if !self.cadence.is_due(class, pass) {
                continue;
            }
            outcome.sampled += 1;
            device.stats.reads = device.stats.reads.wrapping_add(1);

            match device.sensor.read().and_then(|raw| to_reading(raw, class)) {
                Ok(reading) => device.cached = reading,
                Err(e) => {
                    warn!("sensor {} read failed: {}", device.tag, e);
                    device.cached = Reading::Unavailable;
                    device.stats.failures = device.stats.failures.wrapping_add(1);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Cached readings in attachment order.
    pub fn readings(&self) -> impl Iterator<Item = (DeviceTag, Reading)> + '_ {
        self.devices.iter().map(|d| (d.tag, d.cached))
    }

    pub fn reading(&self, tag: DeviceTag) -> Option<Reading> {
        self.devices.iter().find(|d| d.tag == tag).map(|d| d.cached)
    }

    pub fn stats(&self, tag: DeviceTag) -> Option<DeviceStats> {
        self.devices.iter().find(|d| d.tag == tag).map(|d| d.stats)
    }

    pub fn tags(&self) -> impl Iterator<Item = DeviceTag> + '_ {
        self.devices.iter().map(|d| d.tag)
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn cadence(&self) -> &SamplingCadence {
        &self.cadence
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn to_reading(raw: RawReading, class: DeviceClass) -> Result<Reading, SensorError> {
    let reading = match raw {
        RawReading::Scalar(value) => Reading::scalar(value).ok_or(SensorError::OutOfRange(value)),
        RawReading::Triaxial([x, y, z]) => Reading::triaxial(x, y, z).ok_or_else(|| {
            let worst = [x, y, z]
                .into_iter()
                .find(|v| Reading::scalar(*v).is_none())
                .unwrap_or(f64::NAN);
            SensorError::OutOfRange(worst)
        }),
    }?;
    if reading.fits(class) {
        Ok(reading)
    } else {
        Err(SensorError::Driver(format!("{} sensor returned the wrong shape", class)))
    }
}

/// Simulated driver for a device class, used by the simulated bus.
pub fn simulated_sensor(tag: DeviceTag, seed: u32) -> Box<dyn Sensor> {
    let offset = f64::from(seed % 7);
    match tag.class() {
        DeviceClass::Temperature => Box::new(Thermocouple::drifting(74.0 + offset, 3.5, 40)),
        DeviceClass::Acceleration => Box::new(Accelerometer::vibrating([0.0, 0.0, -9.81], 0.35, 9)),
        DeviceClass::Pressure => Box::new(PressureTransducer::drifting(14.2 + offset / 10.0, 0.6, 25)),
    }
}
