use super::{RawReading, Sensor, SensorError};
use crate::protocol::DeviceClass;

/// Simulated three-axis accelerometer (m/s²).
///
/// Adds a small periodic vibration on every axis to a resting vector.
#[derive(Debug, Clone)]
pub struct Accelerometer {
    rest: [f64; 3],
    vibration: f64,
    period_reads: u32,
    reads: u32,
    fault: Option<SensorError>,
}

impl Accelerometer {
    pub fn at_rest(rest: [f64; 3]) -> Self {
        Self::vibrating(rest, 0.0, 1)
    }

    pub fn vibrating(rest: [f64; 3], vibration: f64, period_reads: u32) -> Self {
        Self {
            rest,
            vibration,
            period_reads: period_reads.max(1),
            reads: 0,
            fault: None,
        }
    }

    pub fn with_fault(mut self, fault: SensorError) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn inject_fault(&mut self, fault: SensorError) {
        self.fault = Some(fault);
    }

    pub fn clear_fault(&mut self) {
        self.fault = None;
    }
}

impl Sensor for Accelerometer {
    fn class(&self) -> DeviceClass {
        DeviceClass::Acceleration
    }

    fn read(&mut self) -> Result<RawReading, SensorError> {
        self.reads = self.reads.wrapping_add(1);
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        let phase = f64::from(self.reads % self.period_reads) / f64::from(self.period_reads)
            * core::f64::consts::TAU;
        // Axes are driven a third of a turn apart.
        let mut axes = self.rest;
        for (index, axis) in axes.iter_mut().enumerate() {
            let offset = index as f64 * core::f64::consts::TAU / 3.0;
            *axis += self.vibration * (phase + offset).sin();
        }
        Ok(RawReading::Triaxial(axes))
    }
}
