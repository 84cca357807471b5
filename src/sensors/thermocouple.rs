use super::{RawReading, Sensor, SensorError};
use crate::protocol::DeviceClass;

/// Simulated thermocouple amplifier channel.
///
/// Produces a slow sinusoidal drift around `base_f`. Faults can be
/// injected for testing.
#[derive(Debug, Clone)]
pub struct Thermocouple {
    base_f: f64,
    swing_f: f64,
    period_reads: u32,
    reads: u32,
    fault: Option<SensorError>,
    dropout_every: Option<u32>,
}

impl Thermocouple {
    pub fn steady(temperature_f: f64) -> Self {
        Self::drifting(temperature_f, 0.0, 1)
    }

    pub fn drifting(base_f: f64, swing_f: f64, period_reads: u32) -> Self {
        Self {
            base_f,
            swing_f,
            period_reads: period_reads.max(1),
            reads: 0,
            fault: None,
            dropout_every: None,
        }
    }

    /// Every read fails with `fault` until [`Thermocouple::clear_fault`].
    pub fn with_fault(mut self, fault: SensorError) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Every `n`-th read reports an open circuit.
    pub fn with_dropout(mut self, every: u32) -> Self {
        self.dropout_every = Some(every.max(1));
        self
    }

    pub fn inject_fault(&mut self, fault: SensorError) {
        self.fault = Some(fault);
    }

    pub fn clear_fault(&mut self) {
        self.fault = None;
    }

    fn current_temperature(&self) -> f64 {
        let phase = f64::from(self.reads % self.period_reads) / f64::from(self.period_reads);
        self.base_f + self.swing_f * (phase * core::f64::consts::TAU).sin()
    }
}

impl Sensor for Thermocouple {
    fn class(&self) -> DeviceClass {
        DeviceClass::Temperature
    }

    fn read(&mut self) -> Result<RawReading, SensorError> {
        self.reads = self.reads.wrapping_add(1);
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        if let Some(every) = self.dropout_every {
            if self.reads % every == 0 {
                return Err(SensorError::OpenCircuit);
            }
        }
        Ok(RawReading::Scalar(self.current_temperature()))
    }
}
