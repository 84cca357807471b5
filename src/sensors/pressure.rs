use super::{RawReading, Sensor, SensorError};
use crate::protocol::DeviceClass;

/// Simulated gauge pressure transducer (psi).
#[derive(Debug, Clone)]
pub struct PressureTransducer {
    base_psi: f64,
    swing_psi: f64,
    period_reads: u32,
    reads: u32,
    fault: Option<SensorError>,
}

impl PressureTransducer {
    pub fn steady(pressure_psi: f64) -> Self {
        Self::drifting(pressure_psi, 0.0, 1)
    }

    pub fn drifting(base_psi: f64, swing_psi: f64, period_reads: u32) -> Self {
        Self {
            base_psi,
            swing_psi,
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

impl Sensor for PressureTransducer {
    fn class(&self) -> DeviceClass {
        DeviceClass::Pressure
    }

    fn read(&mut self) -> Result<RawReading, SensorError> {
        self.reads = self.reads.wrapping_add(1);
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        // Triangle wave: the line pressure ramps up and bleeds off.
        let phase = f64::from(self.reads % self.period_reads) / f64::from(self.period_reads);
        let triangle = 1.0 - 4.0 * (phase - 0.5).abs();
        Ok(RawReading::Scalar(self.base_psi + self.swing_psi * triangle))
    }
}
