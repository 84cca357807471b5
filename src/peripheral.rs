use crate::bus::{Clock, DirectionPin, SerialPort};
use crate::protocol::{LineBuffer, MalformedMessage, PeripheralAddress};
use crate::responder::{PollResponder, ReplySource, ResponderError, ResponderEvent};
use crate::sensors::SensorArray;
use crate::telemetry::TelemetryEncoder;

/// Encodes the array's cached readings on demand.
struct CachedReadings<'a> {
    encoder: &'a TelemetryEncoder,
    sensors: &'a SensorArray,
}

impl ReplySource for CachedReadings<'_> {
    fn reply_line(&mut self) -> Result<LineBuffer, MalformedMessage> {
        self.encoder.encode_line(self.sensors)
    }
}

/// One sensor node: samples its devices and answers polls, cooperatively,
/// on a single thread of control.
#[derive(Debug)]
pub struct Peripheral<P, D, C>
where
    P: SerialPort,
    D: DirectionPin,
    C: Clock,
{
    name: String,
    encoder: TelemetryEncoder,
    sensors: SensorArray,
    responder: PollResponder<D>,
    port: P,
    clock: C,
    iterations: u64,
}

impl<P, D, C> Peripheral<P, D, C>
where
    P: SerialPort,
    D: DirectionPin,
    C: Clock,
{
    pub fn new(
        name: impl Into<String>,
        sensors: SensorArray,
        responder: PollResponder<D>,
        port: P,
        clock: C,
    ) -> Self {
        Self {
            name: name.into(),
            encoder: TelemetryEncoder::new(responder.address()),
            sensors,
            responder,
            port,
            clock,
            iterations: 0,
        }
    }

    /// One loop iteration: a sampling pass, then whatever bus input is
    /// waiting. A reply always carries the readings of the pass just taken.
    pub fn run_once(&mut self) -> Result<ResponderEvent, ResponderError> {
        self.iterations += 1;
        self.sensors.sample();
        let mut source = CachedReadings {
            encoder: &self.encoder,
            sensors: &self.sensors,
        };
        self.responder
            .service(&mut self.port, &mut self.clock, &mut source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> PeripheralAddress {
        self.encoder.address()
    }

    pub fn sensors(&self) -> &SensorArray {
        &self.sensors
    }

    pub fn sensors_mut(&mut self) -> &mut SensorArray {
        &mut self.sensors
    }

    pub fn responder(&self) -> &PollResponder<D> {
        &self.responder
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }
}
