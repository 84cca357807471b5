//! Deterministic bus simulation.
//!
//! The collector and every peripheral run against the same [`Medium`], each
//! with its own virtual clock. Whenever the collector blocks (settle delays,
//! reply polling, turnaround) the peripherals are stepped, least advanced
//! first, until they have all caught up with the collector's target time.
//! Peripherals therefore never act on input the collector has not produced
//! yet, and blocking waits stay blocking from each node's point of view.

pub mod medium;

pub use medium::{
    Medium, NodeId, SharedMedium, SimBusError, SimClock, SimPin, SimPort, TransmitWindow,
    Truncation,
};

use crate::bus::Clock;
use crate::config::{BusConfig, ConfigError};
use crate::peripheral::Peripheral;
use crate::protocol::{DeviceTag, MalformedMessage, PeripheralAddress};
use crate::responder::{FixedReply, PollResponder, ResponderStats};
use crate::scheduler::{CycleReport, PollScheduler};
use crate::sensors::{simulated_sensor, AttachError, Sensor, SensorArray};
use crate::telemetry::{TelemetryDecoder, TelemetryHistory};
use crate::transceiver::{TransceiverController, TransceiverError};
use core::time::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

// Every step costs at least this much so stepping always terminates.
const MIN_STEP: Duration = Duration::from_micros(10);

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transceiver(#[from] TransceiverError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error("scripted reply: {0}")]
    Reply(#[from] MalformedMessage),
}

/// Time one peripheral loop iteration spends sensing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyModel {
    Fixed(Duration),
    Uniform { min: Duration, max: Duration },
}

impl Default for LatencyModel {
    fn default() -> Self {
        LatencyModel::Uniform {
            min: Duration::from_micros(500),
            max: Duration::from_millis(2),
        }
    }
}

impl LatencyModel {
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        let cost = match *self {
            LatencyModel::Fixed(cost) => cost,
            LatencyModel::Uniform { min, max } if max > min => {
                let span = u64::try_from((max - min).as_nanos()).unwrap_or(u64::MAX);
                min + Duration::from_nanos(rng.gen_range(0..=span))
            }
            LatencyModel::Uniform { min, .. } => min,
        };
        cost.max(MIN_STEP)
    }

    /// Longest single step this model can produce.
    pub fn worst_case(&self) -> Duration {
        match *self {
            LatencyModel::Fixed(cost) => cost,
            LatencyModel::Uniform { min, max } => min.max(max),
        }
        .max(MIN_STEP)
    }
}

#[derive(Debug)]
enum Behavior {
    Sensing(Peripheral<SimPort, SimPin, SimClock>),
    Scripted {
        responder: PollResponder<SimPin>,
        reply: FixedReply,
        port: SimPort,
        clock: SimClock,
    },
}

/// A peripheral attached to the simulated medium.
#[derive(Debug)]
pub struct SimPeripheral {
    address: PeripheralAddress,
    label: String,
    node: NodeId,
    medium: SharedMedium,
    behavior: Behavior,
    latency: LatencyModel,
    rng: StdRng,
    steps: u64,
}

impl SimPeripheral {
    /// Services the bus at the node's current time, then spends one
    /// sensing interval.
    fn step(&mut self) {
        let result = match &mut self.behavior {
            Behavior::Sensing(peripheral) => peripheral.run_once(),
            Behavior::Scripted {
                responder,
                reply,
                port,
                clock,
            } => responder.service(port, clock, reply),
        };
        if let Err(e) = result {
            warn!("{} ({}): {}", self.label, self.address, e);
        }
        let cost = self.latency.sample(&mut self.rng);
        self.medium.borrow_mut().advance(self.node, cost);
        self.steps += 1;
    }

    fn now(&self) -> Duration {
        self.medium.borrow().now(self.node)
    }

    pub fn address(&self) -> PeripheralAddress {
        self.address
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn responder_stats(&self) -> ResponderStats {
        match &self.behavior {
            Behavior::Sensing(peripheral) => *peripheral.responder().stats(),
            Behavior::Scripted { responder, .. } => *responder.stats(),
        }
    }

    pub fn is_scripted(&self) -> bool {
        matches!(self.behavior, Behavior::Scripted { .. })
    }
}

type Peripherals = Rc<RefCell<Vec<SimPeripheral>>>;

fn step_peripherals_until(peripherals: &RefCell<Vec<SimPeripheral>>, target: Duration) {
    let mut nodes = peripherals.borrow_mut();
    loop {
        let next = nodes
            .iter_mut()
            .map(|p| (p.now(), p))
            .filter(|(now, _)| *now < target)
            .min_by_key(|(now, _)| *now);
        match next {
            Some((_, peripheral)) => peripheral.step(),
            None => break,
        }
    }
}

/// The collector's clock. Blocking on it lets the rest of the bus run.
#[derive(Debug, Clone)]
pub struct CollectorClock {
    medium: SharedMedium,
    node: NodeId,
    peripherals: Peripherals,
}

impl Clock for CollectorClock {
    fn now(&self) -> Duration {
        self.medium.borrow().now(self.node)
    }

    fn delay(&mut self, duration: Duration) {
        let target = self.now() + duration;
        step_peripherals_until(&self.peripherals, target);
        self.medium.borrow_mut().advance_to(self.node, target);
    }
}

/// Collector plus peripherals on one simulated bus.
pub struct Simulation {
    config: BusConfig,
    medium: SharedMedium,
    peripherals: Peripherals,
    collector: NodeId,
    scheduler: PollScheduler<SimPort, SimPin, CollectorClock>,
    history: TelemetryHistory,
}

impl Simulation {
    pub fn builder(config: BusConfig) -> SimulationBuilder {
        SimulationBuilder::new(config)
    }

    pub fn from_config(config: BusConfig) -> Result<Self, SimError> {
        Self::builder(config).build()
    }

    /// One poll cycle. Decoded messages also go into the rolling history.
    pub fn run_cycle(&mut self) -> CycleReport {
        let report = self.scheduler.run_cycle();
        for message in report.decoded() {
            self.history.record(report.cycle, message);
        }
        report
    }

    /// Lets the whole bus run for `duration` without the collector polling.
    pub fn idle(&mut self, duration: Duration) {
        let target = self.now() + duration;
        step_peripherals_until(&self.peripherals, target);
        self.medium.borrow_mut().advance_to(self.collector, target);
    }

    pub fn now(&self) -> Duration {
        self.medium.borrow().now(self.collector)
    }

    pub fn transmit_windows(&self) -> Vec<TransmitWindow> {
        self.medium.borrow().windows().to_vec()
    }

    pub fn overlaps(&self) -> Vec<(TransmitWindow, TransmitWindow)> {
        self.medium.borrow().overlaps()
    }

    pub fn truncations(&self) -> Vec<Truncation> {
        self.medium.borrow().truncations().to_vec()
    }

    /// Transmit windows opened by the peripheral at `address`.
    pub fn transmissions_by(&self, address: PeripheralAddress) -> usize {
        let Some(node) = self.node_of(address) else {
            return 0;
        };
        self.medium
            .borrow()
            .windows()
            .iter()
            .filter(|w| w.node == node)
            .count()
    }

    pub fn responder_stats(&self, address: PeripheralAddress) -> Option<ResponderStats> {
        self.peripherals
            .borrow()
            .iter()
            .find(|p| p.address() == address)
            .map(SimPeripheral::responder_stats)
    }

    pub fn node_of(&self, address: PeripheralAddress) -> Option<NodeId> {
        self.peripherals
            .borrow()
            .iter()
            .find(|p| p.address() == address)
            .map(SimPeripheral::node)
    }

    pub fn collector_node(&self) -> NodeId {
        self.collector
    }

    pub fn scheduler(&self) -> &PollScheduler<SimPort, SimPin, CollectorClock> {
        &self.scheduler
    }

    pub fn history(&self) -> &TelemetryHistory {
        &self.history
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }
}

/// Assembles a [`Simulation`] from a configuration plus per-peripheral
/// overrides.
pub struct SimulationBuilder {
    config: BusConfig,
    seed: u64,
    latency: LatencyModel,
    latency_overrides: Vec<(PeripheralAddress, LatencyModel)>,
    scripted: Vec<(PeripheralAddress, String)>,
    silent: Vec<PeripheralAddress>,
    sensors: Vec<(PeripheralAddress, DeviceTag, Box<dyn Sensor>)>,
}

impl SimulationBuilder {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            seed: 0,
            latency: LatencyModel::default(),
            latency_overrides: Vec::new(),
            scripted: Vec::new(),
            silent: Vec::new(),
            sensors: Vec::new(),
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sensing latency for every peripheral without an override.
    pub fn latency(mut self, model: LatencyModel) -> Self {
        self.latency = model;
        self
    }

    pub fn peripheral_latency(mut self, address: PeripheralAddress, model: LatencyModel) -> Self {
        self.latency_overrides.push((address, model));
        self
    }

    /// The peripheral answers every poll with `line` instead of sensing.
    pub fn scripted(mut self, address: PeripheralAddress, line: &str) -> Self {
        self.scripted.push((address, line.to_string()));
        self
    }

    /// The peripheral is configured but not connected to the bus.
    pub fn silent(mut self, address: PeripheralAddress) -> Self {
        self.silent.push(address);
        self
    }

    /// Replaces the simulated driver of one device.
    pub fn sensor(mut self, address: PeripheralAddress, tag: DeviceTag, sensor: Box<dyn Sensor>) -> Self {
        self.sensors.push((address, tag, sensor));
        self
    }

    pub fn build(mut self) -> Result<Simulation, SimError> {
        self.config.validate()?;
        let timing = self.config.timing();
        let order = self.config.poll_order()?;
        let medium = Medium::shared(timing.byte_time);
        let collector = medium.borrow_mut().attach("collector");
        let peripherals: Peripherals = Rc::new(RefCell::new(Vec::new()));
        let mut rng = StdRng::seed_from_u64(self.seed);

        let configured = self.config.peripherals.clone();
        for peripheral in &configured {
            let address = peripheral.address;
            if self.silent.contains(&address) {
                info!("{} ({}) left off the bus", peripheral.label(), address);
                continue;
            }

            let node = medium.borrow_mut().attach(peripheral.label());
            let port = SimPort::new(medium.clone(), node);
            let clock = SimClock::new(medium.clone(), node);
            let transceiver =
                TransceiverController::new(SimPin::new(medium.clone(), node), &timing)?;
            let triggers = self
                .config
                .bus
                .drain_policy
                .triggers(order.as_slice(), address);
            debug!("{} drains after {:?}", address, triggers);
            let responder = PollResponder::new(address, transceiver, triggers, &timing);

            let scripted = self
                .scripted
                .iter()
                .find(|(a, _)| *a == address)
                .map(|(_, line)| line.clone());
            let behavior = match scripted {
                Some(line) => Behavior::Scripted {
                    responder,
                    reply: FixedReply::new(&line)?,
                    port,
                    clock,
                },
                None => {
                    let mut sensors = SensorArray::new(self.config.cadence);
                    for (index, tag) in peripheral.devices.iter().enumerate() {
                        let sensor = match self
                            .sensors
                            .iter()
                            .position(|(a, t, _)| *a == address && t == tag)
                        {
                            Some(position) => self.sensors.swap_remove(position).2,
                            None => {
                                let seed = u32::from(address.value()) * 31
                                    + u32::try_from(index).unwrap_or(0);
                                simulated_sensor(*tag, seed)
                            }
                        };
                        sensors.attach(*tag, sensor)?;
                    }
                    Behavior::Sensing(Peripheral::new(
                        peripheral.label(),
                        sensors,
                        responder,
                        port,
                        clock,
                    ))
                }
            };

            let latency = self
                .latency_overrides
                .iter()
                .find(|(a, _)| *a == address)
                .map_or(self.latency, |(_, model)| *model);
            peripherals.borrow_mut().push(SimPeripheral {
                address,
                label: peripheral.label(),
                node,
                medium: medium.clone(),
                behavior,
                latency,
                rng: StdRng::seed_from_u64(rng.gen()),
                steps: 0,
            });
        }

        let transceiver =
            TransceiverController::new(SimPin::new(medium.clone(), collector), &timing)?;
        let clock = CollectorClock {
            medium: medium.clone(),
            node: collector,
            peripherals: peripherals.clone(),
        };
        let scheduler = PollScheduler::new(
            order,
            TelemetryDecoder::new(self.config.addresses()),
            transceiver,
            SimPort::new(medium.clone(), collector),
            clock,
            timing,
        );

        Ok(Simulation {
            history: TelemetryHistory::new(self.config.history),
            config: self.config,
            medium,
            peripherals,
            collector,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_model_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let model = LatencyModel::Uniform {
            min: Duration::from_millis(1),
            max: Duration::from_millis(3),
        };
        for _ in 0..100 {
            let cost = model.sample(&mut rng);
            assert!(cost >= Duration::from_millis(1) && cost <= Duration::from_millis(3));
        }
        assert_eq!(LatencyModel::Fixed(Duration::ZERO).sample(&mut rng), MIN_STEP);
        assert_eq!(model.worst_case(), Duration::from_millis(3));
    }

    #[test]
    fn test_default_bus_runs_clean() {
        let mut sim = Simulation::from_config(BusConfig::default()).unwrap();
        for _ in 0..3 {
            let report = sim.run_cycle();
            assert_eq!(report.decoded().count(), 2);
        }
        assert!(sim.overlaps().is_empty());
        assert!(sim.truncations().is_empty());
    }
}
