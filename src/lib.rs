//! # Equipment Health Bus
//!
//! Telemetry collection for equipment health monitoring over a shared,
//! half-duplex RS-485 line. One collector polls a small set of sensor
//! peripherals in turn; each peripheral answers with a single line of text
//! carrying the latest readings of its temperature, acceleration and
//! pressure devices.
//!
//! ## Features
//!
//! - **Line codec**: `1A78.45 B83.82 K0.13,-0.39,-9.81 U14.41\n`, with
//!   per-class validation and explicit `nan` for unavailable devices
//! - **Bus discipline**: driver enable, settle, write, drain, settle,
//!   release; turnaround guards on both sides of every exchange
//! - **Polling**: fixed poll order, bounded reply windows, stale input
//!   discarded before each poll, per-address statistics
//! - **Reply draining**: peripherals skip other nodes' telemetry so digits
//!   inside it are never taken for poll commands
//! - **Simulation**: a virtual-time medium that records every transmit
//!   window, so collisions and truncated frames are observable
//! - **Embedded-friendly core**: fixed-capacity buffers on the wire path
//!
//! ## Quick Start
//!
//! ```rust
//! use healthbus::{BusConfig, Simulation};
//!
//! let mut sim = Simulation::from_config(BusConfig::default()).unwrap();
//! let report = sim.run_cycle();
//! for message in report.decoded() {
//!     println!("{}", message);
//! }
//! assert!(sim.overlaps().is_empty());
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Addresses, device tags, readings and the line format
//! - [`bus`] - Hardware seams: serial port, direction pin, clock
//! - [`transceiver`] - Direction control around each transmitted frame
//! - [`sensors`] - Device drivers and the sampling cadence
//! - [`telemetry`] - Encoding readings, decoding replies, rolling history
//! - [`responder`] - Peripheral side of the poll protocol
//! - [`peripheral`] - Sensing plus responding on one node
//! - [`scheduler`] - Collector side of the poll protocol
//! - [`config`] - TOML bus description
//! - [`sim`] - Deterministic multi-node bus simulation

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod bus;
pub mod config;
pub mod peripheral;
pub mod protocol;
pub mod responder;
pub mod scheduler;
pub mod sensors;
pub mod sim;
pub mod telemetry;
pub mod transceiver;

pub use config::{BusConfig, ConfigError, Timing};
pub use peripheral::Peripheral;
pub use protocol::{
    Decimal2, DeviceClass, DeviceTag, MalformedMessage, PeripheralAddress, Reading,
    TelemetryMessage,
};
pub use responder::{DrainPolicy, PollResponder};
pub use scheduler::{CycleReport, PollOutcome, PollScheduler};
pub use sim::{LatencyModel, Simulation};
pub use telemetry::{TelemetryDecoder, TelemetryEncoder, TelemetryHistory};
