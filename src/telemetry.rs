use crate::protocol::{
    DeviceClass, DeviceTag, LineBuffer, MalformedMessage, PeripheralAddress, Reading,
    TelemetryMessage, MAX_PERIPHERALS,
};
use crate::sensors::SensorArray;
use heapless::{Deque, Vec};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Upper bound on any rolling window kept by [`TelemetryHistory`].
pub const HISTORY_CAPACITY: usize = 16;

const DEFAULT_TEMPERATURE_WINDOW: usize = 10;
const DEFAULT_FAST_WINDOW: usize = 15;

/// Peripheral-side formatter. Emits every attached device on every call,
/// stale or not.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryEncoder {
    address: PeripheralAddress,
}

impl TelemetryEncoder {
    pub fn new(address: PeripheralAddress) -> Self {
        Self { address }
    }

    pub fn address(&self) -> PeripheralAddress {
        self.address
    }

    pub fn encode(&self, sensors: &SensorArray) -> Result<TelemetryMessage, MalformedMessage> {
        let mut message = TelemetryMessage::new(self.address);
        for (tag, reading) in sensors.readings() {
            message.push(tag, reading)?;
        }
        Ok(message)
    }

    /// The newline-terminated wire form of [`TelemetryEncoder::encode`].
    pub fn encode_line(&self, sensors: &SensorArray) -> Result<LineBuffer, MalformedMessage> {
        self.encode(sensors)?.encode_line()
    }
}

/// Collector-side parser bound to the set of addresses configured on the bus.
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    known: Vec<PeripheralAddress, MAX_PERIPHERALS>,
}

impl TelemetryDecoder {
    pub fn new<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = PeripheralAddress>,
    {
        let mut known: Vec<PeripheralAddress, MAX_PERIPHERALS> = Vec::new();
        for address in addresses {
            // Only ten addresses exist, so a deduplicated set always fits.
            if !known.contains(&address) {
                let _ = known.push(address);
            }
        }
        Self { known }
    }

    pub fn recognizes(&self, address: PeripheralAddress) -> bool {
        self.known.contains(&address)
    }

    pub fn known_addresses(&self) -> &[PeripheralAddress] {
        &self.known
    }

    /// Parses one line. Either the whole line becomes a message or nothing does.
    pub fn decode(&self, line: &str) -> Result<TelemetryMessage, MalformedMessage> {
        let message: TelemetryMessage = line.parse()?;
        if !self.recognizes(message.address()) {
            return Err(MalformedMessage::UnknownAddress(message.address()));
        }
        debug!("decoded {} field(s) from {}", message.len(), message.address());
        Ok(message)
    }

    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<TelemetryMessage, MalformedMessage> {
        let line = core::str::from_utf8(bytes).map_err(|_| MalformedMessage::NotAscii)?;
        self.decode(line)
    }
}

/// Rolling window length per device class, in samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryWindows {
    pub temperature: usize,
    pub acceleration: usize,
    pub pressure: usize,
}

impl Default for HistoryWindows {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE_WINDOW,
            acceleration: DEFAULT_FAST_WINDOW,
            pressure: DEFAULT_FAST_WINDOW,
        }
    }
}

impl HistoryWindows {
    pub fn window(&self, class: DeviceClass) -> usize {
        let configured = match class {
            DeviceClass::Temperature => self.temperature,
            DeviceClass::Acceleration => self.acceleration,
            DeviceClass::Pressure => self.pressure,
        };
        configured.clamp(1, HISTORY_CAPACITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub cycle: u64,
    pub reading: Reading,
}

#[derive(Debug)]
struct Series {
    address: PeripheralAddress,
    tag: DeviceTag,
    samples: Deque<Sample, HISTORY_CAPACITY>,
}

/// Bounded in-memory history of decoded readings, one window per
/// (peripheral, device) pair. Nothing is persisted.
#[derive(Debug, Default)]
pub struct TelemetryHistory {
    windows: HistoryWindows,
    series: std::vec::Vec<Series>,
    recorded_messages: u64,
}

impl TelemetryHistory {
    pub fn new(windows: HistoryWindows) -> Self {
        Self {
            windows,
            series: std::vec::Vec::new(),
            recorded_messages: 0,
        }
    }

    pub fn record(&mut self, cycle: u64, message: &TelemetryMessage) {
        let address = message.address();
        for field in message.fields() {
            let limit = self.windows.window(field.tag.class());
            let series = match self
                .series
                .iter()
                .position(|s| s.address == address && s.tag == field.tag)
            {
                Some(index) => &mut self.series[index],
                None => {
                    self.series.push(Series {
                        address,
                        tag: field.tag,
                        samples: Deque::new(),
                    });
                    let last = self.series.len() - 1;
                    &mut self.series[last]
                }
            };
            while series.samples.len() >= limit {
                series.samples.pop_front();
            }
            let _ = series.samples.push_back(Sample {
                cycle,
                reading: field.reading,
            });
        }
        self.recorded_messages += 1;
    }

    /// Oldest-first samples for one device; empty if never seen.
    pub fn series(
        &self,
        address: PeripheralAddress,
        tag: DeviceTag,
    ) -> impl Iterator<Item = &Sample> + '_ {
        self.series
            .iter()
            .filter(move |s| s.address == address && s.tag == tag)
            .flat_map(|s| s.samples.iter())
    }

    pub fn latest(&self, address: PeripheralAddress, tag: DeviceTag) -> Option<Sample> {
        self.series(address, tag).last().copied()
    }

    /// Tags seen so far for `address`, in first-seen order.
    pub fn tags(&self, address: PeripheralAddress) -> impl Iterator<Item = DeviceTag> + '_ {
        self.series
            .iter()
            .filter(move |s| s.address == address)
            .map(|s| s.tag)
    }

    pub fn recorded_messages(&self) -> u64 {
        self.recorded_messages
    }

    pub fn windows(&self) -> &HistoryWindows {
        &self.windows
    }
}
