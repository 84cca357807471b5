use crate::bus::{Clock, DirectionPin, SerialPort};
use crate::config::Timing;
use crate::protocol::{
    LineBuffer, MalformedMessage, PeripheralAddress, TelemetryMessage, MAX_LINE_LEN,
    MAX_PERIPHERALS,
};
use crate::telemetry::TelemetryDecoder;
use crate::transceiver::TransceiverController;
use core::time::Duration;
use heapless::Vec;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollOrderError {
    #[error("poll order is empty")]
    Empty,
    #[error("address {0} appears more than once in the poll order")]
    Duplicate(PeripheralAddress),
}

/// The sequence of addresses the collector polls each cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollOrder {
    addresses: Vec<PeripheralAddress, MAX_PERIPHERALS>,
}

impl PollOrder {
    pub fn new(addresses: &[PeripheralAddress]) -> Result<Self, PollOrderError> {
        if addresses.is_empty() {
            return Err(PollOrderError::Empty);
        }
        let mut order: Vec<PeripheralAddress, MAX_PERIPHERALS> = Vec::new();
        for address in addresses {
            // Distinct addresses never outnumber the capacity.
            if order.contains(address) || order.push(*address).is_err() {
                return Err(PollOrderError::Duplicate(*address));
            }
        }
        Ok(Self { addresses: order })
    }

    pub fn as_slice(&self) -> &[PeripheralAddress] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn contains(&self, address: PeripheralAddress) -> bool {
        self.addresses.contains(&address)
    }

    /// The address polled right after `address`, wrapping at the end.
    pub fn neighbor_of(&self, address: PeripheralAddress) -> Option<PeripheralAddress> {
        let index = self.addresses.iter().position(|a| *a == address)?;
        let neighbor = self.addresses[(index + 1) % self.addresses.len()];
        (neighbor != address).then_some(neighbor)
    }
}

/// Result of polling one address once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum PollOutcome {
    Decoded(TelemetryMessage),
    /// No complete line before the reply timeout.
    Unresponsive,
    Malformed(MalformedMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollResult {
    pub address: PeripheralAddress,
    pub outcome: PollOutcome,
}

/// Everything one pass over the poll order produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at_ms: u64,
    pub elapsed_ms: u64,
    pub results: Vec<PollResult, MAX_PERIPHERALS>,
}

impl CycleReport {
    pub fn outcome(&self, address: PeripheralAddress) -> Option<&PollOutcome> {
        self.results
            .iter()
            .find(|r| r.address == address)
            .map(|r| &r.outcome)
    }

    pub fn decoded(&self) -> impl Iterator<Item = &TelemetryMessage> + '_ {
        self.results.iter().filter_map(|r| match &r.outcome {
            PollOutcome::Decoded(message) => Some(message),
            _ => None,
        })
    }

    pub fn unresponsive(&self) -> impl Iterator<Item = PeripheralAddress> + '_ {
        self.results
            .iter()
            .filter(|r| r.outcome == PollOutcome::Unresponsive)
            .map(|r| r.address)
    }

    pub fn malformed(&self) -> impl Iterator<Item = (PeripheralAddress, &MalformedMessage)> + '_ {
        self.results.iter().filter_map(|r| match &r.outcome {
            PollOutcome::Malformed(e) => Some((r.address, e)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddressStats {
    pub polls: u32,
    pub replies: u32,
    pub timeouts: u32,
    pub malformed: u32,
    pub consecutive_timeouts: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub total_polls: u32,
    pub total_replies: u32,
    pub total_timeouts: u32,
    pub total_malformed: u32,
    pub stale_bytes_discarded: u32,
    per_address: [AddressStats; MAX_PERIPHERALS],
}

impl SchedulerStats {
    pub fn address(&self, address: PeripheralAddress) -> &AddressStats {
        &self.per_address[usize::from(address.value())]
    }

    fn record(&mut self, address: PeripheralAddress, outcome: &PollOutcome) {
        let entry = &mut self.per_address[usize::from(address.value())];
        entry.polls = entry.polls.saturating_add(1);
        self.total_polls = self.total_polls.saturating_add(1);
        match outcome {
            PollOutcome::Decoded(_) => {
                if entry.consecutive_timeouts > 0 {
                    info!(
                        "peripheral {} back after {} missed poll(s)",
                        address, entry.consecutive_timeouts
                    );
                }
                entry.replies = entry.replies.saturating_add(1);
                entry.consecutive_timeouts = 0;
                self.total_replies = self.total_replies.saturating_add(1);
            }
            PollOutcome::Unresponsive => {
                entry.timeouts = entry.timeouts.saturating_add(1);
                entry.consecutive_timeouts = entry.consecutive_timeouts.saturating_add(1);
                self.total_timeouts = self.total_timeouts.saturating_add(1);
            }
            PollOutcome::Malformed(_) => {
                entry.malformed = entry.malformed.saturating_add(1);
                entry.consecutive_timeouts = 0;
                self.total_malformed = self.total_malformed.saturating_add(1);
            }
        }
    }

    fn discarded(&mut self, bytes: usize) {
        self.stale_bytes_discarded = self
            .stale_bytes_discarded
            .saturating_add(u32::try_from(bytes).unwrap_or(u32::MAX));
    }
}

enum LineRead {
    Line(LineBuffer),
    Overflow,
    /// Deadline hit after this many bytes of an unfinished line.
    Partial(usize),
    Nothing,
}

/// Bus master. Owns the collector's port, direction pin and clock and polls
/// one address at a time; the next poll byte is never written before the
/// previous reply window has closed.
#[derive(Debug)]
pub struct PollScheduler<P, D, C>
where
    P: SerialPort,
    D: DirectionPin,
    C: Clock,
{
    order: PollOrder,
    decoder: TelemetryDecoder,
    transceiver: TransceiverController<D>,
    port: P,
    clock: C,
    timing: Timing,
    cycle: u64,
    last_cycle_start: Option<Duration>,
    stats: SchedulerStats,
}

impl<P, D, C> PollScheduler<P, D, C>
where
    P: SerialPort,
    D: DirectionPin,
    C: Clock,
{
    pub fn new(
        order: PollOrder,
        decoder: TelemetryDecoder,
        transceiver: TransceiverController<D>,
        port: P,
        clock: C,
        timing: Timing,
    ) -> Self {
        Self {
            order,
            decoder,
            transceiver,
            port,
            clock,
            timing,
            cycle: 0,
            last_cycle_start: None,
            stats: SchedulerStats::default(),
        }
    }

    /// Polls every address in order once. Cycles start no closer together
    /// than the configured cycle interval.
    pub fn run_cycle(&mut self) -> CycleReport {
        if let Some(last) = self.last_cycle_start {
            let next = last + self.timing.cycle_interval;
            let now = self.clock.now();
            if now < next {
                self.clock.delay(next - now);
            }
        }
        let started = self.clock.now();
        self.last_cycle_start = Some(started);

        let mut results: Vec<PollResult, MAX_PERIPHERALS> = Vec::new();
        let order = self.order.clone();
        for &address in order.as_slice() {
            let outcome = self.poll(address);
            // One result per poll order entry; the order is bounded the same way.
            let _ = results.push(PollResult { address, outcome });
        }

        let report = CycleReport {
            cycle: self.cycle,
            started_at_ms: duration_ms(started),
            elapsed_ms: duration_ms(self.clock.now().saturating_sub(started)),
            results,
        };
        info!(
            "cycle {}: {} decoded, {} unresponsive, {} malformed",
            report.cycle,
            report.decoded().count(),
            report.unresponsive().count(),
            report.malformed().count()
        );
        self.cycle += 1;
        self.stats.cycles += 1;
        report
    }

    /// Writes one poll byte and waits out its reply window.
    pub fn poll(&mut self, address: PeripheralAddress) -> PollOutcome {
        let stale = self.port.discard_input();
        if stale > 0 {
            debug!("dropped {} stale byte(s) before polling {}", stale, address);
            self.stats.discarded(stale);
        }

        let started = self.clock.now();
        let deadline = started + self.timing.reply_timeout;
        trace!("polling {}", address);
        if let Err(e) = self
            .transceiver
            .transmit(&mut self.port, &mut self.clock, &[address.poll_byte()])
        {
            // Still wait the full window; part of the poll may have gone out.
            warn!("poll of {} not sent cleanly: {}", address, e);
        }

        let outcome = match self.read_line(deadline) {
            LineRead::Line(line) => self.decode_reply(address, &line),
            LineRead::Overflow => PollOutcome::Malformed(MalformedMessage::LineTooLong {
                limit: MAX_LINE_LEN,
            }),
            LineRead::Partial(received) => {
                let late = self.wait_out_reply(deadline);
                warn!(
                    "peripheral {} timed out mid-reply after {} byte(s), {} more after the deadline",
                    address, received, late
                );
                PollOutcome::Unresponsive
            }
            LineRead::Nothing => {
                let late = self.wait_out_reply(deadline);
                if late > 0 {
                    warn!(
                        "peripheral {} started replying after the deadline; {} byte(s) discarded",
                        address, late
                    );
                } else {
                    warn!("peripheral {} unresponsive", address);
                }
                PollOutcome::Unresponsive
            }
        };

        match &outcome {
            PollOutcome::Decoded(message) => {
                debug!("peripheral {} reported {} field(s)", address, message.len());
            }
            PollOutcome::Malformed(e) => warn!("discarding reply from {}: {}", address, e),
            PollOutcome::Unresponsive => {}
        }
        self.stats.record(address, &outcome);

        // The peripheral may still hold its driver through its trailing settle.
        self.clock.delay(self.timing.turnaround);
        outcome
    }

    fn read_line(&mut self, deadline: Duration) -> LineRead {
        let mut line = LineBuffer::new();
        let mut received = 0usize;
        let mut overflowed = false;
        loop {
            match self.port.read_byte() {
                Ok(b'\n') => {
                    return if overflowed {
                        LineRead::Overflow
                    } else {
                        LineRead::Line(line)
                    };
                }
                Ok(byte) => {
                    received += 1;
                    if line.try_push(char::from(byte)).is_err() {
                        overflowed = true;
                    }
                }
                Err(e) => {
                    if let nb::Error::Other(e) = e {
                        warn!("serial read error while awaiting reply: {}", e);
                    }
                    let now = self.clock.now();
                    if now >= deadline {
                        return if received == 0 {
                            LineRead::Nothing
                        } else {
                            LineRead::Partial(received)
                        };
                    }
                    self.clock
                        .delay(self.timing.read_poll_interval.min(deadline - now));
                }
            }
        }
    }

    /// Runs after a reply window closed without a complete line. Discards
    /// whatever is still arriving and returns once the newline has passed or
    /// the line has been quiet for one turnaround, so the next poll never
    /// starts while the peripheral is still driving. Bounded by the time a
    /// longest-possible line takes.
    fn wait_out_reply(&mut self, deadline: Duration) -> usize {
        let line_time = self.timing.byte_time * u32::try_from(MAX_LINE_LEN).unwrap_or(u32::MAX);
        let limit = deadline + line_time + self.timing.turnaround;
        let mut quiet_since = self.clock.now();
        let mut discarded = 0usize;
        loop {
            match self.port.read_byte() {
                Ok(byte) => {
                    discarded += 1;
                    if byte == b'\n' {
                        return discarded;
                    }
                    quiet_since = self.clock.now();
                }
                Err(_) => {
                    let now = self.clock.now();
                    if now >= limit || now.saturating_sub(quiet_since) >= self.timing.turnaround {
                        return discarded;
                    }
                    self.clock.delay(self.timing.read_poll_interval);
                }
            }
        }
    }

    fn decode_reply(&self, address: PeripheralAddress, line: &str) -> PollOutcome {
        match self.decoder.decode(line) {
            Ok(message) if message.address() != address => {
                PollOutcome::Malformed(MalformedMessage::AddressMismatch {
                    expected: address,
                    received: message.address(),
                })
            }
            Ok(message) => PollOutcome::Decoded(message),
            Err(e) => PollOutcome::Malformed(e),
        }
    }

    pub fn order(&self) -> &PollOrder {
        &self.order
    }

    pub fn decoder(&self) -> &TelemetryDecoder {
        &self.decoder
    }

    pub fn transceiver(&self) -> &TransceiverController<D> {
        &self.transceiver
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
