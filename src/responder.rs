//! Peripheral side of the polling protocol.
//!
//! A peripheral only ever speaks when the collector writes its address
//! digit. Because every node hears every byte on the bus, the responder also
//! has to skip over the replies of other peripherals: their telemetry is full
//! of digits that would otherwise look like poll commands. After seeing a
//! drain trigger (by default the neighbor's address, i.e. the peripheral
//! polled right after this one) it opens a [`DrainWindow`] and discards input
//! until the end of that reply or until the window's deadline. A reply always
//! begins with its sender's address digit; if anything else arrives first the
//! peer stayed silent and the collector has moved on, so the window closes and
//! the byte is handled as fresh input.

use crate::bus::{Clock, DirectionPin, SerialPort};
use crate::config::Timing;
use crate::protocol::{
    LineBuffer, MalformedMessage, PeripheralAddress, MAX_LINE_LEN, MAX_PERIPHERALS,
};
use crate::transceiver::{TransceiverController, TransceiverError};
use core::time::Duration;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

/// Which poll bytes make a peripheral drain the reply that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrainPolicy {
    /// Only the address polled immediately after this peripheral.
    #[default]
    Neighbor,
    /// Any other configured address.
    AnyPeer,
}

impl DrainPolicy {
    /// Drain triggers for `own` given the collector's poll order.
    ///
    /// The neighbor wraps around the end of the order. A peripheral that is
    /// alone on the bus has no neighbor. One that is absent from the order is
    /// never polled, so every reply on the bus is foreign to it and it drains
    /// after any polled address.
    pub fn triggers(
        self,
        order: &[PeripheralAddress],
        own: PeripheralAddress,
    ) -> Vec<PeripheralAddress, MAX_PERIPHERALS> {
        let mut triggers = Vec::new();
        match self {
            DrainPolicy::Neighbor => {
                if let Some(index) = order.iter().position(|a| *a == own) {
                    let neighbor = order[(index + 1) % order.len()];
                    if neighbor != own {
                        let _ = triggers.push(neighbor);
                    }
                } else {
                    return DrainPolicy::AnyPeer.triggers(order, own);
                }
            }
            DrainPolicy::AnyPeer => {
                for address in order {
                    if *address != own && !triggers.contains(address) {
                        let _ = triggers.push(*address);
                    }
                }
            }
        }
        triggers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponderState {
    Receiving,
    Replying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DrainStatus {
    Open,
    /// The drained reply's newline was seen.
    Complete,
    /// The deadline passed first.
    Expired,
    /// Other traffic arrived before the drained peer began its reply.
    Unanswered,
}

/// Bounded discard of another peripheral's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainWindow {
    trigger: PeripheralAddress,
    deadline: Duration,
    discarded: usize,
}

impl DrainWindow {
    pub fn open(trigger: PeripheralAddress, now: Duration, window: Duration) -> Self {
        Self {
            trigger,
            deadline: now + window,
            discarded: 0,
        }
    }

    /// Whether `byte` is part of the drained reply. Before the reply has
    /// begun only the trigger's address digit can start it.
    pub fn claims(&self, byte: u8) -> bool {
        self.discarded > 0 || byte == self.trigger.poll_byte()
    }

    /// Swallows one byte. The terminating newline is swallowed too.
    pub fn feed(&mut self, byte: u8) -> DrainStatus {
        self.discarded += 1;
        if byte == b'\n' {
            DrainStatus::Complete
        } else {
            DrainStatus::Open
        }
    }

    /// Moves the deadline out to `at` while a reply is still arriving.
    pub fn extend_to(&mut self, at: Duration) {
        if at > self.deadline {
            self.deadline = at;
        }
    }

    pub fn is_expired(&self, now: Duration) -> bool {
        now >= self.deadline
    }

    pub fn trigger(&self) -> PeripheralAddress {
        self.trigger
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }
}

/// Produces the line sent back when this peripheral is polled.
pub trait ReplySource {
    fn reply_line(&mut self) -> Result<LineBuffer, MalformedMessage>;
}

/// A reply that never changes. Stands in for a peripheral whose output is
/// known up front.
#[derive(Debug, Clone)]
pub struct FixedReply {
    line: LineBuffer,
}

impl FixedReply {
    /// Appends the newline if `line` lacks one.
    pub fn new(line: &str) -> Result<Self, MalformedMessage> {
        let too_long = MalformedMessage::LineTooLong {
            limit: MAX_LINE_LEN,
        };
        let mut buffer = LineBuffer::new();
        buffer.try_push_str(line).map_err(|_| too_long.clone())?;
        if !line.ends_with('\n') {
            buffer.try_push('\n').map_err(|_| too_long)?;
        }
        Ok(Self { line: buffer })
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }
}

impl ReplySource for FixedReply {
    fn reply_line(&mut self) -> Result<LineBuffer, MalformedMessage> {
        Ok(self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponderError {
    #[error("could not build reply: {0}")]
    Encode(#[from] MalformedMessage),
    #[error(transparent)]
    Transceiver(#[from] TransceiverError),
    #[error("serial read: {0}")]
    Read(String),
}

/// What one call to [`PollResponder::service`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderEvent {
    /// Nothing addressed to us was waiting.
    Idle,
    Replied { bytes: usize },
    /// A drain window is still open; input ran dry before it closed.
    Draining {
        trigger: PeripheralAddress,
        discarded: usize,
    },
    DrainClosed {
        trigger: PeripheralAddress,
        discarded: usize,
        status: DrainStatus,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResponderStats {
    pub polls_answered: u32,
    pub reply_failures: u32,
    pub bytes_ignored: u32,
    pub drains_completed: u32,
    pub drains_expired: u32,
    pub drains_unanswered: u32,
    pub bytes_drained: u32,
}

#[derive(Debug)]
pub struct PollResponder<D: DirectionPin> {
    address: PeripheralAddress,
    transceiver: TransceiverController<D>,
    drain_triggers: Vec<PeripheralAddress, MAX_PERIPHERALS>,
    drain_window: Duration,
    turnaround: Duration,
    state: ResponderState,
    drain: Option<DrainWindow>,
    stats: ResponderStats,
}

impl<D: DirectionPin> PollResponder<D> {
    pub fn new(
        address: PeripheralAddress,
        transceiver: TransceiverController<D>,
        drain_triggers: Vec<PeripheralAddress, MAX_PERIPHERALS>,
        timing: &Timing,
    ) -> Self {
        debug_assert!(
            !drain_triggers.contains(&address),
            "peripheral {} cannot drain its own address",
            address
        );
        Self {
            address,
            transceiver,
            drain_triggers,
            drain_window: timing.drain_window,
            turnaround: timing.turnaround,
            state: ResponderState::Receiving,
            drain: None,
            stats: ResponderStats::default(),
        }
    }

    /// Processes whatever input is waiting, without blocking for more.
    ///
    /// Stops early after a reply so the caller can go back to sensing.
    /// Finished drains do not stop the scan: a backlog holding several
    /// foreign replies and then our own poll is worked through in one call.
    /// A peripheral whose address never arrives never touches its direction
    /// pin here.
    pub fn service<P, C, S>(
        &mut self,
        port: &mut P,
        clock: &mut C,
        source: &mut S,
    ) -> Result<ResponderEvent, ResponderError>
    where
        P: SerialPort,
        C: Clock,
        S: ReplySource + ?Sized,
    {
        let mut event = ResponderEvent::Idle;
        loop {
            let byte = match port.read_byte() {
                Ok(byte) => byte,
                Err(nb::Error::WouldBlock) => {
                    // Buffered bytes are always drained; the deadline bounds
                    // only the wait for bytes that have not arrived. A reply
                    // in progress keeps it one turnaround past its last byte.
                    if let Some(window) = self.drain {
                        event = if window.is_expired(clock.now()) {
                            self.close_drain(DrainStatus::Expired)
                        } else {
                            ResponderEvent::Draining {
                                trigger: window.trigger(),
                                discarded: window.discarded(),
                            }
                        };
                    }
                    return Ok(event);
                }
                Err(nb::Error::Other(e)) => return Err(ResponderError::Read(e.to_string())),
            };

            if let Some(window) = self.drain.as_mut() {
                if window.claims(byte) {
                    self.stats.bytes_drained = self.stats.bytes_drained.saturating_add(1);
                    window.extend_to(clock.now() + self.turnaround);
                    if window.feed(byte) == DrainStatus::Complete {
                        event = self.close_drain(DrainStatus::Complete);
                    }
                    continue;
                }
                event = self.close_drain(DrainStatus::Unanswered);
            }

            match PeripheralAddress::from_poll_byte(byte) {
                Some(address) if address == self.address => {
                    return self.reply(port, clock, source);
                }
                Some(address) if self.drain_triggers.contains(&address) => {
                    debug!("{}: draining reply of {}", self.address, address);
                    self.drain = Some(DrainWindow::open(address, clock.now(), self.drain_window));
                }
                _ => {
                    trace!("{}: ignoring byte {:#04x}", self.address, byte);
                    self.stats.bytes_ignored = self.stats.bytes_ignored.saturating_add(1);
                }
            }
        }
    }

    fn reply<P, C, S>(
        &mut self,
        port: &mut P,
        clock: &mut C,
        source: &mut S,
    ) -> Result<ResponderEvent, ResponderError>
    where
        P: SerialPort,
        C: Clock,
        S: ReplySource + ?Sized,
    {
        let line = match source.reply_line() {
            Ok(line) => line,
            Err(e) => {
                self.stats.reply_failures = self.stats.reply_failures.saturating_add(1);
                warn!("{}: polled but reply could not be built: {}", self.address, e);
                return Err(e.into());
            }
        };

        self.state = ResponderState::Replying;
        // The collector keeps driving through its own post-write settle.
        clock.delay(self.turnaround);
        let sent = self.transceiver.transmit(port, clock, line.as_bytes());
        self.state = ResponderState::Receiving;

        match sent {
            Ok(()) => {
                self.stats.polls_answered = self.stats.polls_answered.saturating_add(1);
                info!("{}: replied with {} bytes", self.address, line.len());
                Ok(ResponderEvent::Replied { bytes: line.len() })
            }
            Err(e) => {
                self.stats.reply_failures = self.stats.reply_failures.saturating_add(1);
                warn!("{}: reply transmission failed: {}", self.address, e);
                Err(e.into())
            }
        }
    }

    fn close_drain(&mut self, status: DrainStatus) -> ResponderEvent {
        let Some(window) = self.drain.take() else {
            return ResponderEvent::Idle;
        };
        match status {
            DrainStatus::Expired => {
                self.stats.drains_expired = self.stats.drains_expired.saturating_add(1);
                debug!(
                    "{}: drain after {} expired ({} bytes)",
                    self.address,
                    window.trigger(),
                    window.discarded()
                );
            }
            DrainStatus::Unanswered => {
                self.stats.drains_unanswered = self.stats.drains_unanswered.saturating_add(1);
                debug!("{}: {} never replied", self.address, window.trigger());
            }
            DrainStatus::Open | DrainStatus::Complete => {
                self.stats.drains_completed = self.stats.drains_completed.saturating_add(1);
                trace!(
                    "{}: drained {} bytes from {}",
                    self.address,
                    window.discarded(),
                    window.trigger()
                );
            }
        }
        ResponderEvent::DrainClosed {
            trigger: window.trigger(),
            discarded: window.discarded(),
            status,
        }
    }

    pub fn address(&self) -> PeripheralAddress {
        self.address
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn drain(&self) -> Option<&DrainWindow> {
        self.drain.as_ref()
    }

    pub fn drain_triggers(&self) -> &[PeripheralAddress] {
        &self.drain_triggers
    }

    pub fn transceiver(&self) -> &TransceiverController<D> {
        &self.transceiver
    }

    pub fn stats(&self) -> &ResponderStats {
        &self.stats
    }
}
