//! Virtual-time model of the shared RS-485 pair.
//!
//! Every attached node has its own clock. A byte written at time `t` by a
//! node with an enabled driver lands in every other node's receive queue at
//! `t + (k + 1) * byte_time`. Driver-enable windows are logged so overlaps
//! can be checked after a run; releasing a driver before its frame has
//! clocked out is recorded as a truncation and the unsent bytes are lost.

use crate::bus::{Clock, DirectionPin, SerialPort};
use core::convert::Infallible;
use core::time::Duration;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::{trace, warn};

pub type SharedMedium = Rc<RefCell<Medium>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimBusError {
    #[error("{0} wrote while its driver was disabled")]
    DriverDisabled(String),
}

/// Interval during which one node held its driver enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransmitWindow {
    pub node: NodeId,
    pub label: String,
    pub start: Duration,
    pub end: Duration,
    pub bytes: usize,
}

impl TransmitWindow {
    pub fn overlaps(&self, other: &TransmitWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Truncation {
    pub node: NodeId,
    pub label: String,
    pub at: Duration,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    lands_at: Duration,
    byte: u8,
    from: NodeId,
}

#[derive(Debug)]
struct NodeState {
    label: String,
    now: Duration,
    driving_since: Option<Duration>,
    window_bytes: usize,
    busy_until: Duration,
    rx: VecDeque<InFlight>,
}

#[derive(Debug)]
pub struct Medium {
    byte_time: Duration,
    nodes: Vec<NodeState>,
    windows: Vec<TransmitWindow>,
    truncations: Vec<Truncation>,
}

impl Medium {
    pub fn new(byte_time: Duration) -> Self {
        Self {
            byte_time,
            nodes: Vec::new(),
            windows: Vec::new(),
            truncations: Vec::new(),
        }
    }

    pub fn shared(byte_time: Duration) -> SharedMedium {
        Rc::new(RefCell::new(Self::new(byte_time)))
    }

    pub fn attach(&mut self, label: impl Into<String>) -> NodeId {
        self.nodes.push(NodeState {
            label: label.into(),
            now: Duration::ZERO,
            driving_since: None,
            window_bytes: 0,
            busy_until: Duration::ZERO,
            rx: VecDeque::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn byte_time(&self) -> Duration {
        self.byte_time
    }

    pub fn label(&self, node: NodeId) -> &str {
        &self.nodes[node.0].label
    }

    pub fn now(&self, node: NodeId) -> Duration {
        self.nodes[node.0].now
    }

    pub fn advance(&mut self, node: NodeId, by: Duration) {
        self.nodes[node.0].now += by;
    }

    /// Moves a node's clock forward to `at`; never backwards.
    pub fn advance_to(&mut self, node: NodeId, at: Duration) {
        let state = &mut self.nodes[node.0];
        if at > state.now {
            state.now = at;
        }
    }

    pub fn is_driving(&self, node: NodeId) -> bool {
        self.nodes[node.0].driving_since.is_some()
    }

    pub fn enable_driver(&mut self, node: NodeId) {
        let state = &mut self.nodes[node.0];
        if state.driving_since.is_none() {
            state.driving_since = Some(state.now);
            state.window_bytes = 0;
            trace!("{} driver on at {:?}", state.label, state.now);
        }
    }

    pub fn disable_driver(&mut self, node: NodeId) {
        let byte_time = self.byte_time;
        let state = &mut self.nodes[node.0];
        let Some(start) = state.driving_since.take() else {
            return;
        };
        let now = state.now;
        let label = state.label.clone();
        let bytes = state.window_bytes;

        if now < state.busy_until {
            let remaining = state.busy_until - now;
            let dropped = usize::try_from(
                remaining
                    .as_nanos()
                    .div_ceil(byte_time.as_nanos().max(1)),
            )
            .unwrap_or(usize::MAX);
            state.busy_until = now;
            for other in &mut self.nodes {
                other.rx.retain(|f| !(f.from == node && f.lands_at > now));
            }
            warn!("{} released its driver with {} byte(s) unsent", label, dropped);
            self.truncations.push(Truncation {
                node,
                label: label.clone(),
                at: now,
                dropped,
            });
        }

        trace!("{} driver off at {:?}", label, now);
        self.windows.push(TransmitWindow {
            node,
            label,
            start,
            end: now,
            bytes,
        });
    }

    /// Queues `bytes` behind anything this node is still shifting out.
    pub fn transmit(&mut self, node: NodeId, bytes: &[u8]) -> Result<(), SimBusError> {
        let byte_time = self.byte_time;
        let state = &mut self.nodes[node.0];
        if state.driving_since.is_none() {
            return Err(SimBusError::DriverDisabled(state.label.clone()));
        }
        let start = state.now.max(state.busy_until);
        let count = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        state.busy_until = start + byte_time * count;
        state.window_bytes += bytes.len();

        for (index, other) in self.nodes.iter_mut().enumerate() {
            if index == node.0 {
                continue;
            }
            for (k, byte) in (1u32..).zip(bytes) {
                let lands_at = start + byte_time * k;
                let position = other.rx.partition_point(|f| f.lands_at <= lands_at);
                other.rx.insert(
                    position,
                    InFlight {
                        lands_at,
                        byte: *byte,
                        from: node,
                    },
                );
            }
        }
        Ok(())
    }

    /// Next byte that has fully arrived at `node` by its current time.
    pub fn receive(&mut self, node: NodeId) -> Option<u8> {
        let state = &mut self.nodes[node.0];
        let now = state.now;
        if matches!(state.rx.front(), Some(front) if front.lands_at <= now) {
            state.rx.pop_front().map(|f| f.byte)
        } else {
            None
        }
    }

    pub fn is_flushed(&self, node: NodeId) -> bool {
        let state = &self.nodes[node.0];
        state.now >= state.busy_until
    }

    /// Closed transmit windows in the order they closed.
    pub fn windows(&self) -> &[TransmitWindow] {
        &self.windows
    }

    pub fn truncations(&self) -> &[Truncation] {
        &self.truncations
    }

    /// Every pair of windows from different nodes that shared time on the wire.
    pub fn overlaps(&self) -> Vec<(TransmitWindow, TransmitWindow)> {
        let mut found = Vec::new();
        for (index, a) in self.windows.iter().enumerate() {
            for b in &self.windows[index + 1..] {
                if a.node != b.node && a.overlaps(b) {
                    found.push((a.clone(), b.clone()));
                }
            }
        }
        found
    }
}

/// UART handle of one node.
#[derive(Debug, Clone)]
pub struct SimPort {
    medium: SharedMedium,
    node: NodeId,
}

impl SimPort {
    pub fn new(medium: SharedMedium, node: NodeId) -> Self {
        Self { medium, node }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl SerialPort for SimPort {
    type Error = SimBusError;

    fn read_byte(&mut self) -> nb::Result<u8, Self::Error> {
        self.medium
            .borrow_mut()
            .receive(self.node)
            .ok_or(nb::Error::WouldBlock)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.medium.borrow_mut().transmit(self.node, bytes)
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        if self.medium.borrow().is_flushed(self.node) {
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }
}

/// Direction pin of one node.
#[derive(Debug, Clone)]
pub struct SimPin {
    medium: SharedMedium,
    node: NodeId,
}

impl SimPin {
    pub fn new(medium: SharedMedium, node: NodeId) -> Self {
        Self { medium, node }
    }
}

impl DirectionPin for SimPin {
    type Error = Infallible;

    fn drive_transmit(&mut self) -> Result<(), Self::Error> {
        self.medium.borrow_mut().enable_driver(self.node);
        Ok(())
    }

    fn drive_receive(&mut self) -> Result<(), Self::Error> {
        self.medium.borrow_mut().disable_driver(self.node);
        Ok(())
    }
}

/// Clock of a node that only ever advances itself.
#[derive(Debug, Clone)]
pub struct SimClock {
    medium: SharedMedium,
    node: NodeId,
}

impl SimClock {
    pub fn new(medium: SharedMedium, node: NodeId) -> Self {
        Self { medium, node }
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.medium.borrow().now(self.node)
    }

    fn delay(&mut self, duration: Duration) {
        self.medium.borrow_mut().advance(self.node, duration);
    }
}
