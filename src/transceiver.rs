use crate::bus::{Clock, DirectionPin, SerialPort};
use crate::config::Timing;
use core::time::Duration;
use serde::Serialize;
use tracing::{trace, warn};

// Polling period while waiting for the UART to drain.
const FLUSH_POLL: Duration = Duration::from_micros(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Receive,
    Transmit,
}

/// Direction state of one node's transceiver. Only the owning
/// [`TransceiverController`] mutates it.
#[derive(Debug, Clone, Serialize)]
pub struct BusState {
    direction: Direction,
    transmissions: u32,
    failed_transmissions: u32,
}

impl BusState {
    fn new() -> Self {
        Self {
            direction: Direction::Receive,
            transmissions: 0,
            failed_transmissions: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_transmitting(&self) -> bool {
        self.direction == Direction::Transmit
    }

    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    pub fn failed_transmissions(&self) -> u32 {
        self.failed_transmissions
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransceiverError {
    #[error("direction pin: {0}")]
    Pin(String),
    #[error("serial write: {0}")]
    Write(String),
    #[error("frame still unsent after {0:?}")]
    FlushTimeout(Duration),
}

/// Owns a node's direction pin. Keeps the node a receiver except for the
/// window in which it writes a frame.
#[derive(Debug)]
pub struct TransceiverController<D: DirectionPin> {
    pin: D,
    state: BusState,
    settle_delay: Duration,
    byte_time: Duration,
}

impl<D: DirectionPin> TransceiverController<D> {
    /// Takes the pin and drives it to receive before anything else happens.
    pub fn new(pin: D, timing: &Timing) -> Result<Self, TransceiverError> {
        let mut controller = Self {
            pin,
            state: BusState::new(),
            settle_delay: timing.settle_delay,
            byte_time: timing.byte_time,
        };
        controller.set_receive()?;
        Ok(controller)
    }

    pub fn set_transmit(&mut self) -> Result<(), TransceiverError> {
        self.pin
            .drive_transmit()
            .map_err(|e| TransceiverError::Pin(e.to_string()))?;
        self.state.direction = Direction::Transmit;
        trace!("transceiver -> transmit");
        Ok(())
    }

    pub fn set_receive(&mut self) -> Result<(), TransceiverError> {
        self.pin
            .drive_receive()
            .map_err(|e| TransceiverError::Pin(e.to_string()))?;
        self.state.direction = Direction::Receive;
        trace!("transceiver -> receive");
        Ok(())
    }

    /// Full transmit sequence: enable, settle, write, settle, release.
    ///
    /// The write only counts as done once the port has flushed the frame, so
    /// the trailing settle starts after the last stop bit. A port that has not
    /// flushed one settle delay after the frame's wire time is treated as a
    /// failed write. The pin is driven back to receive even when the enable
    /// or the write fails.
    pub fn transmit<P, C>(
        &mut self,
        port: &mut P,
        clock: &mut C,
        frame: &[u8],
    ) -> Result<(), TransceiverError>
    where
        P: SerialPort,
        C: Clock,
    {
        if let Err(e) = self.set_transmit() {
            self.state.failed_transmissions = self.state.failed_transmissions.saturating_add(1);
            if let Err(release) = self.set_receive() {
                warn!("failed to release bus after enable error: {}", release);
            }
            return Err(e);
        }

        clock.delay(self.settle_delay);
        let flush_limit = self.flush_allowance(frame.len());
        let written = port
            .write_all(frame)
            .map_err(|e| TransceiverError::Write(e.to_string()))
            .and_then(|()| Self::wait_for_flush(port, clock, flush_limit));
        if written.is_ok() {
            clock.delay(self.settle_delay);
        }
        let released = self.set_receive();

        match (written, released) {
            (Ok(()), Ok(())) => {
                self.state.transmissions = self.state.transmissions.saturating_add(1);
                Ok(())
            }
            (Err(e), _) | (Ok(()), Err(e)) => {
                self.state.failed_transmissions = self.state.failed_transmissions.saturating_add(1);
                Err(e)
            }
        }
    }

    /// Longest a frame of `len` bytes may take to leave the UART.
    fn flush_allowance(&self, len: usize) -> Duration {
        self.byte_time * u32::try_from(len).unwrap_or(u32::MAX) + self.settle_delay
    }

    fn wait_for_flush<P, C>(
        port: &mut P,
        clock: &mut C,
        allowance: Duration,
    ) -> Result<(), TransceiverError>
    where
        P: SerialPort,
        C: Clock,
    {
        let limit = clock.now() + allowance;
        loop {
            match port.flush() {
                Ok(()) => return Ok(()),
                Err(nb::Error::WouldBlock) if clock.now() >= limit => {
                    return Err(TransceiverError::FlushTimeout(allowance));
                }
                Err(nb::Error::WouldBlock) => clock.delay(FLUSH_POLL),
                Err(nb::Error::Other(e)) => return Err(TransceiverError::Write(e.to_string())),
            }
        }
    }

    pub fn state(&self) -> &BusState {
        &self.state
    }

    pub fn byte_time(&self) -> Duration {
        self.byte_time
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn pin(&self) -> &D {
        &self.pin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    enum Step {
        Transmit,
        Receive,
        Delay(Duration),
        Write(Vec<u8>),
    }

    type Log = Rc<RefCell<Vec<Step>>>;

    struct RecordingPin {
        log: Log,
        fail_transmit: bool,
    }

    impl DirectionPin for RecordingPin {
        type Error = &'static str;

        fn drive_transmit(&mut self) -> Result<(), Self::Error> {
            if self.fail_transmit {
                return Err("stuck low");
            }
            self.log.borrow_mut().push(Step::Transmit);
            Ok(())
        }

        fn drive_receive(&mut self) -> Result<(), Self::Error> {
            self.log.borrow_mut().push(Step::Receive);
            Ok(())
        }
    }

    struct RecordingPort {
        log: Log,
        fail_write: bool,
        stuck: bool,
    }

    impl SerialPort for RecordingPort {
        type Error = &'static str;

        fn read_byte(&mut self) -> nb::Result<u8, Self::Error> {
            Err(nb::Error::WouldBlock)
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
            if self.fail_write {
                return Err("uart overrun");
            }
            self.log.borrow_mut().push(Step::Write(bytes.to_vec()));
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), Self::Error> {
            if self.stuck {
                Err(nb::Error::WouldBlock)
            } else {
                Ok(())
            }
        }
    }

    struct RecordingClock {
        log: Log,
        now: Duration,
    }

    impl Clock for RecordingClock {
        fn now(&self) -> Duration {
            self.now
        }

        fn delay(&mut self, duration: Duration) {
            self.now += duration;
            self.log.borrow_mut().push(Step::Delay(duration));
        }
    }

    fn rig(fail_transmit: bool, fail_write: bool) -> (TransceiverController<RecordingPin>, RecordingPort, RecordingClock, Log) {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let pin = RecordingPin { log: log.clone(), fail_transmit };
        let port = RecordingPort { log: log.clone(), fail_write, stuck: false };
        let clock = RecordingClock { log: log.clone(), now: Duration::ZERO };
        let controller = TransceiverController::new(pin, &Timing::default()).unwrap();
        log.borrow_mut().clear();
        (controller, port, clock, log)
    }

    #[test]
    fn test_starts_in_receive() {
        let (controller, _, _, _) = rig(false, false);
        assert_eq!(controller.state().direction(), Direction::Receive);
        assert_eq!(controller.state().transmissions(), 0);
    }

    #[test]
    fn test_transmit_sequence() {
        let (mut controller, mut port, mut clock, log) = rig(false, false);
        controller.transmit(&mut port, &mut clock, b"1A70.00\n").unwrap();

        let settle = Duration::from_millis(5);
        assert_eq!(
            *log.borrow(),
            vec![
                Step::Transmit,
                Step::Delay(settle),
                Step::Write(b"1A70.00\n".to_vec()),
                Step::Delay(settle),
                Step::Receive,
            ]
        );
        assert_eq!(controller.state().direction(), Direction::Receive);
        assert_eq!(controller.state().transmissions(), 1);
        assert_eq!(clock.now(), Duration::from_millis(10));
    }

    #[test]
    fn test_write_failure_still_releases_bus() {
        let (mut controller, mut port, mut clock, log) = rig(false, true);
        let result = controller.transmit(&mut port, &mut clock, b"1\n");

        assert!(matches!(result, Err(TransceiverError::Write(_))));
        assert_eq!(log.borrow().last(), Some(&Step::Receive));
        assert_eq!(controller.state().direction(), Direction::Receive);
        assert_eq!(controller.state().failed_transmissions(), 1);
    }

    #[test]
    fn test_enable_failure_never_writes() {
        let (mut controller, mut port, mut clock, log) = rig(true, false);
        let result = controller.transmit(&mut port, &mut clock, b"1\n");

        assert!(matches!(result, Err(TransceiverError::Pin(_))));
        assert_eq!(*log.borrow(), vec![Step::Receive]);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn test_stuck_uart_releases_bus_after_allowance() {
        let (mut controller, mut port, mut clock, log) = rig(false, false);
        port.stuck = true;
        let result = controller.transmit(&mut port, &mut clock, b"1\n");

        assert!(matches!(result, Err(TransceiverError::FlushTimeout(_))));
        assert_eq!(log.borrow().last(), Some(&Step::Receive));
        assert_eq!(controller.state().direction(), Direction::Receive);
        assert_eq!(controller.state().failed_transmissions(), 1);

        // Leading settle, then at most the allowance plus one poll step.
        let timing = Timing::default();
        let allowance = timing.byte_time * 2 + timing.settle_delay;
        assert!(clock.now() >= timing.settle_delay + allowance);
        assert!(clock.now() <= timing.settle_delay + allowance + FLUSH_POLL);
    }
}
