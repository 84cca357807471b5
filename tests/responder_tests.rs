use healthbus::bus::{Clock, DirectionPin, SerialPort};
use healthbus::config::Timing;
use healthbus::peripheral::Peripheral;
use healthbus::protocol::*;
use healthbus::responder::*;
use healthbus::sensors::accelerometer::Accelerometer;
use healthbus::sensors::thermocouple::Thermocouple;
use healthbus::sensors::{SamplingCadence, SensorArray, SensorError};
use healthbus::transceiver::{Direction, TransceiverController, TransceiverError};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

fn addr(value: u8) -> PeripheralAddress {
    PeripheralAddress::new(value).unwrap()
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Time shared by the mock port, clock and pin.
#[derive(Clone, Default)]
struct Time(Rc<Cell<Duration>>);

impl Time {
    fn now(&self) -> Duration {
        self.0.get()
    }

    fn set(&self, at: Duration) {
        self.0.set(at);
    }
}

struct TestClock(Time);

impl Clock for TestClock {
    fn now(&self) -> Duration {
        self.0.now()
    }

    fn delay(&mut self, duration: Duration) {
        self.0.set(self.0.now() + duration);
    }
}

/// Receive queue with arrival times; records what was written and when.
struct TestPort {
    time: Time,
    rx: VecDeque<(Duration, u8)>,
    tx: Rc<RefCell<Vec<(Duration, u8)>>>,
}

impl TestPort {
    fn new(time: &Time) -> Self {
        Self {
            time: time.clone(),
            rx: VecDeque::new(),
            tx: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn arrive(&mut self, at: Duration, bytes: &[u8]) {
        for byte in bytes {
            self.rx.push_back((at, *byte));
        }
    }

    fn written(&self) -> String {
        self.tx.borrow().iter().map(|(_, b)| char::from(*b)).collect()
    }

    fn first_write_at(&self) -> Option<Duration> {
        self.tx.borrow().first().map(|(at, _)| *at)
    }
}

impl SerialPort for TestPort {
    type Error = String;

    fn read_byte(&mut self) -> nb::Result<u8, String> {
        let now = self.time.now();
        if matches!(self.rx.front(), Some((at, _)) if *at <= now) {
            self.rx.pop_front().map(|(_, b)| b).ok_or(nb::Error::WouldBlock)
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), String> {
        let now = self.time.now();
        self.tx.borrow_mut().extend(bytes.iter().map(|b| (now, *b)));
        Ok(())
    }
}

#[derive(Clone)]
struct TestPin {
    time: Time,
    events: Rc<RefCell<Vec<(Duration, Direction)>>>,
    fail_transmit: bool,
}

impl TestPin {
    fn new(time: &Time) -> Self {
        Self {
            time: time.clone(),
            events: Rc::new(RefCell::new(Vec::new())),
            fail_transmit: false,
        }
    }

    fn transmit_count(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|(_, d)| *d == Direction::Transmit)
            .count()
    }
}

impl DirectionPin for TestPin {
    type Error = &'static str;

    fn drive_transmit(&mut self) -> Result<(), Self::Error> {
        if self.fail_transmit {
            return Err("driver enable stuck low");
        }
        self.events.borrow_mut().push((self.time.now(), Direction::Transmit));
        Ok(())
    }

    fn drive_receive(&mut self) -> Result<(), Self::Error> {
        self.events.borrow_mut().push((self.time.now(), Direction::Receive));
        Ok(())
    }
}

struct Rig {
    time: Time,
    port: TestPort,
    clock: TestClock,
    pin: TestPin,
    responder: PollResponder<TestPin>,
}

fn rig(own: u8, triggers: &[u8]) -> Rig {
    rig_with_pin(own, triggers, |_| {})
}

fn rig_with_pin(own: u8, triggers: &[u8], setup: impl FnOnce(&mut TestPin)) -> Rig {
    let time = Time::default();
    let mut pin = TestPin::new(&time);
    setup(&mut pin);
    let timing = Timing::default();
    let transceiver = TransceiverController::new(pin.clone(), &timing).unwrap();
    let triggers = triggers.iter().map(|v| addr(*v)).collect();
    Rig {
        port: TestPort::new(&time),
        clock: TestClock(time.clone()),
        responder: PollResponder::new(addr(own), transceiver, triggers, &timing),
        pin,
        time,
    }
}

impl Rig {
    fn service(&mut self, source: &mut dyn ReplySource) -> Result<ResponderEvent, ResponderError> {
        self.responder.service(&mut self.port, &mut self.clock, source)
    }
}

struct BrokenSource;

impl ReplySource for BrokenSource {
    fn reply_line(&mut self) -> Result<LineBuffer, MalformedMessage> {
        Err(MalformedMessage::TooManyFields { limit: MAX_DEVICES })
    }
}

#[test]
fn test_answers_own_poll_after_turnaround() {
    let mut rig = rig(1, &[2]);
    let mut reply = FixedReply::new("1A78.45 B83.82 K0.13,-0.39,-9.81 U14.41").unwrap();
    rig.port.arrive(ms(0), b"1");

    let event = rig.service(&mut reply).unwrap();
    assert_eq!(event, ResponderEvent::Replied { bytes: 40 });
    assert_eq!(rig.port.written(), "1A78.45 B83.82 K0.13,-0.39,-9.81 U14.41\n");

    let timing = Timing::default();
    // Turnaround, then enable, then one settle before the first byte.
    assert_eq!(rig.port.first_write_at(), Some(timing.turnaround + timing.settle_delay));
    let events = rig.pin.events.borrow();
    assert_eq!(events.last().map(|(_, d)| *d), Some(Direction::Receive));
    assert_eq!(rig.pin.transmit_count(), 1);
    assert_eq!(rig.responder.stats().polls_answered, 1);
    assert_eq!(rig.responder.state(), ResponderState::Receiving);
}

#[test]
fn test_foreign_digits_without_drain_are_ignored() {
    let mut rig = rig(1, &[]);
    let mut reply = FixedReply::new("1A70.00").unwrap();
    rig.port.arrive(ms(0), b"3x9");

    assert_eq!(rig.service(&mut reply).unwrap(), ResponderEvent::Idle);
    assert_eq!(rig.pin.transmit_count(), 0);
    assert_eq!(rig.responder.stats().bytes_ignored, 3);
}

#[test]
fn test_neighbor_reply_containing_own_digit_is_drained() {
    let mut rig = rig(1, &[2]);
    let mut reply = FixedReply::new("1A70.00").unwrap();
    rig.port.arrive(ms(0), b"2");
    rig.port.arrive(ms(20), b"2A71.15 U1.10\n");

    // Only the poll byte has arrived: the window stays open.
    assert_eq!(
        rig.service(&mut reply).unwrap(),
        ResponderEvent::Draining {
            trigger: addr(2),
            discarded: 0
        }
    );

    rig.time.set(ms(25));
    assert_eq!(
        rig.service(&mut reply).unwrap(),
        ResponderEvent::DrainClosed {
            trigger: addr(2),
            discarded: 14,
            status: DrainStatus::Complete
        }
    );
    assert_eq!(rig.pin.transmit_count(), 0);
    assert_eq!(rig.responder.stats().drains_completed, 1);
    assert_eq!(rig.responder.stats().bytes_drained, 14);
    assert!(rig.responder.drain().is_none());
}

#[test]
fn test_drain_expires_without_newline() {
    let mut rig = rig(1, &[2]);
    let mut reply = FixedReply::new("1A70.00").unwrap();
    rig.port.arrive(ms(0), b"2");
    rig.port.arrive(ms(5), b"2A7");

    rig.service(&mut reply).unwrap();
    let deadline = rig.responder.drain().unwrap().deadline();
    assert_eq!(deadline, Timing::default().drain_window);

    rig.time.set(ms(10));
    assert_eq!(
        rig.service(&mut reply).unwrap(),
        ResponderEvent::Draining {
            trigger: addr(2),
            discarded: 3
        }
    );

    rig.time.set(deadline);
    let event = rig.service(&mut reply).unwrap();
    assert_eq!(
        event,
        ResponderEvent::DrainClosed {
            trigger: addr(2),
            discarded: 3,
            status: DrainStatus::Expired
        }
    );
    assert_eq!(rig.responder.stats().drains_expired, 1);

    // The next poll for us is answered normally.
    rig.port.arrive(deadline, b"1");
    assert!(matches!(
        rig.service(&mut reply).unwrap(),
        ResponderEvent::Replied { .. }
    ));
}

#[test]
fn test_silent_neighbor_does_not_swallow_our_poll() {
    let mut rig = rig(1, &[2]);
    let mut reply = FixedReply::new("1A70.00").unwrap();
    rig.port.arrive(ms(0), b"2");
    rig.service(&mut reply).unwrap();
    assert!(rig.responder.drain().is_some());

    // The neighbor never answers. A slow loop only looks again well after
    // the collector's next poll for us has landed, inside the drain window.
    rig.port.arrive(ms(150), b"1");
    rig.time.set(ms(160));
    assert_eq!(
        rig.service(&mut reply).unwrap(),
        ResponderEvent::Replied { bytes: 8 }
    );
    assert!(rig.responder.drain().is_none());
    assert_eq!(rig.responder.stats().drains_unanswered, 1);
    assert_eq!(rig.responder.stats().bytes_drained, 0);
    assert_eq!(rig.port.written(), "1A70.00\n");
}

#[test]
fn test_backlog_is_worked_through_in_one_call() {
    let mut rig = rig(1, &[2]);
    let mut reply = FixedReply::new("1A70.00").unwrap();
    rig.port.arrive(ms(0), b"2");
    rig.port.arrive(ms(1), b"2A71.11 K1.00,1.00,1.00\n");
    rig.port.arrive(ms(2), b"1");
    rig.time.set(ms(3));

    assert_eq!(
        rig.service(&mut reply).unwrap(),
        ResponderEvent::Replied { bytes: 8 }
    );
    assert_eq!(rig.pin.transmit_count(), 1);
    assert_eq!(rig.responder.stats().drains_completed, 1);
}

#[test]
fn test_unbuildable_reply_keeps_the_driver_off() {
    let mut rig = rig(1, &[]);
    rig.port.arrive(ms(0), b"1");

    let result = rig.service(&mut BrokenSource);
    assert!(matches!(result, Err(ResponderError::Encode(_))));
    assert_eq!(rig.pin.transmit_count(), 0);
    assert_eq!(rig.responder.stats().reply_failures, 1);
    assert!(rig.port.written().is_empty());
}

#[test]
fn test_pin_failure_reported_and_bus_released() {
    let mut rig = rig_with_pin(1, &[], |pin| pin.fail_transmit = true);
    let mut reply = FixedReply::new("1A70.00").unwrap();
    rig.port.arrive(ms(0), b"1");

    let result = rig.service(&mut reply);
    assert!(matches!(
        result,
        Err(ResponderError::Transceiver(TransceiverError::Pin(_)))
    ));
    assert!(rig.port.written().is_empty());
    assert_eq!(
        rig.responder.transceiver().state().direction(),
        Direction::Receive
    );
    assert_eq!(rig.responder.transceiver().state().failed_transmissions(), 1);
}

#[test]
fn test_peripheral_reports_fresh_readings() {
    let time = Time::default();
    let timing = Timing::default();
    let pin = TestPin::new(&time);
    let transceiver = TransceiverController::new(pin, &timing).unwrap();
    let responder = PollResponder::new(addr(2), transceiver, heapless::Vec::new(), &timing);

    let mut sensors = SensorArray::new(SamplingCadence::default());
    sensors
        .attach(DeviceTag::new('A').unwrap(), Box::new(Thermocouple::steady(78.45)))
        .unwrap();
    sensors
        .attach(
            DeviceTag::new('K').unwrap(),
            Box::new(Accelerometer::at_rest([0.0, 0.0, -9.81]).with_fault(SensorError::NotResponding)),
        )
        .unwrap();

    let mut port = TestPort::new(&time);
    port.arrive(ms(0), b"2");
    let tx = port.tx.clone();
    let mut peripheral = Peripheral::new("Vise", sensors, responder, port, TestClock(time.clone()));

    let event = peripheral.run_once().unwrap();
    assert!(matches!(event, ResponderEvent::Replied { .. }));
    let written: String = tx.borrow().iter().map(|(_, b)| char::from(*b)).collect();
    assert_eq!(written, "2A78.45 Knan\n");
    assert_eq!(peripheral.iterations(), 1);
    assert_eq!(peripheral.sensors().passes(), 1);
}
