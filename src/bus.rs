//! Hardware seams: the UART, the transceiver's direction pin and a clock.
//!
//! Everything above this module is written against these traits so the same
//! protocol code runs on a board, on a host serial adapter, or against the
//! simulated medium in [`crate::sim`].

use core::fmt;
use core::time::Duration;

/// Byte-oriented half of a UART attached to the RS-485 transceiver.
pub trait SerialPort {
    type Error: fmt::Display;

    /// Non-blocking read of one received byte.
    fn read_byte(&mut self) -> nb::Result<u8, Self::Error>;

    /// Queues bytes for transmission. May return before they have clocked out.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// `WouldBlock` until every queued byte has left the shift register.
    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }

    /// Drops everything currently buffered on the receive side.
    fn discard_input(&mut self) -> usize {
        let mut discarded = 0;
        while self.read_byte().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

/// Driver-enable / receiver-enable line of the transceiver.
pub trait DirectionPin {
    type Error: fmt::Display;

    fn drive_transmit(&mut self) -> Result<(), Self::Error>;
    fn drive_receive(&mut self) -> Result<(), Self::Error>;
}

/// Monotonic time source with a blocking delay.
pub trait Clock {
    fn now(&self) -> Duration;
    fn delay(&mut self, duration: Duration);
}
