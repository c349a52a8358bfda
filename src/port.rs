//! Pin-level hardware abstraction
//!
//! The CC debug interface is bit-banged over three lines: RESET, the debug
//! clock DC, and the bidirectional debug data line DD. [`PinPort`] is the
//! seam between the protocol engine and whatever drives those lines on the
//! host; implement it for your GPIO peripheral and hand it to
//! [`Flasher::connect`](crate::flasher::Flasher::connect).

use strum::Display;

/// The three lines of the CC debug interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Pin {
    /// Chip reset, active low
    Reset,
    /// Debug clock, driven by the host
    DebugClock,
    /// Debug data, bidirectional
    DebugData,
}

/// Direction of a pin as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Output,
    Input,
}

/// Driver for the three debug pins.
///
/// All operations are synchronous and infallible; a GPIO line either exists
/// or the implementation could not have been constructed. `DebugData` is the
/// only pin whose direction changes after initialization — the connection
/// flips it around every command.
pub trait PinPort {
    /// Configure `pin` as an input or an output.
    fn set_direction(&mut self, pin: Pin, direction: PinDirection);

    /// Drive an output pin high or low.
    fn set_state(&mut self, pin: Pin, high: bool);

    /// Sample the current state of a pin.
    fn state(&mut self, pin: Pin) -> bool;

    /// Wait for half a debug clock period.
    ///
    /// This paces every DC edge. Implementations where the pin-toggle call
    /// latency already exceeds the chip's minimum clock period may make this
    /// a no-op.
    fn delay(&mut self);
}
