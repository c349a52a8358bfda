//! Raspberry Pi GPIO pin interface
//!
//! Drives the three debug lines straight from the Pi's GPIO header via the
//! [rppal] crate. RESET and DC are plain outputs; DD flips between output
//! and input around every command.
//!
//! [rppal]: https://docs.rs/rppal/latest/rppal/

use std::time::{Duration, Instant};

use miette::Diagnostic;
use rppal::gpio::{Gpio, IoPin, Mode, OutputPin};
use thiserror::Error;

use crate::port::{Pin, PinDirection, PinPort};

#[derive(Error, Debug, Diagnostic)]
pub enum GpioInterfaceError {
    #[error("GPIO {0} is not available")]
    #[diagnostic(
        code(ccflash::gpio_unavailable),
        help("Check that the pin number uses BCM numbering and is not claimed by another peripheral")
    )]
    GpioUnavailable(u8),
    #[error("The GPIO peripheral is not accessible")]
    #[diagnostic(code(ccflash::gpio_error))]
    Gpio(#[from] rppal::gpio::Error),
}

/// [PinPort] implementation backed by the Raspberry Pi GPIO header
pub struct GpioInterface {
    reset: OutputPin,
    dc: OutputPin,
    dd: IoPin,
    half_period: Duration,
}

impl GpioInterface {
    /// Claim the three GPIO lines. Pin numbers use BCM numbering.
    ///
    /// `delay_nanos` is the debug clock half-period; 0 lets the GPIO call
    /// latency pace the clock, which is already well above the chip's
    /// minimum period on every Pi model.
    pub fn new(reset: u8, dc: u8, dd: u8, delay_nanos: u64) -> Result<Self, GpioInterfaceError> {
        let gpio = Gpio::new()?;

        let reset = gpio
            .get(reset)
            .map_err(|_| GpioInterfaceError::GpioUnavailable(reset))?
            .into_output();
        let dc = gpio
            .get(dc)
            .map_err(|_| GpioInterfaceError::GpioUnavailable(dc))?
            .into_output();
        let dd = gpio
            .get(dd)
            .map_err(|_| GpioInterfaceError::GpioUnavailable(dd))?
            .into_io(Mode::Output);

        Ok(GpioInterface {
            reset,
            dc,
            dd,
            half_period: Duration::from_nanos(delay_nanos),
        })
    }
}

impl PinPort for GpioInterface {
    fn set_direction(&mut self, pin: Pin, direction: PinDirection) {
        // Only DD ever changes direction; RESET and DC stay outputs.
        if pin == Pin::DebugData {
            self.dd.set_mode(match direction {
                PinDirection::Output => Mode::Output,
                PinDirection::Input => Mode::Input,
            });
        }
    }

    fn set_state(&mut self, pin: Pin, high: bool) {
        match pin {
            Pin::Reset => write_pin(&mut self.reset, high),
            Pin::DebugClock => write_pin(&mut self.dc, high),
            Pin::DebugData if high => self.dd.set_high(),
            Pin::DebugData => self.dd.set_low(),
        }
    }

    fn state(&mut self, pin: Pin) -> bool {
        match pin {
            Pin::Reset => self.reset.is_set_high(),
            Pin::DebugClock => self.dc.is_set_high(),
            Pin::DebugData => self.dd.is_high(),
        }
    }

    fn delay(&mut self) {
        if self.half_period.is_zero() {
            return;
        }
        // Spin rather than sleep: the scheduler's wake-up jitter dwarfs the
        // sub-microsecond periods used here.
        let start = Instant::now();
        while start.elapsed() < self.half_period {
            std::hint::spin_loop();
        }
    }
}

fn write_pin(pin: &mut OutputPin, high: bool) {
    if high {
        pin.set_high();
    } else {
        pin.set_low();
    }
}
