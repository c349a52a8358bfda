//! Debug interface commands
//!
//! Every exchange on the debug wire starts with a single command byte whose
//! high five bits select the operation. `DebugInstr` and `BurstWrite` encode
//! their payload length into the low bits; all other commands have fixed
//! payloads.

use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::error::ConnectionError;

/// Largest payload accepted by a single `BurstWrite` command.
///
/// The length travels in an 11-bit field interpreted modulo 2048 by the chip,
/// so the maximum is transmitted as 0.
pub const MAX_BURST_WRITE_SIZE: usize = 2048;

/// Debug commands understood by the CC253x/CC254x debug engine
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames)]
#[strum(serialize_all = "kebab-case")]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    ChipErase = 0x02,
    WriteConfig = 0x03,
    ReadConfig = 0x04,
    GetPc = 0x05,
    ReadStatus = 0x06,
    SetHwBreakpoint = 0x07,
    Halt = 0x08,
    Resume = 0x09,
    DebugInstr = 0x0a,
    StepInstr = 0x0b,
    GetBufferedMode = 0x0c,
    GetChipId = 0x0d,
    BurstWrite = 0x10,
}

impl CommandType {
    /// Number of response bytes the chip sends back for this command.
    pub fn response_size(&self) -> usize {
        match self {
            CommandType::GetPc | CommandType::GetChipId => 2,
            _ => 1,
        }
    }

    /// Encode the command byte for a payload of `len` bytes.
    ///
    /// `BurstWrite` additionally yields a second byte carrying the low eight
    /// bits of the length, transmitted right after the command byte.
    pub(crate) fn frame(&self, len: usize) -> Result<(u8, Option<u8>), ConnectionError> {
        let opcode = (*self as u8) << 3;

        match self {
            CommandType::DebugInstr => {
                if !(1..=3).contains(&len) {
                    return Err(self.invalid_payload("1 to 3", len));
                }
                Ok((opcode | len as u8, None))
            }
            CommandType::BurstWrite => {
                if !(1..=MAX_BURST_WRITE_SIZE).contains(&len) {
                    return Err(self.invalid_payload("1 to 2048", len));
                }
                let len = len & 0x7ff;
                Ok((opcode | (len >> 8) as u8, Some(len as u8)))
            }
            _ => Ok((opcode, None)),
        }
    }

    fn invalid_payload(&self, expected: &'static str, found: usize) -> ConnectionError {
        ConnectionError::InvalidPayload {
            command: *self,
            expected,
            found,
        }
    }
}

/// Bits of the status byte returned by `ReadStatus` (and by most commands).
pub mod status {
    pub const STACK_OVERFLOW: u8 = 0x01;
    pub const OSCILLATOR_STABLE: u8 = 0x02;
    pub const DEBUG_LOCKED: u8 = 0x04;
    pub const HALT_STATUS: u8 = 0x08;
    pub const PM_ACTIVE: u8 = 0x10;
    pub const CPU_HALTED: u8 = 0x20;
    pub const PCON_IDLE: u8 = 0x40;
    pub const CHIP_ERASE_BUSY: u8 = 0x80;
}

/// Bits of the debug configuration byte (`ReadConfig`/`WriteConfig`).
pub mod config {
    pub const TIMER_SUSPENDED: u8 = 0x02;
    pub const DMA_PAUSED: u8 = 0x04;
    pub const TIMERS_DISABLED: u8 = 0x08;
    pub const SOFT_POWER_MODE: u8 = 0x20;
}
