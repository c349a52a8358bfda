//! Establish a connection with a target device
//!
//! The [Connection] struct owns the pin port and implements the debug-wire
//! protocol on top of it: the reset sequence, clocked byte transfers on DD,
//! command framing with the response poll loop, and the synthesized 8051
//! instruction sequences used for arbitrary memory access.

use log::trace;

use crate::{
    command::CommandType,
    error::{ConnectionError, Error},
    port::{Pin, PinDirection, PinPort},
};

/// Default number of retries while waiting for a command response.
pub const DEFAULT_RETRIES: u32 = 1;

// 8051 opcodes synthesized through `DebugInstr` for memory access.
const MOV_DPTR: u8 = 0x90; // MOV DPTR,#data16
const MOV_A: u8 = 0x74; // MOV A,#data
const MOVX_A_DPTR: u8 = 0xe0; // MOVX A,@DPTR
const MOVX_DPTR_A: u8 = 0xf0; // MOVX @DPTR,A
const INC_DPTR: u8 = 0xa3; // INC DPTR

/// An established connection with a target device
///
/// The wire is half-duplex and the debug engine on the chip is stateful, so
/// the connection owns its port exclusively and every operation takes
/// `&mut self`; no two transfers can ever be in flight at once.
pub struct Connection {
    port: Box<dyn PinPort>,
    retries: u32,
}

impl Connection {
    pub fn new(port: Box<dyn PinPort>) -> Self {
        Connection {
            port,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Number of retries while polling for a command response.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Set the number of response poll retries.
    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }

    /// Reset the chip into debug mode.
    ///
    /// Two DC pulses while RESET is held low put the debug engine in charge
    /// when the chip comes back up.
    pub fn reset(&mut self) {
        trace!("resetting the chip into debug mode");

        self.port.set_direction(Pin::Reset, PinDirection::Output);
        self.port.set_direction(Pin::DebugClock, PinDirection::Output);
        self.port.set_state(Pin::Reset, true);
        self.port.set_state(Pin::DebugClock, false);
        self.port.delay();
        self.port.set_state(Pin::Reset, false);
        self.port.delay();
        self.pulse_clock();
        self.pulse_clock();
        self.port.set_state(Pin::Reset, true);
        self.port.delay();
    }

    fn pulse_clock(&mut self) {
        self.port.set_state(Pin::DebugClock, true);
        self.port.delay();
        self.port.set_state(Pin::DebugClock, false);
        self.port.delay();
    }

    fn write_byte(&mut self, byte: u8) {
        let mut mask = 0x80u8;
        while mask != 0 {
            self.port.set_state(Pin::DebugData, byte & mask != 0);
            self.pulse_clock();
            mask >>= 1;
        }
    }

    fn read_byte(&mut self) -> u8 {
        let mut byte = 0u8;
        for i in (0..8).rev() {
            self.port.set_state(Pin::DebugClock, true);
            self.port.delay();
            self.port.set_state(Pin::DebugClock, false);
            let bit = self.port.state(Pin::DebugData);
            self.port.delay();
            byte |= (bit as u8) << i;
        }
        byte
    }

    /// Issue a debug command and wait for the chip's response.
    ///
    /// The returned status word holds the response bytes in transmit order,
    /// the first byte received in the low byte. Commands other than `GetPc`
    /// and `GetChipId` respond with a single byte.
    pub fn command(&mut self, command: CommandType, payload: &[u8]) -> Result<u16, Error> {
        let (command_byte, length_byte) = command.frame(payload.len())?;

        trace!("sending {} command, {} payload bytes", command, payload.len());

        // Write phase: the host drives DD.
        self.port.set_direction(Pin::DebugData, PinDirection::Output);
        self.write_byte(command_byte);
        if let Some(low) = length_byte {
            self.write_byte(low);
        }
        for &byte in payload {
            self.write_byte(byte);
        }

        // Read phase: DD goes back to the chip. A low level means the
        // response follows; a high level means the chip is still working, so
        // consume a throwaway byte and poll again.
        self.port.set_direction(Pin::DebugData, PinDirection::Input);

        let mut attempts = self.retries;
        loop {
            self.port.delay();

            if !self.port.state(Pin::DebugData) {
                let mut word = 0u16;
                for i in 0..command.response_size() {
                    word |= (self.read_byte() as u16) << (8 * i);
                }
                trace!("{} response: {:#06x}", command, word);
                return Ok(word);
            }

            if attempts == 0 {
                return Err(ConnectionError::NoResponse(command).into());
            }
            attempts -= 1;

            self.read_byte();
            self.port.delay();
        }
    }

    /// Execute a CPU instruction and return the resulting accumulator value.
    pub fn execute_instruction(&mut self, instruction: &[u8]) -> Result<u8, Error> {
        let word = self.command(CommandType::DebugInstr, instruction)?;
        Ok(word as u8)
    }

    /// Read `out.len()` bytes of XDATA memory starting at `address`.
    ///
    /// The data pointer is loaded once and then streamed: `MOVX A,@DPTR`
    /// fetches each byte, `INC DPTR` advances between bytes. Interleaving
    /// another operation into this sequence would corrupt the stream, which
    /// is why the connection is `&mut` for the whole transfer.
    pub fn read_memory(&mut self, address: u16, out: &mut [u8]) -> Result<(), Error> {
        if out.is_empty() {
            return Ok(());
        }

        self.set_data_pointer(address)?;

        let last = out.len() - 1;
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.execute_instruction(&[MOVX_A_DPTR])?;
            if i != last {
                self.execute_instruction(&[INC_DPTR])?;
            }
        }

        Ok(())
    }

    /// Read a single byte of XDATA memory.
    pub fn read_memory_byte(&mut self, address: u16) -> Result<u8, Error> {
        let mut byte = [0u8];
        self.read_memory(address, &mut byte)?;
        Ok(byte[0])
    }

    /// Write `data` to XDATA memory starting at `address`.
    ///
    /// With `verify` set the whole range is read back byte by byte and
    /// compared afterwards.
    pub fn write_memory(&mut self, address: u16, data: &[u8], verify: bool) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        self.set_data_pointer(address)?;

        let last = data.len() - 1;
        for (i, &byte) in data.iter().enumerate() {
            self.execute_instruction(&[MOV_A, byte])?;
            self.execute_instruction(&[MOVX_DPTR_A])?;
            if i != last {
                self.execute_instruction(&[INC_DPTR])?;
            }
        }

        if verify {
            for (i, &byte) in data.iter().enumerate() {
                let address = address.wrapping_add(i as u16);
                if self.read_memory_byte(address)? != byte {
                    return Err(Error::VerifyFailed {
                        address: address as u32,
                    });
                }
            }
        }

        Ok(())
    }

    fn set_data_pointer(&mut self, address: u16) -> Result<(), Error> {
        self.execute_instruction(&[MOV_DPTR, (address >> 8) as u8, address as u8])?;
        Ok(())
    }

    /// Give the pin port back, consuming the connection.
    pub fn into_port(self) -> Box<dyn PinPort> {
        self.port
    }
}
