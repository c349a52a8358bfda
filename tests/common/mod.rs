//! A pin-level simulation of a CC253x chip.
//!
//! [`MockChip`] implements [`PinPort`] and decodes the debug wire bit by bit,
//! exactly as the silicon does: command bytes are shifted in on rising clock
//! edges while the host drives DD, responses are shifted out after falling
//! edges once DD is released. Behind the wire sits a register-accurate model
//! of the debug engine: XDATA reads and writes through synthesized 8051
//! instructions, the banked flash window, the DMA page-write path and the
//! flash controller's erase state machine.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use ccflash::port::{Pin, PinDirection, PinPort};

const SRAM_SIZE: usize = 0x2000;
const BANK_SIZE: usize = 0x8000;
const PAGE_BUFFER: usize = 0x0010;

mod fctl {
    pub const ERASE: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
    pub const ABORT: u8 = 0x20;
    pub const BUSY: u8 = 0x80;
}

#[derive(Debug)]
enum Frame {
    Idle,
    BurstLength { high: u8 },
    Payload { opcode: u8, needed: usize, data: Vec<u8> },
}

/// Everything observable about the simulated chip. Tests keep a handle to
/// this cell to seed memory, inject faults and inspect the aftermath.
pub struct ChipState {
    // Wire state
    dd_direction: PinDirection,
    dd_host: bool,
    dd_chip: bool,
    dc: bool,
    reset: bool,
    in_reset: bool,
    reset_pulses: u32,
    rx_shift: u8,
    rx_bits: u32,
    tx: VecDeque<bool>,
    frame: Frame,
    /// Number of throwaway bytes the chip feigns being busy for before
    /// answering the next command.
    pub response_delay_bytes: u32,
    pending_response: Vec<u8>,
    dummy_bits: u32,

    // Identification
    pub chip_id: u8,
    pub revision: u8,
    pub chipinfo0: u8,
    pub chipinfo1: u8,

    // Memory
    pub flash: Vec<u8>,
    pub sram: Vec<u8>,
    pub info_page: Vec<u8>,
    regs: HashMap<u16, u8>,
    page_size: usize,

    // Debug engine
    dptr: u16,
    accumulator: u8,
    debug_config: u8,
    locked: bool,
    erase_polls_left: u32,

    // Flash controller
    fctl_result: u8,
    fctl_busy_polls: u32,
    dma0_armed: bool,
    dma1_armed: bool,
    staged_len: usize,
    page_writes: u32,
    /// Makes the n-th page program cycle (1-based) end with FCTL.ABORT set.
    pub abort_on_page_write: Option<u32>,

    /// Payloads of every `DebugInstr` command received, in order.
    pub instructions: Vec<Vec<u8>>,
}

impl ChipState {
    fn new(chip_id: u8, revision: u8, chipinfo0: u8, chipinfo1: u8, page_size: usize) -> Self {
        let flash_kib = if chip_id == 0x95 && chipinfo0 >> 4 == 3 {
            96
        } else {
            16 << (chipinfo0 >> 4)
        };

        ChipState {
            dd_direction: PinDirection::Output,
            dd_host: false,
            dd_chip: true,
            dc: false,
            reset: true,
            in_reset: false,
            reset_pulses: 0,
            rx_shift: 0,
            rx_bits: 0,
            tx: VecDeque::new(),
            frame: Frame::Idle,
            response_delay_bytes: 0,
            pending_response: Vec::new(),
            dummy_bits: 0,
            chip_id,
            revision,
            chipinfo0,
            chipinfo1,
            flash: vec![0xff; flash_kib * 1024],
            sram: vec![0; SRAM_SIZE],
            info_page: vec![0; 256],
            regs: HashMap::new(),
            page_size,
            dptr: 0,
            accumulator: 0,
            debug_config: 0,
            locked: false,
            erase_polls_left: 0,
            fctl_result: 0,
            fctl_busy_polls: 0,
            dma0_armed: false,
            dma1_armed: false,
            staged_len: 0,
            page_writes: 0,
            abort_on_page_write: None,
            instructions: Vec::new(),
        }
    }

    pub fn is_debug_locked(&self) -> bool {
        self.locked
    }

    fn enter_debug_mode(&mut self) {
        self.frame = Frame::Idle;
        self.rx_bits = 0;
        self.tx.clear();
        self.dd_chip = true;
        self.dummy_bits = 0;
        self.dptr = 0;
        self.accumulator = 0;
        self.dma0_armed = false;
        self.dma1_armed = false;
        // The lock bit is latched from the last flash byte while the chip
        // comes out of reset.
        self.locked = self.flash.last().map(|b| b & 0x80 == 0).unwrap_or(false);
    }

    fn status(&self) -> u8 {
        let mut status = 0x02 | 0x20; // oscillator stable, CPU halted
        if self.locked {
            status |= 0x04;
        }
        if self.erase_polls_left > 0 {
            status |= 0x80;
        }
        status
    }

    // Bit-level wire handling

    fn clock_rising(&mut self) {
        if self.in_reset {
            self.reset_pulses += 1;
            return;
        }
        if self.dd_direction != PinDirection::Output {
            return;
        }

        self.rx_shift = (self.rx_shift << 1) | self.dd_host as u8;
        self.rx_bits += 1;
        if self.rx_bits == 8 {
            self.rx_bits = 0;
            let byte = self.rx_shift;
            self.receive_byte(byte);
        }
    }

    fn clock_falling(&mut self) {
        if self.in_reset || self.dd_direction != PinDirection::Input {
            return;
        }

        if let Some(bit) = self.tx.pop_front() {
            self.dd_chip = bit;
        } else if self.response_delay_bytes > 0 {
            // The host is clocking through a throwaway byte.
            self.dummy_bits += 1;
            if self.dummy_bits == 8 {
                self.dummy_bits = 0;
                self.response_delay_bytes -= 1;
                if self.response_delay_bytes == 0 {
                    let response = std::mem::take(&mut self.pending_response);
                    self.queue_response_now(&response);
                }
            }
        } else {
            self.dd_chip = true;
        }
    }

    fn receive_byte(&mut self, byte: u8) {
        match std::mem::replace(&mut self.frame, Frame::Idle) {
            Frame::Idle => {
                let opcode = byte >> 3;
                let low = byte & 0x07;
                match opcode {
                    // BurstWrite: a second byte carries the low length bits.
                    0x10 => self.frame = Frame::BurstLength { high: low },
                    // DebugInstr: instruction length in the low two bits.
                    0x0a => {
                        self.frame = Frame::Payload {
                            opcode,
                            needed: (low & 0x3) as usize,
                            data: Vec::new(),
                        }
                    }
                    // WriteConfig carries one data byte.
                    0x03 => {
                        self.frame = Frame::Payload {
                            opcode,
                            needed: 1,
                            data: Vec::new(),
                        }
                    }
                    _ => self.execute(opcode, &[]),
                }
            }
            Frame::BurstLength { high } => {
                let mut length = ((high as usize) << 8) | byte as usize;
                if length == 0 {
                    length = 2048;
                }
                self.frame = Frame::Payload {
                    opcode: 0x10,
                    needed: length,
                    data: Vec::new(),
                };
            }
            Frame::Payload {
                opcode,
                needed,
                mut data,
            } => {
                data.push(byte);
                if data.len() == needed {
                    self.execute(opcode, &data);
                } else {
                    self.frame = Frame::Payload {
                        opcode,
                        needed,
                        data,
                    };
                }
            }
        }
    }

    fn queue_response(&mut self, bytes: &[u8]) {
        if self.response_delay_bytes > 0 {
            self.pending_response = bytes.to_vec();
            self.dd_chip = true;
        } else {
            self.queue_response_now(bytes);
        }
    }

    fn queue_response_now(&mut self, bytes: &[u8]) {
        for byte in bytes {
            for i in (0..8).rev() {
                self.tx.push_back(byte >> i & 1 != 0);
            }
        }
        // Ready: the line is held low until the host clocks the data out.
        self.dd_chip = false;
    }

    // Command execution

    fn execute(&mut self, opcode: u8, payload: &[u8]) {
        match opcode {
            // ChipErase
            0x02 => {
                self.flash.fill(0xff);
                self.erase_polls_left = 2;
                let status = self.status();
                self.queue_response(&[status]);
            }
            // WriteConfig
            0x03 => {
                self.debug_config = payload[0];
                let status = self.status();
                self.queue_response(&[status]);
            }
            // ReadConfig
            0x04 => {
                let config = self.debug_config;
                self.queue_response(&[config]);
            }
            // GetPc
            0x05 => self.queue_response(&[0x00, 0x00]),
            // ReadStatus
            0x06 => {
                let status = self.status();
                self.erase_polls_left = self.erase_polls_left.saturating_sub(1);
                self.queue_response(&[status]);
            }
            // DebugInstr
            0x0a => {
                self.instructions.push(payload.to_vec());
                self.step_instruction(payload);
                let accumulator = self.accumulator;
                self.queue_response(&[accumulator]);
            }
            // StepInstr
            0x0b => {
                let accumulator = self.accumulator;
                self.queue_response(&[accumulator]);
            }
            // GetChipId
            0x0d => {
                let response = [self.chip_id, self.revision];
                self.queue_response(&response);
            }
            // BurstWrite: DMA channel 0 moves the bytes into SRAM.
            0x10 => {
                if self.dma0_armed {
                    self.sram[PAGE_BUFFER..PAGE_BUFFER + payload.len()].copy_from_slice(payload);
                    self.staged_len = payload.len();
                }
                let status = self.status();
                self.queue_response(&[status]);
            }
            // Halt, Resume, SetHwBreakpoint, GetBufferedMode
            _ => {
                let status = self.status();
                self.queue_response(&[status]);
            }
        }
    }

    fn step_instruction(&mut self, instruction: &[u8]) {
        match instruction {
            [0x90, hi, lo] => self.dptr = (*hi as u16) << 8 | *lo as u16,
            [0x74, value] => self.accumulator = *value,
            [0xe0] => self.accumulator = self.xdata_read(self.dptr),
            [0xf0] => self.xdata_write(self.dptr, self.accumulator),
            [0xa3] => self.dptr = self.dptr.wrapping_add(1),
            _ => {}
        }
    }

    // XDATA space

    fn xdata_read(&mut self, address: u16) -> u8 {
        match address {
            0x0000..=0x1fff => self.sram[address as usize],
            0x6249 => self.revision,
            0x624a => self.chip_id,
            0x6270 => self.fctl_read(),
            0x6276 => self.chipinfo0,
            0x6277 => self.chipinfo1,
            0x7800..=0x78ff => self.info_page[(address - 0x7800) as usize],
            0x8000.. => {
                let bank = self.regs.get(&0x70c7).copied().unwrap_or(0) as usize;
                let offset = bank * BANK_SIZE + (address as usize - 0x8000);
                self.flash.get(offset).copied().unwrap_or(0xff)
            }
            other => self.regs.get(&other).copied().unwrap_or(0),
        }
    }

    fn xdata_write(&mut self, address: u16, value: u8) {
        match address {
            0x0000..=0x1fff => self.sram[address as usize] = value,
            0x6270 => self.fctl_write(value),
            0x70d6 => {
                self.regs.insert(address, value);
                if value & 0x01 != 0 {
                    self.dma0_armed = true;
                }
                if value & 0x02 != 0 {
                    self.dma1_armed = true;
                }
            }
            other => {
                self.regs.insert(other, value);
            }
        }
    }

    fn fctl_read(&mut self) -> u8 {
        if self.fctl_busy_polls > 0 {
            self.fctl_busy_polls -= 1;
            return fctl::BUSY;
        }
        self.fctl_result
    }

    fn fctl_write(&mut self, value: u8) {
        if value & fctl::ERASE != 0 {
            let faddrh = self.regs.get(&0x6272).copied().unwrap_or(0);
            let page = if self.chip_id == 0x95 {
                faddrh as usize
            } else {
                (faddrh >> 1) as usize
            };
            let start = page * self.page_size;
            if start + self.page_size <= self.flash.len() {
                self.flash[start..start + self.page_size].fill(0xff);
            }
            self.fctl_result = 0;
            self.fctl_busy_polls = 1;
        }

        if value & fctl::WRITE != 0 {
            self.page_writes += 1;

            if self.abort_on_page_write == Some(self.page_writes) {
                self.fctl_result = fctl::ABORT;
            } else if self.dma1_armed && self.staged_len > 0 {
                let faddr_low = self.regs.get(&0x6271).copied().unwrap_or(0) as u32;
                let faddr_high = self.regs.get(&0x6272).copied().unwrap_or(0) as u32;
                let destination = ((faddr_high << 8 | faddr_low) << 2) as usize;

                for i in 0..self.staged_len {
                    if let Some(byte) = self.flash.get_mut(destination + i) {
                        // Programming can only clear bits.
                        *byte &= self.sram[PAGE_BUFFER + i];
                    }
                }
                self.fctl_result = 0;
            } else {
                self.fctl_result = fctl::ABORT;
            }

            self.dma0_armed = false;
            self.dma1_armed = false;
            self.fctl_busy_polls = 1;
        }
    }
}

/// [`PinPort`] wrapper around a shared [`ChipState`]
pub struct MockChip {
    state: Rc<RefCell<ChipState>>,
}

impl MockChip {
    /// A CC2530 rev 4 with 256 KiB of flash, 8 KiB of SRAM and a fixed IEEE
    /// address in the information page.
    pub fn cc2530() -> Self {
        let mut state = ChipState::new(0xa5, 0x04, 0x40, 0x07, 2048);
        state.info_page[0x0c..0x14]
            .copy_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        MockChip {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// A CC2533 rev 2 with 96 KiB of flash and 1 KiB pages.
    pub fn cc2533() -> Self {
        let mut state = ChipState::new(0x95, 0x02, 0x30, 0x03, 1024);
        state.info_page[0x0c..0x14]
            .copy_from_slice(&[0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7]);
        MockChip {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// A handle onto the chip internals, for seeding and inspection after
    /// the chip has been handed to the flasher.
    pub fn handle(&self) -> Rc<RefCell<ChipState>> {
        Rc::clone(&self.state)
    }
}

impl PinPort for MockChip {
    fn set_direction(&mut self, pin: Pin, direction: PinDirection) {
        if pin == Pin::DebugData {
            self.state.borrow_mut().dd_direction = direction;
        }
    }

    fn set_state(&mut self, pin: Pin, high: bool) {
        let mut state = self.state.borrow_mut();
        match pin {
            Pin::Reset => {
                if !high {
                    state.in_reset = true;
                    state.reset_pulses = 0;
                } else if state.in_reset {
                    let debug_mode = state.reset_pulses >= 2;
                    state.in_reset = false;
                    if debug_mode {
                        state.enter_debug_mode();
                    }
                }
                state.reset = high;
            }
            Pin::DebugClock => {
                let rising = high && !state.dc;
                let falling = !high && state.dc;
                state.dc = high;
                if rising {
                    state.clock_rising();
                } else if falling {
                    state.clock_falling();
                }
            }
            Pin::DebugData => state.dd_host = high,
        }
    }

    fn state(&mut self, pin: Pin) -> bool {
        let state = self.state.borrow();
        match pin {
            Pin::Reset => state.reset,
            Pin::DebugClock => state.dc,
            Pin::DebugData => match state.dd_direction {
                PinDirection::Input => state.dd_chip,
                PinDirection::Output => state.dd_host,
            },
        }
    }

    fn delay(&mut self) {}
}
