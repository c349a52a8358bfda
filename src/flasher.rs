//! Program the flash of a target device
//!
//! The [Flasher] struct owns the connection and the identified chip, and
//! provides the full set of flash operations: bank-windowed reads, DMA-based
//! page programming, page and chip erase, the page lock bitmap, and the
//! permanent debug-interface lock.

use log::{debug, info, warn};

use crate::{
    command::{config, status, CommandType},
    connection::Connection,
    error::Error,
    port::PinPort,
    progress::ProgressCallbacks,
    targets::{Chip, ChipInfo, FLASH_LOCK_BITS_SIZE},
};

// XDATA addresses of the registers involved in identification and flash
// programming.
const REG_CHVER: u16 = 0x6249;
const REG_CHIPID: u16 = 0x624a;
const REG_DBGDATA: u16 = 0x6260;
const REG_FCTL: u16 = 0x6270;
const REG_FADDRL: u16 = 0x6271;
const REG_FADDRH: u16 = 0x6272;
const REG_FWDATA: u16 = 0x6273;
const REG_CHIPINFO0: u16 = 0x6276;
const REG_CHIPINFO1: u16 = 0x6277;
const REG_MEMCTR: u16 = 0x70c7;
const REG_DMA1CFGL: u16 = 0x70d2;
const REG_DMAARM: u16 = 0x70d6;
const REG_XDATA: u16 = 0x8000;

/// Bits of the flash controller register FCTL.
mod fctl {
    pub const ERASE: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
    pub const CM: u8 = 0x04;
    pub const ABORT: u8 = 0x20;
    pub const FULL: u8 = 0x40;
    pub const BUSY: u8 = 0x80;
}

// DMA descriptors are staged at the bottom of SRAM: the source descriptor at
// 0x0000, the destination descriptor at 0x0008, and the page data itself from
// 0x0010 upwards.
const DMA_DESCRIPTORS_ADDR: u16 = 0x0000;
const DMA_PAGE_BUFFER: u16 = 0x0010;
const DMA_TRIGGER_DEBUG: u8 = 31;
const DMA_TRIGGER_FLASH: u8 = 18;

/// Bound on the FCTL and chip-erase busy polls, so that dead silicon fails
/// with a timeout instead of hanging the host.
const FLASH_POLL_LIMIT: u32 = 1_000_000;

/// Connect to and program a target device
pub struct Flasher {
    /// Connection for all debug-wire operations
    connection: Connection,
    /// Info of the identified chip
    info: ChipInfo,
    /// Progress callbacks for multi-page writes
    progress: Option<Box<dyn ProgressCallbacks>>,
}

impl Flasher {
    /// Reset the chip into debug mode, identify it and return a flasher
    /// ready for use.
    pub fn connect(port: Box<dyn PinPort>) -> Result<Self, Error> {
        let mut connection = Connection::new(port);
        let info = Self::identify_with(&mut connection)?;

        info!("Detected {}", info);

        Ok(Flasher {
            connection,
            info,
            progress: None,
        })
    }

    /// Info of the connected device.
    pub fn device_info(&self) -> &ChipInfo {
        &self.info
    }

    /// The underlying connection, for raw debug commands.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Give the connection back, consuming the flasher.
    pub fn into_connection(self) -> Connection {
        self.connection
    }

    /// Install progress callbacks for multi-page flash writes.
    pub fn set_progress(&mut self, progress: Option<Box<dyn ProgressCallbacks>>) {
        self.progress = progress;
    }

    /// Reset and re-identify the chip, replacing the cached chip info.
    pub fn identify(&mut self) -> Result<&ChipInfo, Error> {
        self.info = Self::identify_with(&mut self.connection)?;
        Ok(&self.info)
    }

    fn identify_with(connection: &mut Connection) -> Result<ChipInfo, Error> {
        connection.reset();

        let word = connection.command(CommandType::GetChipId, &[])?;
        let id = word as u8;
        let revision = (word >> 8) as u8;
        let chip = Chip::from_chip_id(id)?;

        debug!("chip ID {:#04x}, revision {:#04x}", id, revision);

        let status = connection.command(CommandType::ReadStatus, &[])? as u8;
        if status & status::DEBUG_LOCKED != 0 {
            return Ok(ChipInfo::locked(chip, revision));
        }

        // Cross-check the wire answer against the register map; a mismatch
        // means bits are getting lost on the way.
        let reg_id = connection.read_memory_byte(REG_CHIPID)?;
        if reg_id != id {
            return Err(crate::error::ConnectionError::IdentityMismatch {
                expected: reg_id,
                found: id,
            }
            .into());
        }
        let reg_rev = connection.read_memory_byte(REG_CHVER)?;
        if reg_rev != revision {
            return Err(crate::error::ConnectionError::IdentityMismatch {
                expected: reg_rev,
                found: revision,
            }
            .into());
        }

        let chipinfo0 = connection.read_memory_byte(REG_CHIPINFO0)?;
        let chipinfo1 = connection.read_memory_byte(REG_CHIPINFO1)?;
        let mut info = ChipInfo::new(chip, revision, chipinfo0, chipinfo1);

        let (address, length) = chip.ieee_address_region();
        let mut ieee = vec![0u8; length];
        connection.read_memory(address, &mut ieee)?;
        // Stored least-significant byte first; keep it in display order.
        ieee.reverse();
        info.ieee_address = ieee;

        Ok(info)
    }

    fn ensure_unlocked(&self) -> Result<(), Error> {
        if self.info.is_locked {
            Err(Error::ChipLocked)
        } else {
            Ok(())
        }
    }

    fn ensure_page(&self, page: u32) -> Result<(), Error> {
        if page >= self.info.flash_pages {
            Err(Error::BadRange {
                what: "flash page",
                value: page as u64,
            })
        } else {
            Ok(())
        }
    }

    /// Execute a CPU instruction and return the resulting accumulator value.
    pub fn execute_instruction(&mut self, instruction: &[u8]) -> Result<u8, Error> {
        self.ensure_unlocked()?;
        self.connection.execute_instruction(instruction)
    }

    /// Read a range of XDATA memory.
    pub fn read_memory(&mut self, address: u16, out: &mut [u8]) -> Result<(), Error> {
        self.ensure_unlocked()?;
        self.connection.read_memory(address, out)
    }

    /// Write a range of XDATA memory, optionally verifying the result.
    pub fn write_memory(&mut self, address: u16, data: &[u8], verify: bool) -> Result<(), Error> {
        self.ensure_unlocked()?;
        self.connection.write_memory(address, data, verify)
    }

    /// Read flash through the XDATA window, switching banks as needed.
    ///
    /// Reads beyond the writable flash size are clamped like the lock-bit
    /// bytes do not exist; the returned count reflects the clamp. A failure
    /// mid-transfer reports the completed byte count through
    /// [`Error::PartialTransfer`].
    pub fn read_flash(&mut self, address: u32, out: &mut [u8]) -> Result<u32, Error> {
        self.ensure_unlocked()?;

        if address > self.info.writable_flash_size {
            return Err(Error::BadRange {
                what: "flash address",
                value: address as u64,
            });
        }
        if out.is_empty() {
            return Ok(0);
        }

        let size = (out.len() as u64).min((self.info.writable_flash_size - address) as u64) as usize;
        self.read_flash_raw(address, &mut out[..size])
    }

    /// Banked read without bounds clamping; also reaches the lock-bit bytes.
    fn read_flash_raw(&mut self, mut address: u32, out: &mut [u8]) -> Result<u32, Error> {
        let bank_size = self.info.flash_bank_size;
        let size = out.len() as u32;
        let mut done = 0u32;

        while done < size {
            let bank = (address / bank_size) as u8;
            if let Err(e) = self.connection.write_memory(REG_MEMCTR, &[bank], true) {
                return Err(Error::partial(done, e));
            }

            let offset = address % bank_size;
            let count = (bank_size - offset).min(size - done);
            let window = REG_XDATA + offset as u16;

            if let Err(e) = self
                .connection
                .read_memory(window, &mut out[done as usize..][..count as usize])
            {
                return Err(Error::partial(done, e));
            }

            done += count;
            address += count;
        }

        Ok(done)
    }

    /// Read one flash page.
    pub fn read_flash_page(&mut self, page: u32) -> Result<Vec<u8>, Error> {
        self.ensure_unlocked()?;
        self.ensure_page(page)?;

        let mut data = vec![0u8; self.info.flash_page_size as usize];
        self.read_flash_raw(page * self.info.flash_page_size, &mut data)?;
        Ok(data)
    }

    /// Write one flash page, unlocking and erasing it as needed.
    pub fn write_flash_page(&mut self, page: u32, data: &[u8], verify: bool) -> Result<(), Error> {
        self.ensure_unlocked()?;
        self.ensure_page(page)?;

        let page_size = self.info.flash_page_size;
        if data.len() as u32 != page_size {
            return Err(Error::BadRange {
                what: "page data size",
                value: data.len() as u64,
            });
        }

        self.write_flash_inner(page * page_size, data, verify, true)?;
        Ok(())
    }

    /// Erase one flash page.
    pub fn erase_flash_page(&mut self, page: u32) -> Result<(), Error> {
        self.ensure_unlocked()?;
        self.ensure_page(page)?;

        debug!("erasing flash page {}", page);

        // The CC2533's 1 KiB pages map directly onto FADDRH; the others
        // shift by one.
        let mut value = page as u8;
        if self.info.chip != Chip::Cc2533 {
            value <<= 1;
        }

        self.connection.write_memory(REG_FADDRH, &[value], true)?;
        self.connection
            .write_memory(REG_FCTL, &[fctl::ERASE | fctl::CM], false)?;
        self.wait_flash_idle()
    }

    /// Check whether a flash page is locked for writing.
    pub fn is_flash_page_locked(&mut self, page: u32) -> Result<bool, Error> {
        self.ensure_unlocked()?;
        self.ensure_page(page)?;

        let mut byte = [0u8];
        self.read_flash_raw(self.info.writable_flash_size + page / 8, &mut byte)?;
        // A set bit marks the page as unlocked.
        Ok(byte[0] & (1 << (page % 8)) == 0)
    }

    /// Lock a contiguous range of flash pages.
    pub fn lock_flash_pages(&mut self, start_page: u32, pages: u32) -> Result<(), Error> {
        self.set_page_locks(true, start_page, pages)
    }

    /// Unlock a contiguous range of flash pages.
    pub fn unlock_flash_pages(&mut self, start_page: u32, pages: u32) -> Result<(), Error> {
        self.set_page_locks(false, start_page, pages)
    }

    fn set_page_locks(&mut self, lock: bool, start_page: u32, pages: u32) -> Result<(), Error> {
        self.ensure_unlocked()?;
        self.ensure_page(start_page)?;
        if pages < 1 {
            return Err(Error::BadRange {
                what: "page count",
                value: pages as u64,
            });
        }

        let mut bits = [0u8; FLASH_LOCK_BITS_SIZE as usize];
        self.read_flash_raw(self.info.writable_flash_size, &mut bits)?;

        let pages = pages.min(self.info.flash_pages - start_page);
        let mut changed = false;

        for page in start_page..start_page + pages {
            let byte = &mut bits[(page / 8) as usize];
            let mask = 1 << (page % 8);
            if lock {
                changed |= *byte & mask != 0;
                *byte &= !mask;
            } else {
                changed |= *byte & mask == 0;
                *byte |= mask;
            }
        }

        if changed {
            debug!(
                "{} pages {}..{}",
                if lock { "locking" } else { "unlocking" },
                start_page,
                start_page + pages
            );
            // The lock bytes live in flash themselves; write them back
            // without the unlock pass or we would recurse.
            self.write_flash_inner(self.info.writable_flash_size, &bits, true, false)?;
        }

        Ok(())
    }

    /// Write `data` to flash starting at `address`, handling page unlocking,
    /// erase and read-modify-write of partial pages.
    ///
    /// Returns the number of bytes written, which may be smaller than the
    /// input if the range runs past the writable flash size. A failure
    /// mid-transfer reports the completed count through
    /// [`Error::PartialTransfer`].
    pub fn write_flash(&mut self, address: u32, data: &[u8], verify: bool) -> Result<u32, Error> {
        self.ensure_unlocked()?;

        if address > self.info.writable_flash_size {
            return Err(Error::BadRange {
                what: "flash address",
                value: address as u64,
            });
        }
        if data.is_empty() {
            return Ok(0);
        }

        let size = (data.len() as u64).min((self.info.writable_flash_size - address) as u64) as usize;
        self.write_flash_inner(address, &data[..size], verify, true)
    }

    fn write_flash_inner(
        &mut self,
        address: u32,
        data: &[u8],
        verify: bool,
        unlock: bool,
    ) -> Result<u32, Error> {
        let page_size = self.info.flash_page_size;
        let size = data.len() as u32;
        let mut page = address / page_size;
        let mut erase_page = true;

        if size >= self.info.writable_flash_size {
            // Writing (almost) everything: a chip erase is faster than
            // erasing page by page, and clears the lock bits as a side
            // effect.
            self.erase_flash()
                .map_err(|e| Error::partial(0, unwrap_partial(e)))?;
            erase_page = false;
        } else if unlock {
            let end_page = (address + size + page_size - 1) / page_size;
            self.unlock_flash_pages(page, end_page - page)
                .map_err(|e| Error::partial(0, unwrap_partial(e)))?;
        }

        if let Some(progress) = self.progress.as_mut() {
            progress.init(address, size as usize);
        }

        let mut page_buffer = vec![0u8; page_size as usize];
        let mut read_buffer = vec![0u8; page_size as usize];
        let mut bytes = 0u32;
        let mut chunk = page_size - address % page_size;

        while bytes < size {
            let page_address = page * page_size;
            if bytes + chunk > size {
                chunk = size - bytes;
            }

            let write_data: Option<&[u8]> = if chunk != page_size {
                // Partial page: splice the new bytes into the current
                // contents, and skip the program cycle entirely when nothing
                // changes.
                if let Err(e) = self.read_flash_raw(page_address, &mut page_buffer) {
                    return Err(Error::partial(bytes, unwrap_partial(e)));
                }

                let offset = ((address + bytes) % page_size) as usize;
                let incoming = &data[bytes as usize..][..chunk as usize];
                let mut changed = false;
                for (current, &new) in page_buffer[offset..].iter_mut().zip(incoming) {
                    if *current != new {
                        *current = new;
                        changed = true;
                    }
                }

                changed.then_some(&page_buffer[..])
            } else {
                Some(&data[bytes as usize..][..page_size as usize])
            };

            // The controller must be idle before touching the next page.
            match self.connection.read_memory_byte(REG_FCTL) {
                Ok(value) if value & (fctl::ERASE | fctl::WRITE | fctl::FULL | fctl::BUSY) != 0 => {
                    return Err(Error::partial(bytes, Error::FlashController { fctl: value }));
                }
                Ok(_) => {}
                Err(e) => return Err(Error::partial(bytes, e)),
            }

            if let Some(write_data) = write_data {
                if let Err(e) = self.program_page(page, write_data, erase_page) {
                    return Err(Error::partial(bytes, unwrap_partial(e)));
                }

                if verify {
                    let mut matched = false;
                    for attempt in 0..2 {
                        if let Err(e) = self.read_flash_raw(page_address, &mut read_buffer) {
                            return Err(Error::partial(bytes, unwrap_partial(e)));
                        }
                        if read_buffer == write_data {
                            matched = true;
                            break;
                        }
                        if attempt == 0 {
                            warn!("page {} verification mismatch, retrying read", page);
                        }
                    }
                    if !matched {
                        return Err(Error::partial(
                            bytes,
                            Error::VerifyFailed {
                                address: page_address,
                            },
                        ));
                    }
                }
            }

            bytes += chunk;
            chunk = page_size;
            page += 1;

            if let Some(progress) = self.progress.as_mut() {
                progress.update(bytes as usize);
            }
        }

        if let Some(progress) = self.progress.as_mut() {
            progress.finish();
        }

        Ok(bytes)
    }

    /// Program one page through the debug DMA path.
    ///
    /// DMA channel 0 moves the bytes streamed in over `BurstWrite` from
    /// DBGDATA into SRAM; channel 1 feeds them from SRAM into the flash
    /// write register, paced by the flash controller's own trigger.
    fn program_page(&mut self, page: u32, data: &[u8], erase_first: bool) -> Result<(), Error> {
        if erase_first {
            self.erase_flash_page(page)?;
        } else {
            self.ensure_unlocked()?;
            self.ensure_page(page)?;
        }

        debug!("programming flash page {}", page);

        // DMA transfers keep running in debug mode only when unpaused in the
        // debug configuration.
        let debug_config = self.connection.command(CommandType::ReadConfig, &[])? as u8;
        let chip_status = self
            .connection
            .command(CommandType::WriteConfig, &[debug_config & !config::DMA_PAUSED])?
            as u8;
        if chip_status
            & (status::CHIP_ERASE_BUSY | status::PCON_IDLE | status::PM_ACTIVE | status::DEBUG_LOCKED)
            != 0
        {
            return Err(Error::ChipBusy {
                status: chip_status,
            });
        }

        let length = [(data.len() >> 8) as u8, data.len() as u8];
        let descriptors = [
            // Source descriptor: DBGDATA -> SRAM page buffer, triggered by
            // debug burst writes, destination increments.
            (REG_DBGDATA >> 8) as u8,
            REG_DBGDATA as u8,
            (DMA_PAGE_BUFFER >> 8) as u8,
            DMA_PAGE_BUFFER as u8,
            length[0],
            length[1],
            DMA_TRIGGER_DEBUG,
            0x11,
            // Destination descriptor: SRAM page buffer -> FWDATA, triggered
            // by the flash controller, source increments.
            (DMA_PAGE_BUFFER >> 8) as u8,
            DMA_PAGE_BUFFER as u8,
            (REG_FWDATA >> 8) as u8,
            REG_FWDATA as u8,
            length[0],
            length[1],
            DMA_TRIGGER_FLASH,
            0x42,
        ];
        self.connection
            .write_memory(DMA_DESCRIPTORS_ADDR, &descriptors, true)?;

        // DMA1CFG and DMA0CFG sit back to back; point them at the two
        // descriptors in one write.
        self.connection
            .write_memory(REG_DMA1CFGL, &[0x08, 0x00, 0x00, 0x00], true)?;

        // FADDR counts 32-bit words.
        let faddr = (page * self.info.flash_page_size) >> 2;
        self.connection
            .write_memory(REG_FADDRL, &[faddr as u8, (faddr >> 8) as u8], true)?;

        // Arm DMA0 and stream the page into SRAM.
        self.connection.write_memory(REG_DMAARM, &[0x01], true)?;
        self.connection.command(CommandType::BurstWrite, data)?;

        // Arm DMA1 and kick off the flash write. FCTL cannot be verified
        // here: it is busy the moment the write bit lands.
        self.connection.write_memory(REG_DMAARM, &[0x02], true)?;
        self.connection
            .write_memory(REG_FCTL, &[fctl::WRITE | fctl::CM], false)?;

        self.wait_flash_idle()
    }

    /// Poll FCTL until BUSY clears, then check for error bits.
    ///
    /// Wire errors abort immediately; retrying the poll on a flaky wire
    /// would risk misreading a failed program cycle as success.
    fn wait_flash_idle(&mut self) -> Result<(), Error> {
        for _ in 0..FLASH_POLL_LIMIT {
            let value = self.connection.read_memory_byte(REG_FCTL)?;
            if value & fctl::BUSY == 0 {
                return if value & (fctl::ERASE | fctl::WRITE | fctl::ABORT | fctl::FULL) != 0 {
                    Err(Error::FlashController { fctl: value })
                } else {
                    Ok(())
                };
            }
        }

        Err(Error::FlashTimeout)
    }

    /// Erase the entire flash, then re-identify the chip.
    ///
    /// This is the one operation permitted on a debug-locked chip: the erase
    /// clears the lock along with the flash contents.
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        info!("Erasing flash");

        let mut chip_status = self.connection.command(CommandType::ChipErase, &[])? as u8;

        let mut polls = 0u32;
        while chip_status & status::CHIP_ERASE_BUSY != 0 {
            polls += 1;
            if polls > FLASH_POLL_LIMIT {
                return Err(Error::FlashTimeout);
            }
            chip_status = self.connection.command(CommandType::ReadStatus, &[])? as u8;
        }

        self.info = Self::identify_with(&mut self.connection)?;
        if self.info.is_locked {
            Err(Error::ChipLocked)
        } else {
            Ok(())
        }
    }

    /// Permanently lock the debug interface.
    ///
    /// Clears bit 7 of the last flash byte; from the next reset on, the chip
    /// only answers identification and chip-erase requests. Only a full
    /// chip erase lifts the lock again.
    pub fn lock_debug_interface(&mut self) -> Result<(), Error> {
        if self.info.is_locked {
            return Ok(());
        }

        info!("Locking the debug interface");

        let address = self.info.flash_size - 1;
        let mut byte = [0u8];
        self.read_flash_raw(address, &mut byte)?;
        byte[0] &= 0x7f;
        self.write_flash_inner(address, &byte, true, true)?;

        self.info = Self::identify_with(&mut self.connection)?;
        if self.info.is_locked {
            Ok(())
        } else {
            Err(Error::DebugLockFailed)
        }
    }
}

/// Strip a partial-transfer wrapper so counts are not nested when an inner
/// transfer fails inside an outer one.
fn unwrap_partial(error: Error) -> Error {
    match error {
        Error::PartialTransfer { source, .. } => *source,
        other => other,
    }
}
