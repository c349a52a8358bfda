//! Supported target devices
//!
//! All five chips share the same debug engine and flash controller; they
//! differ in flash page size and in where (and whether) an IEEE 802.15.4 or
//! Bluetooth device address is stored in the information page.

use std::fmt;

use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::error::Error;

/// Every flash bank is mapped through the same 32 KiB XDATA window.
pub const FLASH_BANK_SIZE: u32 = 32 * 1024;

/// The last 16 bytes of flash hold the page lock bitmap.
pub const FLASH_LOCK_BITS_SIZE: u32 = 16;

const KIB: u32 = 1024;

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames)]
#[non_exhaustive]
#[strum(serialize_all = "UPPERCASE")]
pub enum Chip {
    /// CC2530, Zigbee
    Cc2530,
    /// CC2531, Zigbee with USB
    Cc2531,
    /// CC2533, Zigbee
    Cc2533,
    /// CC2540, Bluetooth Low Energy with USB
    Cc2540,
    /// CC2541, Bluetooth Low Energy
    Cc2541,
}

impl Chip {
    /// Look up a chip by the ID reported over the debug interface.
    pub fn from_chip_id(id: u8) -> Result<Self, Error> {
        match id {
            0xa5 => Ok(Chip::Cc2530),
            0xb5 => Ok(Chip::Cc2531),
            0x95 => Ok(Chip::Cc2533),
            0x8d => Ok(Chip::Cc2540),
            0x41 => Ok(Chip::Cc2541),
            other => Err(Error::UnknownChip(other)),
        }
    }

    /// The chip ID this device reports.
    pub fn chip_id(&self) -> u8 {
        match self {
            Chip::Cc2530 => 0xa5,
            Chip::Cc2531 => 0xb5,
            Chip::Cc2533 => 0x95,
            Chip::Cc2540 => 0x8d,
            Chip::Cc2541 => 0x41,
        }
    }

    /// Size of one flash page in bytes.
    pub fn flash_page_size(&self) -> u32 {
        match self {
            Chip::Cc2533 => KIB,
            _ => 2 * KIB,
        }
    }

    /// Location and length of the device address in the information page,
    /// most-significant byte stored last.
    pub(crate) fn ieee_address_region(&self) -> (u16, usize) {
        match self {
            Chip::Cc2530 | Chip::Cc2531 | Chip::Cc2533 => (0x780c, 8),
            Chip::Cc2540 | Chip::Cc2541 => (0x780e, 6),
        }
    }

    /// Decode the flash size from the upper nibble of CHIPINFO0.
    pub(crate) fn decode_flash_size(&self, chipinfo0: u8) -> u32 {
        let value = chipinfo0 >> 4;
        if *self == Chip::Cc2533 && value == 0x3 {
            96 * KIB
        } else {
            (16 * KIB) << value
        }
    }
}

/// Information about the connected device
///
/// Produced by identification and invalidated only by a reset or a chip
/// erase, both of which re-identify. A debug-locked chip reports its ID and
/// revision but none of the memory geometry.
#[derive(Debug, Clone)]
pub struct ChipInfo {
    /// The chip being used
    pub chip: Chip,
    /// Silicon revision
    pub revision: u8,
    /// Whether the debug interface is locked
    pub is_locked: bool,
    /// Total flash size in bytes
    pub flash_size: u32,
    /// Flash size excluding the lock-bit bytes at the top
    pub writable_flash_size: u32,
    /// Size of one flash bank (the XDATA window granularity)
    pub flash_bank_size: u32,
    /// Size of one flash page (the erase granularity)
    pub flash_page_size: u32,
    /// Number of flash pages
    pub flash_pages: u32,
    /// SRAM size in bytes
    pub sram_size: u32,
    /// IEEE device address, most-significant byte first; empty if the chip
    /// carries none
    pub ieee_address: Vec<u8>,
}

impl ChipInfo {
    /// Build the info record for an unlocked chip from the raw CHIPINFO
    /// register values.
    pub(crate) fn new(chip: Chip, revision: u8, chipinfo0: u8, chipinfo1: u8) -> Self {
        let flash_size = chip.decode_flash_size(chipinfo0);
        let flash_page_size = chip.flash_page_size();

        ChipInfo {
            chip,
            revision,
            is_locked: false,
            flash_size,
            writable_flash_size: flash_size - FLASH_LOCK_BITS_SIZE,
            flash_bank_size: FLASH_BANK_SIZE,
            flash_page_size,
            flash_pages: (flash_size + flash_page_size - 1) / flash_page_size,
            sram_size: ((chipinfo1 as u32 & 0x7) + 1) * KIB,
            ieee_address: Vec::new(),
        }
    }

    /// Build the info record for a chip whose debug interface is locked.
    pub(crate) fn locked(chip: Chip, revision: u8) -> Self {
        ChipInfo {
            chip,
            revision,
            is_locked: true,
            flash_size: 0,
            writable_flash_size: 0,
            flash_bank_size: 0,
            flash_page_size: 0,
            flash_pages: 0,
            sram_size: 0,
            ieee_address: Vec::new(),
        }
    }
}

impl fmt::Display for ChipInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (rev. {})", self.chip, self.revision)?;
        if self.is_locked {
            write!(f, ", debug interface locked")?;
        }
        Ok(())
    }
}
