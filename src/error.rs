//! Library and application errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while communicating with the device")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Chip with ID {0:#04x} is not recognized, supported chips are CC2530, CC2531, CC2533, CC2540 and CC2541")]
    #[diagnostic(
        code(ccflash::unrecognized_chip),
        help("If your chip is supported, check the wiring and try again")
    )]
    UnknownChip(u8),
    #[error("The debug interface of the chip is locked")]
    #[diagnostic(
        code(ccflash::chip_locked),
        help("A locked chip only allows reading chip info and erasing the flash; `erase-flash` clears the lock along with all flash contents")
    )]
    ChipLocked,
    #[error("{what} {value:#x} is outside the bounds of the connected chip")]
    #[diagnostic(code(ccflash::bad_range))]
    BadRange {
        what: &'static str,
        value: u64,
    },
    #[error("Flash verification failed at address {address:#x}")]
    #[diagnostic(
        code(ccflash::verify_failed),
        help("The flash page may be locked, or the chip may be worn out")
    )]
    VerifyFailed { address: u32 },
    #[error("The flash controller did not become ready in time")]
    #[diagnostic(code(ccflash::flash_timeout))]
    FlashTimeout,
    #[error("The flash controller reported an error (FCTL = {fctl:#04x})")]
    #[diagnostic(code(ccflash::flash_controller))]
    FlashController { fctl: u8 },
    #[error("The chip is not ready for a DMA transfer (status = {status:#04x})")]
    #[diagnostic(code(ccflash::chip_busy))]
    ChipBusy { status: u8 },
    #[error("Transfer aborted after {done} bytes")]
    #[diagnostic(code(ccflash::partial_transfer))]
    PartialTransfer {
        done: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("The debug interface did not lock")]
    #[diagnostic(code(ccflash::lock_failed))]
    DebugLockFailed,
    #[error(transparent)]
    #[diagnostic(transparent)]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    #[diagnostic(code(ccflash::io_error))]
    Io(#[from] io::Error),
    #[error("No pin interface is available on this host")]
    #[diagnostic(
        code(ccflash::no_interface),
        help("Reinstall with `--features raspberry` to drive a chip from the Raspberry Pi GPIO header")
    )]
    NoInterface,
}

impl Error {
    /// Wrap `source` as a partial-transfer failure after `done` bytes.
    pub(crate) fn partial(done: u32, source: Error) -> Self {
        Error::PartialTransfer {
            done,
            source: Box::new(source),
        }
    }

    /// The number of bytes that completed before the operation failed, if
    /// this is a partial-transfer error.
    pub fn bytes_completed(&self) -> Option<u32> {
        match self {
            Error::PartialTransfer { done, .. } => Some(*done),
            _ => None,
        }
    }
}

/// Errors of the wire protocol layer
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("No response from the chip to the {0} command")]
    #[diagnostic(
        code(ccflash::no_response),
        help("Ensure that the chip is powered and the RESET, DC and DD lines are connected")
    )]
    NoResponse(CommandType),
    #[error("A {command} command carries {found} payload bytes, expected {expected}")]
    #[diagnostic(code(ccflash::bad_payload))]
    InvalidPayload {
        command: CommandType,
        expected: &'static str,
        found: usize,
    },
    #[error("The chip reports ID {found:#04x} over the debug interface but {expected:#04x} in its register map")]
    #[diagnostic(
        code(ccflash::identity_mismatch),
        help("This usually indicates an unreliable connection; check the wiring")
    )]
    IdentityMismatch { expected: u8, found: u8 },
}

/// Errors raised while encoding or decoding flash images
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum CodecError {
    #[error("Record mark ':' not found")]
    #[diagnostic(code(ccflash::hex::record_mark))]
    MissingRecordMark,
    #[error("Record delimiter not found")]
    #[diagnostic(code(ccflash::hex::record_delimiter))]
    MissingRecordDelimiter,
    #[error("Invalid hexadecimal digit")]
    #[diagnostic(code(ccflash::hex::bad_digit))]
    InvalidHexDigit,
    #[error("Wrong record checksum")]
    #[diagnostic(code(ccflash::hex::checksum))]
    BadChecksum,
    #[error("Wrong record info for type {kind:#04x}: byte count {count}, offset {offset:#06x}")]
    #[diagnostic(code(ccflash::hex::record_info))]
    BadRecordInfo { kind: u8, count: u8, offset: u16 },
    #[error("Unknown record of type {0:#04x}")]
    #[diagnostic(
        code(ccflash::hex::unknown_record),
        help("Pass `--ignore-unknown` to skip unrecognized record types")
    )]
    UnknownRecord(u8),
    #[error("Duplicate record for the start linear address (EIP)")]
    #[diagnostic(code(ccflash::hex::duplicate_sla))]
    DuplicateStartLinear,
    #[error("Duplicate record for the start segment address (CS and IP)")]
    #[diagnostic(code(ccflash::hex::duplicate_ssa))]
    DuplicateStartSegment,
    #[error("Data after the end-of-file record")]
    #[diagnostic(code(ccflash::hex::trailing_data))]
    TrailingData,
    #[error("End-of-file record not found")]
    #[diagnostic(code(ccflash::hex::missing_eof))]
    MissingEof,
    #[error("CS and IP must either both be set or both be unset")]
    #[diagnostic(code(ccflash::image::start_segment))]
    MismatchedStartSegment,
    #[error("Start address value {0:#x} is out of range")]
    #[diagnostic(code(ccflash::image::start_address))]
    StartAddressRange(u32),
    #[error("Truncated input")]
    #[diagnostic(code(ccflash::image::truncated))]
    Truncated,
    #[error("Memory at {base:#010x} with {size} bytes exceeds the maximum address {endmost:#010x}")]
    #[diagnostic(code(ccflash::image::out_of_range))]
    OutOfRange { base: u32, size: u64, endmost: u32 },
    #[error("Memory at {base:#010x}..={end:#010x} overlaps an existing region")]
    #[diagnostic(code(ccflash::image::overlap))]
    Overlap { base: u32, end: u32 },
    #[error("Requested memory range is not contained in the image")]
    #[diagnostic(code(ccflash::image::not_found))]
    NotFound,
    #[error("Data size should be at least 1 byte")]
    #[diagnostic(code(ccflash::image::empty))]
    EmptyData,
}
