//! Binary envelope codec
//!
//! A compact little-endian container for sparse images: a twelve-byte header
//! carrying the EIP, CS and IP entry points (`0xFFFFFFFF` marks an unset
//! field), followed by `(base, size, data…)` region records until the end of
//! the stream. A region of exactly 2^32 bytes is stored with size 0, since
//! the true length overflows the field.

use std::io::{self, Read, Write};

use crate::{
    error::{CodecError, Error},
    image::{AddressWidth, Image},
};

const INVALID_ADDRESS: u32 = 0xffff_ffff;
const MAX_CS_IP: u32 = 0xffff;

/// Parse a binary envelope into an [Image].
pub fn decode<R: Read>(mut reader: R, width: Option<AddressWidth>) -> Result<Image, Error> {
    let mut image = match width {
        Some(width) => Image::with_address_width(width),
        None => Image::new(),
    };

    let eip = read_u32(&mut reader)?;
    let cs = read_u32(&mut reader)?;
    let ip = read_u32(&mut reader)?;

    if (cs == INVALID_ADDRESS) != (ip == INVALID_ADDRESS) {
        return Err(CodecError::MismatchedStartSegment.into());
    }
    if eip != INVALID_ADDRESS {
        image.set_eip(eip)?;
    }
    if cs != INVALID_ADDRESS {
        if cs > MAX_CS_IP {
            return Err(CodecError::StartAddressRange(cs).into());
        }
        if ip > MAX_CS_IP {
            return Err(CodecError::StartAddressRange(ip).into());
        }
        image.set_start_segment(cs as u16, ip as u16)?;
    }

    loop {
        let mut base_bytes = [0u8; 4];
        if !read_or_eof(&mut reader, &mut base_bytes)? {
            break;
        }
        let base = u32::from_le_bytes(base_bytes);

        let size = match read_u32(&mut reader)? {
            0 => 1u64 << 32,
            size => size as u64,
        };

        // Stream the payload in pieces; adjacent pieces merge back into one
        // region on insert.
        let mut buffer = [0u8; 1024];
        let mut offset = 0u64;
        while offset < size {
            let address = base as u64 + offset;
            if address > u32::MAX as u64 {
                return Err(CodecError::OutOfRange {
                    base,
                    size,
                    endmost: image.endmost_address(),
                }
                .into());
            }

            let take = (size - offset).min(buffer.len() as u64) as usize;
            reader.read_exact(&mut buffer[..take]).map_err(map_eof)?;
            image.insert(address as u32, &buffer[..take])?;
            offset += take as u64;
        }
    }

    Ok(image)
}

/// Write an [Image] as a binary envelope.
pub fn encode<W: Write>(image: &Image, mut writer: W) -> Result<(), Error> {
    let (cs, ip) = match image.start_segment() {
        Some(segment) => (segment.cs as u32, segment.ip as u32),
        None => (INVALID_ADDRESS, INVALID_ADDRESS),
    };

    writer.write_all(&image.eip().unwrap_or(INVALID_ADDRESS).to_le_bytes())?;
    writer.write_all(&cs.to_le_bytes())?;
    writer.write_all(&ip.to_le_bytes())?;

    for region in image.regions() {
        writer.write_all(&region.base_address().to_le_bytes())?;
        // A full-space region wraps to 0 here, by convention.
        writer.write_all(&(region.len() as u32).to_le_bytes())?;
        for chunk in region.chunks() {
            writer.write_all(chunk)?;
        }
    }

    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, Error> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).map_err(map_eof)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Fill `buffer` completely, or report a clean end-of-stream before the
/// first byte. A stream ending part way through is a truncation error.
fn read_or_eof<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<bool, Error> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(CodecError::Truncated.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn map_eof(error: io::Error) -> Error {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::Truncated.into()
    } else {
        Error::Io(error)
    }
}
