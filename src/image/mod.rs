//! Sparse flash image model
//!
//! An [Image] is an ordered set of non-overlapping memory regions plus the
//! optional entry-point fields carried by the Intel-hex start records. It is
//! the common currency between the codecs ([hex], [bin]) and the flasher:
//! codecs produce and consume images, the CLI splices them into flash
//! operations.

use strum::Display;

use crate::error::CodecError;

pub mod bin;
pub mod hex;

/// Data inside a region is stored in chunks of at most this many bytes, so
/// that building a large image from many small inserts stays amortized.
const CHUNK_CAPACITY: usize = 1024;

const MAX_8BIT: u32 = 0xffff;
const MAX_16BIT: u32 = 0xf_ffff;
const MAX_32BIT: u32 = 0xffff_ffff;

/// Addressing ranges of the I8HEX, I16HEX and I32HEX variants
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum AddressWidth {
    /// 16-bit addresses, data records only (I8HEX)
    #[strum(serialize = "8-bit")]
    #[cfg_attr(feature = "cli", value(name = "8"))]
    Bits8,
    /// 20-bit addresses via extended segment address records (I16HEX)
    #[strum(serialize = "16-bit")]
    #[cfg_attr(feature = "cli", value(name = "16"))]
    Bits16,
    /// 32-bit addresses via extended linear address records (I32HEX)
    #[strum(serialize = "32-bit")]
    #[cfg_attr(feature = "cli", value(name = "32"))]
    Bits32,
}

impl AddressWidth {
    fn max_address(self) -> u32 {
        match self {
            AddressWidth::Bits8 => MAX_8BIT,
            AddressWidth::Bits16 => MAX_16BIT,
            AddressWidth::Bits32 => MAX_32BIT,
        }
    }
}

/// The CS:IP entry point carried by a start segment address record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSegment {
    pub cs: u16,
    pub ip: u16,
}

/// A contiguous span of bytes at a base address
#[derive(Debug, Clone)]
pub struct Region {
    base_address: u32,
    chunks: Vec<Vec<u8>>,
}

// Two regions are equal when they cover the same span with the same bytes;
// the internal chunk boundaries depend on insertion order and do not matter.
impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.base_address == other.base_address
            && self.len() == other.len()
            && self.chunks().flatten().eq(other.chunks().flatten())
    }
}

impl Eq for Region {}

impl Region {
    fn new(base_address: u32, data: &[u8]) -> Self {
        let mut region = Region {
            base_address,
            chunks: Vec::new(),
        };
        region.append(data);
        region
    }

    /// First address covered by this region.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Length in bytes. A region can span the full 32-bit address space, so
    /// the length does not fit in a `u32`.
    pub fn len(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Last address covered by this region.
    pub fn end_address(&self) -> u32 {
        (self.base_address as u64 + self.len() - 1) as u32
    }

    /// The data chunks, in address order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(|c| c.as_slice())
    }

    /// Collect the region contents into one buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len() as usize);
        for chunk in &self.chunks {
            bytes.extend_from_slice(chunk);
        }
        bytes
    }

    /// Append `data` to the end, filling the tail chunk before starting new
    /// ones.
    fn append(&mut self, mut data: &[u8]) {
        if let Some(tail) = self.chunks.last_mut() {
            let room = CHUNK_CAPACITY - tail.len();
            if room > 0 {
                let take = room.min(data.len());
                tail.extend_from_slice(&data[..take]);
                data = &data[take..];
            }
        }

        while !data.is_empty() {
            let take = data.len().min(CHUNK_CAPACITY);
            self.chunks.push(data[..take].to_vec());
            data = &data[take..];
        }
    }

    /// Prepend `data` ahead of the existing chunks and move the base down.
    fn prepend(&mut self, base_address: u32, data: &[u8]) {
        let mut chunks = Vec::with_capacity(data.len().div_ceil(CHUNK_CAPACITY) + self.chunks.len());
        for chunk in data.chunks(CHUNK_CAPACITY) {
            chunks.push(chunk.to_vec());
        }
        chunks.append(&mut self.chunks);
        self.chunks = chunks;
        self.base_address = base_address;
    }

    /// Glue `other` (which must start right after this region ends) onto the
    /// end, keeping its chunking as is.
    fn absorb(&mut self, other: Region) {
        self.chunks.extend(other.chunks);
    }
}

/// A sparse memory image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    eip: Option<u32>,
    start_segment: Option<StartSegment>,
    regions: Vec<Region>,
    end_address: u32,
    endmost_address: u32,
}

impl Default for Image {
    fn default() -> Self {
        Image::new()
    }
}

impl Image {
    /// An empty image that accepts the full 32-bit address space and picks
    /// the narrowest hex variant its contents allow.
    pub fn new() -> Self {
        Image {
            eip: None,
            start_segment: None,
            regions: Vec::new(),
            end_address: MAX_8BIT,
            endmost_address: MAX_32BIT,
        }
    }

    /// An empty image pinned to a fixed addressing width; data beyond the
    /// width's range is rejected and emission always uses that variant.
    pub fn with_address_width(width: AddressWidth) -> Self {
        let max = width.max_address();
        Image {
            eip: None,
            start_segment: None,
            regions: Vec::new(),
            end_address: max,
            endmost_address: max,
        }
    }

    /// EIP entry point from a start linear address record.
    pub fn eip(&self) -> Option<u32> {
        self.eip
    }

    /// Set the EIP entry point; it can only be set once.
    pub fn set_eip(&mut self, eip: u32) -> Result<(), CodecError> {
        if self.eip.is_some() {
            return Err(CodecError::DuplicateStartLinear);
        }
        self.eip = Some(eip);
        Ok(())
    }

    /// CS:IP entry point from a start segment address record.
    pub fn start_segment(&self) -> Option<StartSegment> {
        self.start_segment
    }

    /// Set the CS:IP entry point; it can only be set once.
    pub fn set_start_segment(&mut self, cs: u16, ip: u16) -> Result<(), CodecError> {
        if self.start_segment.is_some() {
            return Err(CodecError::DuplicateStartSegment);
        }
        self.start_segment = Some(StartSegment { cs, ip });
        Ok(())
    }

    /// The regions of the image, ordered by base address.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Total number of data bytes across all regions.
    pub fn data_len(&self) -> u64 {
        self.regions.iter().map(Region::len).sum()
    }

    /// The highest address the image may contain.
    pub fn endmost_address(&self) -> u32 {
        self.endmost_address
    }

    /// The addressing class required by the current contents (the maximum
    /// observed address, rounded up to the next hex-variant boundary).
    pub fn end_address(&self) -> u32 {
        self.end_address
    }

    /// Insert `data` at `base`.
    ///
    /// The new span must not overlap any existing region; spans that exactly
    /// touch a neighbour are merged into it, so two regions are never
    /// adjacent.
    pub fn insert(&mut self, base: u32, data: &[u8]) -> Result<(), CodecError> {
        if data.is_empty() {
            return Err(CodecError::EmptyData);
        }

        let size = data.len() as u64;
        let end = base as u64 + size - 1;
        if end > self.endmost_address as u64 {
            return Err(CodecError::OutOfRange {
                base,
                size,
                endmost: self.endmost_address,
            });
        }

        if end > self.end_address as u64 {
            self.end_address = if end > MAX_16BIT as u64 {
                MAX_32BIT
            } else if end > MAX_8BIT as u64 {
                MAX_16BIT
            } else {
                MAX_8BIT
            };
        }

        // First region starting beyond the new base.
        let index = self
            .regions
            .partition_point(|region| region.base_address as u64 <= base as u64);

        if index > 0 {
            let previous = &self.regions[index - 1];
            if previous.base_address as u64 + previous.len() > base as u64 {
                return Err(CodecError::Overlap {
                    base,
                    end: end as u32,
                });
            }
        }
        if index < self.regions.len() && self.regions[index].base_address as u64 <= end {
            return Err(CodecError::Overlap {
                base,
                end: end as u32,
            });
        }

        let touches_previous = index > 0
            && self.regions[index - 1].base_address as u64 + self.regions[index - 1].len()
                == base as u64;
        let touches_next =
            index < self.regions.len() && end + 1 == self.regions[index].base_address as u64;

        match (touches_previous, touches_next) {
            (true, true) => {
                let next = self.regions.remove(index);
                let previous = &mut self.regions[index - 1];
                previous.append(data);
                previous.absorb(next);
            }
            (true, false) => {
                self.regions[index - 1].append(data);
            }
            (false, true) => {
                self.regions[index].prepend(base, data);
            }
            (false, false) => {
                self.regions.insert(index, Region::new(base, data));
            }
        }

        Ok(())
    }

    /// Copy `size` bytes starting at `base` out of the image.
    ///
    /// The whole span must be contained in a single region; requests that
    /// cross a gap fail with [`CodecError::NotFound`].
    pub fn copy_out(&self, base: u32, size: usize) -> Result<Vec<u8>, CodecError> {
        if size == 0 {
            return Err(CodecError::EmptyData);
        }

        let region = self
            .regions
            .iter()
            .find(|region| {
                (region.base_address as u64..region.base_address as u64 + region.len())
                    .contains(&(base as u64))
            })
            .ok_or(CodecError::NotFound)?;

        let offset = base as u64 - region.base_address as u64;
        if offset + size as u64 > region.len() {
            return Err(CodecError::NotFound);
        }

        let mut out = Vec::with_capacity(size);
        let mut skip = offset;
        for chunk in region.chunks() {
            let chunk_len = chunk.len() as u64;
            if skip >= chunk_len {
                skip -= chunk_len;
                continue;
            }
            let available = &chunk[skip as usize..];
            skip = 0;
            let take = available.len().min(size - out.len());
            out.extend_from_slice(&available[..take]);
            if out.len() == size {
                break;
            }
        }

        Ok(out)
    }
}
