//! Packed 7-bit bitstream reader and writer
//!
//! Every byte on the wire carries 7 payload bits; the top bit is reserved by
//! the transport. Fields are packed least-significant bit first and may span
//! byte boundaries.

use thiserror::Error;

/// Payload bits carried by each wire byte
pub const BITS_PER_BYTE: usize = 7;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("Read of {requested} bits with only {remaining} remaining")]
    Truncated { requested: usize, remaining: usize },

    #[error("Field width {0} is outside 1..=32")]
    InvalidWidth(usize),

    #[error("Write of {requested} bits exceeds capacity ({remaining} bits left)")]
    Overflow { requested: usize, remaining: usize },
}

/// Checksum of a 7-bit payload
pub fn checksum(payload: &[u8]) -> u8 {
    let mut sum = payload.len() as u8;
    for &b in payload {
        sum = sum.wrapping_add(sum.wrapping_mul(2).wrapping_add(b));
    }
    sum & 0x7f
}

/// True if the last byte is the checksum of the bytes before it
pub fn checksum_is_ok(data: &[u8]) -> bool {
    match data.split_last() {
        Some((&sum, payload)) if !payload.is_empty() => checksum(payload) == sum,
        _ => false,
    }
}

/// Cursor over a packed 7-bit payload
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * BITS_PER_BYTE - self.position
    }

    /// Read an unsigned field. On failure the cursor does not move.
    pub fn read_bits(&mut self, bits: usize) -> Result<u32, BitstreamError> {
        if bits == 0 || bits > 32 {
            return Err(BitstreamError::InvalidWidth(bits));
        }

        let remaining = self.remaining_bits();
        if bits > remaining {
            return Err(BitstreamError::Truncated {
                requested: bits,
                remaining,
            });
        }

        let mut value: u64 = 0;
        let mut written = 0;
        while written < bits {
            let byte = usize::from(self.data[self.position / BITS_PER_BYTE] & 0x7f);
            let offset = self.position % BITS_PER_BYTE;
            let take = (BITS_PER_BYTE - offset).min(bits - written);
            let chunk = (byte >> offset) & ((1 << take) - 1);

            value |= (chunk as u64) << written;
            written += take;
            self.position += take;
        }

        Ok(value as u32)
    }

    /// Read a two's complement field of `bits` width
    pub fn read_signed(&mut self, bits: usize) -> Result<i32, BitstreamError> {
        let raw = self.read_bits(bits)?;
        if bits == 32 {
            return Ok(raw as i32);
        }

        let shift = 32 - bits as u32;
        Ok(((raw << shift) as i32) >> shift)
    }

    pub fn read_bool(&mut self) -> Result<bool, BitstreamError> {
        Ok(self.read_bits(1)? != 0)
    }

    /// Read `count` 7-bit characters
    pub fn read_string(&mut self, count: usize) -> Result<String, BitstreamError> {
        let needed = count * BITS_PER_BYTE;
        if needed > self.remaining_bits() {
            return Err(BitstreamError::Truncated {
                requested: needed,
                remaining: self.remaining_bits(),
            });
        }

        let mut out = String::with_capacity(count);
        for _ in 0..count {
            out.push(char::from(self.read_bits(BITS_PER_BYTE)? as u8));
        }
        Ok(out)
    }
}

/// Builds a packed 7-bit payload
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    position: usize,
    /// Maximum payload size in bytes, if bounded
    limit: Option<usize>,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            limit: Some(max_bytes),
            ..Self::default()
        }
    }

    pub fn bits_written(&self) -> usize {
        self.position
    }

    pub fn remaining_capacity(&self) -> Option<usize> {
        self.limit
            .map(|max| (max * BITS_PER_BYTE).saturating_sub(self.position))
    }

    pub fn has_capacity(&self, bits: usize) -> bool {
        self.remaining_capacity().map_or(true, |left| bits <= left)
    }

    pub fn write_bits(&mut self, value: u32, bits: usize) -> Result<(), BitstreamError> {
        if bits == 0 || bits > 32 {
            return Err(BitstreamError::InvalidWidth(bits));
        }
        if !self.has_capacity(bits) {
            return Err(BitstreamError::Overflow {
                requested: bits,
                remaining: self.remaining_capacity().unwrap_or(0),
            });
        }

        let mut value = u64::from(value);
        let mut left = bits;
        while left > 0 {
            let offset = self.position % BITS_PER_BYTE;
            if offset == 0 {
                self.data.push(0);
            }

            let take = (BITS_PER_BYTE - offset).min(left);
            let chunk = (value & ((1 << take) - 1)) as u8;
            if let Some(last) = self.data.last_mut() {
                *last |= chunk << offset;
            }

            value >>= take;
            left -= take;
            self.position += take;
        }

        Ok(())
    }

    pub fn write_signed(&mut self, value: i32, bits: usize) -> Result<(), BitstreamError> {
        let mask = if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 };
        self.write_bits(value as u32 & mask, bits)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), BitstreamError> {
        self.write_bits(u32::from(value), 1)
    }

    /// Finish the payload. The final partial byte is already zero padded.
    pub fn finish(self) -> Vec<u8> {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
