//! Unsigned varint (LEB128-style) encoding and the two record flavors built
//! on top of it.
//!
//! No crate in the surrounding stack offers a varint codec matching this
//! wire shape, so it is hand-rolled: 7 bits of payload per byte, high bit
//! set on every byte but the last.

use crate::error::{GsfaError, Result};

/// Matches Go's `binary.MaxVarintLen64`: a u64 varint never needs more than
/// 10 bytes.
pub const MAX_VARINT_LEN_64: usize = 10;

pub fn encode_uvarint(mut x: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (x & 0x7F) as u8;
        x >>= 7;
        if x != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

/// Decode one uvarint from the front of `buf`. Returns `(value, bytes_consumed)`.
pub fn decode_uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN_64 {
            return Err(GsfaError::MalformedHeader("varint too long".into()));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(GsfaError::MalformedHeader("truncated varint".into()))
}

/// `(offset, size, blocktime)`, the per-transaction location record
/// actually used by the linked log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSizeBlocktime {
    pub offset: u64,
    pub size: u64,
    pub blocktime: u64,
}

impl OffsetSizeBlocktime {
    pub fn encode(&self, out: &mut Vec<u8>) {
        encode_uvarint(self.offset, out);
        encode_uvarint(self.size, out);
        encode_uvarint(self.blocktime, out);
    }

    /// Decode one record from the front of `buf`, returning the record and
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (offset, n1) = decode_uvarint(buf)?;
        let (size, n2) = decode_uvarint(&buf[n1..])?;
        let (blocktime, n3) = decode_uvarint(&buf[n1 + n2..])?;
        Ok((
            Self {
                offset,
                size,
                blocktime,
            },
            n1 + n2 + n3,
        ))
    }

    /// Decode a whole buffer into records, until exhausted. A nonempty
    /// trailing remainder that cannot form a full record is an error.
    pub fn decode_all(mut buf: &[u8]) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        while !buf.is_empty() {
            let (record, consumed) = Self::decode(buf)?;
            out.push(record);
            buf = &buf[consumed..];
        }
        Ok(out)
    }
}

/// `OffsetSizeSlot[Flags]`: the variant with a trailing flags byte and a
/// slot, used by call sites that need to recover the originating slot
/// without consulting the block decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSizeSlotFlags {
    pub offset: u64,
    pub size: u64,
    pub slot: u64,
    pub flags: u8,
}

impl OffsetSizeSlotFlags {
    pub fn encode(&self, out: &mut Vec<u8>) {
        encode_uvarint(self.offset, out);
        encode_uvarint(self.size, out);
        out.push(self.flags);
        encode_uvarint(self.slot, out);
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (offset, n1) = decode_uvarint(buf)?;
        let (size, n2) = decode_uvarint(&buf[n1..])?;
        let flags = *buf
            .get(n1 + n2)
            .ok_or_else(|| GsfaError::MalformedHeader("truncated flags byte".into()))?;
        let (slot, n3) = decode_uvarint(&buf[n1 + n2 + 1..])?;
        Ok((
            Self {
                offset,
                size,
                slot,
                flags,
            },
            n1 + n2 + 1 + n3,
        ))
    }
}
