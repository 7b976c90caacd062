//! Byte Source
//!
//! Bounds-checked, endianness-aware reads over a borrowed byte slice. Every
//! multi-byte field the loader and the decoders interpret goes through here,
//! so a short buffer always surfaces as [`BaretkError::Truncated`] instead of
//! a slice-index panic.

use crate::error::{BaretkError, Result};
use crate::loader::Endianness;

/// Addressable view over file or memory bytes with a declared endianness.
#[derive(Debug, Clone, Copy)]
pub struct ByteSource<'a> {
    bytes: &'a [u8],
    endianness: Endianness,
}

impl<'a> ByteSource<'a> {
    pub fn new(bytes: &'a [u8], endianness: Endianness) -> Self {
        Self { bytes, endianness }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Same bytes, different byte order.
    pub fn with_endianness(self, endianness: Endianness) -> Self {
        Self {
            bytes: self.bytes,
            endianness,
        }
    }

    /// Borrow `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// Returns `Truncated` if the range extends past the end of the source
    /// (including arithmetic overflow of `offset + len`).
    pub fn slice(&self, offset: u64, len: u64) -> Result<&'a [u8]> {
        let available: u64 = self.bytes.len() as u64;
        let end: u64 = offset
            .checked_add(len)
            .ok_or_else(|| BaretkError::truncated(offset, len, available))?;
        if end > available {
            return Err(BaretkError::truncated(
                offset,
                len,
                available.saturating_sub(offset),
            ));
        }
        Ok(&self.bytes[offset as usize..end as usize])
    }

    /// Borrow everything from `offset` to the end; empty when `offset` is at or past the end.
    pub fn tail(&self, offset: u64) -> &'a [u8] {
        match usize::try_from(offset) {
            Ok(start) if start < self.bytes.len() => &self.bytes[start..],
            _ => &[],
        }
    }

    fn array<const N: usize>(&self, offset: u64) -> Result<[u8; N]> {
        let raw: &[u8] = self.slice(offset, N as u64)?;
        let mut out: [u8; N] = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    #[inline]
    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        Ok(self.array::<1>(offset)?[0])
    }

    pub fn read_u16(&self, offset: u64) -> Result<u16> {
        let raw: [u8; 2] = self.array(offset)?;
        Ok(match self.endianness {
            Endianness::Little => u16::from_le_bytes(raw),
            Endianness::Big => u16::from_be_bytes(raw),
        })
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let raw: [u8; 4] = self.array(offset)?;
        Ok(match self.endianness {
            Endianness::Little => u32::from_le_bytes(raw),
            Endianness::Big => u32::from_be_bytes(raw),
        })
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let raw: [u8; 8] = self.array(offset)?;
        Ok(match self.endianness {
            Endianness::Little => u64::from_le_bytes(raw),
            Endianness::Big => u64::from_be_bytes(raw),
        })
    }

    /// Read a native word: 8 bytes for 64-bit containers, 4 bytes widened otherwise.
    pub fn read_word(&self, offset: u64, is_64: bool) -> Result<u64> {
        if is_64 {
            self.read_u64(offset)
        } else {
            self.read_u32(offset).map(u64::from)
        }
    }

    /// Read a NUL-terminated string starting at `offset`, bounded by the source end.
    pub fn read_cstr(&self, offset: u64) -> Result<&'a str> {
        let rest: &[u8] = self.slice(offset, 0).map(|_| self.tail(offset))?;
        let end: usize = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        std::str::from_utf8(&rest[..end])
            .map_err(|_| BaretkError::malformed(format!("non UTF-8 string at 0x{:x}", offset)))
    }
}
