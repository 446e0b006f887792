//! The mutable file image: endian-aware, length-checked byte access.
//!
//! Every multi-byte value in the file goes through these helpers so that LSB
//! and MSB encodings are handled uniformly; the engine never reinterprets raw
//! header bytes as host integers.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use elf::abi::{ELFDATA2LSB, ELFDATA2MSB};

use crate::error::parse_error;
use crate::Result;

/// Byte order of the ELF data encoding, from `e_ident[EI_DATA]`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Maps an `EI_DATA` byte to a byte order, if it names a known one.
    pub fn from_ei_data(data: u8) -> Option<Endian> {
        match data {
            ELFDATA2LSB => Some(Endian::Little),
            ELFDATA2MSB => Some(Endian::Big),
            _ => None,
        }
    }
}

/// A growable byte buffer holding exactly one ELF file.
pub struct Image {
    data: Vec<u8>,
    endian: Endian,
}

impl Image {
    pub fn new(data: Vec<u8>, endian: Endian) -> Image {
        Image { data, endian }
    }

    #[inline]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, offset: u64, len: u64) -> Result<core::ops::Range<usize>> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| parse_error("file offset overflow"))?;
        if end > self.len() {
            return Err(parse_error("access out of file bounds"));
        }
        Ok(offset as usize..end as usize)
    }

    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.data[range])
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn read_u16(&self, offset: u64) -> Result<u16> {
        let bytes = self.slice(offset, 2)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u16(bytes),
            Endian::Big => BigEndian::read_u16(bytes),
        })
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let bytes = self.slice(offset, 4)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u32(bytes),
            Endian::Big => BigEndian::read_u32(bytes),
        })
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let bytes = self.slice(offset, 8)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u64(bytes),
            Endian::Big => BigEndian::read_u64(bytes),
        })
    }

    pub fn write_u16(&mut self, offset: u64, value: u16) -> Result<()> {
        let endian = self.endian;
        let range = self.range(offset, 2)?;
        let bytes = &mut self.data[range];
        match endian {
            Endian::Little => LittleEndian::write_u16(bytes, value),
            Endian::Big => BigEndian::write_u16(bytes, value),
        }
        Ok(())
    }

    pub fn write_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        let endian = self.endian;
        let range = self.range(offset, 4)?;
        let bytes = &mut self.data[range];
        match endian {
            Endian::Little => LittleEndian::write_u32(bytes, value),
            Endian::Big => BigEndian::write_u32(bytes, value),
        }
        Ok(())
    }

    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        let endian = self.endian;
        let range = self.range(offset, 8)?;
        let bytes = &mut self.data[range];
        match endian {
            Endian::Little => LittleEndian::write_u64(bytes, value),
            Endian::Big => BigEndian::write_u64(bytes, value),
        }
        Ok(())
    }

    pub fn copy_from(&mut self, offset: u64, src: &[u8]) -> Result<()> {
        let range = self.range(offset, src.len() as u64)?;
        self.data[range].copy_from_slice(src);
        Ok(())
    }

    pub fn fill(&mut self, offset: u64, len: u64, byte: u8) -> Result<()> {
        let range = self.range(offset, len)?;
        self.data[range].fill(byte);
        Ok(())
    }

    /// Grows the buffer to `new_len` bytes, zero-filling the tail. Existing
    /// bytes are preserved; the image never shrinks.
    pub fn grow(&mut self, new_len: u64) {
        debug_assert!(new_len >= self.len());
        self.data.resize(new_len as usize, 0);
    }

    /// Moves everything from `start` to the end of the buffer forward by
    /// `amount` bytes, growing the buffer and zero-filling the vacated window.
    pub fn shift_tail(&mut self, start: u64, amount: u64) -> Result<()> {
        let old_len = self.data.len();
        if start > old_len as u64 {
            return Err(parse_error("shift start out of file bounds"));
        }
        let start = start as usize;
        let amount = amount as usize;
        self.data.resize(old_len + amount, 0);
        self.data.copy_within(start..old_len, start + amount);
        self.data[start..start + amount].fill(0);
        Ok(())
    }
}
