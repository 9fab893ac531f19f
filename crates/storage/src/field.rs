//! Binary view over a byte range.
//!
//! Every on-disk structure in the store is encoded through these helpers:
//! fixed-width big-endian integers, sub-range fields, and a small pointer
//! type for walking a range forwards or backwards. Offsets are relative to
//! the start of the field; callers are responsible for staying in bounds.

use crate::error::{Result, StorageError};

/// Read-only view of a byte range.
#[derive(Debug, Clone, Copy)]
pub struct Field<'a> {
    bytes: &'a [u8],
}

impl<'a> Field<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Sub-field of `len` bytes starting at `offset`.
    pub fn sub(&self, offset: usize, len: usize) -> Field<'a> {
        Field::new(&self.bytes[offset..offset + len])
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    pub fn get_u24(&self, offset: usize) -> u32 {
        u32::from_be_bytes([
            0,
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
        ])
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        u32::from_be_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ])
    }

    pub fn get_utf8(&self, offset: usize, len: usize) -> Result<&'a str> {
        std::str::from_utf8(&self.bytes[offset..offset + len])
            .map_err(|e| StorageError::Format(format!("invalid UTF-8 at offset {offset}: {e}")))
    }
}

/// Mutable view of a byte range.
#[derive(Debug)]
pub struct FieldMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> FieldMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_field(&self) -> Field<'_> {
        Field::new(self.bytes)
    }

    pub fn sub_mut(&mut self, offset: usize, len: usize) -> FieldMut<'_> {
        FieldMut::new(&mut self.bytes[offset..offset + len])
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.as_field().get_u8(offset)
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        self.as_field().get_u16(offset)
    }

    pub fn get_u24(&self, offset: usize) -> u32 {
        self.as_field().get_u24(offset)
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        self.as_field().get_u32(offset)
    }

    pub fn put_u8(&mut self, offset: usize, value: u8) {
        self.bytes[offset] = value;
    }

    pub fn put_u16(&mut self, offset: usize, value: u16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Writes the low 24 bits of `value`.
    pub fn put_u24(&mut self, offset: usize, value: u32) {
        debug_assert!(value <= 0x00FF_FFFF, "value {value} does not fit in 24 bits");
        self.bytes[offset..offset + 3].copy_from_slice(&value.to_be_bytes()[1..]);
    }

    pub fn put_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn put_bytes(&mut self, offset: usize, data: &[u8]) {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copies `len` bytes from `src` to `dst` within this field; the ranges
    /// may overlap.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        self.bytes.copy_within(src..src + len, dst);
    }

    pub fn clear(&mut self, offset: usize, len: usize) {
        self.bytes[offset..offset + len].fill(0);
    }
}

/// A position inside a field that moves forwards or backwards by whole
/// values. Reads past the end of the field yield a format error instead of
/// panicking, so it is safe on untrusted bytes.
#[derive(Debug)]
pub struct Pointer<'a> {
    field: Field<'a>,
    offset: usize,
}

impl<'a> Pointer<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            field: Field::new(bytes),
            offset: 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.field.len().saturating_sub(self.offset)
    }

    pub fn inc(&mut self, n: usize) {
        self.offset += n;
    }

    pub fn dec(&mut self, n: usize) {
        self.offset = self.offset.saturating_sub(n);
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(StorageError::Format(format!(
                "truncated data: need {n} bytes at offset {}, have {}",
                self.offset,
                self.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let value = self.field.get_u8(self.offset);
        self.inc(1);
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let value = self.field.get_u16(self.offset);
        self.inc(2);
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let value = self.field.get_u32(self.offset);
        self.inc(4);
        Ok(value)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let bytes = self.field.sub(self.offset, n).bytes();
        self.inc(n);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut buf = [0u8; 12];
        {
            let mut field = FieldMut::new(&mut buf);
            field.put_u16(0, 0x0102);
            field.put_u24(2, 0x030405);
            field.put_u32(5, 0x0607_0809);
            field.put_u8(9, 0xFF);
        }
        assert_eq!(&buf[..10], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 0xFF]);

        let field = Field::new(&buf);
        assert_eq!(field.get_u16(0), 0x0102);
        assert_eq!(field.get_u24(2), 0x030405);
        assert_eq!(field.get_u32(5), 0x0607_0809);
    }

    #[test]
    fn sub_fields_are_relative() {
        let mut buf = [0u8; 8];
        {
            let mut field = FieldMut::new(&mut buf);
            let mut inner = field.sub_mut(4, 4);
            inner.put_u16(2, 0xABCD);
        }
        assert_eq!(Field::new(&buf).sub(4, 4).get_u16(2), 0xABCD);
        assert_eq!(buf[6], 0xAB);
    }

    #[test]
    fn pointer_moves_both_ways_and_detects_truncation() {
        let buf = [0u8, 7, 0, 0, 0, 9, b'h', b'i'];
        let mut ptr = Pointer::new(&buf);
        assert_eq!(ptr.read_u16().unwrap(), 7);
        assert_eq!(ptr.read_u32().unwrap(), 9);
        assert_eq!(ptr.read_bytes(2).unwrap(), b"hi");
        assert!(ptr.read_u8().is_err());
        ptr.dec(2);
        assert_eq!(ptr.read_u8().unwrap(), b'h');
    }

    #[test]
    fn utf8_round_trip() {
        let mut buf = [0u8; 16];
        FieldMut::new(&mut buf).put_bytes(1, "héllo".as_bytes());
        let text = Field::new(&buf).get_utf8(1, "héllo".len()).unwrap();
        assert_eq!(text, "héllo");

        let bad = [0xC3u8, 0x28];
        assert!(Field::new(&bad).get_utf8(0, 2).is_err());
    }
}
