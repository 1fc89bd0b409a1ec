//! Bounds-checked FlatBuffer reader
//!
//! FlatBuffer layout, as far as the loader needs it:
//! - offset 0: u32 offset to the root table
//! - a table starts with an i32 soffset back to its vtable
//! - a vtable is [u16 vtable size, u16 table size, u16 field offsets...]
//! - offset-typed fields (tables, vectors, strings) hold a u32 relative to
//!   the field's own position
//! - vectors and strings start with a u32 element count
//!
//! Every read is checked against the buffer; malformed input yields
//! `LoadError::Malformed` instead of panicking.

use byteorder::{ByteOrder, LittleEndian};
use graft_core::LoadError;

type Result<T> = std::result::Result<T, LoadError>;

/// Borrow `len` bytes at `pos`
pub(crate) fn slice(data: &[u8], pos: usize, len: usize) -> Result<&[u8]> {
    pos.checked_add(len)
        .and_then(|end| data.get(pos..end))
        .ok_or_else(|| LoadError::Malformed("Read out of bounds".into()))
}

// Helper functions for reading little-endian values
pub(crate) fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
    Ok(LittleEndian::read_u16(slice(data, pos, 2)?))
}

pub(crate) fn read_i32(data: &[u8], pos: usize) -> Result<i32> {
    Ok(LittleEndian::read_i32(slice(data, pos, 4)?))
}

pub(crate) fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    Ok(LittleEndian::read_u32(slice(data, pos, 4)?))
}

pub(crate) fn read_u64(data: &[u8], pos: usize) -> Result<u64> {
    Ok(LittleEndian::read_u64(slice(data, pos, 8)?))
}

pub(crate) fn read_f32(data: &[u8], pos: usize) -> Result<f32> {
    Ok(LittleEndian::read_f32(slice(data, pos, 4)?))
}

/// Resolve the u32 offset stored at `pos`
fn follow(data: &[u8], pos: usize) -> Result<usize> {
    let offset = read_u32(data, pos)? as usize;
    pos.checked_add(offset)
        .filter(|&target| target < data.len())
        .ok_or_else(|| LoadError::Malformed(format!("Offset at {} points outside the buffer", pos)))
}

/// A table inside a FlatBuffer
#[derive(Debug, Clone, Copy)]
pub(crate) struct Table<'a> {
    data: &'a [u8],
    pos: usize,
    vtable: usize,
    vtable_len: usize,
}

impl<'a> Table<'a> {
    /// The root table
    pub fn root(data: &'a [u8]) -> Result<Self> {
        let pos = follow(data, 0)?;
        Self::at(data, pos)
    }

    /// The table starting at `pos`
    pub fn at(data: &'a [u8], pos: usize) -> Result<Self> {
        let soffset = read_i32(data, pos)? as i64;
        let vtable = pos as i64 - soffset;
        if vtable < 0 || vtable as usize >= data.len() {
            return Err(LoadError::Malformed(format!(
                "Vtable for table at {} is out of bounds",
                pos
            )));
        }
        let vtable = vtable as usize;

        let vtable_len = read_u16(data, vtable)? as usize;
        if vtable_len < 4 || vtable_len % 2 != 0 {
            return Err(LoadError::Malformed(format!(
                "Invalid vtable size {} at {}",
                vtable_len, vtable
            )));
        }
        slice(data, vtable, vtable_len)?;

        Ok(Self {
            data,
            pos,
            vtable,
            vtable_len,
        })
    }

    /// Absolute position of field `field`, or None when it is absent
    fn field_pos(&self, field: u16) -> Result<Option<usize>> {
        let entry = 4 + 2 * field as usize;
        if entry + 2 > self.vtable_len {
            return Ok(None);
        }
        match read_u16(self.data, self.vtable + entry)? {
            0 => Ok(None),
            offset => Ok(Some(self.pos + offset as usize)),
        }
    }

    pub fn u8_field(&self, field: u16, default: u8) -> Result<u8> {
        match self.field_pos(field)? {
            Some(pos) => Ok(slice(self.data, pos, 1)?[0]),
            None => Ok(default),
        }
    }

    pub fn bool_field(&self, field: u16, default: bool) -> Result<bool> {
        Ok(self.u8_field(field, default as u8)? != 0)
    }

    pub fn i32_field(&self, field: u16, default: i32) -> Result<i32> {
        match self.field_pos(field)? {
            Some(pos) => read_i32(self.data, pos),
            None => Ok(default),
        }
    }

    pub fn u32_field(&self, field: u16, default: u32) -> Result<u32> {
        match self.field_pos(field)? {
            Some(pos) => read_u32(self.data, pos),
            None => Ok(default),
        }
    }

    pub fn u64_field(&self, field: u16, default: u64) -> Result<u64> {
        match self.field_pos(field)? {
            Some(pos) => read_u64(self.data, pos),
            None => Ok(default),
        }
    }

    pub fn f32_field(&self, field: u16, default: f32) -> Result<f32> {
        match self.field_pos(field)? {
            Some(pos) => read_f32(self.data, pos),
            None => Ok(default),
        }
    }

    /// Position an offset-typed field points at
    fn target(&self, field: u16) -> Result<Option<usize>> {
        self.field_pos(field)?
            .map(|pos| follow(self.data, pos))
            .transpose()
    }

    /// Sub-table field
    pub fn table_field(&self, field: u16) -> Result<Option<Table<'a>>> {
        self.target(field)?
            .map(|pos| Table::at(self.data, pos))
            .transpose()
    }

    /// String field
    pub fn string_field(&self, field: u16) -> Result<Option<String>> {
        let Some(bytes) = self.bytes_field(field)? else {
            return Ok(None);
        };
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| LoadError::Malformed(format!("Invalid UTF-8: {}", e)))
    }

    /// Vector-of-tables field; empty when absent
    pub fn tables_field(&self, field: u16) -> Result<Vec<Table<'a>>> {
        let Some(pos) = self.target(field)? else {
            return Ok(Vec::new());
        };
        let count = read_u32(self.data, pos)? as usize;
        let len = count
            .checked_mul(4)
            .ok_or_else(|| LoadError::Malformed(format!("Vector at {} is too long", pos)))?;
        slice(self.data, pos + 4, len)?;

        (0..count)
            .map(|i| {
                let elem_pos = pos + 4 + i * 4;
                Table::at(self.data, follow(self.data, elem_pos)?)
            })
            .collect()
    }

    /// Byte-vector (or string) field
    pub fn bytes_field(&self, field: u16) -> Result<Option<&'a [u8]>> {
        self.vector(field, 1)
    }

    pub fn i32_vector_field(&self, field: u16) -> Result<Option<Vec<i32>>> {
        Ok(self
            .vector(field, 4)?
            .map(|raw| raw.chunks_exact(4).map(LittleEndian::read_i32).collect()))
    }

    pub fn i64_vector_field(&self, field: u16) -> Result<Option<Vec<i64>>> {
        Ok(self
            .vector(field, 8)?
            .map(|raw| raw.chunks_exact(8).map(LittleEndian::read_i64).collect()))
    }

    pub fn f32_vector_field(&self, field: u16) -> Result<Option<Vec<f32>>> {
        Ok(self
            .vector(field, 4)?
            .map(|raw| raw.chunks_exact(4).map(LittleEndian::read_f32).collect()))
    }

    /// Raw element bytes of a vector of `width`-byte scalars
    fn vector(&self, field: u16, width: usize) -> Result<Option<&'a [u8]>> {
        let Some(pos) = self.target(field)? else {
            return Ok(None);
        };
        let count = read_u32(self.data, pos)? as usize;
        let len = count
            .checked_mul(width)
            .ok_or_else(|| LoadError::Malformed(format!("Vector at {} is too long", pos)))?;
        slice(self.data, pos + 4, len).map(Some)
    }
}
