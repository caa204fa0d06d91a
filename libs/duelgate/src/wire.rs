//! Sequential fixed-width codec over the segment byte window.
//!
//! Both sides agree, per action, on the exact sequence and width of
//! fields; there is no schema tag next to the bytes. Every decode is
//! bounds-checked so a buggy or malicious peer can at worst fail the
//! call, never read out of bounds.

use crate::error::{BridgeError, Result};

/// Cursor writer over a borrowed byte window. Native endian, no padding.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos.checked_add(bytes.len()).ok_or_else(|| {
            BridgeError::Wire("write length overflow".into())
        })?;
        if end > self.buf.len() {
            return Err(BridgeError::Wire(format!(
                "write of {} bytes at offset {} exceeds buffer capacity {}",
                bytes.len(),
                self.pos,
                self.buf.len()
            )));
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.put(&v.to_ne_bytes())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_ne_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_ne_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.put(&v.to_ne_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.put(&v.to_ne_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.put(&v.to_ne_bytes())
    }

    /// Raw bytes, no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.put(bytes)
    }

    /// `u64` length prefix followed by the bytes.
    pub fn write_sized(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u64(bytes.len() as u64)?;
        self.put(bytes)
    }
}

/// Cursor reader over a borrowed byte window.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(|| {
            BridgeError::Wire("read length overflow".into())
        })?;
        if end > self.buf.len() {
            return Err(BridgeError::Wire(format!(
                "read of {} bytes at offset {} exceeds buffer capacity {}",
                len,
                self.pos,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_ne_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_ne_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_ne_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Raw bytes of a known length.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// `u64` length prefix followed by the bytes.
    pub fn read_sized(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u64()?;
        let len = usize::try_from(len)
            .map_err(|_| BridgeError::Wire(format!("length prefix {len} too large")))?;
        self.take(len)
    }

    /// A `u32`-prefixed payload, as used by message/query responses.
    pub fn read_sized_u32(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}
