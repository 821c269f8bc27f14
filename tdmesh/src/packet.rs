//! Fixed-capacity packet buffer with independent read and write cursors.
//!
//! Every frame on the air is built and parsed through [`Packet`]. Writes
//! append at `data_size`, reads consume from `data_start`; the unread bytes
//! are `data_start..data_size`. Nothing ever resizes: the capacity is the
//! network-wide [`MAX_PACKET_SIZE`].

use crate::types::MAX_PACKET_SIZE;

/// Codec cursor failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// A write would run past the buffer capacity.
    #[error("packet overflow: {requested} bytes requested, {available} available")]
    Overflow { requested: usize, available: usize },
    /// A read (or indexed access) would run past the written data.
    #[error("packet underflow: {requested} bytes requested, {remaining} remaining")]
    Underflow { requested: usize, remaining: usize },
}

#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    buf: [u8; MAX_PACKET_SIZE],
    data_start: usize,
    data_size: usize,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("data_start", &self.data_start)
            .field("data", &self.data())
            .finish()
    }
}

impl Packet {
    /// An empty packet.
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_PACKET_SIZE],
            data_start: 0,
            data_size: 0,
        }
    }

    /// A packet holding a copy of `bytes`, ready to be read.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut pkt = Self::new();
        pkt.put(bytes)?;
        Ok(pkt)
    }

    pub const fn capacity() -> usize {
        MAX_PACKET_SIZE
    }

    /// Unread bytes.
    pub fn size(&self) -> usize {
        self.data_size - self.data_start
    }

    /// Bytes that can still be written.
    pub fn available(&self) -> usize {
        MAX_PACKET_SIZE - self.data_size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The unread bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.data_start..self.data_size]
    }

    /// Append `bytes`. Fails without writing anything if they do not fit.
    pub fn put(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        if bytes.len() > self.available() {
            return Err(PacketError::Overflow {
                requested: bytes.len(),
                available: self.available(),
            });
        }
        self.buf[self.data_size..self.data_size + bytes.len()].copy_from_slice(bytes);
        self.data_size += bytes.len();
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), PacketError> {
        self.put(&[value])
    }

    pub fn put_u16_be(&mut self, value: u16) -> Result<(), PacketError> {
        self.put(&value.to_be_bytes())
    }

    /// Consume `out.len()` bytes into `out`. Fails without consuming if too few remain.
    pub fn get(&mut self, out: &mut [u8]) -> Result<(), PacketError> {
        self.ensure_unread(out.len())?;
        out.copy_from_slice(&self.buf[self.data_start..self.data_start + out.len()]);
        self.data_start += out.len();
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, PacketError> {
        let mut b = [0u8; 1];
        self.get(&mut b)?;
        Ok(b[0])
    }

    pub fn get_u16_be(&mut self) -> Result<u16, PacketError> {
        let mut b = [0u8; 2];
        self.get(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    /// Skip `len` unread bytes.
    pub fn discard(&mut self, len: usize) -> Result<(), PacketError> {
        self.ensure_unread(len)?;
        self.data_start += len;
        Ok(())
    }

    /// Byte at absolute position `index`, which must lie before `data_size`.
    pub fn at(&self, index: usize) -> Result<u8, PacketError> {
        self.ensure_written(index)?;
        Ok(self.buf[index])
    }

    pub fn at_mut(&mut self, index: usize) -> Result<&mut u8, PacketError> {
        self.ensure_written(index)?;
        Ok(&mut self.buf[index])
    }

    /// Reset both cursors.
    pub fn clear(&mut self) {
        self.data_start = 0;
        self.data_size = 0;
    }

    /// Whole backing buffer, for a radio receive to fill.
    ///
    /// Follow with [`Packet::set_received`] to publish how much was written.
    pub fn receive_buffer(&mut self) -> &mut [u8; MAX_PACKET_SIZE] {
        self.clear();
        &mut self.buf
    }

    /// Mark the first `len` bytes of the buffer as written and unread.
    pub fn set_received(&mut self, len: usize) -> Result<(), PacketError> {
        if len > MAX_PACKET_SIZE {
            return Err(PacketError::Overflow {
                requested: len,
                available: MAX_PACKET_SIZE,
            });
        }
        self.data_start = 0;
        self.data_size = len;
        Ok(())
    }

    fn ensure_unread(&self, len: usize) -> Result<(), PacketError> {
        if len > self.size() {
            return Err(PacketError::Underflow {
                requested: len,
                remaining: self.size(),
            });
        }
        Ok(())
    }

    fn ensure_written(&self, index: usize) -> Result<(), PacketError> {
        if index >= self.data_size {
            return Err(PacketError::Underflow {
                requested: index + 1,
                remaining: self.data_size,
            });
        }
        Ok(())
    }
}
