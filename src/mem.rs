
use std::fmt;

use anyhow::bail;

use crate::bus::prim::AccessWidth;

/// An owned, contiguous span of bytes backing a RAM or ROM region.
///
/// Values are stored in big-endian order regardless of host byte order,
/// matching the simulated CPU. The buffer pool exclusively owns this
/// storage; nothing else holds a reference into it across accesses.
pub struct MemBuffer {
    /// Vector of bytes with the contents of this region.
    data: Vec<u8>,
    /// Bus address of the first byte.
    base: u32,
    /// False for ROM regions; writes through the bus are rejected.
    writable: bool,
}

impl MemBuffer {
    pub fn new(base: u32, len: usize, writable: bool) -> Self {
        MemBuffer { data: vec![0u8; len], base, writable }
    }

    pub fn base(&self) -> u32 {
        self.base
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Rebase the buffer. Storage identity and contents are preserved.
    pub fn set_base(&mut self, base: u32) {
        self.base = base;
    }

    /// Offset of `addr` inside this buffer, if it falls within it.
    pub fn offset_of(&self, addr: u32) -> Option<usize> {
        let off = addr.checked_sub(self.base)? as usize;
        (off < self.data.len()).then_some(off)
    }
}

/// Generic reads and writes.
impl MemBuffer {
    pub fn read<T: AccessWidth>(&self, off: usize) -> anyhow::Result<T> {
        let len = T::size_of();
        if off + len > self.data.len() {
            bail!("out-of-bounds read at offset {off:x}");
        }
        Ok(T::from_be_slice(&self.data[off..off + len]))
    }

    pub fn write<T: AccessWidth>(&mut self, off: usize, val: T) -> anyhow::Result<()> {
        let len = T::size_of();
        if off + len > self.data.len() {
            bail!("out-of-bounds write at offset {off:x}");
        }
        val.put_be_slice(&mut self.data[off..off + len]);
        Ok(())
    }
}

/// Bulk reads and writes.
impl MemBuffer {
    pub fn read_buf(&self, off: usize, dst: &mut [u8]) -> anyhow::Result<()> {
        if off + dst.len() > self.data.len() {
            bail!("out-of-bounds bulk read at offset {off:x}");
        }
        dst.copy_from_slice(&self.data[off..off + dst.len()]);
        Ok(())
    }

    pub fn write_buf(&mut self, off: usize, src: &[u8]) -> anyhow::Result<()> {
        if off + src.len() > self.data.len() {
            bail!("out-of-bounds bulk write at offset {off:x}");
        }
        self.data[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl fmt::Debug for MemBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBuffer")
            .field("base", &self.base)
            .field("len", &self.data.len())
            .field("writable", &self.writable)
            .finish()
    }
}
