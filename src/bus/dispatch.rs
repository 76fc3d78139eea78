
use log::{debug, warn};

use crate::bus::prim::*;
use crate::bus::{AddressSpace, PAGE_SIZE};

/// All-ones pattern returned (masked to the access width) for faulted
/// reads.
pub const FAULT_SENTINEL: u32 = !0;

/// Slot-level transfers. Each returns `None` when the access misses,
/// which the engine turns into invalid-access handling.
impl AddressSpace {
    fn buffer_read(&self, id: u8, addr: u32, width: BusWidth) -> Option<u32> {
        let buf = self.buffers[id as usize].as_ref()?;
        let off = buf.offset_of(addr)?;
        match width {
            BusWidth::Byte => buf.read::<u8>(off).ok().map(u32::from),
            BusWidth::Word => buf.read::<u16>(off).ok().map(u32::from),
            BusWidth::Long => buf.read::<u32>(off).ok(),
        }
    }

    fn buffer_write_raw(&mut self, id: u8, addr: u32, width: BusWidth, val: u32) -> Option<()> {
        let buf = self.buffers[id as usize].as_mut()?;
        let off = buf.offset_of(addr)?;
        match width {
            BusWidth::Byte => buf.write(off, val as u8).ok(),
            BusWidth::Word => buf.write(off, val as u16).ok(),
            BusWidth::Long => buf.write(off, val).ok(),
        }
    }

    fn buffer_write(&mut self, id: u8, addr: u32, width: BusWidth, val: u32) -> Option<()> {
        if !self.buffers[id as usize].as_ref()?.writable() {
            return None;
        }
        self.buffer_write_raw(id, addr, width, val)
    }

    fn device_read(&mut self, id: u8, addr: u32, width: BusWidth) -> Option<u32> {
        let handle = self.devices[id as usize]?.handle;
        self.device_handler.as_mut()?.read(handle, addr, width)
    }

    fn device_write(&mut self, id: u8, addr: u32, width: BusWidth, val: u32) -> Option<()> {
        let handle = self.devices[id as usize]?.handle;
        self.device_handler.as_mut()?.write(handle, addr, width, val)
    }
}

/// The access engine: one decode path shared by all widths.
impl AddressSpace {
    fn bus_read(&mut self, addr: u32, width: BusWidth) -> u32 {
        let hit = match self.lookup(addr) {
            PageEntry::Unmapped => None,
            PageEntry::Mem(id) => self.buffer_read(id, addr, width),
            PageEntry::Dev(id) => self.device_read(id, addr, width),
        };
        match hit {
            Some(val) => {
                self.trace(TraceOp::Read, addr, width.bits(), val);
                val
            }
            None => self.invalid_read(addr, width),
        }
    }

    fn bus_write(&mut self, addr: u32, width: BusWidth, val: u32) {
        let val = val & width.mask();
        let hit = match self.lookup(addr) {
            PageEntry::Unmapped => None,
            PageEntry::Mem(id) => self.buffer_write(id, addr, width, val),
            PageEntry::Dev(id) => self.device_write(id, addr, width, val),
        };
        match hit {
            Some(()) => self.trace(TraceOp::Write, addr, width.bits(), val),
            None => self.invalid_write(addr, width, val),
        }
    }

    fn invalid_read(&mut self, addr: u32, width: BusWidth) -> u32 {
        warn!(target: "MEM", "bad read {addr:08x}/{}: {:?} page", width.bits(), self.lookup(addr));
        debug!(target: "MEM", "page table:\n{}", self.pagetable_summary());
        self.fault();
        let sentinel = FAULT_SENTINEL & width.mask();
        self.trace(TraceOp::InvalidRead, addr, width.bits(), sentinel);
        sentinel
    }

    fn invalid_write(&mut self, addr: u32, width: BusWidth, val: u32) {
        warn!(target: "MEM", "bad write {addr:08x}/{} <- {val:x}: {:?} page", width.bits(), self.lookup(addr));
        debug!(target: "MEM", "page table:\n{}", self.pagetable_summary());
        self.fault();
        self.trace(TraceOp::InvalidWrite, addr, width.bits(), val);
    }
}

/// The Musashi-facing data-access contract.
impl AddressSpace {
    pub fn read8(&mut self, addr: u32) -> u32 {
        self.bus_read(addr, BusWidth::Byte)
    }
    pub fn read16(&mut self, addr: u32) -> u32 {
        self.bus_read(addr, BusWidth::Word)
    }
    pub fn read32(&mut self, addr: u32) -> u32 {
        self.bus_read(addr, BusWidth::Long)
    }

    pub fn write8(&mut self, addr: u32, val: u32) {
        self.bus_write(addr, BusWidth::Byte, val)
    }
    pub fn write16(&mut self, addr: u32, val: u32) {
        self.bus_write(addr, BusWidth::Word, val)
    }
    pub fn write32(&mut self, addr: u32, val: u32) {
        self.bus_write(addr, BusWidth::Long, val)
    }

    /// Immediate (fetch-stream) reads are not reported to the trace sink.
    pub fn read_immediate16(&mut self, addr: u32) -> u32 {
        self.read_untraced(addr, BusWidth::Word)
    }
    pub fn read_immediate32(&mut self, addr: u32) -> u32 {
        self.read_untraced(addr, BusWidth::Long)
    }

    fn read_untraced(&mut self, addr: u32, width: BusWidth) -> u32 {
        let otrace = self.trace_enabled;
        self.trace_enabled = false;
        let val = self.bus_read(addr, width);
        self.trace_enabled = otrace;
        val
    }

    /// PC-relative reads behave exactly like plain data reads.
    pub fn read_pcrelative8(&mut self, addr: u32) -> u32 {
        self.read8(addr)
    }
    pub fn read_pcrelative16(&mut self, addr: u32) -> u32 {
        self.read16(addr)
    }
    pub fn read_pcrelative32(&mut self, addr: u32) -> u32 {
        self.read32(addr)
    }

    /// Disassembler reads: identical decode, but never trace and never
    /// raise a bus error, so the disassembler has no side effects on the
    /// simulated bus.
    pub fn read_dasm16(&self, addr: u32) -> u32 {
        self.read_memory(addr, BusWidth::Word)
    }
    pub fn read_dasm32(&self, addr: u32) -> u32 {
        self.read_memory(addr, BusWidth::Long)
    }
}

/// The embedding application's trace-free inspection and loading API.
impl AddressSpace {
    /// Direct read of a mapped memory page. Device pages and unmapped
    /// addresses return the fault sentinel with no side effects.
    pub fn read_memory(&self, addr: u32, width: BusWidth) -> u32 {
        let hit = match self.lookup(addr) {
            PageEntry::Mem(id) => self.buffer_read(id, addr, width),
            _ => None,
        };
        hit.unwrap_or_else(|| {
            debug!(target: "MEM", "unhandled direct read at {addr:08x}/{}", width.bits());
            FAULT_SENTINEL & width.mask()
        })
    }

    /// Direct write to a mapped memory page. This is the loader path: the
    /// buffer's writable flag is not consulted, so ROM contents can be
    /// installed. Misses are ignored.
    pub fn write_memory(&mut self, addr: u32, width: BusWidth, val: u32) {
        let val = val & width.mask();
        let done = match self.lookup(addr) {
            PageEntry::Mem(id) => self.buffer_write_raw(id, addr, width, val),
            _ => None,
        };
        if done.is_none() {
            debug!(target: "MEM", "ignored direct write at {addr:08x}/{} <- {val:x}", width.bits());
        }
    }

    /// Copy a contiguous span into mapped memory page by page, splitting
    /// across buffer edges. Copying stops at the first page that is not
    /// mapped memory; the number of bytes written is returned.
    pub fn write_bulk(&mut self, addr: u32, bytes: &[u8]) -> usize {
        let mut addr = addr as u64;
        let mut src = bytes;
        while !src.is_empty() && addr <= u32::MAX as u64 {
            let page_off = (addr as u32 % PAGE_SIZE) as usize;
            let chunk = src.len().min(PAGE_SIZE as usize - page_off);
            let id = match self.lookup(addr as u32) {
                PageEntry::Mem(id) => id,
                _ => break,
            };
            let Some(buf) = self.buffers[id as usize].as_mut() else {
                break;
            };
            let Some(off) = buf.offset_of(addr as u32) else {
                break;
            };
            if buf.write_buf(off, &src[..chunk]).is_err() {
                break;
            }
            addr += chunk as u64;
            src = &src[chunk..];
        }
        bytes.len() - src.len()
    }
}
