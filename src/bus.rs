pub mod dispatch;
pub mod prim;

use log::debug;
use thiserror::Error;

use crate::bus::prim::*;
use crate::mem::MemBuffer;

/// Size of one page of the simulated address space.
pub const PAGE_SIZE: u32 = 0x1000;
/// Number of pages covering the full 32-bit address space.
pub const NUM_PAGES: usize = ((1u64 << 32) / PAGE_SIZE as u64) as usize;
/// Number of concurrently live memory buffers.
pub const NUM_BUFFER_SLOTS: usize = 64;
/// Number of concurrently live device ranges.
pub const NUM_DEVICE_SLOTS: usize = 8;

const PAGE_MASK: u32 = PAGE_SIZE - 1;

fn page_index(addr: u32) -> usize {
    (addr / PAGE_SIZE) as usize
}

fn page_round_down(addr: u32) -> u32 {
    addr & !PAGE_MASK
}

fn page_round_up(addr: u64) -> u64 {
    (addr + PAGE_MASK as u64) & !(PAGE_MASK as u64)
}

/// Failures reported by the mapping operations.
///
/// Mapping operations never partially mutate state: on `Err` the page
/// table, buffer pool, and device registry are unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("base or size is not page-aligned")]
    Misaligned,
    #[error("range is empty or extends past the top of the address space")]
    BadRange,
    #[error("address range overlaps an existing mapping")]
    RangeInUse,
    #[error("all buffer slots are in use")]
    PoolExhausted,
    #[error("all device slots are in use")]
    DevicePoolExhausted,
    #[error("no mapped range starts at the given base")]
    UnknownRange,
    #[error("no device handler is registered")]
    NoDeviceHandler,
    #[error("initial contents do not fit in the region")]
    InitTooLarge,
}

/// An address window whose accesses are forwarded to the device handler.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRange {
    pub base: u32,
    pub size: u32,
    /// Opaque value handed back to the device handler on every access.
    pub handle: u32,
}

/// A simulated 32-bit physical address space.
///
/// In this model, the address space owns all backing storage and routes
/// every access through a per-page table to a memory buffer, a device
/// window, or invalid-access handling. It is built to be owned by a
/// single CPU-simulation thread; there is no internal locking.
pub struct AddressSpace {
    pages: Vec<PageEntry>,
    pub(crate) buffers: Vec<Option<MemBuffer>>,
    pub(crate) devices: Vec<Option<DeviceRange>>,

    pub(crate) device_handler: Option<Box<dyn DeviceHandler>>,
    trace_sink: Option<Box<dyn TraceSink>>,
    instr_sink: Option<Box<dyn InstrSink>>,
    cpu_sink: Option<Box<dyn CpuSink>>,

    pub(crate) trace_enabled: bool,
    instr_trace_enabled: bool,
    bus_error_enabled: bool,
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace {
            pages: vec![PageEntry::Unmapped; NUM_PAGES],
            buffers: (0..NUM_BUFFER_SLOTS).map(|_| None).collect(),
            devices: vec![None; NUM_DEVICE_SLOTS],
            device_handler: None,
            trace_sink: None,
            instr_sink: None,
            cpu_sink: None,
            trace_enabled: false,
            instr_trace_enabled: false,
            bus_error_enabled: false,
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook registration and gating.
impl AddressSpace {
    /// Register the handler that services device windows, replacing any
    /// previous one. Unregistered is the explicit `None` state, in which
    /// device windows cannot be added.
    pub fn set_device_handler(&mut self, handler: Box<dyn DeviceHandler>) {
        self.device_handler = Some(handler);
    }

    pub fn set_trace_handler(&mut self, sink: Box<dyn TraceSink>) {
        self.trace_sink = Some(sink);
    }

    pub fn set_instr_handler(&mut self, sink: Box<dyn InstrSink>) {
        self.instr_sink = Some(sink);
    }

    /// Register the CPU core's fault callbacks.
    pub fn set_cpu_handler(&mut self, sink: Box<dyn CpuSink>) {
        self.cpu_sink = Some(sink);
    }

    /// Enable memory-access tracing. A no-op unless a trace handler is
    /// registered.
    pub fn enable_tracing(&mut self, enable: bool) {
        self.trace_enabled = enable && self.trace_sink.is_some();
    }

    /// Enable per-instruction fetch notification. A no-op unless an
    /// instruction handler is registered.
    pub fn enable_instr_tracing(&mut self, enable: bool) {
        self.instr_trace_enabled = enable && self.instr_sink.is_some();
    }

    /// Gate escalation of invalid accesses to the CPU fault callbacks.
    /// When disabled, faults still return the sentinel value but the CPU
    /// core is not signalled.
    pub fn enable_bus_error(&mut self, enable: bool) {
        self.bus_error_enabled = enable;
    }

    pub(crate) fn trace(&mut self, op: TraceOp, addr: u32, size: u32, val: u32) {
        if self.trace_enabled {
            if let Some(sink) = self.trace_sink.as_mut() {
                sink.trace(op, addr, size, val);
            }
        }
    }

    pub(crate) fn fault(&mut self) {
        if self.bus_error_enabled {
            if let Some(cpu) = self.cpu_sink.as_mut() {
                cpu.pulse_bus_error();
                cpu.end_timeslice();
            }
        }
    }

    /// Notify the instruction sink of a fetched program counter.
    pub fn instr_fetch(&mut self, pc: u32) {
        if self.instr_trace_enabled {
            if let Some(sink) = self.instr_sink.as_mut() {
                sink.instr_fetched(pc);
            }
        }
    }
}

/// Page-table primitives.
impl AddressSpace {
    /// O(1) lookup of the entry covering `addr`.
    pub fn lookup(&self, addr: u32) -> PageEntry {
        self.pages[page_index(addr)]
    }

    fn page_run(base: u32, size: u32) -> std::ops::Range<usize> {
        let limit = ((base as u64 + size as u64) / PAGE_SIZE as u64) as usize;
        page_index(base)..limit
    }

    fn range_is_free(&self, base: u32, size: u32) -> bool {
        Self::page_run(base, size).all(|p| self.pages[p] == PageEntry::Unmapped)
    }

    /// Device windows may cover unmapped pages and, permissively, pages
    /// already flagged device. They may never share a page with memory.
    fn range_can_be_device(&self, base: u32, size: u32) -> bool {
        Self::page_run(base, size).all(|p| !matches!(self.pages[p], PageEntry::Mem(_)))
    }

    fn set_range(&mut self, base: u32, size: u32, entry: PageEntry) {
        for p in Self::page_run(base, size) {
            self.pages[p] = entry;
        }
    }

    /// Compact rendering of the page table: one character per page in
    /// rows of 64, runs of unmapped rows elided.
    pub fn pagetable_summary(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let mut dots = false;
        for row in (0..NUM_PAGES).step_by(64) {
            let cells = &self.pages[row..row + 64];
            if cells.iter().all(|p| *p == PageEntry::Unmapped) {
                if !dots {
                    out.push_str("  ...\n");
                    dots = true;
                }
                continue;
            }
            dots = false;
            let _ = write!(out, "{:08x}:", row as u64 * PAGE_SIZE as u64);
            for (i, pte) in cells.iter().enumerate() {
                if i % 8 == 0 {
                    out.push(' ');
                }
                out.push(match pte {
                    PageEntry::Unmapped => '.',
                    PageEntry::Mem(id) => (b'A' + id % 26) as char,
                    PageEntry::Dev(_) => '*',
                });
            }
            out.push('\n');
        }
        out
    }
}

/// Mapping operations.
impl AddressSpace {
    /// Map a RAM (writable) or ROM region backed by a newly allocated,
    /// zero-filled buffer, optionally seeded with `initial` contents.
    pub fn add_memory(
        &mut self,
        base: u32,
        size: u32,
        writable: bool,
        initial: Option<&[u8]>,
    ) -> Result<(), MapError> {
        if base % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        if size == 0 || base as u64 + size as u64 > 1 << 32 {
            return Err(MapError::BadRange);
        }
        if !self.range_is_free(base, size) {
            return Err(MapError::RangeInUse);
        }
        let slot = self
            .buffers
            .iter()
            .position(|b| b.is_none())
            .ok_or(MapError::PoolExhausted)?;

        let mut buf = MemBuffer::new(base, size as usize, writable);
        if let Some(src) = initial {
            buf.write_buf(0, src).map_err(|_| MapError::InitTooLarge)?;
        }
        self.buffers[slot] = Some(buf);
        self.set_range(base, size, PageEntry::Mem(slot as u8));

        let kind = if writable { MapKind::Ram } else { MapKind::Rom };
        debug!(target: "MEM", "mapped {:?} {size:#x} bytes at {base:08x} (slot {slot})", kind);
        self.trace(TraceOp::Map, base, size, kind as u32);
        Ok(())
    }

    /// Release the buffer whose mapping starts exactly at `base`. Interior
    /// addresses of a mapped range are rejected.
    pub fn remove_memory(&mut self, base: u32) -> Result<(), MapError> {
        let slot = match self.lookup(base) {
            PageEntry::Mem(id) => id as usize,
            _ => return Err(MapError::UnknownRange),
        };
        let size = match self.buffers[slot].as_ref() {
            Some(b) if b.base() == base => b.len() as u32,
            _ => return Err(MapError::UnknownRange),
        };
        self.set_range(base, size, PageEntry::Unmapped);
        self.buffers[slot] = None;

        debug!(target: "MEM", "unmapped {size:#x} bytes at {base:08x} (slot {slot})");
        self.trace(TraceOp::Unmap, base, size, 0);
        Ok(())
    }

    /// Move the buffer mapped at `src` so it starts at `dst`. The
    /// destination range must be entirely free; storage identity and
    /// contents are preserved.
    pub fn move_memory(&mut self, src: u32, dst: u32) -> Result<(), MapError> {
        if dst % PAGE_SIZE != 0 {
            return Err(MapError::Misaligned);
        }
        let slot = match self.lookup(src) {
            PageEntry::Mem(id) => id as usize,
            _ => return Err(MapError::UnknownRange),
        };
        let size = match self.buffers[slot].as_ref() {
            Some(b) if b.base() == src => b.len() as u32,
            _ => return Err(MapError::UnknownRange),
        };
        if dst as u64 + size as u64 > 1 << 32 {
            return Err(MapError::BadRange);
        }
        // Checked before unmapping, so a move onto itself fails cleanly.
        if !self.range_is_free(dst, size) {
            return Err(MapError::RangeInUse);
        }
        self.set_range(src, size, PageEntry::Unmapped);
        if let Some(b) = self.buffers[slot].as_mut() {
            b.set_base(dst);
        }
        self.set_range(dst, size, PageEntry::Mem(slot as u8));

        debug!(target: "MEM", "moved {size:#x} bytes from {src:08x} to {dst:08x}");
        self.trace(TraceOp::Move, src, size, dst);
        Ok(())
    }

    /// Map a device window carrying an opaque `handle`. `base` and `size`
    /// are rounded out to page boundaries.
    pub fn add_device(&mut self, base: u32, size: u32, handle: u32) -> Result<(), MapError> {
        if self.device_handler.is_none() {
            return Err(MapError::NoDeviceHandler);
        }
        if size == 0 || base as u64 + size as u64 > 1 << 32 {
            return Err(MapError::BadRange);
        }
        let aligned_base = page_round_down(base);
        let span = page_round_up(base as u64 + size as u64) - aligned_base as u64;
        // A single window cannot describe the entire address space.
        if span > u32::MAX as u64 {
            return Err(MapError::BadRange);
        }
        let aligned_size = span as u32;

        if !self.range_can_be_device(aligned_base, aligned_size) {
            return Err(MapError::RangeInUse);
        }
        let slot = self
            .devices
            .iter()
            .position(|d| d.is_none())
            .ok_or(MapError::DevicePoolExhausted)?;

        self.devices[slot] = Some(DeviceRange { base: aligned_base, size: aligned_size, handle });
        self.set_range(aligned_base, aligned_size, PageEntry::Dev(slot as u8));

        debug!(target: "MEM", "mapped device {handle:#x}: {aligned_size:#x} bytes at {aligned_base:08x}");
        self.trace(TraceOp::Map, aligned_base, aligned_size, MapKind::Device as u32);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::testing::*;
    use super::*;

    #[test]
    fn add_memory_rejects_misaligned_ranges() {
        let mut mem = AddressSpace::new();
        assert_eq!(mem.add_memory(0x100, 0x1000, true, None), Err(MapError::Misaligned));
        assert_eq!(mem.add_memory(0, 0x800, true, None), Err(MapError::Misaligned));
        assert_eq!(mem.add_memory(0, 0, true, None), Err(MapError::BadRange));
        assert!(mem.add_memory(0, 0x1000, true, None).is_ok());
    }

    #[test]
    fn add_memory_rejects_overlap() {
        let mut mem = AddressSpace::new();
        mem.add_memory(0, 0x1000, true, None).unwrap();
        assert_eq!(mem.add_memory(0x800, 0x1000, true, None), Err(MapError::Misaligned));
        assert_eq!(mem.add_memory(0, 0x2000, true, None), Err(MapError::RangeInUse));
        // Page table untouched by the failures.
        assert_eq!(mem.lookup(0), PageEntry::Mem(0));
        assert_eq!(mem.lookup(0x1000), PageEntry::Unmapped);
    }

    #[test]
    fn add_memory_seeds_initial_contents() {
        let mut mem = AddressSpace::new();
        mem.add_memory(0x2000, 0x1000, false, Some(&[0xde, 0xad])).unwrap();
        assert_eq!(mem.read_memory(0x2000, BusWidth::Word), 0xdead);
        assert_eq!(mem.read_memory(0x2002, BusWidth::Byte), 0);
    }

    #[test]
    fn add_memory_rejects_oversized_initial_contents() {
        let mut mem = AddressSpace::new();
        let too_big = vec![0u8; 0x1001];
        assert_eq!(
            mem.add_memory(0, 0x1000, true, Some(&too_big)),
            Err(MapError::InitTooLarge)
        );
        assert_eq!(mem.lookup(0), PageEntry::Unmapped);
    }

    #[test]
    fn pool_exhaustion_and_slot_reuse() {
        let mut mem = AddressSpace::new();
        for i in 0..NUM_BUFFER_SLOTS as u32 {
            mem.add_memory(i * 0x1000, 0x1000, true, None).unwrap();
        }
        let next = NUM_BUFFER_SLOTS as u32 * 0x1000;
        assert_eq!(mem.add_memory(next, 0x1000, true, None), Err(MapError::PoolExhausted));

        mem.remove_memory(0x3000).unwrap();
        assert!(mem.add_memory(next, 0x1000, true, None).is_ok());
        assert_eq!(mem.lookup(next), PageEntry::Mem(3));
    }

    #[test]
    fn remove_memory_requires_exact_base() {
        let mut mem = AddressSpace::new();
        mem.add_memory(0x4000, 0x2000, true, None).unwrap();
        assert_eq!(mem.remove_memory(0x5000), Err(MapError::UnknownRange));
        assert_eq!(mem.remove_memory(0x8000), Err(MapError::UnknownRange));
        assert!(mem.remove_memory(0x4000).is_ok());
        assert_eq!(mem.lookup(0x4000), PageEntry::Unmapped);
        assert_eq!(mem.lookup(0x5000), PageEntry::Unmapped);
    }

    #[test]
    fn move_memory_preserves_contents() {
        let mut mem = AddressSpace::new();
        mem.add_memory(0, 0x1000, true, None).unwrap();
        mem.write_memory(4, BusWidth::Byte, 0x5a);

        mem.move_memory(0, 0x3000).unwrap();
        assert_eq!(mem.read_memory(0x3004, BusWidth::Byte), 0x5a);
        assert_eq!(mem.lookup(0), PageEntry::Unmapped);
        assert_eq!(mem.lookup(0x3000), PageEntry::Mem(0));
    }

    #[test]
    fn move_memory_rejects_occupied_destination() {
        let mut mem = AddressSpace::new();
        mem.add_memory(0, 0x2000, true, None).unwrap();
        mem.add_memory(0x4000, 0x1000, true, None).unwrap();
        assert_eq!(mem.move_memory(0, 0x4000), Err(MapError::RangeInUse));
        // A move onto itself is also an occupied destination.
        assert_eq!(mem.move_memory(0, 0x1000), Err(MapError::RangeInUse));
        assert_eq!(mem.lookup(0), PageEntry::Mem(0));
    }

    #[test]
    fn add_device_requires_handler() {
        let mut mem = AddressSpace::new();
        assert_eq!(mem.add_device(0x2000, 0x1000, 0), Err(MapError::NoDeviceHandler));

        mem.set_device_handler(Box::new(FixedDevice::new(0)));
        assert!(mem.add_device(0x2000, 0x1000, 0).is_ok());
        assert_eq!(mem.lookup(0x2000), PageEntry::Dev(0));
    }

    #[test]
    fn add_device_rounds_to_page_boundaries() {
        let mut mem = AddressSpace::new();
        mem.set_device_handler(Box::new(FixedDevice::new(0)));
        mem.add_device(0x2100, 0x80, 9).unwrap();
        assert_eq!(mem.lookup(0x2000), PageEntry::Dev(0));
        assert_eq!(mem.lookup(0x2fff), PageEntry::Dev(0));
        assert_eq!(mem.lookup(0x3000), PageEntry::Unmapped);
        assert_eq!(mem.devices[0].unwrap().size, 0x1000);
    }

    #[test]
    fn device_may_not_share_a_page_with_memory() {
        let mut mem = AddressSpace::new();
        mem.set_device_handler(Box::new(FixedDevice::new(0)));
        mem.add_memory(0x1000, 0x1000, true, None).unwrap();
        assert_eq!(mem.add_device(0x1800, 0x1000, 0), Err(MapError::RangeInUse));
        assert_eq!(mem.lookup(0x1000), PageEntry::Mem(0));
        assert_eq!(mem.lookup(0x2000), PageEntry::Unmapped);
    }

    #[test]
    fn mapping_operations_are_traced() {
        let mut mem = AddressSpace::new();
        let log = TraceLog::default();
        let records = Rc::clone(&log.0);
        mem.set_trace_handler(Box::new(log));
        mem.enable_tracing(true);

        mem.add_memory(0, 0x1000, true, None).unwrap();
        mem.add_memory(0x1000, 0x1000, false, None).unwrap();
        mem.move_memory(0x1000, 0x3000).unwrap();
        mem.remove_memory(0).unwrap();

        let records = records.borrow();
        assert_eq!(records[0], (TraceOp::Map, 0, 0x1000, MapKind::Ram as u32));
        assert_eq!(records[1], (TraceOp::Map, 0x1000, 0x1000, MapKind::Rom as u32));
        assert_eq!(records[2], (TraceOp::Move, 0x1000, 0x1000, 0x3000));
        assert_eq!(records[3], (TraceOp::Unmap, 0, 0x1000, 0));
    }

    #[test]
    fn enabling_tracing_without_handler_is_a_noop() {
        let mut mem = AddressSpace::new();
        mem.enable_tracing(true);
        assert!(!mem.trace_enabled);
        // Safe to run traced operations with no sink.
        mem.add_memory(0, 0x1000, true, None).unwrap();
    }

    #[test]
    fn pagetable_summary_marks_mappings() {
        let mut mem = AddressSpace::new();
        mem.set_device_handler(Box::new(FixedDevice::new(0)));
        mem.add_memory(0, 0x1000, true, None).unwrap();
        mem.add_device(0x2000, 0x1000, 0).unwrap();

        let summary = mem.pagetable_summary();
        let row = summary.lines().find(|l| l.starts_with("00000000:")).unwrap();
        assert!(row.contains('A'));
        assert!(row.contains('*'));
    }

    #[test]
    fn ranges_past_the_top_of_address_space_are_rejected() {
        let mut mem = AddressSpace::new();
        assert_eq!(
            mem.add_memory(0xffff_f000, 0x2000, true, None),
            Err(MapError::BadRange)
        );
        assert_eq!(mem.lookup(0xffff_f000), PageEntry::Unmapped);

        mem.add_memory(0, 0x2000, true, None).unwrap();
        assert_eq!(mem.move_memory(0, 0xffff_f000), Err(MapError::BadRange));
        assert_eq!(mem.lookup(0), PageEntry::Mem(0));
        assert_eq!(mem.lookup(0xffff_f000), PageEntry::Unmapped);

        mem.set_device_handler(Box::new(FixedDevice::new(0)));
        assert_eq!(mem.add_device(0xffff_fff0, 0x20, 0), Err(MapError::BadRange));
        assert_eq!(mem.lookup(0xffff_f000), PageEntry::Unmapped);
        assert!(mem.devices.iter().all(|d| d.is_none()));
    }

    #[test]
    fn whole_space_device_window_is_rejected() {
        let mut mem = AddressSpace::new();
        mem.set_device_handler(Box::new(FixedDevice::new(0)));
        assert_eq!(mem.add_device(0, 0xffff_ffff, 1), Err(MapError::BadRange));
        assert!(mem.devices.iter().all(|d| d.is_none()));
        // A window ending exactly at the top is fine.
        assert!(mem.add_device(0xffff_f000, 0x1000, 1).is_ok());
        assert_eq!(mem.lookup(0xffff_ffff), PageEntry::Dev(0));
    }

    #[test]
    fn top_of_address_space_is_mappable() {
        let mut mem = AddressSpace::new();
        mem.add_memory(0xffff_f000, 0x1000, true, None).unwrap();
        assert_eq!(mem.lookup(0xffff_ffff), PageEntry::Mem(0));
        mem.write_memory(0xffff_fffc, BusWidth::Long, 0xcafe_babe);
        assert_eq!(mem.read_memory(0xffff_fffc, BusWidth::Long), 0xcafe_babe);
    }
}
