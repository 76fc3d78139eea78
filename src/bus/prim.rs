
use std::mem;

/// Helper functions implemented on numeric primitives.
///
/// These let the buffer code move between numeric primitives and the
/// big-endian byte slices that back them.
pub trait AccessWidth: Sized + Copy {
    fn from_be_slice(data: &[u8]) -> Self;
    fn put_be_slice(self, dst: &mut [u8]);

    fn size_of() -> usize {
        mem::size_of::<Self>()
    }
}

/// Macro to make implementing AccessWidth a bit less verbose.
macro_rules! impl_accesswidth {
    ($type:ident) => {
        impl AccessWidth for $type {
            fn from_be_slice(data: &[u8]) -> Self {
                Self::from_be_bytes(data.try_into().unwrap())
            }
            fn put_be_slice(self, dst: &mut [u8]) {
                dst.copy_from_slice(&self.to_be_bytes())
            }
        }
    };
}

// Implement AccessWidth for the supported numeric primitives.
impl_accesswidth!(u32);
impl_accesswidth!(u16);
impl_accesswidth!(u8);

/// The width of an access on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    Byte,
    Word,
    Long,
}

impl BusWidth {
    /// Number of bytes transferred by an access of this width.
    pub fn bytes(self) -> usize {
        match self {
            BusWidth::Byte => 1,
            BusWidth::Word => 2,
            BusWidth::Long => 4,
        }
    }

    /// Width in bits, as reported in trace records.
    pub fn bits(self) -> u32 {
        (self.bytes() * 8) as u32
    }

    /// Mask covering the value bits of this width.
    pub fn mask(self) -> u32 {
        match self {
            BusWidth::Byte => 0x0000_00ff,
            BusWidth::Word => 0x0000_ffff,
            BusWidth::Long => 0xffff_ffff,
        }
    }
}

/// Per-page mapping state.
///
/// A page is `Dev` only while a device handler is registered, since
/// device windows cannot be added without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageEntry {
    /// No backing; accesses are invalid.
    #[default]
    Unmapped,
    /// Backed by the buffer-pool slot with this id.
    Mem(u8),
    /// Forwarded to the device range with this id.
    Dev(u8),
}

/// Operations reported to a [`TraceSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOp {
    Read,
    Write,
    InvalidRead,
    InvalidWrite,
    Map,
    Unmap,
    Move,
}

impl TraceOp {
    /// Single-character code used in log output.
    pub fn code(self) -> char {
        match self {
            TraceOp::Read => 'R',
            TraceOp::Write => 'W',
            TraceOp::InvalidRead => 'r',
            TraceOp::InvalidWrite => 'w',
            TraceOp::Map => 'M',
            TraceOp::Unmap => 'U',
            TraceOp::Move => 'o',
        }
    }
}

/// Flavor carried in the value field of a `Map` trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Rom = 0,
    Ram = 1,
    Device = 2,
}

/// Target of accesses routed through a device window.
///
/// The `handle` is the opaque value the window was registered with.
/// Returning `None` means the device does not claim the access, which
/// falls through to invalid-access handling.
pub trait DeviceHandler {
    fn read(&mut self, handle: u32, addr: u32, width: BusWidth) -> Option<u32>;
    fn write(&mut self, handle: u32, addr: u32, width: BusWidth, val: u32) -> Option<()>;
}

/// Sink for memory-access and mapping trace records.
///
/// For accesses, `size` is the width in bits (8/16/32); for mapping
/// records it is the byte size of the affected range.
pub trait TraceSink {
    fn trace(&mut self, op: TraceOp, addr: u32, size: u32, val: u32);
}

/// Sink notified once per fetched instruction with its program counter.
pub trait InstrSink {
    fn instr_fetched(&mut self, pc: u32);
}

/// Fault signals delivered back to the CPU core.
///
/// Both signals are cooperative: the memory subsystem still returns
/// normally from the faulting access.
pub trait CpuSink {
    /// Simulate assertion of the bus-error line.
    fn pulse_bus_error(&mut self);
    /// Abort the remainder of the current execution timeslice.
    fn end_timeslice(&mut self);
}
