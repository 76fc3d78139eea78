//! Memory subsystem for a Musashi-based 68000-family emulator.
//!
//! The crate simulates a flat 32-bit physical address space: byte, word,
//! and longword accesses are decoded through a per-page table and routed
//! to RAM/ROM buffers, memory-mapped device windows, or bus-error fault
//! handling, with optional tracing of every access and instruction fetch.
//! The CPU core itself is an external collaborator driving the
//! [`bus::AddressSpace`] through its read/write methods.

/// Implementation of emulated memory buffers.
pub mod mem;

/// Implementation of the simulated address space and bus.
pub mod bus;
