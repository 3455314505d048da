//! Unified guest memory for the console core.
//!
//! The whole guest address space is backed by a single contiguous host buffer. Guest virtual
//! addresses are folded into that buffer by [`GuestMemory::translate_address`]; there is no page
//! table. Every access is bounds-checked against the buffer and reports a [`MemoryFault`] instead
//! of touching host memory outside it.

#![forbid(unsafe_code)]

mod guest_memory;
pub mod regions;

pub use guest_memory::{GuestMemory, MemoryConfig, MemoryError, MemoryFault};

pub type MemoryResult<T> = Result<T, MemoryFault>;
