//! Named regions of the guest address space.
//!
//! These are conventions used by loaders and initial register setup. Address translation does not
//! consult them.

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

pub const PAGE_SIZE: u64 = 4 * KIB;

/// Size of the unified memory on real hardware.
pub const CONSOLE_MEMORY_SIZE: u64 = 8 * GIB;

/// Buffer size used when nothing else is configured.
pub const DEFAULT_MEMORY_SIZE: u64 = 512 * MIB;

pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;
pub const USER_BASE: u64 = 0x0000_0000_0040_0000;
pub const HEAP_BASE: u64 = 0x0000_0002_0000_0000;
pub const STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;
pub const STACK_SIZE: u64 = 8 * MIB;
pub const VRAM_BASE: u64 = 0x0000_0008_0000_0000;
pub const VRAM_SIZE: u64 = 8 * GIB;
pub const SHARED_BASE: u64 = 0x0000_0010_0000_0000;

/// Rounds `value` up to the next page boundary.
pub const fn page_align_up(value: u64) -> u64 {
    value.saturating_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
