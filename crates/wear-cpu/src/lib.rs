//! x86-64 subset interpreter.
//!
//! [`Cpu::step`] fetches one instruction (an optional REP and REX prefix, then the opcode),
//! dispatches it through a 256-entry handler table and returns the cycles consumed. Unknown
//! opcodes are logged and skipped as one-cycle no-ops. `SYSCALL` calls the injected
//! [`SyscallHandler`]; the CPU itself knows nothing about the guest OS.

#![forbid(unsafe_code)]

pub mod cpu;
pub mod interpreter;

pub use cpu::{CpuContext, RFlags, Reg, SegmentRegs, MXCSR_RESET, RFLAGS_RESET};
pub use interpreter::{
    Cpu, CpuControl, CpuFault, CpuState, SyscallHandler, DEFAULT_PAUSE_POLL,
};
