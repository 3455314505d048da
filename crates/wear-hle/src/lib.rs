//! High-level emulation of the console's system calls.
//!
//! Guest code traps with `SYSCALL`; the [`SyscallDispatcher`] reads the number from RAX and the
//! arguments from [`ARG_REGS`], runs the registered handler and writes its result back to RAX.
//! Handlers are grouped into [`HleModule`]s that install themselves into a dispatcher.

#![forbid(unsafe_code)]

pub mod audio;
mod dispatcher;
pub mod kernel;
pub mod numbers;
pub mod pad;

pub use audio::{AudioBackend, AudioModule, NullAudio};
pub use dispatcher::{
    HleFunction, HleModule, SyscallArgs, SyscallDispatcher, SyscallResult, SyscallStats, ARG_REGS,
};
pub use kernel::KernelModule;
pub use numbers::syscall_name;
pub use pad::{NullPad, PadBackend, PadButtons, PadModule, PadState};

/// Dispatcher with the kernel, audio and pad modules installed on null host backends.
pub fn default_dispatcher() -> SyscallDispatcher {
    let mut dispatcher = SyscallDispatcher::new();
    dispatcher.install(KernelModule::default());
    dispatcher.install(AudioModule::default());
    dispatcher.install(PadModule::default());
    dispatcher
}
