//! Lifecycle controller for the console core.
//!
//! [`Emulator`] allocates guest memory, wires the CPU's `SYSCALL` trap to the HLE dispatcher
//! (kernel, audio, pad and GNM modules), loads a program through a [`ProgramLoader`] and runs it on
//! a dedicated execution thread. Render commands produced by the GPU decoder are drained from
//! [`Emulator::render_queue`] by whoever presents them.

#![forbid(unsafe_code)]

pub mod bios;
mod config;
mod emulator;
mod error;
pub mod loader;

pub use bios::InternalBios;
pub use config::{EmulatorConfig, DEFAULT_STACK_RESERVE, DEFAULT_STEPS_PER_TICK};
pub use emulator::{EmuState, Emulator, EmulatorStats, StateCallback};
pub use error::{CoreError, LoadError};
pub use loader::{FlatBinaryLoader, LoadedImage, ProgramLoader, RawImageLoader};
