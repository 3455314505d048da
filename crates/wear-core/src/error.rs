use std::path::PathBuf;

use wear_mem::{MemoryError, MemoryFault};

use crate::EmuState;

/// Why a loader could not place a program in guest memory.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("program image is empty")]
    EmptyImage,
    #[error("image of {len} bytes does not fit in guest memory at {addr:#x}")]
    DoesNotFit { addr: u64, len: u64 },
    #[error(transparent)]
    Memory(#[from] MemoryFault),
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("failed to set up guest memory: {0}")]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Fault(#[from] MemoryFault),
    #[error("failed to load program: {0}")]
    Load(#[from] LoadError),
    #[error("invalid emulator configuration: {0}")]
    Config(#[source] serde_json::Error),
    #[error("failed to read configuration {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stack reserve {reserve:#x} is larger than the stack top")]
    StackReserve { reserve: u64 },
    #[error("emulator is not initialized")]
    NotInitialized,
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: EmuState,
    },
    #[error("panic during {during}: {message}")]
    Panicked {
        during: &'static str,
        message: String,
    },
}
