//! GPU front end: PM4 command-buffer decoding and the render command queue.

#![forbid(unsafe_code)]

mod command;
mod decoder;
mod gnm;
pub mod pm4;
mod queue;
pub mod state;

pub use command::RenderCommand;
pub use decoder::{
    DecodeError, DecoderConfig, DecoderStats, DecoderStatsSnapshot, Pm4Decoder,
    DEFAULT_MAX_INDIRECT_DEPTH,
};
pub use gnm::{GnmModule, GPU_CORE_CLOCK_MHZ};
pub use queue::RenderQueue;
pub use state::GpuState;
