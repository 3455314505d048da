//! GNM driver syscalls: command-buffer submission and the frame/clock queries around it.

use std::sync::Arc;

use wear_hle::kernel::EFAULT;
use wear_hle::numbers::{
    SCE_GNM_GET_GPU_CORE_CLOCK_FREQUENCY, SCE_GNM_SUBMIT_COMMAND_BUFFERS, SCE_GNM_SUBMIT_DONE,
};
use wear_hle::{HleModule, SyscallArgs, SyscallDispatcher, SyscallResult};
use wear_mem::GuestMemory;

use crate::decoder::{DecoderStats, Pm4Decoder};
use crate::queue::RenderQueue;

pub const GPU_CORE_CLOCK_MHZ: i64 = 911;

/// Owns a [`Pm4Decoder`]; once installed the decoder lives inside the submission handler, so
/// keep [`GnmModule::stats`] and [`GnmModule::queue`] handles beforehand if you need them.
pub struct GnmModule {
    decoder: Pm4Decoder,
}

impl GnmModule {
    pub fn new(decoder: Pm4Decoder) -> Self {
        Self { decoder }
    }

    pub fn stats(&self) -> Arc<DecoderStats> {
        self.decoder.stats()
    }

    pub fn queue(&self) -> Arc<RenderQueue> {
        Arc::clone(self.decoder.queue())
    }
}

impl HleModule for GnmModule {
    const NAME: &'static str = "libgnm";

    fn register(self, d: &mut SyscallDispatcher) {
        let queue = Arc::clone(self.decoder.queue());
        let mut decoder = self.decoder;

        // (count, buffer address array, byte size array)
        d.register(
            SCE_GNM_SUBMIT_COMMAND_BUFFERS,
            move |_ctx, mem: &mut GuestMemory, args: &SyscallArgs| {
                match decoder.submit(mem, args.get(0) as u32, args.get(1), args.get(2)) {
                    Ok(()) => SyscallResult::ok(0),
                    Err(fault) => SyscallResult::err(EFAULT, fault.to_string()),
                }
            },
        );

        d.register(SCE_GNM_SUBMIT_DONE, move |_ctx, _mem, _args: &SyscallArgs| {
            queue.end_frame();
            SyscallResult::ok(0)
        });

        d.register(
            SCE_GNM_GET_GPU_CORE_CLOCK_FREQUENCY,
            |_ctx, _mem, _args: &SyscallArgs| SyscallResult::ok(GPU_CORE_CLOCK_MHZ),
        );
    }
}
