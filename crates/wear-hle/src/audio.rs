//! `sceAudioOut*` syscalls, forwarded to a host [`AudioBackend`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use wear_mem::GuestMemory;

use crate::dispatcher::{HleModule, SyscallArgs, SyscallDispatcher, SyscallResult};
use crate::kernel::EFAULT;
use crate::numbers::*;

pub const CHANNELS: usize = 2;
pub const BYTES_PER_SAMPLE: usize = 2;
pub const FRAME_SIZE: usize = CHANNELS * BYTES_PER_SAMPLE;
/// Samples per output call when the backend does not know the port.
pub const DEFAULT_SAMPLE_COUNT: u32 = 256;
/// Guest volume scale: 32767 is unity gain.
pub const VOLUME_UNITY: i32 = 32767;

pub const ERROR_INVALID_PORT: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortParams {
    pub port_type: i32,
    pub index: i32,
    pub sample_count: u32,
    pub frequency: u32,
    pub format: u32,
}

/// Host audio output. Status-returning methods use 0 for success and a negative code otherwise.
pub trait AudioBackend: Send {
    fn init(&mut self) -> bool;
    /// Returns a non-negative port handle or a negative error.
    fn open_port(&mut self, params: PortParams) -> i32;
    fn close_port(&mut self, handle: i32) -> i32;
    fn sample_count(&self, handle: i32) -> Option<u32>;
    /// Consumes one buffer of interleaved 16-bit stereo PCM.
    fn output(&mut self, handle: i32, pcm: &[u8]) -> i32;
    fn set_volume(&mut self, handle: i32, volume: f32) -> i32;
}

/// Backend that accepts and discards everything, tracking just enough to answer queries.
#[derive(Debug, Default)]
pub struct NullAudio {
    initialized: bool,
    ports: FxHashMap<i32, PortParams>,
    volumes: FxHashMap<i32, f32>,
    next_handle: i32,
    bytes_output: u64,
}

impl NullAudio {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn open_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn bytes_output(&self) -> u64 {
        self.bytes_output
    }

    pub fn volume(&self, handle: i32) -> Option<f32> {
        self.volumes.get(&handle).copied()
    }
}

impl AudioBackend for NullAudio {
    fn init(&mut self) -> bool {
        self.initialized = true;
        true
    }

    fn open_port(&mut self, params: PortParams) -> i32 {
        self.next_handle += 1;
        self.ports.insert(self.next_handle, params);
        self.volumes.insert(self.next_handle, 1.0);
        self.next_handle
    }

    fn close_port(&mut self, handle: i32) -> i32 {
        self.volumes.remove(&handle);
        match self.ports.remove(&handle) {
            Some(_) => 0,
            None => ERROR_INVALID_PORT,
        }
    }

    fn sample_count(&self, handle: i32) -> Option<u32> {
        self.ports.get(&handle).map(|p| p.sample_count)
    }

    fn output(&mut self, handle: i32, pcm: &[u8]) -> i32 {
        if !self.ports.contains_key(&handle) {
            return ERROR_INVALID_PORT;
        }
        self.bytes_output += pcm.len() as u64;
        0
    }

    fn set_volume(&mut self, handle: i32, volume: f32) -> i32 {
        match self.volumes.get_mut(&handle) {
            Some(v) => {
                *v = volume;
                0
            }
            None => ERROR_INVALID_PORT,
        }
    }
}

fn lock<B>(backend: &Mutex<B>) -> MutexGuard<'_, B> {
    backend.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AudioModule<B> {
    backend: Arc<Mutex<B>>,
}

impl<B: AudioBackend + 'static> AudioModule<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    /// Shared handle to the backend, for the host side.
    pub fn backend(&self) -> Arc<Mutex<B>> {
        Arc::clone(&self.backend)
    }
}

impl Default for AudioModule<NullAudio> {
    fn default() -> Self {
        Self::new(NullAudio::default())
    }
}

fn output_buffer<B: AudioBackend>(
    backend: &Mutex<B>,
    mem: &GuestMemory,
    args: &SyscallArgs,
) -> SyscallResult {
    let (handle, ptr) = (args.get(0) as i32, args.get(1));
    if ptr == 0 {
        return SyscallResult::err(-1, "null PCM pointer");
    }
    let mut backend = lock(backend);
    let samples = backend
        .sample_count(handle)
        .unwrap_or(DEFAULT_SAMPLE_COUNT) as usize;
    let pcm = match mem.physical_slice(ptr, samples * FRAME_SIZE) {
        Ok(pcm) => pcm,
        Err(fault) => return SyscallResult::err(-1, fault.to_string()),
    };
    SyscallResult::status(i64::from(backend.output(handle, pcm)))
}

impl<B: AudioBackend + 'static> HleModule for AudioModule<B> {
    const NAME: &'static str = "libaudio";

    fn register(self, d: &mut SyscallDispatcher) {
        let backend = self.backend;

        let b = Arc::clone(&backend);
        d.register(SCE_AUDIO_OUT_INIT, move |_ctx, _mem, _args: &SyscallArgs| {
            let ok = lock(&b).init();
            tracing::debug!(ok, "sceAudioOutInit");
            if ok {
                SyscallResult::ok(0)
            } else {
                SyscallResult::err(-1, "audio backend failed to initialise")
            }
        });

        let b = Arc::clone(&backend);
        d.register(SCE_AUDIO_OUT_OPEN, move |_ctx, _mem, args: &SyscallArgs| {
            let params = PortParams {
                port_type: args.get(1) as i32,
                index: args.get(2) as i32,
                sample_count: args.get(3) as u32,
                frequency: args.get(4) as u32,
                format: args.get(5) as u32,
            };
            let handle = lock(&b).open_port(params);
            tracing::debug!(?params, handle, "sceAudioOutOpen");
            SyscallResult {
                value: i64::from(handle),
                success: handle >= 0,
                error: None,
            }
        });

        let b = Arc::clone(&backend);
        d.register(SCE_AUDIO_OUT_CLOSE, move |_ctx, _mem, args: &SyscallArgs| {
            SyscallResult::status(i64::from(lock(&b).close_port(args.get(0) as i32)))
        });

        let b = Arc::clone(&backend);
        d.register(SCE_AUDIO_OUT_OUTPUT, move |_ctx, mem: &mut GuestMemory, args: &SyscallArgs| {
            output_buffer(&b, mem, args)
        });

        // Multi-port output is treated as a single-port output.
        let b = Arc::clone(&backend);
        d.register(SCE_AUDIO_OUT_OUTPUTS, move |_ctx, mem: &mut GuestMemory, args: &SyscallArgs| {
            output_buffer(&b, mem, args)
        });

        let b = Arc::clone(&backend);
        d.register(
            SCE_AUDIO_OUT_SET_VOLUME,
            move |_ctx, mem: &mut GuestMemory, args: &SyscallArgs| {
                let (handle, vol_ptr) = (args.get(0) as i32, args.get(2));
                let mut volume = 1.0;
                if vol_ptr != 0 {
                    match mem.read_u32(vol_ptr) {
                        Ok(raw) => volume = raw as i32 as f32 / VOLUME_UNITY as f32,
                        Err(fault) => return SyscallResult::err(EFAULT, fault.to_string()),
                    }
                }
                SyscallResult::status(i64::from(lock(&b).set_volume(handle, volume)))
            },
        );

        d.register(
            SCE_AUDIO_OUT_GET_PORT_STATE,
            |_ctx, mem: &mut GuestMemory, args: &SyscallArgs| {
                let state_ptr = args.get(1);
                if state_ptr != 0 {
                    let written = mem
                        .write_u32(state_ptr, 1)
                        .and_then(|()| mem.write_u32(state_ptr.wrapping_add(4), 0));
                    if let Err(fault) = written {
                        return SyscallResult::err(EFAULT, fault.to_string());
                    }
                }
                SyscallResult::ok(0)
            },
        );

        d.register(
            SCE_AUDIO_OUT_GET_SYSTEM_STATE,
            |_ctx, mem: &mut GuestMemory, args: &SyscallArgs| {
                let state_ptr = args.get(0);
                if state_ptr != 0 {
                    if let Err(fault) = mem.write_u32(state_ptr, 1) {
                        return SyscallResult::err(EFAULT, fault.to_string());
                    }
                }
                SyscallResult::ok(0)
            },
        );
    }
}
