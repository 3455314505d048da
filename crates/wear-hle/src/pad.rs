//! `scePad*` syscalls. Controller state comes from a host [`PadBackend`] and is written to guest
//! memory in the console's `ScePadData` layout.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use wear_mem::GuestMemory;

use crate::dispatcher::{HleModule, SyscallArgs, SyscallDispatcher, SyscallResult};
use crate::kernel::EFAULT;
use crate::numbers::*;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PadButtons: u32 {
        const SHARE = 0x0000_0001;
        const L3 = 0x0000_0002;
        const R3 = 0x0000_0004;
        const OPTIONS = 0x0000_0008;
        const UP = 0x0000_0010;
        const RIGHT = 0x0000_0020;
        const DOWN = 0x0000_0040;
        const LEFT = 0x0000_0080;
        const L2 = 0x0000_0100;
        const R2 = 0x0000_0200;
        const L1 = 0x0000_0400;
        const R1 = 0x0000_0800;
        const TRIANGLE = 0x0000_1000;
        const CIRCLE = 0x0000_2000;
        const CROSS = 0x0000_4000;
        const SQUARE = 0x0000_8000;
        const TOUCH_PAD = 0x0010_0000;
    }
}

pub const STICK_CENTER: u8 = 128;

/// Host-side controller snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PadState {
    pub buttons: PadButtons,
    pub left_stick: (u8, u8),
    pub right_stick: (u8, u8),
    pub l2: u8,
    pub r2: u8,
    pub accel: [f32; 3],
    pub gyro: [f32; 3],
}

impl Default for PadState {
    fn default() -> Self {
        Self {
            buttons: PadButtons::empty(),
            left_stick: (STICK_CENTER, STICK_CENTER),
            right_stick: (STICK_CENTER, STICK_CENTER),
            l2: 0,
            r2: 0,
            // Resting controller: gravity along -Y.
            accel: [0.0, -1.0, 0.0],
            gyro: [0.0; 3],
        }
    }
}

/// `ScePadData` as the guest sees it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PadData {
    pub buttons: u32,
    pub left_stick_x: u8,
    pub left_stick_y: u8,
    pub right_stick_x: u8,
    pub right_stick_y: u8,
    pub analog_l2: u8,
    pub analog_r2: u8,
    pub padding1: u16,
    pub orientation: [f32; 4],
    pub accel: [f32; 3],
    pub gyro: [f32; 3],
    pub touch_data: [u8; 24],
    pub connected: u8,
    pub padding3: [u8; 3],
    pub timestamp: u64,
    pub extension: [u8; 12],
    pub connected_count: u8,
    pub padding2: [u8; 3],
}

pub const PAD_DATA_SIZE: usize = std::mem::size_of::<PadData>();
const _: () = assert!(PAD_DATA_SIZE == 0x68);

impl PadData {
    /// Always reports one connected controller with identity orientation and no touches.
    pub fn from_state(state: &PadState, timestamp_us: u64) -> Self {
        Self {
            buttons: state.buttons.bits(),
            left_stick_x: state.left_stick.0,
            left_stick_y: state.left_stick.1,
            right_stick_x: state.right_stick.0,
            right_stick_y: state.right_stick.1,
            analog_l2: state.l2,
            analog_r2: state.r2,
            orientation: [0.0, 0.0, 0.0, 1.0],
            accel: state.accel,
            gyro: state.gyro,
            connected: 1,
            timestamp: timestamp_us,
            connected_count: 1,
            ..Zeroable::zeroed()
        }
    }
}

pub trait PadBackend: Send {
    fn state(&mut self, handle: i32) -> PadState;

    fn set_vibration(&mut self, _handle: i32, _large_motor: u8, _small_motor: u8) {}
}

/// A single virtual controller whose state is set by the host.
#[derive(Debug, Default)]
pub struct NullPad {
    pub state: PadState,
    pub vibration: (u8, u8),
}

impl PadBackend for NullPad {
    fn state(&mut self, _handle: i32) -> PadState {
        self.state
    }

    fn set_vibration(&mut self, _handle: i32, large_motor: u8, small_motor: u8) {
        self.vibration = (large_motor, small_motor);
    }
}

fn lock<B>(backend: &Mutex<B>) -> MutexGuard<'_, B> {
    backend.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PadModule<B> {
    backend: Arc<Mutex<B>>,
}

impl<B: PadBackend + 'static> PadModule<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    pub fn backend(&self) -> Arc<Mutex<B>> {
        Arc::clone(&self.backend)
    }
}

impl Default for PadModule<NullPad> {
    fn default() -> Self {
        Self::new(NullPad::default())
    }
}

impl<B: PadBackend + 'static> HleModule for PadModule<B> {
    const NAME: &'static str = "libpad";

    fn register(self, d: &mut SyscallDispatcher) {
        let epoch = Instant::now();

        // scePadRead takes the same arguments; both return a single sample.
        for num in [SCE_PAD_READ_STATE, SCE_PAD_READ] {
            let backend = Arc::clone(&self.backend);
            d.register(num, move |_ctx, mem: &mut GuestMemory, args: &SyscallArgs| {
                let (handle, out) = (args.get(0) as i32, args.get(1));
                if out == 0 {
                    return SyscallResult::err(-1, "null output pointer");
                }
                let state = lock(&backend).state(handle);
                let timestamp = u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX);
                match mem.write(out, PadData::from_state(&state, timestamp)) {
                    Ok(()) => SyscallResult::ok(0),
                    Err(fault) => SyscallResult::err(EFAULT, fault.to_string()),
                }
            });
        }

        d.register(SCE_PAD_OPEN, |_ctx, _mem, args: &SyscallArgs| {
            tracing::debug!(
                user = args.get(0) as i32,
                kind = args.get(1) as i32,
                index = args.get(2) as i32,
                "scePadOpen"
            );
            SyscallResult::ok(0)
        });
        d.register(SCE_PAD_GET_HANDLE, |_ctx, _mem, _args: &SyscallArgs| SyscallResult::ok(0));
        d.register(SCE_PAD_CLOSE, |_ctx, _mem, _args: &SyscallArgs| SyscallResult::ok(0));

        let backend = Arc::clone(&self.backend);
        d.register(SCE_PAD_SET_VIBRATION, move |_ctx, _mem, args: &SyscallArgs| {
            let (large, small) = (args.get(1) as u8, args.get(2) as u8);
            if large > 0 || small > 0 {
                tracing::debug!(large, small, "scePadSetVibration");
            }
            lock(&backend).set_vibration(args.get(0) as i32, large, small);
            SyscallResult::ok(0)
        });
    }
}
