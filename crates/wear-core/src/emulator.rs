use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use wear_cpu::{Cpu, CpuContext, CpuControl, CpuFault, CpuState, Reg};
use wear_gpu::{DecoderStats, GnmModule, Pm4Decoder, RenderCommand, RenderQueue};
use wear_hle::{
    AudioModule, KernelModule, NullAudio, NullPad, PadModule, SyscallDispatcher, SyscallStats,
};
use wear_mem::regions::STACK_TOP;
use wear_mem::GuestMemory;

use crate::bios::InternalBios;
use crate::loader::ProgramLoader;
use crate::{CoreError, EmulatorConfig};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EmuState {
    Idle = 0,
    Booting = 1,
    Running = 2,
    Paused = 3,
    Stopping = 4,
    /// Terminal until [`Emulator::reset`].
    Error = 5,
}

impl EmuState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EmuState::Booting,
            2 => EmuState::Running,
            3 => EmuState::Paused,
            4 => EmuState::Stopping,
            5 => EmuState::Error,
            _ => EmuState::Idle,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EmuState::Idle => "IDLE",
            EmuState::Booting => "BOOTING",
            EmuState::Running => "RUNNING",
            EmuState::Paused => "PAUSED",
            EmuState::Stopping => "STOPPING",
            EmuState::Error => "ERROR",
        }
    }
}

impl fmt::Display for EmuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmulatorStats {
    pub instructions: u64,
    pub syscalls: u64,
    pub unimplemented_syscalls: u64,
    pub packets_processed: u64,
    pub draw_calls: u64,
    pub dispatches: u64,
    pub frames: u64,
}

pub type StateCallback = Box<dyn Fn(EmuState) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State visible to both the controller and the execution thread.
struct Shared {
    state: AtomicU8,
    on_state_change: Mutex<Option<StateCallback>>,
    snapshot: Mutex<CpuContext>,
    instructions: AtomicU64,
    program_loaded: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EmuState::Idle as u8),
            on_state_change: Mutex::new(None),
            snapshot: Mutex::new(CpuContext::default()),
            instructions: AtomicU64::new(0),
            program_loaded: AtomicBool::new(false),
        }
    }

    fn state(&self) -> EmuState {
        EmuState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EmuState) {
        let previous = EmuState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            self.announce(previous, state);
        }
    }

    /// Moves to `to` only from one of `from`. Returns whether the transition happened.
    fn transition(&self, from: &[EmuState], to: EmuState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = EmuState::from_u8(current);
            if !from.contains(&state) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.announce(state, to);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn announce(&self, from: EmuState, to: EmuState) {
        tracing::info!(from = %from, to = %to, "emulator state changed");
        if let Some(callback) = lock(&self.on_state_change).as_ref() {
            callback(to);
        }
    }

    fn publish(&self, cpu: &Cpu) {
        *lock(&self.snapshot) = cpu.snapshot();
        self.instructions.store(cpu.instruction_count(), Ordering::Release);
    }
}

/// Guest memory and the CPU wired to the syscall dispatcher. Owned by the execution thread while
/// running and handed back when it exits.
struct Core {
    memory: GuestMemory,
    cpu: Cpu,
}

/// Handles kept by the controller after the dispatcher has been moved into the CPU.
struct Services {
    cpu: CpuControl,
    syscalls: Arc<SyscallStats>,
    decoder: Arc<DecoderStats>,
    audio: Arc<Mutex<NullAudio>>,
    pad: Arc<Mutex<NullPad>>,
}

fn build_core(
    config: &EmulatorConfig,
    queue: &Arc<RenderQueue>,
) -> Result<(Core, Services), CoreError> {
    let memory = GuestMemory::new(config.memory)?;

    let audio = AudioModule::default();
    let pad = PadModule::default();
    let gnm = GnmModule::new(Pm4Decoder::new(config.decoder, Arc::clone(queue)));
    let (audio_backend, pad_backend) = (audio.backend(), pad.backend());
    let decoder_stats = gnm.stats();

    let mut dispatcher = SyscallDispatcher::new();
    dispatcher.install(KernelModule {
        neo_mode: config.neo_mode,
        ..KernelModule::default()
    });
    dispatcher.install(audio);
    dispatcher.install(pad);
    dispatcher.install(gnm);
    let syscalls = dispatcher.stats();
    tracing::debug!(handlers = dispatcher.handler_count(), "syscall table ready");

    let cpu = Cpu::with_syscall_handler(dispatcher);
    let services = Services {
        cpu: cpu.control(),
        syscalls,
        decoder: decoder_stats,
        audio: audio_backend,
        pad: pad_backend,
    };
    Ok((Core { memory, cpu }, services))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Runs `f`, turning a panic into [`CoreError::Panicked`].
fn contain<T>(during: &'static str, f: impl FnOnce() -> T) -> Result<T, CoreError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| CoreError::Panicked {
        during,
        message: panic_message(&*payload),
    })
}

#[derive(Debug, Clone, Copy)]
struct ExecSettings {
    pause_poll: Duration,
    steps_per_tick: u64,
}

enum Exit {
    Stopped,
    Halted,
    Faulted(Option<CpuFault>),
}

fn exec_loop(
    core: &mut Core,
    shared: &Shared,
    control: &CpuControl,
    settings: ExecSettings,
) -> Exit {
    loop {
        if control.stop_requested() {
            return Exit::Stopped;
        }
        match shared.state() {
            EmuState::Running => {}
            EmuState::Paused => {
                control.pause();
                thread::sleep(settings.pause_poll);
                continue;
            }
            _ => return Exit::Stopped,
        }
        control.resume();

        for _ in 0..settings.steps_per_tick {
            let executed = core.cpu.run_slice(&mut core.memory, 1);
            shared.publish(&core.cpu);
            if executed == 0 || core.cpu.state() != CpuState::Running {
                break;
            }
        }

        match core.cpu.state() {
            CpuState::Halted => return Exit::Halted,
            CpuState::Faulted => return Exit::Faulted(core.cpu.last_fault()),
            _ => {}
        }
    }
}

fn exec_thread(mut core: Core, shared: Arc<Shared>, settings: ExecSettings) -> Core {
    let control = core.cpu.control();
    tracing::info!(
        rip = format_args!("{:#018x}", core.cpu.context().rip),
        "execution thread started"
    );
    let exit = panic::catch_unwind(AssertUnwindSafe(|| {
        exec_loop(&mut core, &shared, &control, settings)
    }));
    shared.publish(&core.cpu);

    let active = [EmuState::Running, EmuState::Paused];
    match exit {
        Ok(Exit::Stopped) => {}
        Ok(Exit::Halted) => {
            shared.program_loaded.store(false, Ordering::Release);
            shared.transition(&active, EmuState::Idle);
        }
        Ok(Exit::Faulted(fault)) => {
            match fault {
                Some(fault) => tracing::error!(
                    rip = format_args!("{:#018x}", fault.rip),
                    error = %fault.fault,
                    "guest faulted"
                ),
                None => tracing::error!("guest faulted"),
            }
            shared.transition(&active, EmuState::Error);
        }
        Err(payload) => {
            tracing::error!(panic = %panic_message(&*payload), "execution thread panicked");
            shared.transition(&active, EmuState::Error);
        }
    }
    tracing::info!(
        instructions = core.cpu.instruction_count(),
        cpu = ?core.cpu.state(),
        "execution thread exiting"
    );
    core
}

/// The lifecycle controller: owns guest memory, the CPU and the syscall layer, and runs the CPU
/// on a dedicated execution thread.
///
/// Control calls (`run`, `pause`, `stop`, ...) are made from the owning thread. Observers read
/// [`Emulator::cpu_snapshot`] and [`Emulator::stats`]; neither touches live CPU state.
pub struct Emulator {
    config: EmulatorConfig,
    shared: Arc<Shared>,
    queue: Arc<RenderQueue>,
    core: Option<Core>,
    services: Option<Services>,
    worker: Option<JoinHandle<Core>>,
    entry_point: Option<u64>,
}

impl fmt::Debug for Emulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emulator")
            .field("state", &self.state())
            .field("program_loaded", &self.is_program_loaded())
            .field("entry_point", &self.entry_point)
            .field("running_thread", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

impl Emulator {
    /// Creates an uninitialized controller in [`EmuState::Idle`]; call [`Emulator::initialize`]
    /// before loading a program.
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new()),
            queue: Arc::new(RenderQueue::new()),
            core: None,
            services: None,
            worker: None,
            entry_point: None,
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Replaces the observer notified on every state change. It runs on whichever thread made
    /// the change.
    pub fn on_state_change(&self, callback: impl Fn(EmuState) + Send + Sync + 'static) {
        *lock(&self.shared.on_state_change) = Some(Box::new(callback));
    }

    pub fn is_initialized(&self) -> bool {
        self.services.is_some()
    }

    /// Allocates guest memory, builds the CPU and registers every syscall module.
    ///
    /// Does nothing if already initialized. Allocation failure or a panic leaves the controller
    /// in [`EmuState::Error`].
    pub fn initialize(&mut self) -> Result<(), CoreError> {
        if self.is_initialized() {
            return Ok(());
        }
        self.shared.set_state(EmuState::Booting);
        let built = contain("initialize", || build_core(&self.config, &self.queue));
        match built.and_then(|built| built) {
            Ok((core, services)) => {
                tracing::info!(
                    memory_bytes = core.memory.size(),
                    max_indirect_depth = self.config.decoder.max_indirect_depth,
                    "emulator initialized"
                );
                self.shared.publish(&core.cpu);
                self.core = Some(core);
                self.services = Some(services);
                self.shared.set_state(EmuState::Idle);
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "initialization failed");
                self.shared.set_state(EmuState::Error);
                Err(err)
            }
        }
    }

    /// Loads a program and points the CPU at it: RIP at the entry point, RSP and RBP at
    /// `STACK_TOP - stack_reserve`. Returns the entry point.
    ///
    /// Only allowed while [`EmuState::Idle`]. A stack reserve larger than `STACK_TOP` is rejected
    /// before anything is touched. A loader error returns to Idle with nothing loaded; a panic
    /// moves to [`EmuState::Error`].
    pub fn load_program(&mut self, loader: &dyn ProgramLoader) -> Result<u64, CoreError> {
        let state = self.shared.state();
        if state != EmuState::Idle {
            tracing::warn!(state = %state, "load rejected");
            return Err(CoreError::InvalidState {
                action: "load a program",
                state,
            });
        }
        self.reclaim_worker();
        let Some(core) = self.core.as_mut() else {
            return Err(CoreError::NotInitialized);
        };
        let Some(sp) = STACK_TOP.checked_sub(self.config.stack_reserve) else {
            tracing::warn!(
                stack_reserve = format_args!("{:#x}", self.config.stack_reserve),
                "load rejected: stack reserve exceeds the stack top"
            );
            return Err(CoreError::StackReserve {
                reserve: self.config.stack_reserve,
            });
        };

        self.shared.set_state(EmuState::Booting);
        self.shared.program_loaded.store(false, Ordering::Release);
        self.entry_point = None;

        match contain("load", || loader.load(&mut core.memory)) {
            Ok(Ok(image)) => {
                core.cpu.reset();
                let ctx = core.cpu.context_mut();
                ctx.rip = image.entry_point;
                ctx.set_rsp(sp);
                ctx.set_reg(Reg::Rbp, sp);
                self.shared.publish(&core.cpu);

                self.queue.clear();
                self.queue.push(RenderCommand::CLEAR_BLACK);
                self.entry_point = Some(image.entry_point);
                self.shared.program_loaded.store(true, Ordering::Release);
                tracing::info!(
                    image = %image.description,
                    entry = format_args!("{:#x}", image.entry_point),
                    "program loaded"
                );
                self.shared.set_state(EmuState::Idle);
                Ok(image.entry_point)
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "program load failed");
                self.shared.set_state(EmuState::Idle);
                Err(err.into())
            }
            Err(err) => {
                tracing::error!(error = %err, "program load crashed");
                self.shared.set_state(EmuState::Error);
                Err(err)
            }
        }
    }

    pub fn load_internal_bios(&mut self) -> Result<u64, CoreError> {
        self.load_program(&InternalBios)
    }

    /// Starts execution from Idle, or resumes from Paused.
    ///
    /// Rejected (returns `false`, state untouched) without a loaded program or from any other
    /// state.
    pub fn run(&mut self) -> bool {
        if !self.is_program_loaded() {
            tracing::warn!("run rejected: no program loaded");
            return false;
        }
        match self.shared.state() {
            EmuState::Paused => self.resume(),
            EmuState::Idle => self.start_worker(),
            state => {
                tracing::warn!(state = %state, "run rejected");
                false
            }
        }
    }

    fn start_worker(&mut self) -> bool {
        self.reclaim_worker();
        let Some(core) = self.core.take() else {
            tracing::warn!("run rejected: emulator is not initialized");
            return false;
        };
        if !self.shared.transition(&[EmuState::Idle], EmuState::Running) {
            self.core = Some(core);
            return false;
        }

        let settings = ExecSettings {
            pause_poll: self.config.pause_poll,
            steps_per_tick: self.config.steps_per_tick.max(1),
        };
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("wear-exec".to_owned())
            .spawn(move || exec_thread(core, shared, settings))
        {
            Ok(handle) => {
                self.worker = Some(handle);
                true
            }
            Err(err) => {
                // The closure, and the core with it, is gone; only a reset recovers.
                tracing::error!(error = %err, "failed to spawn execution thread");
                self.shared.set_state(EmuState::Error);
                false
            }
        }
    }

    /// Running -> Paused. Memory and registers are kept.
    pub fn pause(&mut self) -> bool {
        if !self.shared.transition(&[EmuState::Running], EmuState::Paused) {
            tracing::warn!(state = %self.state(), "pause rejected");
            return false;
        }
        if let Some(services) = &self.services {
            services.cpu.pause();
        }
        true
    }

    /// Paused -> Running.
    pub fn resume(&mut self) -> bool {
        if !self.shared.transition(&[EmuState::Paused], EmuState::Running) {
            tracing::warn!(state = %self.state(), "resume rejected");
            return false;
        }
        if let Some(services) = &self.services {
            services.cpu.resume();
        }
        true
    }

    pub fn toggle_pause(&mut self) -> bool {
        match self.state() {
            EmuState::Running => self.pause(),
            EmuState::Paused => self.resume(),
            state => {
                tracing::warn!(state = %state, "toggle pause rejected");
                false
            }
        }
    }

    /// Stops execution, joins the execution thread and unloads the program.
    ///
    /// Rejected from Idle, Booting, Stopping and Error.
    pub fn stop(&mut self) -> bool {
        if !self
            .shared
            .transition(&[EmuState::Running, EmuState::Paused], EmuState::Stopping)
        {
            tracing::warn!(state = %self.state(), "stop rejected");
            self.reclaim_worker();
            return false;
        }
        if let Some(services) = &self.services {
            services.cpu.request_stop();
        }
        self.reclaim_worker();
        self.unload();
        self.shared.set_state(EmuState::Idle);
        true
    }

    /// Discards guest memory and the CPU and builds them again from the configuration. This is
    /// the only way out of [`EmuState::Error`].
    pub fn reset(&mut self) -> Result<(), CoreError> {
        tracing::info!(state = %self.state(), "resetting emulator");
        self.halt_worker();
        self.unload();
        self.core = None;
        self.services = None;
        self.shared.instructions.store(0, Ordering::Release);
        *lock(&self.shared.snapshot) = CpuContext::default();
        self.initialize()
    }

    /// Stops any execution and releases guest memory. The controller can be initialized again.
    pub fn shutdown(&mut self) {
        self.halt_worker();
        self.unload();
        self.core = None;
        self.services = None;
        self.shared.set_state(EmuState::Idle);
    }

    pub fn state(&self) -> EmuState {
        self.shared.state()
    }

    pub fn is_program_loaded(&self) -> bool {
        self.shared.program_loaded.load(Ordering::Acquire)
    }

    pub fn entry_point(&self) -> Option<u64> {
        self.entry_point
    }

    /// Register file as of the most recently completed step.
    pub fn cpu_snapshot(&self) -> CpuContext {
        *lock(&self.shared.snapshot)
    }

    pub fn stats(&self) -> EmulatorStats {
        let mut stats = EmulatorStats {
            instructions: self.shared.instructions.load(Ordering::Acquire),
            frames: self.queue.frame_count(),
            ..EmulatorStats::default()
        };
        if let Some(services) = &self.services {
            let decoder = services.decoder.snapshot();
            stats.syscalls = services.syscalls.total_calls();
            stats.unimplemented_syscalls = services.syscalls.unimplemented_calls();
            stats.packets_processed = decoder.packets_processed;
            stats.draw_calls = decoder.draw_calls;
            stats.dispatches = decoder.dispatches;
        }
        stats
    }

    /// Copies guest memory at `addr` into `buf`.
    ///
    /// Memory is only reachable while no execution thread owns it, so this is rejected while
    /// Running, Paused or Stopping.
    pub fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), CoreError> {
        let state = self.shared.state();
        if matches!(
            state,
            EmuState::Running | EmuState::Paused | EmuState::Stopping
        ) {
            return Err(CoreError::InvalidState {
                action: "read guest memory",
                state,
            });
        }
        self.reclaim_worker();
        let core = self.core.as_ref().ok_or(CoreError::NotInitialized)?;
        core.memory.read_block(addr, buf)?;
        Ok(())
    }

    pub fn render_queue(&self) -> Arc<RenderQueue> {
        Arc::clone(&self.queue)
    }

    pub fn pad(&self) -> Option<Arc<Mutex<NullPad>>> {
        self.services.as_ref().map(|s| Arc::clone(&s.pad))
    }

    pub fn audio(&self) -> Option<Arc<Mutex<NullAudio>>> {
        self.services.as_ref().map(|s| Arc::clone(&s.audio))
    }

    /// Joins a finished (or finishing) execution thread and takes the core back.
    fn reclaim_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.join() {
            Ok(core) => self.core = Some(core),
            Err(payload) => {
                tracing::error!(
                    panic = %panic_message(&*payload),
                    "execution thread died without returning the core"
                );
                self.shared.set_state(EmuState::Error);
            }
        }
    }

    fn halt_worker(&mut self) {
        if self.worker.is_some() {
            self.shared.set_state(EmuState::Stopping);
            if let Some(services) = &self.services {
                services.cpu.request_stop();
            }
        }
        self.reclaim_worker();
    }

    fn unload(&mut self) {
        if let Some(core) = self.core.as_mut() {
            core.cpu.reset();
            self.shared.publish(&core.cpu);
        }
        self.shared.program_loaded.store(false, Ordering::Release);
        self.entry_point = None;
        self.queue.clear();
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        if let Some(services) = &self.services {
            services.cpu.request_stop();
        }
        if let Some(worker) = self.worker.take() {
            // A panic was already logged by the thread itself.
            let _ = worker.join();
        }
    }
}
