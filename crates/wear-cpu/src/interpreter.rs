mod dispatch;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wear_mem::{GuestMemory, MemoryFault};

use crate::cpu::CpuContext;

/// Default sleep between state checks while paused inside [`Cpu::run_loop`].
pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_millis(10);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Stopped = 0,
    Running = 1,
    Paused = 2,
    Halted = 3,
    Faulted = 4,
}

impl CpuState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CpuState::Running,
            2 => CpuState::Paused,
            3 => CpuState::Halted,
            4 => CpuState::Faulted,
            _ => CpuState::Stopped,
        }
    }
}

/// A memory fault caught at the step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("memory fault at rip=0x{rip:016x}")]
pub struct CpuFault {
    pub rip: u64,
    #[source]
    pub fault: MemoryFault,
}

/// Injected trap strategy invoked by the `SYSCALL` instruction.
///
/// The CPU has no knowledge of the guest OS; whatever the handler leaves in the context (return
/// value in RAX, a redirected RIP) is what the guest observes.
pub trait SyscallHandler: Send {
    fn on_syscall(&mut self, ctx: &mut CpuContext, mem: &mut GuestMemory);
}

impl<F> SyscallHandler for F
where
    F: FnMut(&mut CpuContext, &mut GuestMemory) + Send,
{
    fn on_syscall(&mut self, ctx: &mut CpuContext, mem: &mut GuestMemory) {
        self(ctx, mem)
    }
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
}

/// Thread-safe handle for pausing, resuming and stopping a [`Cpu`] owned by another thread.
#[derive(Debug, Clone)]
pub struct CpuControl {
    shared: Arc<Shared>,
}

impl CpuControl {
    pub fn state(&self) -> CpuState {
        CpuState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Running -> Paused. Returns `false` if the CPU was not running.
    pub fn pause(&self) -> bool {
        self.transition(CpuState::Running, CpuState::Paused)
    }

    /// Paused -> Running. Returns `false` if the CPU was not paused.
    pub fn resume(&self) -> bool {
        self.transition(CpuState::Paused, CpuState::Running)
    }

    /// Asks a running [`Cpu::run_loop`] to return after the current instruction.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    fn transition(&self, from: CpuState, to: CpuState) -> bool {
        self.shared
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The CPU execution engine: a register file plus a table-driven interpreter for a small x86-64
/// subset.
pub struct Cpu {
    ctx: CpuContext,
    shared: Arc<Shared>,
    syscall_handler: Option<Box<dyn SyscallHandler>>,
    instruction_count: u64,
    last_opcode: u8,
    last_fault: Option<CpuFault>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("state", &self.state())
            .field("rip", &format_args!("{:#x}", self.ctx.rip))
            .field("instruction_count", &self.instruction_count)
            .field("has_syscall_handler", &self.syscall_handler.is_some())
            .finish_non_exhaustive()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            ctx: CpuContext::default(),
            shared: Arc::new(Shared {
                state: AtomicU8::new(CpuState::Stopped as u8),
                stop: AtomicBool::new(false),
            }),
            syscall_handler: None,
            instruction_count: 0,
            last_opcode: 0,
            last_fault: None,
        }
    }

    pub fn with_syscall_handler(handler: impl SyscallHandler + 'static) -> Self {
        let mut cpu = Self::new();
        cpu.set_syscall_handler(handler);
        cpu
    }

    pub fn set_syscall_handler(&mut self, handler: impl SyscallHandler + 'static) {
        self.syscall_handler = Some(Box::new(handler));
    }

    pub fn clear_syscall_handler(&mut self) {
        self.syscall_handler = None;
    }

    /// Restores the power-on register file and returns to [`CpuState::Stopped`].
    ///
    /// The syscall handler survives a reset.
    pub fn reset(&mut self) {
        self.ctx = CpuContext::default();
        self.instruction_count = 0;
        self.last_opcode = 0;
        self.last_fault = None;
        self.shared.stop.store(false, Ordering::Release);
        self.set_state(CpuState::Stopped);
    }

    pub fn control(&self) -> CpuControl {
        CpuControl {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CpuState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    pub fn pause(&self) -> bool {
        self.control().pause()
    }

    pub fn resume(&self) -> bool {
        self.control().resume()
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.set_state(CpuState::Stopped);
    }

    pub fn context(&self) -> &CpuContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut CpuContext {
        &mut self.ctx
    }

    /// Copy of the register file.
    pub fn snapshot(&self) -> CpuContext {
        self.ctx
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn last_opcode(&self) -> u8 {
        self.last_opcode
    }

    pub fn last_fault(&self) -> Option<CpuFault> {
        self.last_fault
    }

    /// Executes one instruction and returns the cycles it consumed.
    ///
    /// Returns 0 when the CPU halted or faulted (now or on an earlier step). A memory fault during
    /// fetch or execute leaves RIP at the faulting instruction and moves the CPU to
    /// [`CpuState::Faulted`]; it is not propagated further.
    pub fn step(&mut self, mem: &mut GuestMemory) -> u32 {
        match self.state() {
            CpuState::Halted | CpuState::Faulted => return 0,
            CpuState::Stopped | CpuState::Paused => self.set_state(CpuState::Running),
            CpuState::Running => {}
        }
        self.execute_one(mem)
    }

    fn execute_one(&mut self, mem: &mut GuestMemory) -> u32 {
        match dispatch::execute(self, mem) {
            Ok(cycles) => {
                self.instruction_count += 1;
                if cycles == 0 {
                    tracing::info!(
                        rip = format_args!("{:#018x}", self.ctx.rip),
                        instructions = self.instruction_count,
                        "HLT, stopping"
                    );
                    self.set_state(CpuState::Halted);
                }
                cycles
            }
            Err(fault) => {
                let rip = self.ctx.rip;
                tracing::error!(
                    rip = format_args!("{rip:#018x}"),
                    error = %fault,
                    "memory fault"
                );
                self.last_fault = Some(CpuFault { rip, fault });
                self.set_state(CpuState::Faulted);
                0
            }
        }
    }

    /// Steps until the CPU halts, faults, or [`CpuControl::request_stop`] is observed, sleeping
    /// `pause_poll` between checks while paused. Returns the number of instructions executed.
    pub fn run_loop(&mut self, mem: &mut GuestMemory, pause_poll: Duration) -> u64 {
        if matches!(self.state(), CpuState::Halted | CpuState::Faulted) {
            return 0;
        }
        tracing::info!(
            rip = format_args!("{:#018x}", self.ctx.rip),
            "starting execution"
        );

        let start = self.instruction_count;
        if self.state() != CpuState::Paused {
            self.set_state(CpuState::Running);
        }
        while !self.shared.stop.load(Ordering::Acquire) {
            if self.state() == CpuState::Paused {
                std::thread::sleep(pause_poll);
                continue;
            }
            if self.execute_one(mem) == 0 {
                break;
            }
        }
        self.shared.stop.store(false, Ordering::Release);

        if matches!(self.state(), CpuState::Running | CpuState::Paused) {
            self.set_state(CpuState::Stopped);
        }
        let executed = self.instruction_count - start;
        tracing::info!(executed, state = ?self.state(), "execution stopped");
        executed
    }

    /// Executes at most `budget` instructions and returns how many ran.
    ///
    /// Returns early on halt, fault, a pause through [`CpuControl`], or a stop request. A stopped
    /// CPU starts running; a paused one executes nothing.
    pub fn run_slice(&mut self, mem: &mut GuestMemory, budget: u64) -> u64 {
        match self.state() {
            CpuState::Stopped => self.set_state(CpuState::Running),
            CpuState::Running => {}
            CpuState::Paused | CpuState::Halted | CpuState::Faulted => return 0,
        }
        let start = self.instruction_count;
        for _ in 0..budget {
            if self.state() != CpuState::Running || self.shared.stop.load(Ordering::Acquire) {
                break;
            }
            if self.execute_one(mem) == 0 {
                break;
            }
        }
        self.instruction_count - start
    }
}
