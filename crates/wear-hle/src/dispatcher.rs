use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use wear_cpu::{CpuContext, Reg, SyscallHandler};
use wear_mem::GuestMemory;

use crate::numbers::syscall_name;

/// Registers carrying the six syscall arguments, in ABI order.
pub const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::R10, Reg::R8, Reg::R9];

/// The six argument registers captured at trap time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallArgs(pub [u64; 6]);

impl SyscallArgs {
    pub fn from_context(ctx: &CpuContext) -> Self {
        Self(ARG_REGS.map(|reg| ctx.reg(reg)))
    }

    pub fn get(&self, index: usize) -> u64 {
        self.0[index]
    }
}

/// Outcome of one handler call. `value` is written back to RAX whether or not the call succeeded;
/// how failure is encoded in it is up to each syscall family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallResult {
    pub value: i64,
    pub success: bool,
    pub error: Option<String>,
}

impl SyscallResult {
    pub fn ok(value: i64) -> Self {
        Self {
            value,
            success: true,
            error: None,
        }
    }

    pub fn err(value: i64, error: impl Into<String>) -> Self {
        Self {
            value,
            success: false,
            error: Some(error.into()),
        }
    }

    /// Success iff `value == 0`, the convention of the `sce*` status-returning calls.
    pub fn status(value: i64) -> Self {
        Self {
            value,
            success: value == 0,
            error: None,
        }
    }
}

pub type HleFunction =
    Box<dyn FnMut(&mut CpuContext, &mut GuestMemory, &SyscallArgs) -> SyscallResult + Send>;

/// Call counters, shared so other threads can observe them.
#[derive(Debug, Default)]
pub struct SyscallStats {
    total: AtomicU64,
    unimplemented: AtomicU64,
}

impl SyscallStats {
    pub fn total_calls(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn unimplemented_calls(&self) -> u64 {
        self.unimplemented.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.unimplemented.store(0, Ordering::Relaxed);
    }
}

/// A feature module that contributes syscall handlers.
pub trait HleModule {
    const NAME: &'static str;

    fn register(self, dispatcher: &mut SyscallDispatcher);
}

/// Maps syscall numbers to handlers and services `SYSCALL` traps.
#[derive(Default)]
pub struct SyscallDispatcher {
    handlers: FxHashMap<u64, HleFunction>,
    stats: Arc<SyscallStats>,
}

impl std::fmt::Debug for SyscallDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallDispatcher")
            .field("handlers", &self.handlers.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SyscallDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `num`, replacing any previous handler.
    pub fn register<F>(&mut self, num: u64, handler: F)
    where
        F: FnMut(&mut CpuContext, &mut GuestMemory, &SyscallArgs) -> SyscallResult + Send + 'static,
    {
        if self.handlers.insert(num, Box::new(handler)).is_some() {
            tracing::debug!(syscall = %syscall_name(num), num, "replaced syscall handler");
        }
    }

    pub fn unregister(&mut self, num: u64) -> bool {
        self.handlers.remove(&num).is_some()
    }

    pub fn is_registered(&self, num: u64) -> bool {
        self.handlers.contains_key(&num)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn install<M: HleModule>(&mut self, module: M) {
        let before = self.handlers.len();
        module.register(self);
        tracing::debug!(
            module = M::NAME,
            added = self.handlers.len().saturating_sub(before),
            "registered HLE module"
        );
    }

    pub fn stats(&self) -> Arc<SyscallStats> {
        Arc::clone(&self.stats)
    }

    /// Services one trap: number from RAX, arguments from [`ARG_REGS`], result back into RAX.
    ///
    /// A number with no handler is counted, logged and answered with 0.
    pub fn dispatch(&mut self, ctx: &mut CpuContext, mem: &mut GuestMemory) {
        let num = ctx.reg(Reg::Rax);
        let args = SyscallArgs::from_context(ctx);
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let Some(handler) = self.handlers.get_mut(&num) else {
            self.stats.unimplemented.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(syscall = %syscall_name(num), num, "unimplemented syscall");
            ctx.set_reg(Reg::Rax, 0);
            return;
        };

        tracing::trace!(syscall = %syscall_name(num), args = ?args.0, "syscall");
        let result = handler(ctx, mem, &args);
        if !result.success {
            tracing::warn!(
                syscall = %syscall_name(num),
                value = result.value,
                error = result.error.as_deref().unwrap_or(""),
                "syscall failed"
            );
        }
        ctx.set_reg(Reg::Rax, result.value as u64);
    }
}

impl SyscallHandler for SyscallDispatcher {
    fn on_syscall(&mut self, ctx: &mut CpuContext, mem: &mut GuestMemory) {
        self.dispatch(ctx, mem);
    }
}
