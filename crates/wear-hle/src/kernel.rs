//! Process, console and memory-mapping syscalls.

use wear_cpu::CpuContext;
use wear_mem::regions::{page_align_up, HEAP_BASE};
use wear_mem::GuestMemory;

use crate::dispatcher::{HleModule, SyscallArgs, SyscallDispatcher, SyscallResult};
use crate::numbers::*;

pub const EFAULT: i64 = -14;

pub const FAKE_PID: i64 = 1000;
pub const FIRST_MODULE_ID: i64 = 100;
pub const CPU_TEMPERATURE_CELSIUS: u32 = 45;

const WRITE_LIMIT: usize = 4096;
const DEBUG_OUT_LIMIT: usize = 1024;
const MODULE_PATH_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct KernelModule {
    /// Reported by `sceKernelIsNeoMode`.
    pub neo_mode: bool,
    /// First address handed out by anonymous `mmap`.
    pub heap_base: u64,
}

impl Default for KernelModule {
    fn default() -> Self {
        Self {
            neo_mode: true,
            heap_base: HEAP_BASE,
        }
    }
}

impl HleModule for KernelModule {
    const NAME: &'static str = "kernel";

    fn register(self, d: &mut SyscallDispatcher) {
        d.register(SYS_EXIT, |_ctx, _mem, args: &SyscallArgs| {
            tracing::info!(status = args.get(0) as i32, "guest called exit");
            SyscallResult::ok(0)
        });

        d.register(SYS_WRITE, sys_write);

        let mut next_alloc = self.heap_base;
        d.register(SYS_MMAP, move |_ctx, _mem, args: &SyscallArgs| {
            let (addr, len) = (args.get(0), args.get(1));
            let mapped = if addr != 0 { addr } else { next_alloc };
            next_alloc = next_alloc.wrapping_add(page_align_up(len));
            tracing::debug!(
                addr = format_args!("{addr:#x}"),
                len,
                mapped = format_args!("{mapped:#x}"),
                "sys_mmap"
            );
            SyscallResult::ok(mapped as i64)
        });

        d.register(SYS_GETPID, |_ctx, _mem, _args: &SyscallArgs| {
            SyscallResult::ok(FAKE_PID)
        });
        d.register(SYS_GETUID, |_ctx, _mem, _args: &SyscallArgs| SyscallResult::ok(0));

        d.register(SCE_KERNEL_DEBUG_OUT, |_ctx, mem: &mut GuestMemory, args: &SyscallArgs| {
            match mem.read_cstr(args.get(0), DEBUG_OUT_LIMIT) {
                Ok(msg) => {
                    tracing::info!(target: "guest", "[debug] {}", String::from_utf8_lossy(&msg));
                    SyscallResult::ok(0)
                }
                Err(fault) => SyscallResult::err(EFAULT, fault.to_string()),
            }
        });

        let neo_mode = self.neo_mode;
        d.register(SCE_KERNEL_IS_NEO_MODE, move |_ctx, _mem, _args: &SyscallArgs| {
            SyscallResult::ok(i64::from(neo_mode))
        });

        d.register(
            SCE_KERNEL_GET_CPU_TEMPERATURE,
            |_ctx, mem: &mut GuestMemory, args: &SyscallArgs| {
                let out = args.get(0);
                if out != 0 {
                    if let Err(fault) = mem.write_u32(out, CPU_TEMPERATURE_CELSIUS) {
                        return SyscallResult::err(EFAULT, fault.to_string());
                    }
                }
                SyscallResult::ok(0)
            },
        );

        let mut next_module_id = FIRST_MODULE_ID;
        d.register(
            SCE_KERNEL_LOAD_START_MODULE,
            move |_ctx, mem: &mut GuestMemory, args: &SyscallArgs| {
                let path = match mem.read_cstr(args.get(0), MODULE_PATH_LIMIT) {
                    Ok(path) => path,
                    Err(fault) => return SyscallResult::err(-1, fault.to_string()),
                };
                let id = next_module_id;
                next_module_id += 1;
                tracing::info!(path = %String::from_utf8_lossy(&path), id, "load start module");
                SyscallResult::ok(id)
            },
        );
    }
}

/// `write(fd, buf, count)`: copies at most `count` bytes (capped at 4 KiB, stopping at NUL) and
/// echoes stdout/stderr to the log. Returns the number of bytes taken.
fn sys_write(_ctx: &mut CpuContext, mem: &mut GuestMemory, args: &SyscallArgs) -> SyscallResult {
    let (fd, buf, count) = (args.get(0), args.get(1), args.get(2));
    let limit = usize::try_from(count).unwrap_or(usize::MAX).min(WRITE_LIMIT);
    let text = match mem.read_cstr(buf, limit) {
        Ok(text) => text,
        Err(fault) => return SyscallResult::err(EFAULT, fault.to_string()),
    };
    if fd == 1 || fd == 2 {
        tracing::info!(target: "guest", fd, "{}", String::from_utf8_lossy(&text).trim_end());
    }
    SyscallResult::ok(text.len() as i64)
}
