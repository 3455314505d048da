//! Syscall numbers understood by the high-level emulation layer.

pub const SYS_EXIT: u64 = 1;
pub const SYS_READ: u64 = 3;
pub const SYS_WRITE: u64 = 4;
pub const SYS_OPEN: u64 = 5;
pub const SYS_CLOSE: u64 = 6;
pub const SYS_UNLINK: u64 = 10;
pub const SYS_GETPID: u64 = 20;
pub const SYS_GETUID: u64 = 24;
pub const SYS_MKDIR: u64 = 136;
pub const SYS_STAT: u64 = 188;
pub const SYS_FSTAT: u64 = 189;
pub const SYS_GETDENTS: u64 = 272;
pub const SYS_MMAP: u64 = 477;
pub const SYS_LSEEK: u64 = 478;

pub const SCE_AUDIO_OUT_INIT: u64 = 495;
pub const SCE_AUDIO_OUT_OPEN: u64 = 496;
pub const SCE_AUDIO_OUT_CLOSE: u64 = 497;
pub const SCE_AUDIO_OUT_OUTPUT: u64 = 498;
pub const SCE_AUDIO_OUT_OUTPUTS: u64 = 499;
pub const SCE_AUDIO_OUT_SET_VOLUME: u64 = 500;
pub const SCE_AUDIO_OUT_GET_PORT_STATE: u64 = 501;
pub const SCE_AUDIO_OUT_GET_SYSTEM_STATE: u64 = 502;

pub const SCE_PAD_READ: u64 = 570;
pub const SCE_PAD_READ_STATE: u64 = 571;
pub const SCE_PAD_OPEN: u64 = 572;
pub const SCE_PAD_CLOSE: u64 = 573;
pub const SCE_PAD_GET_HANDLE: u64 = 574;
pub const SCE_PAD_SET_VIBRATION: u64 = 575;

pub const SCE_GNM_SUBMIT_COMMAND_BUFFERS: u64 = 591;
pub const SCE_KERNEL_LOAD_START_MODULE: u64 = 594;
pub const SCE_KERNEL_DEBUG_OUT: u64 = 602;
pub const SCE_GNM_SUBMIT_DONE: u64 = 614;
pub const SCE_KERNEL_IS_NEO_MODE: u64 = 618;
pub const SCE_KERNEL_GET_CPU_TEMPERATURE: u64 = 621;
pub const SCE_GNM_GET_GPU_CORE_CLOCK_FREQUENCY: u64 = 626;

/// Human-readable name for logs; unknown numbers render as `syscall_<n>`.
pub fn syscall_name(num: u64) -> std::borrow::Cow<'static, str> {
    let name = match num {
        SYS_EXIT => "sys_exit",
        SYS_READ => "sys_read",
        SYS_WRITE => "sys_write",
        SYS_OPEN => "sys_open",
        SYS_CLOSE => "sys_close",
        SYS_UNLINK => "sys_unlink",
        SYS_GETPID => "sys_getpid",
        SYS_GETUID => "sys_getuid",
        SYS_MKDIR => "sys_mkdir",
        SYS_STAT => "sys_stat",
        SYS_FSTAT => "sys_fstat",
        SYS_GETDENTS => "sys_getdents",
        SYS_MMAP => "sys_mmap",
        SYS_LSEEK => "sys_lseek",
        SCE_AUDIO_OUT_INIT => "sceAudioOutInit",
        SCE_AUDIO_OUT_OPEN => "sceAudioOutOpen",
        SCE_AUDIO_OUT_CLOSE => "sceAudioOutClose",
        SCE_AUDIO_OUT_OUTPUT => "sceAudioOutOutput",
        SCE_AUDIO_OUT_OUTPUTS => "sceAudioOutOutputs",
        SCE_AUDIO_OUT_SET_VOLUME => "sceAudioOutSetVolume",
        SCE_AUDIO_OUT_GET_PORT_STATE => "sceAudioOutGetPortState",
        SCE_AUDIO_OUT_GET_SYSTEM_STATE => "sceAudioOutGetSystemState",
        SCE_PAD_READ => "scePadRead",
        SCE_PAD_READ_STATE => "scePadReadState",
        SCE_PAD_OPEN => "scePadOpen",
        SCE_PAD_CLOSE => "scePadClose",
        SCE_PAD_GET_HANDLE => "scePadGetHandle",
        SCE_PAD_SET_VIBRATION => "scePadSetVibration",
        SCE_GNM_SUBMIT_COMMAND_BUFFERS => "sceGnmSubmitCommandBuffers",
        SCE_KERNEL_LOAD_START_MODULE => "sceKernelLoadStartModule",
        SCE_KERNEL_DEBUG_OUT => "sceKernelDebugOut",
        SCE_GNM_SUBMIT_DONE => "sceGnmSubmitDone",
        SCE_KERNEL_IS_NEO_MODE => "sceKernelIsNeoMode",
        SCE_KERNEL_GET_CPU_TEMPERATURE => "sceKernelGetCpuTemperature",
        SCE_GNM_GET_GPU_CORE_CLOCK_FREQUENCY => "sceGnmGetGpuCoreClockFrequency",
        _ => return format!("syscall_{num}").into(),
    };
    name.into()
}
