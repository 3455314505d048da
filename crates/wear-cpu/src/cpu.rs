bitflags::bitflags! {
    /// Architectural RFLAGS bits the core cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RFlags: u64 {
        const CF = 1 << 0;
        /// Always reads as one.
        const RESERVED_1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

pub const RFLAGS_RESET: u64 = RFlags::RESERVED_1.bits() | RFlags::IF.bits();
pub const MXCSR_RESET: u32 = 0x1F80;

/// 16 general purpose registers in the standard x86-64 order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "RAX",
            Reg::Rcx => "RCX",
            Reg::Rdx => "RDX",
            Reg::Rbx => "RBX",
            Reg::Rsp => "RSP",
            Reg::Rbp => "RBP",
            Reg::Rsi => "RSI",
            Reg::Rdi => "RDI",
            Reg::R8 => "R8",
            Reg::R9 => "R9",
            Reg::R10 => "R10",
            Reg::R11 => "R11",
            Reg::R12 => "R12",
            Reg::R13 => "R13",
            Reg::R14 => "R14",
            Reg::R15 => "R15",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRegs {
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
}

/// The guest register file.
///
/// `Copy` so observers on other threads can take a whole snapshot at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuContext {
    regs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub segments: SegmentRegs,
    pub xmm: [u128; 16],
    pub mxcsr: u32,
}

impl Default for CpuContext {
    fn default() -> Self {
        Self {
            regs: [0; 16],
            rip: 0,
            rflags: RFLAGS_RESET,
            segments: SegmentRegs::default(),
            xmm: [0; 16],
            mxcsr: MXCSR_RESET,
        }
    }
}

impl CpuContext {
    pub fn reg(&self, reg: Reg) -> u64 {
        self.regs[reg as usize]
    }

    pub fn set_reg(&mut self, reg: Reg, value: u64) {
        self.regs[reg as usize] = value;
    }

    /// `index` is the 4-bit register number (opcode low bits plus REX.B).
    pub fn reg_by_index(&self, index: u8) -> u64 {
        self.regs[usize::from(index & 0xF)]
    }

    pub fn set_reg_by_index(&mut self, index: u8, value: u64) {
        self.regs[usize::from(index & 0xF)] = value;
    }

    pub fn regs(&self) -> &[u64; 16] {
        &self.regs
    }

    pub fn rsp(&self) -> u64 {
        self.reg(Reg::Rsp)
    }

    pub fn set_rsp(&mut self, value: u64) {
        self.set_reg(Reg::Rsp, value);
    }

    pub fn flags(&self) -> RFlags {
        RFlags::from_bits_retain(self.rflags)
    }
}
