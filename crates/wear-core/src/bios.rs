//! Built-in boot program used when no game is supplied.
//!
//! It prints a banner through `write`, initializes audio, then polls the first pad forever with a
//! `PAUSE` between reads, which keeps the syscall path and the execution loop exercised.

use wear_cpu::Reg;
use wear_hle::numbers::{SCE_AUDIO_OUT_INIT, SCE_PAD_READ_STATE, SYS_WRITE};
use wear_mem::GuestMemory;

use crate::loader::{LoadedImage, ProgramLoader};
use crate::LoadError;

pub const BIOS_ENTRY: u64 = 0x40_0000;
pub const BANNER_ADDR: u64 = 0x40_0200;
pub const PAD_BUFFER_ADDR: u64 = 0x40_0300;
pub const BANNER: &[u8] = b"WeaR-emu Internal BIOS v1.0\n";

/// Writes the boot program and its banner; entry is [`BIOS_ENTRY`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalBios;

impl ProgramLoader for InternalBios {
    fn load(&self, mem: &mut GuestMemory) -> Result<LoadedImage, LoadError> {
        mem.write_block(BIOS_ENTRY, &program())?;
        mem.write_block(BANNER_ADDR, BANNER)?;
        mem.write_u8(BANNER_ADDR + BANNER.len() as u64, 0)?;
        Ok(LoadedImage {
            entry_point: BIOS_ENTRY,
            description: "internal BIOS".to_owned(),
        })
    }
}

/// Machine code of the boot program, position-dependent at [`BIOS_ENTRY`].
pub fn program() -> Vec<u8> {
    let mut asm = Assembler::default();

    asm.mov_imm32(Reg::Rax, SYS_WRITE as u32);
    asm.mov_imm32(Reg::Rdi, 1);
    asm.mov_imm64(Reg::Rsi, BANNER_ADDR);
    asm.mov_imm32(Reg::Rdx, BANNER.len() as u32);
    asm.syscall();

    asm.mov_imm32(Reg::Rax, SCE_AUDIO_OUT_INIT as u32);
    asm.syscall();

    let poll = asm.len();
    asm.mov_imm32(Reg::Rax, SCE_PAD_READ_STATE as u32);
    asm.mov_imm32(Reg::Rdi, 0);
    asm.mov_imm64(Reg::Rsi, PAD_BUFFER_ADDR);
    asm.syscall();
    asm.pause();
    asm.jmp(poll);

    asm.0
}

#[derive(Default)]
struct Assembler(Vec<u8>);

impl Assembler {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn rex_w(reg: Reg) -> u8 {
        0x48 | ((reg as u8) >> 3)
    }

    /// `mov r64, imm32` (sign-extended).
    fn mov_imm32(&mut self, reg: Reg, imm: u32) {
        self.0
            .extend_from_slice(&[Self::rex_w(reg), 0xC7, 0xC0 | (reg as u8 & 7)]);
        self.0.extend_from_slice(&imm.to_le_bytes());
    }

    /// `movabs r64, imm64`
    fn mov_imm64(&mut self, reg: Reg, imm: u64) {
        self.0
            .extend_from_slice(&[Self::rex_w(reg), 0xB8 + (reg as u8 & 7)]);
        self.0.extend_from_slice(&imm.to_le_bytes());
    }

    fn syscall(&mut self) {
        self.0.extend_from_slice(&[0x0F, 0x05]);
    }

    fn pause(&mut self) {
        self.0.extend_from_slice(&[0xF3, 0x90]);
    }

    /// `jmp rel32` to an earlier offset in the program.
    fn jmp(&mut self, target: usize) {
        let rel = target as i64 - (self.len() as i64 + 5);
        self.0.push(0xE9);
        self.0.extend_from_slice(&(rel as i32).to_le_bytes());
    }
}
