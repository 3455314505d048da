//! Opcode dispatch table and instruction handlers.

use wear_mem::{GuestMemory, MemoryResult};

use super::Cpu;
use crate::cpu::Reg;

const PREFIX_REP: u8 = 0xF3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Jump(u64),
    Halt,
}

/// Prefixes, opcode and the read cursor of the instruction being executed.
///
/// Instruction bytes are fetched byte-wise so code never trips alignment enforcement.
#[derive(Debug)]
struct Fetch {
    rep: bool,
    rex: u8,
    opcode: u8,
    cursor: u64,
}

impl Fetch {
    fn decode(mem: &GuestMemory, rip: u64) -> MemoryResult<Self> {
        let mut fetch = Fetch {
            rep: false,
            rex: 0,
            opcode: 0,
            cursor: rip,
        };
        let mut byte = fetch.byte(mem)?;
        if byte == PREFIX_REP {
            fetch.rep = true;
            byte = fetch.byte(mem)?;
        }
        if byte & 0xF0 == 0x40 {
            fetch.rex = byte;
            byte = fetch.byte(mem)?;
        }
        fetch.opcode = byte;
        Ok(fetch)
    }

    fn rex_w(&self) -> bool {
        self.rex & 0x08 != 0
    }

    /// Register number from the low three bits of `low`, extended by REX.B.
    fn reg_b(&self, low: u8) -> u8 {
        (low & 0x7) | ((self.rex & 0x01) << 3)
    }

    fn byte(&mut self, mem: &GuestMemory) -> MemoryResult<u8> {
        let value = mem.read_u8(self.cursor)?;
        self.cursor = self.cursor.wrapping_add(1);
        Ok(value)
    }

    fn imm32(&mut self, mem: &GuestMemory) -> MemoryResult<u32> {
        let bytes = mem.read::<[u8; 4]>(self.cursor)?;
        self.cursor = self.cursor.wrapping_add(4);
        Ok(u32::from_le_bytes(bytes))
    }

    fn imm64(&mut self, mem: &GuestMemory) -> MemoryResult<u64> {
        let bytes = mem.read::<[u8; 8]>(self.cursor)?;
        self.cursor = self.cursor.wrapping_add(8);
        Ok(u64::from_le_bytes(bytes))
    }

    fn rel32_target(&mut self, mem: &GuestMemory) -> MemoryResult<u64> {
        let rel = self.imm32(mem)? as i32;
        Ok(self.cursor.wrapping_add_signed(i64::from(rel)))
    }
}

type Handler = fn(&mut Cpu, &mut GuestMemory, &mut Fetch) -> MemoryResult<Next>;

const TABLE: [Handler; 256] = build_table();

const fn build_table() -> [Handler; 256] {
    let mut table = [op_unknown as Handler; 256];
    let mut i = 0;
    while i < 8 {
        table[0x50 + i] = op_push_reg;
        table[0x58 + i] = op_pop_reg;
        table[0xB8 + i] = op_mov_reg_imm;
        i += 1;
    }
    table[0x0F] = op_two_byte;
    table[0x90] = op_nop;
    table[0xC3] = op_ret;
    table[0xC7] = op_mov_rm_imm32;
    table[0xE8] = op_call_rel32;
    table[0xE9] = op_jmp_rel32;
    table[0xF4] = op_hlt;
    table
}

/// Decodes and executes one instruction at RIP, committing RIP only on success.
///
/// Returns the cycles consumed; 0 means the instruction halted the CPU.
pub(super) fn execute(cpu: &mut Cpu, mem: &mut GuestMemory) -> MemoryResult<u32> {
    let mut fetch = Fetch::decode(mem, cpu.ctx.rip)?;
    cpu.last_opcode = fetch.opcode;

    let handler = TABLE[usize::from(fetch.opcode)];
    match handler(cpu, mem, &mut fetch)? {
        Next::Continue => {
            cpu.ctx.rip = fetch.cursor;
            Ok(1)
        }
        Next::Jump(target) => {
            cpu.ctx.rip = target;
            Ok(1)
        }
        Next::Halt => {
            cpu.ctx.rip = fetch.cursor;
            Ok(0)
        }
    }
}

fn push(cpu: &mut Cpu, mem: &mut GuestMemory, value: u64) -> MemoryResult<()> {
    let rsp = cpu.ctx.rsp().wrapping_sub(8);
    mem.write_u64(rsp, value)?;
    cpu.ctx.set_rsp(rsp);
    Ok(())
}

fn pop(cpu: &mut Cpu, mem: &mut GuestMemory) -> MemoryResult<u64> {
    let rsp = cpu.ctx.rsp();
    let value = mem.read_u64(rsp)?;
    cpu.ctx.set_rsp(rsp.wrapping_add(8));
    Ok(value)
}

/// NOP, or PAUSE when carrying the REP prefix.
fn op_nop(_cpu: &mut Cpu, _mem: &mut GuestMemory, fetch: &mut Fetch) -> MemoryResult<Next> {
    if fetch.rep {
        std::hint::spin_loop();
    }
    Ok(Next::Continue)
}

fn op_hlt(_cpu: &mut Cpu, _mem: &mut GuestMemory, _fetch: &mut Fetch) -> MemoryResult<Next> {
    Ok(Next::Halt)
}

fn op_ret(cpu: &mut Cpu, mem: &mut GuestMemory, _fetch: &mut Fetch) -> MemoryResult<Next> {
    let target = pop(cpu, mem)?;
    Ok(Next::Jump(target))
}

fn op_jmp_rel32(_cpu: &mut Cpu, mem: &mut GuestMemory, fetch: &mut Fetch) -> MemoryResult<Next> {
    let target = fetch.rel32_target(mem)?;
    Ok(Next::Jump(target))
}

fn op_call_rel32(cpu: &mut Cpu, mem: &mut GuestMemory, fetch: &mut Fetch) -> MemoryResult<Next> {
    let target = fetch.rel32_target(mem)?;
    push(cpu, mem, fetch.cursor)?;
    Ok(Next::Jump(target))
}

fn op_push_reg(cpu: &mut Cpu, mem: &mut GuestMemory, fetch: &mut Fetch) -> MemoryResult<Next> {
    let value = cpu.ctx.reg_by_index(fetch.reg_b(fetch.opcode));
    push(cpu, mem, value)?;
    Ok(Next::Continue)
}

fn op_pop_reg(cpu: &mut Cpu, mem: &mut GuestMemory, fetch: &mut Fetch) -> MemoryResult<Next> {
    let value = pop(cpu, mem)?;
    cpu.ctx.set_reg_by_index(fetch.reg_b(fetch.opcode), value);
    Ok(Next::Continue)
}

/// `B8+r`: imm64 with REX.W, otherwise imm32 zero-extended.
fn op_mov_reg_imm(cpu: &mut Cpu, mem: &mut GuestMemory, fetch: &mut Fetch) -> MemoryResult<Next> {
    let value = if fetch.rex_w() {
        fetch.imm64(mem)?
    } else {
        u64::from(fetch.imm32(mem)?)
    };
    cpu.ctx.set_reg_by_index(fetch.reg_b(fetch.opcode), value);
    Ok(Next::Continue)
}

/// `C7 /0`: register destinations only. imm32 is sign-extended under REX.W.
fn op_mov_rm_imm32(
    cpu: &mut Cpu,
    mem: &mut GuestMemory,
    fetch: &mut Fetch,
) -> MemoryResult<Next> {
    let modrm = fetch.byte(mem)?;
    let mode = modrm >> 6;
    let ext = (modrm >> 3) & 0x7;
    if mode != 0b11 || ext != 0 {
        tracing::warn!(
            opcode = format_args!("{:#04x}", fetch.opcode),
            modrm = format_args!("{modrm:#04x}"),
            rip = format_args!("{:#018x}", cpu.ctx.rip),
            "unsupported MOV r/m form, skipping"
        );
        return Ok(Next::Continue);
    }

    let imm = fetch.imm32(mem)?;
    let value = if fetch.rex_w() {
        imm as i32 as i64 as u64
    } else {
        u64::from(imm)
    };
    cpu.ctx.set_reg_by_index(fetch.reg_b(modrm), value);
    Ok(Next::Continue)
}

fn op_two_byte(cpu: &mut Cpu, mem: &mut GuestMemory, fetch: &mut Fetch) -> MemoryResult<Next> {
    let opcode2 = fetch.byte(mem)?;
    match opcode2 {
        0x05 => op_syscall(cpu, mem, fetch),
        _ => {
            tracing::warn!(
                opcode = format_args!("0x0f {opcode2:#04x}"),
                rip = format_args!("{:#018x}", cpu.ctx.rip),
                "unrecognized opcode"
            );
            Ok(Next::Continue)
        }
    }
}

/// Hands the context to the injected handler with RIP already past the instruction, so the
/// handler may redirect control flow.
fn op_syscall(cpu: &mut Cpu, mem: &mut GuestMemory, fetch: &mut Fetch) -> MemoryResult<Next> {
    cpu.ctx.rip = fetch.cursor;
    match cpu.syscall_handler.as_mut() {
        Some(handler) => handler.on_syscall(&mut cpu.ctx, mem),
        None => tracing::debug!(rax = cpu.ctx.reg(Reg::Rax), "SYSCALL with no handler"),
    }
    Ok(Next::Jump(cpu.ctx.rip))
}

fn op_unknown(cpu: &mut Cpu, _mem: &mut GuestMemory, fetch: &mut Fetch) -> MemoryResult<Next> {
    tracing::warn!(
        opcode = format_args!("{:#04x}", fetch.opcode),
        rip = format_args!("{:#018x}", cpu.ctx.rip),
        "unrecognized opcode"
    );
    Ok(Next::Continue)
}
