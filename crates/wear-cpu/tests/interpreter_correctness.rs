use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wear_cpu::{Cpu, CpuContext, CpuState, Reg};
use wear_mem::regions::USER_BASE;
use wear_mem::GuestMemory;

const MEM_SIZE: u64 = 0x10000;
const STACK: u64 = 0x8000;

fn setup(program: &[u8]) -> (Cpu, GuestMemory) {
    let mut mem = GuestMemory::with_size(MEM_SIZE).unwrap();
    mem.write_block(USER_BASE, program).unwrap();
    let mut cpu = Cpu::new();
    cpu.context_mut().rip = USER_BASE;
    cpu.context_mut().set_rsp(STACK);
    (cpu, mem)
}

fn run_to_halt(cpu: &mut Cpu, mem: &mut GuestMemory) {
    for _ in 0..1000 {
        if cpu.step(mem) == 0 {
            return;
        }
    }
    panic!("program did not halt");
}

#[test]
fn nop_advances_rip_by_one_and_touches_nothing_else() {
    let (mut cpu, mut mem) = setup(&[0x90]);
    cpu.context_mut().set_reg(Reg::Rbx, 0x1234);
    let before = cpu.snapshot();

    assert_eq!(cpu.step(&mut mem), 1);

    let mut expected: CpuContext = before;
    expected.rip = USER_BASE + 1;
    assert_eq!(cpu.snapshot(), expected);
    assert_eq!(cpu.state(), CpuState::Running);
    assert_eq!(cpu.instruction_count(), 1);
}

#[test]
fn hlt_returns_zero_and_stays_halted() {
    let (mut cpu, mut mem) = setup(&[0xF4, 0x90]);
    assert_eq!(cpu.step(&mut mem), 0);
    assert_eq!(cpu.state(), CpuState::Halted);
    assert_eq!(cpu.context().rip, USER_BASE + 1);

    assert_eq!(cpu.step(&mut mem), 0, "a halted CPU must not execute");
    assert_eq!(cpu.context().rip, USER_BASE + 1);
}

#[test]
fn mov_immediate_width_follows_rex_w() {
    #[rustfmt::skip]
    let prog = [
        0xB8, 0x78, 0x56, 0x34, 0x12,                               // mov eax, 0x12345678
        0x48, 0xBB, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // mov rbx, 0x1122334455667788
        0x49, 0xB8, 0x01, 0, 0, 0, 0, 0, 0, 0x80,                   // mov r8, 0x8000000000000001
        0xF4,
    ];
    let (mut cpu, mut mem) = setup(&prog);
    cpu.context_mut().set_reg(Reg::Rax, u64::MAX);
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.context().reg(Reg::Rax), 0x1234_5678, "imm32 zero-extends");
    assert_eq!(cpu.context().reg(Reg::Rbx), 0x1122_3344_5566_7788);
    assert_eq!(cpu.context().reg(Reg::R8), 0x8000_0000_0000_0001);
}

#[test]
fn mov_rm_imm32_sign_extends_under_rex_w() {
    #[rustfmt::skip]
    let prog = [
        0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF, // mov rax, -1
        0xC7, 0xC7, 0x05, 0x00, 0x00, 0x00,       // mov edi, 5
        0x49, 0xC7, 0xC2, 0x00, 0x00, 0x00, 0x80, // mov r10, 0xffffffff80000000
        0xF4,
    ];
    let (mut cpu, mut mem) = setup(&prog);
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.context().reg(Reg::Rax), u64::MAX);
    assert_eq!(cpu.context().reg(Reg::Rdi), 5);
    assert_eq!(cpu.context().reg(Reg::R10), 0xFFFF_FFFF_8000_0000);
}

#[test]
fn push_pop_moves_values_through_the_stack() {
    // push rax; push rbx; pop r9; pop rcx; hlt
    let prog = [0x50, 0x53, 0x41, 0x59, 0x59, 0xF4];
    let (mut cpu, mut mem) = setup(&prog);
    cpu.context_mut().set_reg(Reg::Rax, 0xAAAA);
    cpu.context_mut().set_reg(Reg::Rbx, 0xBBBB);
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.context().reg(Reg::R9), 0xBBBB);
    assert_eq!(cpu.context().reg(Reg::Rcx), 0xAAAA);
    assert_eq!(cpu.context().rsp(), STACK);
    assert_eq!(mem.read_u64(STACK - 8).unwrap(), 0xAAAA);
    assert_eq!(mem.read_u64(STACK - 16).unwrap(), 0xBBBB);
}

#[test]
fn call_pushes_return_address_and_ret_pops_it() {
    #[rustfmt::skip]
    let prog = [
        0xE8, 0x05, 0x00, 0x00, 0x00, // call +5
        0xF4,                         // hlt
        0x90, 0x90, 0x90, 0x90,
        0xC3,                         // ret
    ];
    let (mut cpu, mut mem) = setup(&prog);

    assert_eq!(cpu.step(&mut mem), 1);
    assert_eq!(cpu.context().rip, USER_BASE + 10);
    assert_eq!(cpu.context().rsp(), STACK - 8);
    assert_eq!(mem.read_u64(STACK - 8).unwrap(), USER_BASE + 5);

    assert_eq!(cpu.step(&mut mem), 1);
    assert_eq!(cpu.context().rip, USER_BASE + 5);
    assert_eq!(cpu.context().rsp(), STACK);

    assert_eq!(cpu.step(&mut mem), 0);
    assert_eq!(cpu.state(), CpuState::Halted);
}

#[test]
fn jmp_rel32_is_relative_to_the_next_instruction() {
    // nop; jmp -6 (back to the nop)
    let prog = [0x90, 0xE9, 0xFA, 0xFF, 0xFF, 0xFF];
    let (mut cpu, mut mem) = setup(&prog);
    cpu.step(&mut mem);
    cpu.step(&mut mem);
    assert_eq!(cpu.context().rip, USER_BASE);
}

#[test]
fn pause_is_a_one_cycle_hint() {
    let (mut cpu, mut mem) = setup(&[0xF3, 0x90, 0xF4]);
    assert_eq!(cpu.step(&mut mem), 1);
    assert_eq!(cpu.context().rip, USER_BASE + 2);
}

#[test]
fn unknown_opcode_is_skipped_as_one_cycle_noop() {
    let (mut cpu, mut mem) = setup(&[0x06, 0x0F, 0xFF, 0xF4]);
    assert_eq!(cpu.step(&mut mem), 1);
    assert_eq!(cpu.context().rip, USER_BASE + 1);
    assert_eq!(cpu.last_opcode(), 0x06);

    assert_eq!(cpu.step(&mut mem), 1, "unknown two-byte opcode");
    assert_eq!(cpu.context().rip, USER_BASE + 3);
    assert_eq!(cpu.state(), CpuState::Running);
}

#[test]
fn syscall_invokes_injected_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);

    let (mut cpu, mut mem) = setup(&[0x0F, 0x05, 0xF4]);
    cpu.set_syscall_handler(move |ctx: &mut CpuContext, mem: &mut GuestMemory| {
        seen.fetch_add(1, Ordering::SeqCst);
        assert_eq!(ctx.rip, USER_BASE + 2, "RIP already points past SYSCALL");
        mem.write_u32(0x100, ctx.reg(Reg::Rdi) as u32).unwrap();
        ctx.set_reg(Reg::Rax, 42);
    });
    cpu.context_mut().set_reg(Reg::Rdi, 7);

    assert_eq!(cpu.step(&mut mem), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cpu.context().reg(Reg::Rax), 42);
    assert_eq!(mem.read_u32(0x100).unwrap(), 7);
    assert_eq!(cpu.context().rip, USER_BASE + 2);
}

#[test]
fn syscall_handler_may_redirect_control_flow() {
    let (mut cpu, mut mem) = setup(&[0x0F, 0x05, 0x90, 0x90, 0xF4]);
    cpu.set_syscall_handler(|ctx: &mut CpuContext, _: &mut GuestMemory| {
        ctx.rip = USER_BASE + 4;
    });
    cpu.step(&mut mem);
    assert_eq!(cpu.context().rip, USER_BASE + 4);
}

#[test]
fn syscall_without_handler_is_harmless() {
    let (mut cpu, mut mem) = setup(&[0x0F, 0x05, 0xF4]);
    cpu.context_mut().set_reg(Reg::Rax, 99);
    assert_eq!(cpu.step(&mut mem), 1);
    assert_eq!(cpu.context().reg(Reg::Rax), 99);
}

#[test]
fn fetch_past_buffer_end_faults_without_moving_rip() {
    let (mut cpu, mut mem) = setup(&[]);
    // The rel32 operand of this `jmp` straddles the end of the buffer.
    let rip = MEM_SIZE - 3;
    mem.write_u8(rip, 0xE9).unwrap();
    cpu.context_mut().rip = rip;

    assert_eq!(cpu.step(&mut mem), 0);
    assert_eq!(cpu.state(), CpuState::Faulted);
    assert_eq!(cpu.context().rip, rip);
    let fault = cpu.last_fault().expect("fault recorded");
    assert_eq!(fault.rip, rip);

    assert_eq!(cpu.step(&mut mem), 0, "faulted is terminal until reset");

    cpu.reset();
    assert_eq!(cpu.state(), CpuState::Stopped);
    assert!(cpu.last_fault().is_none());
    assert_eq!(cpu.context().rip, 0);
}

#[test]
fn pop_from_unmapped_stack_faults() {
    let (mut cpu, mut mem) = setup(&[0x58]);
    cpu.context_mut().set_rsp(MEM_SIZE - 4);
    assert_eq!(cpu.step(&mut mem), 0);
    assert_eq!(cpu.state(), CpuState::Faulted);
    assert_eq!(cpu.context().rsp(), MEM_SIZE - 4, "RSP is not committed on fault");
}

#[test]
fn pause_and_resume_transitions() {
    let (mut cpu, mut mem) = setup(&[0x90, 0x90, 0xF4]);
    assert_eq!(cpu.state(), CpuState::Stopped);
    assert!(!cpu.pause(), "only a running CPU can pause");

    cpu.step(&mut mem);
    assert!(cpu.pause());
    assert_eq!(cpu.state(), CpuState::Paused);
    assert!(cpu.resume());
    assert_eq!(cpu.state(), CpuState::Running);
    assert!(!cpu.resume());

    cpu.stop();
    assert_eq!(cpu.state(), CpuState::Stopped);
}

#[test]
fn run_loop_runs_until_halt() {
    let (mut cpu, mut mem) = setup(&[0x90, 0x90, 0xF4]);
    let executed = cpu.run_loop(&mut mem, Duration::from_millis(1));
    assert_eq!(executed, 3);
    assert_eq!(cpu.state(), CpuState::Halted);
}

#[test]
fn run_loop_observes_stop_requests_from_another_thread() {
    // jmp $
    let (mut cpu, mut mem) = setup(&[0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
    let control = cpu.control();

    let worker = std::thread::spawn(move || {
        let executed = cpu.run_loop(&mut mem, Duration::from_millis(1));
        (cpu, executed)
    });

    while control.state() != CpuState::Running {
        std::thread::yield_now();
    }
    assert!(control.pause());
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(control.state(), CpuState::Paused);
    assert!(control.resume());
    std::thread::sleep(Duration::from_millis(5));
    control.request_stop();

    let (cpu, executed) = worker.join().unwrap();
    assert!(executed > 0);
    assert_eq!(cpu.state(), CpuState::Stopped);
    assert_eq!(cpu.context().rip, USER_BASE);
    assert!(!control.stop_requested(), "stop request is consumed by the loop");
}

#[test]
fn run_slice_respects_budget_pause_and_halt() {
    // jmp to self, forever
    let (mut cpu, mut mem) = setup(&[0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
    assert_eq!(cpu.run_slice(&mut mem, 100), 100);
    assert_eq!(cpu.state(), CpuState::Running);
    assert_eq!(cpu.context().rip, USER_BASE);

    assert!(cpu.pause());
    assert_eq!(cpu.run_slice(&mut mem, 100), 0);
    assert_eq!(cpu.state(), CpuState::Paused);
    assert!(cpu.resume());

    cpu.control().request_stop();
    assert_eq!(cpu.run_slice(&mut mem, 100), 0);

    let (mut cpu, mut mem) = setup(&[0x90, 0x90, 0xF4, 0x90]);
    assert_eq!(cpu.run_slice(&mut mem, 100), 3);
    assert_eq!(cpu.state(), CpuState::Halted);
    assert_eq!(cpu.run_slice(&mut mem, 100), 0);
}
