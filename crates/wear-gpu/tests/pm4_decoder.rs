use std::sync::Arc;

use wear_cpu::{Cpu, CpuState, Reg};
use wear_gpu::pm4::{build_type3_header, opcode};
use wear_gpu::{
    DecodeError, DecoderConfig, GnmModule, Pm4Decoder, RenderCommand, RenderQueue,
    DEFAULT_MAX_INDIRECT_DEPTH,
};
use wear_hle::numbers::{SCE_GNM_SUBMIT_COMMAND_BUFFERS, SCE_GNM_SUBMIT_DONE};
use wear_hle::SyscallDispatcher;
use wear_mem::GuestMemory;

const MEM_SIZE: u64 = 0x10000;

fn setup() -> (Pm4Decoder, Arc<RenderQueue>, GuestMemory) {
    let queue = Arc::new(RenderQueue::new());
    let decoder = Pm4Decoder::new(DecoderConfig::default(), Arc::clone(&queue));
    (decoder, queue, GuestMemory::with_size(MEM_SIZE).unwrap())
}

fn write_words(mem: &mut GuestMemory, addr: u64, words: &[u32]) -> u32 {
    for (i, w) in words.iter().enumerate() {
        mem.write_u32(addr + i as u64 * 4, *w).unwrap();
    }
    words.len() as u32
}

fn type3(op: u8, payload: &[u32]) -> Vec<u32> {
    let mut words = vec![build_type3_header(op, payload.len() as u32, 0)];
    words.extend_from_slice(payload);
    words
}

fn draw(vertex_count: u32, instance_count: u32) -> RenderCommand {
    RenderCommand::Draw {
        vertex_count,
        instance_count,
        primitive_type: 4,
    }
}

#[test]
fn nop_then_draw_auto_yields_exactly_one_draw() {
    let (mut decoder, queue, mut mem) = setup();
    let before = decoder.state().clone();
    let words = [
        build_type3_header(opcode::NOP, 1, 0),
        0,
        build_type3_header(opcode::DRAW_INDEX_AUTO, 2, 0),
        3,
        0,
    ];
    let len = write_words(&mut mem, 0x100, &words);

    decoder.process_command_buffer(&mem, 0x100, len).unwrap();

    assert_eq!(decoder.state(), &before);
    assert_eq!(queue.pop_all(), vec![draw(3, 1)]);
    let stats = decoder.stats().snapshot();
    assert_eq!(stats.packets_processed, 2);
    assert_eq!(stats.draw_calls, 1);
}

#[test]
fn instance_count_packet_applies_to_later_draws() {
    let (mut decoder, queue, mut mem) = setup();
    let mut words = type3(opcode::NUM_INSTANCES, &[5]);
    words.extend(type3(opcode::DRAW_INDEX_AUTO, &[36, 2]));
    let len = write_words(&mut mem, 0x200, &words);

    decoder.process_command_buffer(&mem, 0x200, len).unwrap();

    assert_eq!(queue.pop_all(), vec![draw(36, 5)]);
    assert!(queue.pop_all().is_empty());
}

#[test]
fn overflowing_packet_aborts_only_its_own_buffer() {
    let (mut decoder, queue, mut mem) = setup();
    // Buffer A: one good draw, then a header claiming 8 payload dwords with 1 left, then a
    // draw that must never be seen.
    let mut a = type3(opcode::DRAW_INDEX_AUTO, &[1, 0]);
    a.push(build_type3_header(opcode::DRAW_INDEX_AUTO, 8, 0));
    a.push(2);
    a.extend(type3(opcode::DRAW_INDEX_AUTO, &[99, 0]));
    let a_len = write_words(&mut mem, 0x1000, &a);
    // Only the first five dwords belong to buffer A.
    assert_eq!(a_len, 8);
    let b_len = write_words(&mut mem, 0x2000, &type3(opcode::DRAW_INDEX_AUTO, &[7, 0]));

    // Submission: two pointers, two byte sizes.
    mem.write_u64(0x3000, 0x1000).unwrap();
    mem.write_u64(0x3008, 0x2000).unwrap();
    mem.write_u32(0x3010, 5 * 4).unwrap();
    mem.write_u32(0x3014, b_len * 4).unwrap();
    decoder.submit(&mem, 2, 0x3000, 0x3010).unwrap();

    assert_eq!(queue.pop_all(), vec![draw(1, 1), draw(7, 1)]);

    let err = decoder.process_command_buffer(&mem, 0x1000, 5).unwrap_err();
    assert_eq!(
        err,
        DecodeError::PacketOverflow {
            offset: 3,
            declared: 8,
            remaining: 1
        }
    );
}

#[test]
fn non_command_packets_are_skipped() {
    let (mut decoder, queue, mut mem) = setup();
    let mut words = vec![
        // Type-0 write of two registers: header plus two values.
        0x0001_0000 | 0x2000,
        0xDEAD,
        0xBEEF,
        // Type-2 filler.
        0x8000_0000,
    ];
    words.extend(type3(opcode::DRAW_INDEX_AUTO, &[4, 0]));
    let len = write_words(&mut mem, 0x400, &words);

    decoder.process_command_buffer(&mem, 0x400, len).unwrap();
    assert_eq!(queue.pop_all(), vec![draw(4, 1)]);
    assert_eq!(decoder.stats().snapshot().packets_processed, 3);
}

#[test]
fn unknown_opcode_is_skipped_and_decoding_continues() {
    let (mut decoder, queue, mut mem) = setup();
    let mut words = type3(0xEE, &[1, 2, 3]);
    words.extend(type3(opcode::DRAW_INDEX_AUTO, &[6, 0]));
    let len = write_words(&mut mem, 0x500, &words);

    decoder.process_command_buffer(&mem, 0x500, len).unwrap();
    assert_eq!(queue.pop_all(), vec![draw(6, 1)]);
}

#[test]
fn indexed_draws_use_index_type_and_buffer_address() {
    let (mut decoder, queue, mut mem) = setup();
    let mut words = type3(opcode::INDEX_TYPE, &[0xFFFF_FFF1]);
    words.extend(type3(opcode::NUM_INSTANCES, &[2]));
    words.extend(type3(opcode::DRAW_INDEX_2, &[64, 0x8000_0000, 0x1, 30, 0]));
    words.extend(type3(opcode::DRAW_INDEX_OFFSET_2, &[64, 3, 12, 0]));
    let len = write_words(&mut mem, 0x600, &words);

    decoder.process_command_buffer(&mem, 0x600, len).unwrap();

    assert_eq!(decoder.state().index_buffer.address, 0x1_8000_0000);
    assert_eq!(decoder.state().index_buffer.size, 64);
    assert_eq!(
        queue.pop_all(),
        vec![
            RenderCommand::DrawIndexed {
                index_count: 30,
                instance_count: 2,
                index_address: 0x1_8000_0000,
                index_type: 1,
                primitive_type: 4,
            },
            RenderCommand::DrawIndexed {
                index_count: 12,
                instance_count: 2,
                index_address: 0x1_8000_000C,
                index_type: 1,
                primitive_type: 4,
            },
        ]
    );
}

#[test]
fn viewport_registers_reshape_viewport() {
    let (mut decoder, _queue, mut mem) = setup();
    let values = [640.0f32, 640.0, 360.0, 360.0, 1.0, 0.0];
    let mut payload = vec![0x10F];
    payload.extend(values.iter().map(|v| v.to_bits()));
    let len = write_words(&mut mem, 0x600, &type3(opcode::SET_CONTEXT_REG, &payload));

    decoder.process_command_buffer(&mem, 0x600, len).unwrap();

    let viewport = decoder.state().viewport;
    assert_eq!((viewport.x, viewport.y), (0.0, 0.0));
    assert_eq!((viewport.width, viewport.height), (1280.0, 720.0));
    assert_eq!((viewport.min_z, viewport.max_z), (0.0, 1.0));
}

#[test]
fn dispatch_direct_and_register_packets() {
    let (mut decoder, queue, mut mem) = setup();
    let mut words = type3(opcode::SET_SH_REG, &[0x20C, 0x40, 0]);
    words.extend(type3(opcode::SET_UCONFIG_REG, &[0x242, 2]));
    words.extend(type3(opcode::DISPATCH_DIRECT, &[8, 4, 1, 1]));
    words.extend(type3(opcode::EVENT_WRITE_EOP, &[0, 0, 0, 0, 0]));
    words.extend(type3(opcode::DRAW_INDEX_AUTO, &[3, 0]));
    let len = write_words(&mut mem, 0x700, &words);

    decoder.process_command_buffer(&mem, 0x700, len).unwrap();

    assert_eq!(decoder.state().cs_shader, 0x4000);
    assert_eq!(decoder.state().primitive_type, 2);
    assert_eq!(
        queue.pop_all(),
        vec![
            RenderCommand::Dispatch {
                groups_x: 8,
                groups_y: 4,
                groups_z: 1,
            },
            RenderCommand::Draw {
                vertex_count: 3,
                instance_count: 1,
                primitive_type: 2,
            },
        ]
    );
    assert_eq!(decoder.stats().snapshot().dispatches, 1);
}

#[test]
fn clear_state_restores_defaults() {
    let (mut decoder, queue, mut mem) = setup();
    let mut words = type3(opcode::NUM_INSTANCES, &[9]);
    words.extend(type3(opcode::CLEAR_STATE, &[0]));
    words.extend(type3(opcode::DRAW_INDEX_AUTO, &[3, 0]));
    let len = write_words(&mut mem, 0x800, &words);

    decoder.process_command_buffer(&mem, 0x800, len).unwrap();
    assert_eq!(queue.pop_all(), vec![draw(3, 1)]);
}

#[test]
fn indirect_buffer_is_decoded_inline() {
    let (mut decoder, queue, mut mem) = setup();
    let nested_len = write_words(&mut mem, 0x4000, &type3(opcode::DRAW_INDEX_AUTO, &[10, 0]));

    let mut words = type3(opcode::DRAW_INDEX_AUTO, &[1, 0]);
    words.extend(type3(opcode::INDIRECT_BUFFER, &[0x4000, 0, nested_len]));
    words.extend(type3(opcode::DRAW_INDEX_AUTO, &[2, 0]));
    let len = write_words(&mut mem, 0x900, &words);

    decoder.process_command_buffer(&mem, 0x900, len).unwrap();
    assert_eq!(queue.pop_all(), vec![draw(1, 1), draw(10, 1), draw(2, 1)]);
}

#[test]
fn self_referencing_indirect_buffer_stops_at_depth_limit() {
    let (mut decoder, queue, mut mem) = setup();
    let mut words = type3(opcode::INDIRECT_BUFFER, &[0xA00, 0, 0]);
    words.extend(type3(opcode::DRAW_INDEX_AUTO, &[1, 0]));
    let len = words.len() as u32;
    words[3] = len;
    write_words(&mut mem, 0xA00, &words);

    decoder.process_command_buffer(&mem, 0xA00, len).unwrap();

    // The top-level buffer plus one draw per permitted nesting level.
    let draws = queue.pop_all();
    assert_eq!(draws.len(), DEFAULT_MAX_INDIRECT_DEPTH as usize + 1);
}

#[test]
fn buffer_outside_memory_reports_a_fault() {
    let (mut decoder, queue, mem) = setup();
    let err = decoder
        .process_command_buffer(&mem, MEM_SIZE - 2, 4)
        .unwrap_err();
    assert!(matches!(err, DecodeError::Memory(_)));
    assert!(queue.is_empty());
}

#[test]
fn cpu_syscall_submits_through_gnm_module() {
    let queue = Arc::new(RenderQueue::new());
    let module = GnmModule::new(Pm4Decoder::new(DecoderConfig::default(), Arc::clone(&queue)));
    let stats = module.stats();
    let mut dispatcher = SyscallDispatcher::new();
    dispatcher.install(module);

    let mut mem = GuestMemory::with_size(MEM_SIZE).unwrap();
    let len = write_words(&mut mem, 0x4000, &type3(opcode::DRAW_INDEX_AUTO, &[3, 0]));
    mem.write_u64(0x2000, 0x4000).unwrap();
    mem.write_u32(0x2010, len * 4).unwrap();

    #[rustfmt::skip]
    let program = [
        0x48, 0xC7, 0xC0, 0x4F, 0x02, 0x00, 0x00, // mov rax, 591
        0x48, 0xC7, 0xC7, 0x01, 0x00, 0x00, 0x00, // mov rdi, 1
        0x48, 0xC7, 0xC6, 0x00, 0x20, 0x00, 0x00, // mov rsi, 0x2000
        0x48, 0xC7, 0xC2, 0x10, 0x20, 0x00, 0x00, // mov rdx, 0x2010
        0x0F, 0x05,                               // syscall
        0x48, 0xC7, 0xC0, 0x66, 0x02, 0x00, 0x00, // mov rax, 614
        0x0F, 0x05,                               // syscall
        0xF4,                                     // hlt
    ];
    assert_eq!(SCE_GNM_SUBMIT_COMMAND_BUFFERS, 0x24F);
    assert_eq!(SCE_GNM_SUBMIT_DONE, 0x266);
    mem.write_block(0x1000, &program).unwrap();

    let mut cpu = Cpu::with_syscall_handler(dispatcher);
    cpu.context_mut().rip = 0x1000;
    while cpu.step(&mut mem) != 0 {}

    assert_eq!(cpu.state(), CpuState::Halted);
    assert_eq!(cpu.context().reg(Reg::Rax), 0);
    assert_eq!(queue.pop_all(), vec![draw(3, 1), RenderCommand::EndFrame]);
    assert_eq!(queue.frame_count(), 1);
    assert_eq!(stats.snapshot().draw_calls, 1);
}
