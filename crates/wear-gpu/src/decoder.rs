//! PM4 command-buffer decoder.
//!
//! Walks a buffer of packets in guest memory, folds register and draw-parameter packets into
//! [`GpuState`], and turns draw and dispatch packets into [`RenderCommand`]s on the shared
//! [`RenderQueue`]. It never talks to a graphics API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wear_mem::{GuestMemory, MemoryFault, MemoryResult};

use crate::command::RenderCommand;
use crate::pm4::{opcode, opcode_name, PacketHeader, PacketType};
use crate::queue::RenderQueue;
use crate::state::{GpuState, RegisterBank, INDEX_TYPE_U32};

pub const DEFAULT_MAX_INDIRECT_DEPTH: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// How many `INDIRECT_BUFFER` levels may nest below a submitted buffer. Deeper references
    /// are logged and skipped.
    pub max_indirect_depth: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_indirect_depth: DEFAULT_MAX_INDIRECT_DEPTH,
        }
    }
}

/// Why decoding of one buffer stopped early. Never fatal to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("packet at dword {offset} declares {declared} payload dwords but only {remaining} remain")]
    PacketOverflow {
        offset: u32,
        declared: u32,
        remaining: u32,
    },
    #[error("indirect buffer at {addr:#x} exceeds the nesting limit of {max}")]
    NestingTooDeep { addr: u64, max: u32 },
    #[error(transparent)]
    Memory(#[from] MemoryFault),
}

/// Decoder counters, readable from any thread.
#[derive(Debug, Default)]
pub struct DecoderStats {
    packets: AtomicU64,
    draws: AtomicU64,
    dispatches: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStatsSnapshot {
    pub packets_processed: u64,
    pub draw_calls: u64,
    pub dispatches: u64,
}

impl DecoderStats {
    pub fn snapshot(&self) -> DecoderStatsSnapshot {
        DecoderStatsSnapshot {
            packets_processed: self.packets.load(Ordering::Relaxed),
            draw_calls: self.draws.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.packets.store(0, Ordering::Relaxed);
        self.draws.store(0, Ordering::Relaxed);
        self.dispatches.store(0, Ordering::Relaxed);
    }
}

fn dword_addr(base: u64, index: u32) -> u64 {
    base.wrapping_add(u64::from(index) * 4)
}

fn read_dwords(mem: &GuestMemory, base: u64, index: u32, count: u32) -> MemoryResult<Vec<u32>> {
    let bytes = mem.physical_slice(dword_addr(base, index), count as usize * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

pub struct Pm4Decoder {
    config: DecoderConfig,
    state: GpuState,
    queue: Arc<RenderQueue>,
    stats: Arc<DecoderStats>,
}

impl Pm4Decoder {
    pub fn new(config: DecoderConfig, queue: Arc<RenderQueue>) -> Self {
        Self {
            config,
            state: GpuState::default(),
            queue,
            stats: Arc::default(),
        }
    }

    pub fn state(&self) -> &GpuState {
        &self.state
    }

    pub fn queue(&self) -> &Arc<RenderQueue> {
        &self.queue
    }

    pub fn stats(&self) -> Arc<DecoderStats> {
        Arc::clone(&self.stats)
    }

    /// Decodes every buffer of one submission in order. `buffers` points at `count` 64-bit
    /// buffer addresses and `sizes` at `count` 32-bit byte sizes.
    ///
    /// A buffer that fails to decode is logged and skipped; only a fault while reading the two
    /// arrays themselves is returned.
    pub fn submit(
        &mut self,
        mem: &GuestMemory,
        count: u32,
        buffers: u64,
        sizes: u64,
    ) -> MemoryResult<()> {
        tracing::debug!(count, "submit command buffers");
        for i in 0..u64::from(count) {
            let addr = mem.read_u64(buffers.wrapping_add(i * 8))?;
            let size_bytes = mem.read_u32(sizes.wrapping_add(i * 4))?;
            tracing::trace!(
                buffer = i,
                addr = format_args!("{addr:#x}"),
                dwords = size_bytes / 4,
                "command buffer"
            );
            if let Err(err) = self.process_command_buffer(mem, addr, size_bytes / 4) {
                tracing::warn!(
                    buffer = i,
                    addr = format_args!("{addr:#x}"),
                    error = %err,
                    "command buffer aborted"
                );
            }
        }
        Ok(())
    }

    /// Decodes one buffer of `size_dwords` dwords at `addr`.
    ///
    /// Packets before an error have already taken effect; nothing after it is decoded.
    pub fn process_command_buffer(
        &mut self,
        mem: &GuestMemory,
        addr: u64,
        size_dwords: u32,
    ) -> Result<(), DecodeError> {
        self.decode(mem, addr, size_dwords, 0)
    }

    fn decode(
        &mut self,
        mem: &GuestMemory,
        base: u64,
        size: u32,
        depth: u32,
    ) -> Result<(), DecodeError> {
        let mut offset = 0u32;
        while offset < size {
            let header = PacketHeader::parse(mem.read_u32(dword_addr(base, offset))?);
            let remaining = size - offset - 1;

            match header.packet_type() {
                PacketType::Type1 | PacketType::Type2 => {
                    offset += 1;
                    self.stats.packets.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                PacketType::Type0 | PacketType::Type3 => {}
            }

            let declared = header.payload_words();
            if declared > remaining {
                tracing::warn!(
                    offset,
                    declared,
                    remaining,
                    opcode = opcode_name(header.opcode()),
                    "PM4 packet overflows its buffer"
                );
                return Err(DecodeError::PacketOverflow {
                    offset,
                    declared,
                    remaining,
                });
            }

            if header.packet_type() == PacketType::Type3 {
                let payload = read_dwords(mem, base, offset + 1, declared)?;
                self.execute(mem, header.opcode(), &payload, depth);
            } else {
                tracing::trace!(offset, dwords = declared, "skipping type-0 register write");
            }

            offset += 1 + declared;
            self.stats.packets.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn execute(&mut self, mem: &GuestMemory, op: u8, p: &[u32], depth: u32) {
        tracing::trace!(opcode = opcode_name(op), words = p.len(), "PM4 packet");
        match op {
            opcode::NOP => {}
            opcode::CLEAR_STATE => self.state.reset(),
            opcode::SET_CONTEXT_REG => self.set_registers(RegisterBank::Context, p),
            opcode::SET_SH_REG => self.set_registers(RegisterBank::Sh, p),
            opcode::SET_UCONFIG_REG => self.set_registers(RegisterBank::Uconfig, p),
            opcode::INDEX_TYPE => {
                if let [index_type, ..] = *p {
                    self.state.index_buffer.index_type = index_type & 0x3;
                }
            }
            opcode::NUM_INSTANCES => {
                if let [instances, ..] = *p {
                    self.state.instance_count = instances;
                }
            }
            opcode::DRAW_INDEX_AUTO => {
                // Second dword is the draw initiator, which carries nothing we model.
                if let [vertex_count, _initiator, ..] = *p {
                    tracing::debug!(
                        vertex_count,
                        instances = self.state.instance_count,
                        "draw auto"
                    );
                    self.push_draw(RenderCommand::Draw {
                        vertex_count,
                        instance_count: self.state.instance_count,
                        primitive_type: self.state.primitive_type,
                    });
                }
            }
            opcode::DRAW_INDEX_2 => {
                if let [max_size, lo, hi, index_count, ..] = *p {
                    let index_address = u64::from(lo) | (u64::from(hi) << 32);
                    self.state.index_buffer.address = index_address;
                    self.state.index_buffer.size = max_size;
                    self.push_indexed(index_count, index_address);
                }
            }
            opcode::DRAW_INDEX_OFFSET_2 => {
                if let [_max_size, first_index, index_count, ..] = *p {
                    let stride = if self.state.index_buffer.index_type == INDEX_TYPE_U32 {
                        4
                    } else {
                        2
                    };
                    let index_address = self
                        .state
                        .index_buffer
                        .address
                        .wrapping_add(u64::from(first_index) * stride);
                    self.push_indexed(index_count, index_address);
                }
            }
            opcode::DISPATCH_DIRECT => {
                if let [groups_x, groups_y, groups_z, ..] = *p {
                    tracing::debug!(groups_x, groups_y, groups_z, "dispatch direct");
                    self.queue.push(RenderCommand::Dispatch {
                        groups_x,
                        groups_y,
                        groups_z,
                    });
                    self.stats.dispatches.fetch_add(1, Ordering::Relaxed);
                }
            }
            opcode::INDIRECT_BUFFER => {
                if let [lo, hi, control, ..] = *p {
                    let addr = u64::from(lo) | (u64::from(hi & 0xFFFF) << 32);
                    self.indirect(mem, addr, control & 0xF_FFFF, depth);
                }
            }
            opcode::EVENT_WRITE
            | opcode::EVENT_WRITE_EOP
            | opcode::EVENT_WRITE_EOS
            | opcode::RELEASE_MEM
            | opcode::ACQUIRE_MEM
            | opcode::SURFACE_SYNC
            | opcode::WAIT_REG_MEM
            | opcode::CONTEXT_CONTROL => {
                tracing::trace!(opcode = opcode_name(op), "sync packet acknowledged");
            }
            _ if opcode_name(op) != "UNKNOWN" => {
                tracing::debug!(opcode = opcode_name(op), "PM4 packet not modeled, skipped");
            }
            _ => {
                tracing::warn!(
                    opcode = format_args!("{op:#04x}"),
                    "unrecognized PM4 opcode, skipped"
                );
            }
        }
    }

    fn set_registers(&mut self, bank: RegisterBank, p: &[u32]) {
        let Some((&first, values)) = p.split_first() else {
            return;
        };
        let start = first & 0xFFFF;
        for (i, &value) in values.iter().enumerate() {
            let offset = start.wrapping_add(i as u32);
            tracing::trace!(
                ?bank,
                reg = format_args!("{offset:#06x}"),
                value = format_args!("{value:#010x}"),
                "set register"
            );
            self.state.set_register(bank, offset, value);
        }
    }

    fn push_draw(&mut self, cmd: RenderCommand) {
        self.queue.push(cmd);
        self.stats.draws.fetch_add(1, Ordering::Relaxed);
    }

    fn push_indexed(&mut self, index_count: u32, index_address: u64) {
        tracing::debug!(
            index_count,
            index_address = format_args!("{index_address:#x}"),
            "draw indexed"
        );
        self.push_draw(RenderCommand::DrawIndexed {
            index_count,
            instance_count: self.state.instance_count,
            index_address,
            index_type: self.state.index_buffer.index_type,
            primitive_type: self.state.primitive_type,
        });
    }

    fn indirect(&mut self, mem: &GuestMemory, addr: u64, size: u32, depth: u32) {
        if depth >= self.config.max_indirect_depth {
            let err = DecodeError::NestingTooDeep {
                addr,
                max: self.config.max_indirect_depth,
            };
            tracing::warn!(error = %err, "indirect buffer skipped");
            return;
        }
        tracing::debug!(
            addr = format_args!("{addr:#x}"),
            dwords = size,
            depth,
            "indirect buffer"
        );
        if let Err(err) = self.decode(mem, addr, size, depth + 1) {
            tracing::warn!(
                addr = format_args!("{addr:#x}"),
                error = %err,
                "indirect buffer aborted"
            );
        }
    }
}
