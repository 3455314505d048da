//! PM4 packet framing.
//!
//! Every packet starts with one little-endian header dword:
//!
//! ```text
//!  31 30 | 29 ........ 16 | 15 ..... 8 | 7 ....... 0
//!  type  |  count (N - 1) |   opcode   | shader type
//! ```
//!
//! Only type-3 packets carry an opcode. Type-0 packets are raw register writes with the same
//! count field; type-1 and type-2 packets are single-dword fillers.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Type0,
    Type1,
    Type2,
    Type3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHeader(pub u32);

impl PacketHeader {
    pub const fn parse(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn packet_type(self) -> PacketType {
        match self.0 >> 30 {
            0 => PacketType::Type0,
            1 => PacketType::Type1,
            2 => PacketType::Type2,
            _ => PacketType::Type3,
        }
    }

    /// Raw count field: payload dwords minus one.
    pub const fn count(self) -> u32 {
        (self.0 >> 16) & 0x3FFF
    }

    pub const fn opcode(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn shader_type(self) -> u8 {
        self.0 as u8
    }

    pub const fn payload_words(self) -> u32 {
        self.count() + 1
    }
}

/// Builds a type-3 header. `payload_words` must be in `1..=0x4000`.
pub const fn build_type3_header(opcode: u8, payload_words: u32, shader_type: u8) -> u32 {
    (3 << 30)
        | ((payload_words.wrapping_sub(1) & 0x3FFF) << 16)
        | ((opcode as u32) << 8)
        | shader_type as u32
}

pub mod opcode {
    pub const NOP: u8 = 0x10;
    pub const CLEAR_STATE: u8 = 0x12;
    pub const DISPATCH_DIRECT: u8 = 0x15;
    pub const DISPATCH_INDIRECT: u8 = 0x16;
    pub const DRAW_INDEX_2: u8 = 0x27;
    pub const CONTEXT_CONTROL: u8 = 0x28;
    pub const INDEX_TYPE: u8 = 0x2A;
    pub const DRAW_INDEX: u8 = 0x2B;
    pub const DRAW_INDEX_AUTO: u8 = 0x2D;
    pub const NUM_INSTANCES: u8 = 0x2F;
    pub const SET_BASE: u8 = 0x30;
    pub const STRMOUT_BUFFER_UPDATE: u8 = 0x34;
    pub const DRAW_INDEX_OFFSET_2: u8 = 0x35;
    pub const WRITE_DATA: u8 = 0x37;
    pub const DRAW_INDEX_INDIRECT: u8 = 0x38;
    pub const MEM_SEMAPHORE: u8 = 0x39;
    pub const WAIT_REG_MEM: u8 = 0x3C;
    pub const INDIRECT_BUFFER: u8 = 0x3F;
    pub const COPY_DATA: u8 = 0x40;
    pub const SURFACE_SYNC: u8 = 0x43;
    pub const EVENT_WRITE: u8 = 0x46;
    pub const EVENT_WRITE_EOP: u8 = 0x47;
    pub const EVENT_WRITE_EOS: u8 = 0x48;
    pub const RELEASE_MEM: u8 = 0x49;
    pub const DMA_DATA: u8 = 0x50;
    pub const ACQUIRE_MEM: u8 = 0x58;
    pub const SET_CONTEXT_REG: u8 = 0x69;
    pub const LOAD_CONTEXT_REG: u8 = 0x6A;
    pub const SET_SH_REG: u8 = 0x76;
    pub const LOAD_SH_REG: u8 = 0x77;
    pub const SET_UCONFIG_REG: u8 = 0x79;
}

pub fn opcode_name(op: u8) -> &'static str {
    match op {
        opcode::NOP => "NOP",
        opcode::CLEAR_STATE => "CLEAR_STATE",
        opcode::DISPATCH_DIRECT => "DISPATCH_DIRECT",
        opcode::DISPATCH_INDIRECT => "DISPATCH_INDIRECT",
        opcode::DRAW_INDEX_2 => "DRAW_INDEX_2",
        opcode::CONTEXT_CONTROL => "CONTEXT_CONTROL",
        opcode::INDEX_TYPE => "INDEX_TYPE",
        opcode::DRAW_INDEX => "DRAW_INDEX",
        opcode::DRAW_INDEX_AUTO => "DRAW_INDEX_AUTO",
        opcode::NUM_INSTANCES => "NUM_INSTANCES",
        opcode::SET_BASE => "SET_BASE",
        opcode::STRMOUT_BUFFER_UPDATE => "STRMOUT_BUFFER_UPDATE",
        opcode::DRAW_INDEX_OFFSET_2 => "DRAW_INDEX_OFFSET_2",
        opcode::WRITE_DATA => "WRITE_DATA",
        opcode::DRAW_INDEX_INDIRECT => "DRAW_INDEX_INDIRECT",
        opcode::MEM_SEMAPHORE => "MEM_SEMAPHORE",
        opcode::WAIT_REG_MEM => "WAIT_REG_MEM",
        opcode::INDIRECT_BUFFER => "INDIRECT_BUFFER",
        opcode::COPY_DATA => "COPY_DATA",
        opcode::SURFACE_SYNC => "SURFACE_SYNC",
        opcode::EVENT_WRITE => "EVENT_WRITE",
        opcode::EVENT_WRITE_EOP => "EVENT_WRITE_EOP",
        opcode::EVENT_WRITE_EOS => "EVENT_WRITE_EOS",
        opcode::RELEASE_MEM => "RELEASE_MEM",
        opcode::DMA_DATA => "DMA_DATA",
        opcode::ACQUIRE_MEM => "ACQUIRE_MEM",
        opcode::SET_CONTEXT_REG => "SET_CONTEXT_REG",
        opcode::LOAD_CONTEXT_REG => "LOAD_CONTEXT_REG",
        opcode::SET_SH_REG => "SET_SH_REG",
        opcode::LOAD_SH_REG => "LOAD_SH_REG",
        opcode::SET_UCONFIG_REG => "SET_UCONFIG_REG",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let raw = build_type3_header(opcode::DRAW_INDEX_AUTO, 2, 0);
        assert_eq!(raw, 0xC001_2D00);
        let h = PacketHeader::parse(raw);
        assert_eq!(h.packet_type(), PacketType::Type3);
        assert_eq!(h.count(), 1);
        assert_eq!(h.payload_words(), 2);
        assert_eq!(h.opcode(), opcode::DRAW_INDEX_AUTO);
        assert_eq!(h.shader_type(), 0);

        let h = PacketHeader::parse(build_type3_header(opcode::SET_SH_REG, 3, 1));
        assert_eq!(h.shader_type(), 1);
        assert_eq!(opcode_name(h.opcode()), "SET_SH_REG");
    }

    #[test]
    fn non_command_packet_types() {
        assert_eq!(PacketHeader::parse(0x0002_1234).packet_type(), PacketType::Type0);
        assert_eq!(PacketHeader::parse(0x4000_0000).packet_type(), PacketType::Type1);
        assert_eq!(PacketHeader::parse(0x8000_0000).packet_type(), PacketType::Type2);
        assert_eq!(opcode_name(0xEE), "UNKNOWN");
    }
}
