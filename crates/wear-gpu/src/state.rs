//! Decoder-owned GPU state, mutated by register and draw-parameter packets.

use rustc_hash::FxHashMap;

pub const MAX_COLOR_TARGETS: usize = 8;

pub const PRIMITIVE_TRIANGLE_LIST: u32 = 4;
pub const INDEX_TYPE_U16: u32 = 0;
pub const INDEX_TYPE_U32: u32 = 1;

/// Register offsets, relative to their bank, that are mirrored into typed state.
pub mod reg {
    // SH bank.
    pub const SPI_SHADER_PGM_LO_PS: u32 = 0x008;
    pub const SPI_SHADER_PGM_HI_PS: u32 = 0x009;
    pub const SPI_SHADER_PGM_LO_VS: u32 = 0x048;
    pub const SPI_SHADER_PGM_HI_VS: u32 = 0x049;
    pub const COMPUTE_PGM_LO: u32 = 0x20C;
    pub const COMPUTE_PGM_HI: u32 = 0x20D;

    // Context bank.
    pub const DB_Z_WRITE_BASE: u32 = 0x012;
    pub const CB_COLOR0_BASE: u32 = 0x318;
    pub const CB_COLOR0_INFO: u32 = 0x31C;
    pub const CB_COLOR_STRIDE: u32 = 0x0F;
    pub const PA_CL_VPORT_XSCALE: u32 = 0x10F;
    pub const PA_CL_VPORT_XOFFSET: u32 = 0x110;
    pub const PA_CL_VPORT_YSCALE: u32 = 0x111;
    pub const PA_CL_VPORT_YOFFSET: u32 = 0x112;
    pub const PA_CL_VPORT_ZSCALE: u32 = 0x113;
    pub const PA_CL_VPORT_ZOFFSET: u32 = 0x114;

    // Uconfig bank.
    pub const VGT_PRIMITIVE_TYPE: u32 = 0x242;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterBank {
    Context,
    Sh,
    Uconfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexBufferBinding {
    pub address: u64,
    pub size: u32,
    pub index_type: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorTarget {
    pub address: u64,
    pub format: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_z: f32,
    pub max_z: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 1920.0,
            height: 1080.0,
            min_z: 0.0,
            max_z: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuState {
    pub index_buffer: IndexBufferBinding,
    pub color_targets: [ColorTarget; MAX_COLOR_TARGETS],
    pub depth_target: u64,
    pub vs_shader: u64,
    pub ps_shader: u64,
    pub cs_shader: u64,
    pub primitive_type: u32,
    pub instance_count: u32,
    pub viewport: Viewport,
    context_regs: FxHashMap<u32, u32>,
    sh_regs: FxHashMap<u32, u32>,
    uconfig_regs: FxHashMap<u32, u32>,
}

impl Default for GpuState {
    fn default() -> Self {
        Self {
            index_buffer: IndexBufferBinding::default(),
            color_targets: [ColorTarget::default(); MAX_COLOR_TARGETS],
            depth_target: 0,
            vs_shader: 0,
            ps_shader: 0,
            cs_shader: 0,
            primitive_type: PRIMITIVE_TRIANGLE_LIST,
            instance_count: 1,
            viewport: Viewport::default(),
            context_regs: FxHashMap::default(),
            sh_regs: FxHashMap::default(),
            uconfig_regs: FxHashMap::default(),
        }
    }
}

/// Shader program registers hold bits 39:8 in LO and 47:40 in HI.
fn shader_address(lo: u32, hi: u32) -> u64 {
    (u64::from(lo) << 8) | (u64::from(hi & 0xFF) << 40)
}

impl GpuState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn bank(&self, bank: RegisterBank) -> &FxHashMap<u32, u32> {
        match bank {
            RegisterBank::Context => &self.context_regs,
            RegisterBank::Sh => &self.sh_regs,
            RegisterBank::Uconfig => &self.uconfig_regs,
        }
    }

    pub fn register(&self, bank: RegisterBank, offset: u32) -> Option<u32> {
        self.bank(bank).get(&offset).copied()
    }

    fn reg_or_zero(&self, bank: RegisterBank, offset: u32) -> u32 {
        self.register(bank, offset).unwrap_or(0)
    }

    /// Viewport registers hold IEEE floats; an unwritten one keeps the value implied by the
    /// current viewport.
    fn vport_reg(&self, offset: u32, current: f32) -> f32 {
        self.register(RegisterBank::Context, offset)
            .map_or(current, f32::from_bits)
    }

    /// Stores one register value and refreshes any typed field derived from it.
    pub fn set_register(&mut self, bank: RegisterBank, offset: u32, value: u32) {
        let regs = match bank {
            RegisterBank::Context => &mut self.context_regs,
            RegisterBank::Sh => &mut self.sh_regs,
            RegisterBank::Uconfig => &mut self.uconfig_regs,
        };
        regs.insert(offset, value);

        match (bank, offset) {
            (RegisterBank::Sh, reg::SPI_SHADER_PGM_LO_PS | reg::SPI_SHADER_PGM_HI_PS) => {
                self.ps_shader = shader_address(
                    self.reg_or_zero(bank, reg::SPI_SHADER_PGM_LO_PS),
                    self.reg_or_zero(bank, reg::SPI_SHADER_PGM_HI_PS),
                );
            }
            (RegisterBank::Sh, reg::SPI_SHADER_PGM_LO_VS | reg::SPI_SHADER_PGM_HI_VS) => {
                self.vs_shader = shader_address(
                    self.reg_or_zero(bank, reg::SPI_SHADER_PGM_LO_VS),
                    self.reg_or_zero(bank, reg::SPI_SHADER_PGM_HI_VS),
                );
            }
            (RegisterBank::Sh, reg::COMPUTE_PGM_LO | reg::COMPUTE_PGM_HI) => {
                self.cs_shader = shader_address(
                    self.reg_or_zero(bank, reg::COMPUTE_PGM_LO),
                    self.reg_or_zero(bank, reg::COMPUTE_PGM_HI),
                );
            }
            (RegisterBank::Context, reg::DB_Z_WRITE_BASE) => {
                self.depth_target = u64::from(value) << 8;
            }
            (RegisterBank::Context, offset)
                if (reg::CB_COLOR0_BASE
                    ..reg::CB_COLOR0_BASE + reg::CB_COLOR_STRIDE * MAX_COLOR_TARGETS as u32)
                    .contains(&offset) =>
            {
                let slot = ((offset - reg::CB_COLOR0_BASE) / reg::CB_COLOR_STRIDE) as usize;
                match (offset - reg::CB_COLOR0_BASE) % reg::CB_COLOR_STRIDE {
                    0 => self.color_targets[slot].address = u64::from(value) << 8,
                    n if n == reg::CB_COLOR0_INFO - reg::CB_COLOR0_BASE => {
                        self.color_targets[slot].format = value;
                    }
                    _ => {}
                }
            }
            (RegisterBank::Context, reg::PA_CL_VPORT_XSCALE | reg::PA_CL_VPORT_XOFFSET) => {
                let half = self.viewport.width / 2.0;
                let scale = self.vport_reg(reg::PA_CL_VPORT_XSCALE, half);
                let offset = self.vport_reg(reg::PA_CL_VPORT_XOFFSET, self.viewport.x + half);
                self.viewport.x = offset - scale;
                self.viewport.width = scale * 2.0;
            }
            (RegisterBank::Context, reg::PA_CL_VPORT_YSCALE | reg::PA_CL_VPORT_YOFFSET) => {
                let half = self.viewport.height / 2.0;
                let scale = self.vport_reg(reg::PA_CL_VPORT_YSCALE, half);
                let offset = self.vport_reg(reg::PA_CL_VPORT_YOFFSET, self.viewport.y + half);
                self.viewport.y = offset - scale;
                self.viewport.height = scale * 2.0;
            }
            (RegisterBank::Context, reg::PA_CL_VPORT_ZSCALE | reg::PA_CL_VPORT_ZOFFSET) => {
                let range = self.viewport.max_z - self.viewport.min_z;
                let scale = self.vport_reg(reg::PA_CL_VPORT_ZSCALE, range);
                let offset = self.vport_reg(reg::PA_CL_VPORT_ZOFFSET, self.viewport.min_z);
                self.viewport.min_z = offset;
                self.viewport.max_z = offset + scale;
            }
            (RegisterBank::Uconfig, reg::VGT_PRIMITIVE_TYPE) => self.primitive_type = value,
            _ => {}
        }
    }
}
