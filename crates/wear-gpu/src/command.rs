/// One normalized rendering or compute operation, ready for the presentation side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderCommand {
    Clear {
        color: [f32; 4],
        depth: f32,
        stencil: u32,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        primitive_type: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        index_address: u64,
        /// 0 = 16-bit indices, 1 = 32-bit.
        index_type: u32,
        primitive_type: u32,
    },
    Dispatch {
        groups_x: u32,
        groups_y: u32,
        groups_z: u32,
    },
    EndFrame,
}

impl RenderCommand {
    /// Opaque black, far depth.
    pub const CLEAR_BLACK: Self = Self::Clear {
        color: [0.0, 0.0, 0.0, 1.0],
        depth: 1.0,
        stencil: 0,
    };

    pub fn is_draw(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. })
    }
}
