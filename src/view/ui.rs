use glam::{Mat4, Vec3};

use crate::material::{GlobalUniforms, MaterialContext, MaterialError, MaterialSystem};

use super::{draw_geometries, FrameInfo, Projection, RenderPacket, RenderView};

/// Screen-space view for UI geometry. Coordinates are in pixels.
#[derive(Debug)]
pub struct UiView {
    projection: Projection,
}

impl UiView {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            projection: Projection::screen(width.max(1) as f32, height.max(1) as f32),
        }
    }
}

impl RenderView for UiView {
    fn name(&self) -> &str {
        "ui"
    }

    fn on_resize(&mut self, width: u32, height: u32) {
        self.projection.resize(width, height);
    }

    fn render(
        &mut self,
        packet: &RenderPacket,
        frame: &FrameInfo,
        materials: &mut MaterialSystem,
        ctx: &mut MaterialContext<'_>,
    ) -> Result<usize, MaterialError> {
        crate::profile_scope!("ui_view");
        let globals = GlobalUniforms {
            projection: self.projection.matrix(),
            view: Mat4::IDENTITY,
            ambient_colour: packet.ambient_colour,
            view_position: Vec3::ZERO,
            mode: packet.mode,
        };
        Ok(draw_geometries(
            self.name(),
            &packet.ui,
            &globals,
            frame,
            materials,
            ctx,
        ))
    }
}
