use glam::Mat4;

use crate::material::{GlobalUniforms, MaterialContext, MaterialError, MaterialSystem};

use super::{draw_geometries, FrameInfo, Projection, RenderPacket, RenderView};

/// Perspective view of the world geometry.
#[derive(Debug)]
pub struct WorldView {
    projection: Projection,
}

impl WorldView {
    pub fn new(fov_y_degrees: f32, width: u32, height: u32, near: f32, far: f32) -> Self {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        Self {
            projection: Projection::perspective(fov_y_degrees, aspect, near, far),
        }
    }

    pub fn projection(&self) -> Mat4 {
        self.projection.matrix()
    }
}

impl RenderView for WorldView {
    fn name(&self) -> &str {
        "world"
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
        crate::profile_scope!("world_view");
        let globals = GlobalUniforms {
            projection: self.projection.matrix(),
            view: packet.camera.view_matrix(),
            ambient_colour: packet.ambient_colour,
            view_position: packet.camera.position,
            mode: packet.mode,
        };
        Ok(draw_geometries(
            self.name(),
            &packet.world,
            &globals,
            frame,
            materials,
            ctx,
        ))
    }
}
