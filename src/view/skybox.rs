use crate::material::{MaterialContext, MaterialError, MaterialSystem};
use crate::resources::TextureId;
use crate::shader::{InstanceId, ShaderId};

use super::{FrameInfo, Projection, RenderPacket, RenderView};

/// Vertices of the unit cube drawn as two triangles per face.
pub const SKYBOX_VERTEX_COUNT: u32 = 36;

const CUBE_SAMPLER: &str = "cube_texture";

/// Cube-mapped background drawn around the camera.
///
/// The skybox owns a single instance of its shader that holds the cube
/// texture.
#[derive(Debug)]
pub struct SkyboxView {
    projection: Projection,
    shader: ShaderId,
    instance: Option<InstanceId>,
    texture: TextureId,
    texture_name: String,
}

impl SkyboxView {
    pub fn new(
        shader_name: &str,
        texture_name: &str,
        projection: Projection,
        ctx: &mut MaterialContext<'_>,
    ) -> Result<Self, MaterialError> {
        let shader = match ctx.shaders.get_id(shader_name) {
            Some(id) => id,
            None => ctx
                .shaders
                .load(shader_name, &mut *ctx.backend, &**ctx.loader)?,
        };
        let texture = ctx.textures.acquire(texture_name, true)?;
        let instance = match ctx
            .shaders
            .require_mut(shader)
            .and_then(|s| s.acquire_instance_resources(&mut *ctx.backend))
        {
            Ok(instance) => instance,
            Err(e) => {
                ctx.textures.release(texture_name, &mut *ctx.backend);
                return Err(e.into());
            }
        };
        log::debug!("Skybox view created with shader '{shader_name}'");
        Ok(Self {
            projection,
            shader,
            instance: Some(instance),
            texture,
            texture_name: texture_name.to_string(),
        })
    }

    pub fn texture(&self) -> TextureId {
        self.texture
    }
}

impl RenderView for SkyboxView {
    fn name(&self) -> &str {
        "skybox"
    }

    fn on_resize(&mut self, width: u32, height: u32) {
        self.projection.resize(width, height);
    }

    fn render(
        &mut self,
        packet: &RenderPacket,
        frame: &FrameInfo,
        _materials: &mut MaterialSystem,
        ctx: &mut MaterialContext<'_>,
    ) -> Result<usize, MaterialError> {
        crate::profile_scope!("skybox_view");
        let Some(instance) = self.instance else {
            return Ok(0);
        };
        if !packet.draw_skybox {
            return Ok(0);
        }

        ctx.shaders.use_shader(self.shader, &mut *ctx.backend)?;
        let shader = ctx.shaders.require_mut(self.shader)?;
        let backend = &mut *ctx.backend;

        if shader.last_globals_frame() != Some(frame.frame_number) {
            shader.bind_globals();
            let projection = self.projection.matrix();
            let view = packet.camera.rotation_matrix();
            shader.set_uniform_by_name(backend, "projection", bytemuck::bytes_of(&projection))?;
            shader.set_uniform_by_name(backend, "view", bytemuck::bytes_of(&view))?;
            shader.apply_globals(backend)?;
            shader.set_last_globals_frame(frame.frame_number);
        }

        shader.bind_instance(instance)?;
        shader.set_sampler_by_name(CUBE_SAMPLER, ctx.textures.binding(self.texture))?;
        shader.apply_instance(backend)?;

        backend.draw(SKYBOX_VERTEX_COUNT, 1);
        Ok(1)
    }

    fn destroy(&mut self, ctx: &mut MaterialContext<'_>) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        if let Some(shader) = ctx.shaders.get_mut(self.shader) {
            if let Err(e) = shader.release_instance_resources(&mut *ctx.backend, instance) {
                log::error!("Failed to release skybox instance: {e}");
            }
        }
        ctx.textures.release(&self.texture_name, &mut *ctx.backend);
    }
}
