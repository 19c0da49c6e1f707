//! Render views
//!
//! A view turns its part of a [`RenderPacket`] into draw calls. Every draw
//! binds in the same order: shader globals, material instance, local push
//! constants, then the draw itself. A draw whose binding fails is skipped and
//! logged; the rest of the frame continues.

pub mod camera;
mod renderer;
mod skybox;
mod ui;
mod world;

pub use camera::{Camera, Projection};
pub use renderer::{Backend, Renderer, RendererError};
pub use skybox::{SkyboxView, SKYBOX_VERTEX_COUNT};
pub use ui::UiView;
pub use world::WorldView;

use glam::{Mat4, Vec4};

use crate::material::{
    GlobalUniforms, MaterialContext, MaterialError, MaterialId, MaterialSystem, RenderMode,
};

/// One draw: a material, its model matrix and the vertices to draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryRenderData {
    pub material: MaterialId,
    pub model: Mat4,
    pub vertex_count: u32,
}

impl GeometryRenderData {
    pub fn new(material: MaterialId, model: Mat4, vertex_count: u32) -> Self {
        Self {
            material,
            model,
            vertex_count,
        }
    }
}

/// Everything the views need to draw one frame.
#[derive(Debug, Clone)]
pub struct RenderPacket {
    pub delta_time: f32,
    pub camera: Camera,
    pub ambient_colour: Vec4,
    pub mode: RenderMode,
    pub world: Vec<GeometryRenderData>,
    pub ui: Vec<GeometryRenderData>,
    pub draw_skybox: bool,
}

impl Default for RenderPacket {
    fn default() -> Self {
        Self {
            delta_time: 0.0,
            camera: Camera::default(),
            ambient_colour: GlobalUniforms::default().ambient_colour,
            mode: RenderMode::Default,
            world: Vec::new(),
            ui: Vec::new(),
            draw_skybox: true,
        }
    }
}

/// Per-frame counters handed to every view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_number: u64,
    pub frame_slot: usize,
}

pub trait RenderView {
    fn name(&self) -> &str;

    fn on_resize(&mut self, width: u32, height: u32);

    /// Record this view's draws. Returns the number of draws issued.
    fn render(
        &mut self,
        packet: &RenderPacket,
        frame: &FrameInfo,
        materials: &mut MaterialSystem,
        ctx: &mut MaterialContext<'_>,
    ) -> Result<usize, MaterialError>;

    /// Release resources the view owns.
    fn destroy(&mut self, _ctx: &mut MaterialContext<'_>) {}
}

/// Draw each geometry with its material, skipping the ones that fail.
pub(crate) fn draw_geometries(
    view: &str,
    geometries: &[GeometryRenderData],
    globals: &GlobalUniforms,
    frame: &FrameInfo,
    materials: &mut MaterialSystem,
    ctx: &mut MaterialContext<'_>,
) -> usize {
    let mut drawn = 0;
    for geometry in geometries {
        match draw_geometry(geometry, globals, frame, materials, ctx) {
            Ok(()) => drawn += 1,
            Err(e) => log::warn!("{view}: skipping draw of {:?}: {e}", geometry.material),
        }
    }
    drawn
}

fn draw_geometry(
    geometry: &GeometryRenderData,
    globals: &GlobalUniforms,
    frame: &FrameInfo,
    materials: &mut MaterialSystem,
    ctx: &mut MaterialContext<'_>,
) -> Result<(), MaterialError> {
    let material = materials
        .material(geometry.material)
        .ok_or(MaterialError::InvalidMaterial(geometry.material))?;
    let shader = material.shader;
    let needs_update = material.render_frame != Some(frame.frame_number);

    ctx.shaders.use_shader(shader, &mut *ctx.backend)?;
    materials.apply_global(shader, frame.frame_number, globals, ctx)?;
    materials.apply_instance(geometry.material, needs_update, ctx)?;
    materials.apply_local(geometry.material, &geometry.model, ctx)?;
    if needs_update {
        materials.mark_rendered(geometry.material, frame.frame_number);
    }

    ctx.backend.draw(geometry.vertex_count, 1);
    Ok(())
}
