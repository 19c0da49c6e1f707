//! Material system integration tests, driven through the renderer on the
//! null backend.

mod common;

use std::time::{Duration, Instant};

use glam::Vec4;

use common::{null_backend, null_renderer, renderer_config};
use lumen_engine::backend::{BindingResource, BindingSlot};
use lumen_engine::material::DEFAULT_MATERIAL_NAME;
use lumen_engine::{
    GeometryRenderData, MaterialConfig, MaterialError, MaterialKind, RenderPacket, Renderer,
    ResourceError, ShaderError,
};

fn poll_until(renderer: &mut Renderer, mut done: impl FnMut(&Renderer) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        renderer.poll();
        if done(renderer) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_default_material_is_built_in() {
    let renderer = null_renderer(renderer_config(8));
    let materials = renderer.materials();
    let id = materials.get(DEFAULT_MATERIAL_NAME).unwrap();
    assert_eq!(id, materials.default_material());

    let material = materials.material(id).unwrap();
    assert_eq!(material.kind, MaterialKind::Standard);
    assert!(!material.auto_release());
    assert_eq!(
        renderer.shaders().get(material.shader).unwrap().name(),
        "builtin.world"
    );
}

#[test]
fn test_acquire_and_release_by_name() {
    let mut renderer = null_renderer(renderer_config(8));
    let a = renderer.acquire_material("brick").unwrap();
    let b = renderer.acquire_material("brick").unwrap();
    assert_eq!(a, b);

    let material = renderer.materials().material(a).unwrap();
    assert_eq!(material.ref_count(), 2);
    assert_eq!(material.diffuse_colour, Vec4::new(0.8, 0.3, 0.2, 1.0));
    assert_eq!(material.shininess, 8.0);
    let shader = material.shader;
    let instances = renderer.shaders().get(shader).unwrap().instance_count();

    renderer.release_material("brick").unwrap();
    assert!(renderer.materials().get("brick").is_some());
    renderer.release_material("brick").unwrap();
    assert!(renderer.materials().get("brick").is_none());
    assert_eq!(
        renderer.shaders().get(shader).unwrap().instance_count(),
        instances - 1
    );

    assert!(matches!(
        renderer.release_material("brick"),
        Err(MaterialError::UnknownMaterial(_))
    ));
}

#[test]
fn test_default_material_cannot_be_released() {
    let mut renderer = null_renderer(renderer_config(8));
    renderer.release_material(DEFAULT_MATERIAL_NAME).unwrap();
    renderer.release_material(DEFAULT_MATERIAL_NAME).unwrap();
    assert!(renderer.materials().get(DEFAULT_MATERIAL_NAME).is_some());
}

#[test]
fn test_missing_material_file() {
    let mut renderer = null_renderer(renderer_config(8));
    assert!(matches!(
        renderer.acquire_material("does_not_exist"),
        Err(MaterialError::Resource(ResourceError::NotFound { .. }))
    ));
    assert!(renderer.materials().get("does_not_exist").is_none());
}

#[test]
fn test_kept_material_survives_zero_references() {
    let mut renderer = null_renderer(renderer_config(8));
    let config = MaterialConfig::new("pinned", MaterialKind::Standard).with_auto_release(false);
    let id = renderer.acquire_material_from_config(&config).unwrap();
    renderer.release_material("pinned").unwrap();

    assert_eq!(renderer.materials().get("pinned"), Some(id));
    assert_eq!(renderer.materials().material(id).unwrap().ref_count(), 0);
}

#[test]
fn test_instance_exhaustion_is_reported() {
    // The default material already holds one of the two world instances.
    let mut renderer = null_renderer(renderer_config(2));
    renderer
        .acquire_material_from_config(&MaterialConfig::new("one", MaterialKind::Standard))
        .unwrap();
    let err = renderer
        .acquire_material_from_config(&MaterialConfig::new("two", MaterialKind::Standard))
        .unwrap_err();

    assert!(matches!(
        err,
        MaterialError::Shader(ShaderError::NoInstancesAvailable { max: 2, .. })
    ));
    assert!(renderer.materials().get("two").is_none());
}

// ============================================================================
// Families
// ============================================================================

#[test]
fn test_ui_material_uses_ui_shader() {
    let mut renderer = null_renderer(renderer_config(8));
    let id = renderer.acquire_material("panel").unwrap();
    let material = renderer.materials().material(id).unwrap();

    assert_eq!(material.kind, MaterialKind::Ui);
    assert_eq!(
        renderer.shaders().get(material.shader).unwrap().name(),
        "builtin.ui"
    );
    assert_eq!(material.maps.len(), 1);
    assert_eq!(material.maps[0].sampler, "diffuse_texture");
    assert_eq!(material.maps[0].texture, renderer.textures().default_texture());
}

#[test]
fn test_terrain_layers_map_to_indexed_samplers() {
    let mut renderer = null_renderer(renderer_config(8));
    let id = renderer.acquire_material("valley").unwrap();
    let material = renderer.materials().material(id).unwrap();

    assert_eq!(material.kind, MaterialKind::Terrain);
    assert_eq!(material.layer_shininess, vec![4.0, 12.0]);
    let samplers: Vec<&str> = material.maps.iter().map(|m| m.sampler.as_str()).collect();
    assert_eq!(samplers, vec!["diffuse_texture_0", "diffuse_texture_1"]);
    assert!(renderer.textures().find("grass").is_some());
    assert_eq!(material.maps[1].texture, renderer.textures().default_texture());
}

#[test]
fn test_terrain_uniforms_written_on_first_draw() {
    let mut renderer = null_renderer(renderer_config(8));
    let id = renderer.acquire_material("valley").unwrap();

    let mut packet = RenderPacket::default();
    packet.world.push(GeometryRenderData::new(id, glam::Mat4::IDENTITY, 6));
    assert_eq!(renderer.draw_frame(&packet).unwrap(), 1);

    let material = renderer.materials().material(id).unwrap();
    assert_eq!(material.render_frame, Some(0));
    let shader = renderer.shaders().get(material.shader).unwrap();
    let offset = shader.instance(material.instance).unwrap().offset();
    let buffer = shader.uniform_buffer().unwrap();
    let bytes = null_backend(&renderer).read_buffer(buffer, offset, 12).unwrap();

    let layer_count: i32 = bytemuck::pod_read_unaligned(&bytes[0..4]);
    let shininess: [f32; 2] = bytemuck::pod_read_unaligned(&bytes[4..12]);
    assert_eq!(layer_count, 2);
    assert_eq!(shininess, [4.0, 12.0]);
}

// ============================================================================
// Textures
// ============================================================================

#[test]
fn test_loaded_texture_replaces_placeholder_binding() {
    let mut renderer = null_renderer(renderer_config(8));
    let id = renderer.acquire_material("textured_brick").unwrap();
    let texture = renderer.materials().material(id).unwrap().maps[0].texture;
    assert_eq!(renderer.textures().get(texture).unwrap().generation, 0);

    assert!(poll_until(&mut renderer, |r| {
        r.textures().get(texture).map_or(false, |t| t.generation > 0)
    }));
    let loaded = renderer.textures().get(texture).unwrap();
    assert_eq!((loaded.width, loaded.height), (4, 4));
    let handle = loaded.handle();

    let mut packet = RenderPacket::default();
    packet.world.push(GeometryRenderData::new(id, glam::Mat4::IDENTITY, 36));
    renderer.draw_frame(&packet).unwrap();

    let material = renderer.materials().material(id).unwrap();
    let shader = renderer.shaders().get(material.shader).unwrap();
    let set = shader.instance(material.instance).unwrap().binding_set(0).unwrap();
    assert_eq!(
        null_backend(&renderer).binding(set, BindingSlot::new(1, 0)),
        Some(BindingResource::Texture(handle))
    );
}

#[test]
fn test_release_drops_material_textures() {
    let mut renderer = null_renderer(renderer_config(8));
    renderer.acquire_material("textured_brick").unwrap();
    assert!(renderer.textures().find("brick_diffuse").is_some());

    renderer.release_material("textured_brick").unwrap();
    assert!(renderer.textures().find("brick_diffuse").is_none());
}
