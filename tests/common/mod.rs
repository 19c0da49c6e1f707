//! Shared fixtures for the integration tests.
//!
//! Everything runs on the [`NullBackend`] with resources served from a
//! [`MemoryLoader`], so no GPU or asset directory is needed.

#![allow(dead_code)]

use std::sync::Arc;

use lumen_engine::backend::ShaderStage;
use lumen_engine::shader::{Shader, ShaderLimits};
use lumen_engine::{
    Backend, JobSystemConfig, JobType, MemoryLoader, NullBackend, Renderer, RendererConfig,
    ResourceLoader, ResourceType,
};

pub const WORLD_SHADER: &str = r#"
    name = "builtin.world"
    use_instances = true
    use_local = true
    stages = [
        { stage = "vertex", file = "world.vert.spv" },
        { stage = "fragment", file = "world.frag.spv" },
    ]
    attributes = [
        { name = "in_position", type = "vec3" },
        { name = "in_texcoord", type = "vec2" },
    ]
    uniforms = [
        { name = "projection", type = "mat4", scope = "global" },
        { name = "view", type = "mat4", scope = "global" },
        { name = "ambient_colour", type = "vec4", scope = "global" },
        { name = "diffuse_colour", type = "vec4", scope = "instance" },
        { name = "shininess", type = "f32", scope = "instance" },
        { name = "diffuse_texture", type = "sampler", scope = "instance" },
        { name = "model", type = "mat4", scope = "local" },
    ]
"#;

pub const UI_SHADER: &str = r#"
    name = "builtin.ui"
    use_instances = true
    use_local = true
    stages = [
        { stage = "vertex", file = "ui.vert.spv" },
        { stage = "fragment", file = "ui.frag.spv" },
    ]
    attributes = [
        { name = "in_position", type = "vec2" },
        { name = "in_texcoord", type = "vec2" },
    ]
    uniforms = [
        { name = "projection", type = "mat4", scope = "global" },
        { name = "view", type = "mat4", scope = "global" },
        { name = "diffuse_colour", type = "vec4", scope = "instance" },
        { name = "diffuse_texture", type = "sampler", scope = "instance" },
        { name = "model", type = "mat4", scope = "local" },
    ]
"#;

pub const SKYBOX_SHADER: &str = r#"
    name = "builtin.skybox"
    use_instances = true
    stages = [
        { stage = "vertex", file = "skybox.vert.spv" },
        { stage = "fragment", file = "skybox.frag.spv" },
    ]
    attributes = [{ name = "in_position", type = "vec3" }]
    uniforms = [
        { name = "projection", type = "mat4", scope = "global" },
        { name = "view", type = "mat4", scope = "global" },
        { name = "cube_texture", type = "sampler", scope = "instance" },
    ]
"#;

pub const TERRAIN_SHADER: &str = r#"
    name = "builtin.terrain"
    use_instances = true
    use_local = true
    stages = [
        { stage = "vertex", file = "terrain.vert.spv" },
        { stage = "fragment", file = "terrain.frag.spv" },
    ]
    attributes = [{ name = "in_position", type = "vec3" }]
    uniforms = [
        { name = "projection", type = "mat4", scope = "global" },
        { name = "view", type = "mat4", scope = "global" },
        { name = "layer_count", type = "i32", scope = "instance" },
        { name = "shininess_0", type = "f32", scope = "instance" },
        { name = "shininess_1", type = "f32", scope = "instance" },
        { name = "diffuse_texture_0", type = "sampler", scope = "instance" },
        { name = "diffuse_texture_1", type = "sampler", scope = "instance" },
        { name = "model", type = "mat4", scope = "local" },
    ]
"#;

/// PNG of a single solid colour.
pub fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png");
    bytes
}

/// Loader holding the builtin shaders, their bytecode and a few materials.
pub fn memory_loader() -> MemoryLoader {
    let loader = MemoryLoader::new();
    for file in [
        "world.vert.spv",
        "world.frag.spv",
        "ui.vert.spv",
        "ui.frag.spv",
        "skybox.vert.spv",
        "skybox.frag.spv",
        "terrain.vert.spv",
        "terrain.frag.spv",
        "test.vert.spv",
        "test.frag.spv",
    ] {
        loader.insert(ResourceType::ShaderBytecode, file, vec![0x03, 0x02, 0x23, 0x07]);
    }
    loader.insert_text(ResourceType::ShaderConfig, "builtin.world", WORLD_SHADER);
    loader.insert_text(ResourceType::ShaderConfig, "builtin.ui", UI_SHADER);
    loader.insert_text(ResourceType::ShaderConfig, "builtin.skybox", SKYBOX_SHADER);
    loader.insert_text(ResourceType::ShaderConfig, "builtin.terrain", TERRAIN_SHADER);
    loader.insert(ResourceType::Image, "brick_diffuse", solid_png(4, 4, [200, 80, 40, 255]));
    loader.insert_text(
        ResourceType::MaterialConfig,
        "brick",
        r#"
        diffuse_colour = [0.8, 0.3, 0.2, 1.0]
        shininess = 8.0
        "#,
    );
    loader.insert_text(
        ResourceType::MaterialConfig,
        "textured_brick",
        r#"
        diffuse_map = "brick_diffuse"
        "#,
    );
    loader.insert_text(
        ResourceType::MaterialConfig,
        "valley",
        r#"
        kind = "terrain"
        layers = [
            { diffuse_map = "grass", shininess = 4.0 },
            { shininess = 12.0 },
        ]
        "#,
    );
    loader.insert_text(
        ResourceType::MaterialConfig,
        "panel",
        r#"
        kind = "ui"
        diffuse_colour = [0.1, 0.1, 0.1, 0.9]
        "#,
    );
    loader
}

pub fn shared_loader() -> Arc<dyn ResourceLoader> {
    Arc::new(memory_loader())
}

/// Two-stage shader named "test" reading `test.*.spv`.
pub fn test_shader(use_instances: bool, use_local: bool, max_instances: usize) -> Shader {
    let limits = ShaderLimits {
        max_instances,
        ..Default::default()
    };
    let mut shader = Shader::new("test", use_instances, use_local, limits);
    shader
        .add_stage(ShaderStage::Vertex, "test.vert.spv")
        .expect("vertex stage");
    shader
        .add_stage(ShaderStage::Fragment, "test.frag.spv")
        .expect("fragment stage");
    shader
}

/// Renderer config with a single worker that accepts every job type.
pub fn renderer_config(max_instances: usize) -> RendererConfig {
    let mut config = RendererConfig::default();
    config.jobs = JobSystemConfig::with_threads(vec![JobType::all()]);
    config.shaders.max_instances = max_instances;
    config.width = 640;
    config.height = 480;
    config
}

pub fn null_renderer(config: RendererConfig) -> Renderer {
    lumen_engine::logging::init_for_tests();
    let backend = Backend::Null(NullBackend::with_frames_in_flight(config.frames_in_flight));
    Renderer::with_backend(config, backend, shared_loader()).expect("renderer on null backend")
}

pub fn null_backend(renderer: &Renderer) -> &NullBackend {
    renderer.backend().as_null().expect("null backend")
}
