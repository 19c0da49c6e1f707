//! End-to-end frame tests: renderer, views and the binding order of draws.

mod common;

use glam::{Mat4, Vec3};
use rstest::rstest;

use common::{null_backend, null_renderer, renderer_config, shared_loader};
use lumen_engine::backend::{NullBackendStats, RecordedCommand};
use lumen_engine::view::SKYBOX_VERTEX_COUNT;
use lumen_engine::{
    Backend, BackendType, Camera, GeometryRenderData, MaterialConfig, MaterialKind, NullBackend,
    RenderPacket, Renderer, RendererConfig, ShaderScope,
};

fn world_packet(draws: &[GeometryRenderData]) -> RenderPacket {
    RenderPacket {
        camera: Camera::new(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO),
        world: draws.to_vec(),
        ..Default::default()
    }
}

fn count(commands: &[RecordedCommand], pred: impl Fn(&RecordedCommand) -> bool) -> usize {
    commands.iter().filter(|c| pred(*c)).count()
}

// ============================================================================
// Frame loop
// ============================================================================

#[test]
fn test_frames_count_draws_and_advance() {
    let mut renderer = null_renderer(renderer_config(8));
    let brick = renderer.acquire_material("brick").unwrap();
    let packet = world_packet(&[
        GeometryRenderData::new(brick, Mat4::IDENTITY, 36),
        GeometryRenderData::new(brick, Mat4::from_translation(Vec3::X), 36),
    ]);

    for expected_frame in 1..=3 {
        assert_eq!(renderer.draw_frame(&packet).unwrap(), 2);
        assert_eq!(renderer.frame_number(), expected_frame);
    }
    let backend = null_backend(&renderer);
    assert_eq!(backend.draw_count(), 6);
    assert_eq!(backend.frame_index(), 3);
}

#[test]
fn test_empty_packet_draws_nothing() {
    let mut renderer = null_renderer(renderer_config(8));
    assert_eq!(renderer.draw_frame(&RenderPacket::default()).unwrap(), 0);
    assert_eq!(renderer.frame_number(), 1);
    assert_eq!(null_backend(&renderer).draw_count(), 0);
}

#[test]
fn test_draw_binds_global_instance_local_in_order() {
    let mut renderer = null_renderer(renderer_config(8));
    let brick = renderer.acquire_material("brick").unwrap();
    renderer.backend_mut().as_null_mut().unwrap().take_commands();

    let model = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
    renderer
        .draw_frame(&world_packet(&[GeometryRenderData::new(brick, model, 36)]))
        .unwrap();

    let commands = renderer.backend_mut().as_null_mut().unwrap().take_commands();
    assert_eq!(commands.len(), 5);
    assert!(matches!(commands[0], RecordedCommand::BindPipeline(_)));
    assert!(matches!(
        commands[1],
        RecordedCommand::BindSet { scope: ShaderScope::Global, .. }
    ));
    assert!(matches!(
        commands[2],
        RecordedCommand::BindSet { scope: ShaderScope::Instance, .. }
    ));
    match &commands[3] {
        RecordedCommand::PushConstants { offset, data, .. } => {
            assert_eq!(*offset, 0);
            assert_eq!(data.as_slice(), bytemuck::bytes_of(&model));
        }
        other => panic!("expected push constants, got {other:?}"),
    }
    assert_eq!(
        commands[4],
        RecordedCommand::Draw {
            vertex_count: 36,
            instance_count: 1
        }
    );
}

#[test]
fn test_globals_applied_once_per_shader_per_frame() {
    let mut renderer = null_renderer(renderer_config(8));
    let brick = renderer.acquire_material("brick").unwrap();
    let red = renderer
        .acquire_material_from_config(
            &MaterialConfig::new("red", MaterialKind::Standard)
                .with_diffuse_colour([1.0, 0.0, 0.0, 1.0]),
        )
        .unwrap();
    renderer.backend_mut().as_null_mut().unwrap().take_commands();

    let packet = world_packet(&[
        GeometryRenderData::new(brick, Mat4::IDENTITY, 36),
        GeometryRenderData::new(red, Mat4::IDENTITY, 36),
        GeometryRenderData::new(brick, Mat4::IDENTITY, 36),
    ]);
    renderer.draw_frame(&packet).unwrap();

    let commands = renderer.backend_mut().as_null_mut().unwrap().take_commands();
    let globals = count(&commands, |c| {
        matches!(c, RecordedCommand::BindSet { scope: ShaderScope::Global, .. })
    });
    let instances = count(&commands, |c| {
        matches!(c, RecordedCommand::BindSet { scope: ShaderScope::Instance, .. })
    });
    let pipelines = count(&commands, |c| matches!(c, RecordedCommand::BindPipeline(_)));
    assert_eq!(globals, 1);
    assert_eq!(instances, 3);
    assert_eq!(pipelines, 1);
}

#[test]
fn test_instance_uniforms_written_once_per_frame() {
    let mut renderer = null_renderer(renderer_config(8));
    let brick = renderer.acquire_material("brick").unwrap();
    let packet = world_packet(&[
        GeometryRenderData::new(brick, Mat4::IDENTITY, 36),
        GeometryRenderData::new(brick, Mat4::IDENTITY, 36),
    ]);

    renderer.draw_frame(&packet).unwrap();
    assert_eq!(renderer.materials().render_frame(brick), Some(0));
    renderer.draw_frame(&packet).unwrap();
    assert_eq!(renderer.materials().render_frame(brick), Some(1));
}

#[test]
fn test_stale_material_skipped_rest_of_frame_drawn() {
    let mut renderer = null_renderer(renderer_config(8));
    let brick = renderer.acquire_material("brick").unwrap();
    let gone = renderer
        .acquire_material_from_config(&MaterialConfig::new("gone", MaterialKind::Standard))
        .unwrap();
    renderer.release_material("gone").unwrap();

    let packet = world_packet(&[
        GeometryRenderData::new(gone, Mat4::IDENTITY, 36),
        GeometryRenderData::new(brick, Mat4::IDENTITY, 36),
    ]);
    assert_eq!(renderer.draw_frame(&packet).unwrap(), 1);
    assert_eq!(null_backend(&renderer).draw_count(), 1);
}

#[test]
fn test_ui_view_draws_ui_geometry() {
    let mut renderer = null_renderer(renderer_config(8));
    let panel = renderer.acquire_material("panel").unwrap();
    let brick = renderer.acquire_material("brick").unwrap();

    let mut packet = world_packet(&[GeometryRenderData::new(brick, Mat4::IDENTITY, 36)]);
    packet
        .ui
        .push(GeometryRenderData::new(panel, Mat4::from_scale(Vec3::splat(100.0)), 6));
    assert_eq!(renderer.draw_frame(&packet).unwrap(), 2);

    let commands = null_backend(&renderer).commands();
    let last_draw = commands
        .iter()
        .rev()
        .find(|c| matches!(c, RecordedCommand::Draw { .. }));
    assert_eq!(
        last_draw,
        Some(&RecordedCommand::Draw {
            vertex_count: 6,
            instance_count: 1
        })
    );
}

// ============================================================================
// Views
// ============================================================================

#[rstest]
#[case::with_skybox(true, 1)]
#[case::skybox_disabled(false, 0)]
fn test_skybox_view(#[case] draw_skybox: bool, #[case] expected_draws: usize) {
    let mut config = renderer_config(8);
    config.views.skybox_texture = Some("sky".to_string());
    let mut renderer = null_renderer(config);
    assert_eq!(renderer.view_names(), vec!["skybox", "world", "ui"]);

    let packet = RenderPacket {
        draw_skybox,
        ..Default::default()
    };
    assert_eq!(renderer.draw_frame(&packet).unwrap(), expected_draws);
    if draw_skybox {
        assert_eq!(
            null_backend(&renderer).commands().last(),
            Some(&RecordedCommand::Draw {
                vertex_count: SKYBOX_VERTEX_COUNT,
                instance_count: 1
            })
        );
    }
}

#[test]
fn test_views_without_skybox() {
    let renderer = null_renderer(renderer_config(8));
    assert_eq!(renderer.view_names(), vec!["world", "ui"]);
}

#[rstest]
#[case::zero_width(0, 480, (640, 480))]
#[case::zero_height(640, 0, (640, 480))]
#[case::new_size(1024, 768, (1024, 768))]
fn test_resize(#[case] width: u32, #[case] height: u32, #[case] expected: (u32, u32)) {
    let mut renderer = null_renderer(renderer_config(8));
    renderer.resize(width, height);
    assert_eq!(renderer.size(), expected);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_shutdown_releases_every_backend_object() {
    let mut config = renderer_config(8);
    config.views.skybox_texture = Some("sky".to_string());
    let mut renderer = null_renderer(config);
    let brick = renderer.acquire_material("brick").unwrap();
    renderer.acquire_material("valley").unwrap();
    renderer
        .draw_frame(&world_packet(&[GeometryRenderData::new(brick, Mat4::IDENTITY, 36)]))
        .unwrap();

    renderer.shutdown();
    assert_eq!(null_backend(&renderer).stats(), NullBackendStats::default());
    assert!(renderer.shaders().is_empty());
    assert!(renderer.materials().is_empty());

    // A second shutdown, and the one on drop, are no-ops.
    renderer.shutdown();
}

#[test]
fn test_renderer_from_toml_config() {
    lumen_engine::logging::init_for_tests();
    let config = RendererConfig::from_toml_str(
        r#"
        frames_in_flight = 2
        width = 320
        height = 200

        [shaders]
        max_instances = 4

        [jobs]
        thread_types = ["GENERAL | RESOURCE_LOAD"]
        "#,
    )
    .unwrap();
    let backend = Backend::new(config.backend, config.frames_in_flight).unwrap();
    let mut renderer = Renderer::with_backend(config, backend, shared_loader()).unwrap();

    assert_eq!(renderer.size(), (320, 200));
    assert_eq!(renderer.jobs().thread_count(), 1);
    for _ in 0..3 {
        renderer.draw_frame(&RenderPacket::default()).unwrap();
    }
    assert_eq!(null_backend(&renderer).frame_index(), 3);
}

#[test]
fn test_missing_default_shader_fails_cleanly() {
    lumen_engine::logging::init_for_tests();
    let loader = std::sync::Arc::new(lumen_engine::MemoryLoader::new());
    let backend = Backend::Null(NullBackend::new());
    let result = Renderer::with_backend(renderer_config(8), backend, loader);
    assert!(result.is_err());
}

#[cfg(not(feature = "vulkan-backend"))]
#[test]
fn test_vulkan_requires_feature() {
    assert!(Backend::new(BackendType::Vulkan, 3).is_err());
}
