//! # Lumen Engine
//!
//! Rendering core built around a shader binding abstraction with three
//! uniform scopes, a material system on top of it, and a priority job
//! scheduler for background work.
//!
//! ## Overview
//!
//! - [`shader`] - shaders with global, instance and local uniforms backed by
//!   one sub-allocated uniform buffer per shader
//! - [`material`] - named, reference-counted materials (standard, UI, terrain)
//! - [`view`] - world, UI and skybox views and the [`Renderer`] frame loop
//! - [`jobs`] - worker pool with priorities, dependencies and main-thread
//!   result delivery
//! - [`backend`] - the [`RenderBackend`] contract with a recording
//!   [`NullBackend`] and, behind the `vulkan-backend` feature, a headless
//!   Vulkan backend
//!
//! ## Example
//!
//! ```ignore
//! use glam::Mat4;
//! use lumen_engine::{GeometryRenderData, RenderPacket, Renderer, RendererConfig};
//!
//! lumen_engine::logging::init();
//! let mut renderer = Renderer::new(RendererConfig::load("lumen.toml")?)?;
//! let brick = renderer.acquire_material("brick")?;
//!
//! let mut packet = RenderPacket::default();
//! packet.world.push(GeometryRenderData::new(brick, Mat4::IDENTITY, 36));
//! renderer.draw_frame(&packet)?;
//! ```

pub mod arena;
pub mod backend;
pub mod config;
pub mod jobs;
pub mod logging;
pub mod material;
pub mod profiling;
pub mod resources;
pub mod shader;
pub mod view;

pub use arena::{Arena, Handle};
pub use backend::{BackendError, NullBackend, RenderBackend};
pub use config::{BackendType, ConfigError, RendererConfig, ViewConfig};
pub use jobs::{JobError, JobId, JobInfo, JobPriority, JobSystem, JobSystemConfig, JobType};
pub use material::{
    GlobalUniforms, MaterialConfig, MaterialContext, MaterialError, MaterialId, MaterialKind,
    MaterialSystem, MaterialSystemConfig, RenderMode,
};
pub use resources::{
    FileSystemLoader, MemoryLoader, ResourceError, ResourceLoader, ResourceType, TextureSystem,
    UniformBufferAllocator,
};
pub use shader::{Shader, ShaderConfig, ShaderError, ShaderId, ShaderScope, ShaderSystem};
pub use view::{
    Backend, Camera, GeometryRenderData, RenderPacket, RenderView, Renderer, RendererError,
};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
