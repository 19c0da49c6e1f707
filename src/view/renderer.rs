//! Frame orchestration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::backend::*;
use crate::config::{BackendType, ConfigError, RendererConfig};
use crate::jobs::{JobError, JobSystem};
use crate::material::{
    MaterialConfig, MaterialContext, MaterialError, MaterialId, MaterialSystem,
};
use crate::resources::{
    FileSystemLoader, ResourceError, ResourceLoader, TextureId, TextureSystem,
};
use crate::shader::{ShaderError, ShaderSystem};

#[cfg(feature = "vulkan-backend")]
use crate::backend::vulkan::VulkanBackend;

use super::{FrameInfo, Projection, RenderPacket, RenderView, SkyboxView, UiView, WorldView};

const JOB_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Material(#[from] MaterialError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Backend selected at runtime.
pub enum Backend {
    Null(NullBackend),
    #[cfg(feature = "vulkan-backend")]
    Vulkan(VulkanBackend),
}

macro_rules! dispatch {
    ($self:expr, $b:ident => $body:expr) => {
        match $self {
            Backend::Null($b) => $body,
            #[cfg(feature = "vulkan-backend")]
            Backend::Vulkan($b) => $body,
        }
    };
}

impl Backend {
    pub fn new(backend_type: BackendType, frames_in_flight: usize) -> BackendResult<Self> {
        match backend_type {
            BackendType::Null => Ok(Backend::Null(NullBackend::with_frames_in_flight(
                frames_in_flight,
            ))),
            #[cfg(feature = "vulkan-backend")]
            BackendType::Vulkan => Ok(Backend::Vulkan(VulkanBackend::new_headless(
                frames_in_flight,
            )?)),
            #[cfg(not(feature = "vulkan-backend"))]
            BackendType::Vulkan => Err(BackendError::InitializationFailed(
                "built without the `vulkan-backend` feature".into(),
            )),
        }
    }

    pub fn as_null(&self) -> Option<&NullBackend> {
        match self {
            Backend::Null(b) => Some(b),
            #[cfg(feature = "vulkan-backend")]
            _ => None,
        }
    }

    pub fn as_null_mut(&mut self) -> Option<&mut NullBackend> {
        match self {
            Backend::Null(b) => Some(b),
            #[cfg(feature = "vulkan-backend")]
            _ => None,
        }
    }

    #[cfg(feature = "vulkan-backend")]
    pub fn as_vulkan(&self) -> Option<&VulkanBackend> {
        match self {
            Backend::Vulkan(b) => Some(b),
            _ => None,
        }
    }
}

impl RenderBackend for Backend {
    fn name(&self) -> &'static str {
        dispatch!(self, b => b.name())
    }

    fn frames_in_flight(&self) -> usize {
        dispatch!(self, b => b.frames_in_flight())
    }

    fn min_uniform_alignment(&self) -> u64 {
        dispatch!(self, b => b.min_uniform_alignment())
    }

    fn max_push_constant_size(&self) -> u32 {
        dispatch!(self, b => b.max_push_constant_size())
    }

    fn begin_frame(&mut self) -> BackendResult<usize> {
        dispatch!(self, b => b.begin_frame())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        dispatch!(self, b => b.end_frame())
    }

    fn current_frame_slot(&self) -> usize {
        dispatch!(self, b => b.current_frame_slot())
    }

    fn create_shader_stage(
        &mut self,
        stage: ShaderStage,
        bytecode: &[u8],
    ) -> BackendResult<ShaderModuleHandle> {
        dispatch!(self, b => b.create_shader_stage(stage, bytecode))
    }

    fn destroy_shader_stage(&mut self, module: ShaderModuleHandle) {
        dispatch!(self, b => b.destroy_shader_stage(module))
    }

    fn create_binding_layout(
        &mut self,
        scope: ShaderScope,
        entries: &[BindingLayoutEntry],
    ) -> BackendResult<BindingLayoutHandle> {
        dispatch!(self, b => b.create_binding_layout(scope, entries))
    }

    fn destroy_binding_layout(&mut self, layout: BindingLayoutHandle) {
        dispatch!(self, b => b.destroy_binding_layout(layout))
    }

    fn create_pipeline(&mut self, desc: &PipelineDescriptor) -> BackendResult<PipelineHandle> {
        dispatch!(self, b => b.create_pipeline(desc))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        dispatch!(self, b => b.destroy_pipeline(pipeline))
    }

    fn create_uniform_buffer(&mut self, size: u64) -> BackendResult<BufferHandle> {
        dispatch!(self, b => b.create_uniform_buffer(size))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        dispatch!(self, b => b.write_buffer(buffer, offset, data))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        dispatch!(self, b => b.destroy_buffer(buffer))
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        pixels: &[u8],
    ) -> BackendResult<TextureHandle> {
        dispatch!(self, b => b.create_texture(desc, pixels))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        dispatch!(self, b => b.destroy_texture(texture))
    }

    fn allocate_binding_set(
        &mut self,
        layout: BindingLayoutHandle,
        frame_slot: usize,
    ) -> BackendResult<BindingSetHandle> {
        dispatch!(self, b => b.allocate_binding_set(layout, frame_slot))
    }

    fn free_binding_set(&mut self, set: BindingSetHandle) {
        dispatch!(self, b => b.free_binding_set(set))
    }

    fn write_binding(
        &mut self,
        set: BindingSetHandle,
        slot: BindingSlot,
        resource: BindingResource,
    ) -> BackendResult<()> {
        dispatch!(self, b => b.write_binding(set, slot, resource))
    }

    fn bind_binding_set(&mut self, pipeline: PipelineHandle, scope: ShaderScope, set: BindingSetHandle) {
        dispatch!(self, b => b.bind_binding_set(pipeline, scope, set))
    }

    fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        dispatch!(self, b => b.bind_pipeline(pipeline))
    }

    fn push_constants(&mut self, pipeline: PipelineHandle, offset: u32, data: &[u8]) {
        dispatch!(self, b => b.push_constants(pipeline, offset, data))
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        dispatch!(self, b => b.draw(vertex_count, instance_count))
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        dispatch!(self, b => b.wait_idle())
    }
}

/// Owns the backend, the resource systems and the views, and draws frames.
///
/// Views render in order: skybox (when configured), world, then UI.
pub struct Renderer {
    backend: Backend,
    loader: Arc<dyn ResourceLoader>,
    jobs: JobSystem,
    shaders: ShaderSystem,
    textures: TextureSystem,
    materials: MaterialSystem,
    views: Vec<Box<dyn RenderView>>,
    frame_number: u64,
    width: u32,
    height: u32,
    shut_down: bool,
}

impl Renderer {
    /// Create the configured backend with resources read from `asset_root`.
    pub fn new(config: RendererConfig) -> Result<Self, RendererError> {
        let backend = Backend::new(config.backend, config.frames_in_flight)?;
        let loader: Arc<dyn ResourceLoader> = Arc::new(FileSystemLoader::new(&config.asset_root));
        Self::with_backend(config, backend, loader)
    }

    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, RendererError> {
        Self::new(RendererConfig::load(path)?)
    }

    pub fn with_loader(
        config: RendererConfig,
        loader: Arc<dyn ResourceLoader>,
    ) -> Result<Self, RendererError> {
        let backend = Backend::new(config.backend, config.frames_in_flight)?;
        Self::with_backend(config, backend, loader)
    }

    pub fn with_backend(
        config: RendererConfig,
        mut backend: Backend,
        loader: Arc<dyn ResourceLoader>,
    ) -> Result<Self, RendererError> {
        log::info!("Creating renderer on {}", backend.name());
        let jobs = JobSystem::new(config.jobs.clone())?;
        let mut shaders = ShaderSystem::new(config.shaders.clone());
        let mut textures = TextureSystem::new(&config.textures, &mut backend)?;

        let built = {
            let mut ctx = MaterialContext {
                backend: &mut backend,
                shaders: &mut shaders,
                textures: &mut textures,
                loader: &loader,
                jobs: Some(&jobs),
            };
            build_views(&config, &mut ctx).and_then(|views| {
                let materials = MaterialSystem::new(config.materials.clone(), &mut ctx)?;
                Ok((views, materials))
            })
        };
        let (views, materials) = match built {
            Ok(built) => built,
            Err(e) => {
                log::error!("Renderer initialization failed: {e}");
                shaders.shutdown(&mut backend);
                textures.shutdown(&mut backend);
                return Err(e.into());
            }
        };

        Ok(Self {
            backend,
            loader,
            jobs,
            shaders,
            textures,
            materials,
            views,
            frame_number: 0,
            width: config.width,
            height: config.height,
            shut_down: false,
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    pub fn shaders(&self) -> &ShaderSystem {
        &self.shaders
    }

    pub fn textures(&self) -> &TextureSystem {
        &self.textures
    }

    pub fn materials(&self) -> &MaterialSystem {
        &self.materials
    }

    pub fn jobs(&self) -> &JobSystem {
        &self.jobs
    }

    /// Number of frames drawn so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn view_names(&self) -> Vec<&str> {
        self.views.iter().map(|v| v.name()).collect()
    }

    /// Append a view; it renders after the built-in ones.
    pub fn add_view(&mut self, view: Box<dyn RenderView>) {
        log::debug!("Adding view '{}'", view.name());
        self.views.push(view);
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 || (width, height) == (self.width, self.height) {
            return;
        }
        log::debug!("Resizing renderer to {width}x{height}");
        self.width = width;
        self.height = height;
        for view in &mut self.views {
            view.on_resize(width, height);
        }
    }

    pub fn acquire_material(&mut self, name: &str) -> Result<MaterialId, MaterialError> {
        let mut ctx = MaterialContext {
            backend: &mut self.backend,
            shaders: &mut self.shaders,
            textures: &mut self.textures,
            loader: &self.loader,
            jobs: Some(&self.jobs),
        };
        self.materials.acquire(name, &mut ctx)
    }

    pub fn acquire_material_from_config(
        &mut self,
        config: &MaterialConfig,
    ) -> Result<MaterialId, MaterialError> {
        let mut ctx = MaterialContext {
            backend: &mut self.backend,
            shaders: &mut self.shaders,
            textures: &mut self.textures,
            loader: &self.loader,
            jobs: Some(&self.jobs),
        };
        self.materials.acquire_from_config(config, &mut ctx)
    }

    pub fn release_material(&mut self, name: &str) -> Result<(), MaterialError> {
        let mut ctx = MaterialContext {
            backend: &mut self.backend,
            shaders: &mut self.shaders,
            textures: &mut self.textures,
            loader: &self.loader,
            jobs: None,
        };
        self.materials.release(name, &mut ctx)
    }

    /// Start a background load of texture `name`.
    pub fn load_texture(&mut self, name: &str) -> Result<TextureId, ResourceError> {
        self.textures
            .load_async(name, &self.jobs, Arc::clone(&self.loader))
    }

    /// Deliver finished jobs and upload loaded textures without drawing.
    pub fn poll(&mut self) -> usize {
        self.jobs.update();
        self.textures.process_loaded(&mut self.backend)
    }

    /// Draw one frame. Returns the number of draws issued.
    ///
    /// A view or draw that fails is logged and skipped; only backend frame
    /// errors abort the frame.
    pub fn draw_frame(&mut self, packet: &RenderPacket) -> Result<usize, RendererError> {
        crate::profile_function!();
        self.poll();

        let frame_slot = self.backend.begin_frame()?;
        self.shaders.reset_current();
        let frame = FrameInfo {
            frame_number: self.frame_number,
            frame_slot,
        };

        let mut draws = 0;
        {
            let mut ctx = MaterialContext {
                backend: &mut self.backend,
                shaders: &mut self.shaders,
                textures: &mut self.textures,
                loader: &self.loader,
                jobs: Some(&self.jobs),
            };
            for view in &mut self.views {
                match view.render(packet, &frame, &mut self.materials, &mut ctx) {
                    Ok(count) => draws += count,
                    Err(e) => log::error!("View '{}' failed: {e}", view.name()),
                }
            }
        }

        self.backend.end_frame()?;
        log::trace!(
            "Frame {} drawn in slot {frame_slot} ({draws} draws)",
            self.frame_number
        );
        self.frame_number += 1;
        crate::profile_plot!("draws", draws);
        crate::frame_mark!();
        Ok(draws)
    }

    /// Release every resource. Called on drop if not called explicitly.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        log::info!("Shutting down renderer");

        if let Err(e) = self.backend.wait_idle() {
            log::error!("wait_idle failed during shutdown: {e}");
        }
        if !self.jobs.wait_idle(JOB_DRAIN_TIMEOUT) {
            log::warn!("Jobs still pending at shutdown");
        }

        {
            let mut ctx = MaterialContext {
                backend: &mut self.backend,
                shaders: &mut self.shaders,
                textures: &mut self.textures,
                loader: &self.loader,
                jobs: None,
            };
            for view in &mut self.views {
                view.destroy(&mut ctx);
            }
            self.materials.shutdown(&mut ctx);
        }
        self.views.clear();
        self.shaders.shutdown(&mut self.backend);
        self.textures.shutdown(&mut self.backend);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &self.backend.name())
            .field("frame_number", &self.frame_number)
            .field("views", &self.view_names())
            .finish()
    }
}

fn build_views(
    config: &RendererConfig,
    ctx: &mut MaterialContext<'_>,
) -> Result<Vec<Box<dyn RenderView>>, MaterialError> {
    let views_config = &config.views;
    let mut views: Vec<Box<dyn RenderView>> = Vec::with_capacity(3);
    let aspect = config.width.max(1) as f32 / config.height.max(1) as f32;

    if let Some(texture) = &views_config.skybox_texture {
        let projection =
            Projection::perspective(views_config.fov, aspect, views_config.near, views_config.far);
        views.push(Box::new(SkyboxView::new(
            &views_config.skybox_shader,
            texture,
            projection,
            ctx,
        )?));
    }
    views.push(Box::new(WorldView::new(
        views_config.fov,
        config.width,
        config.height,
        views_config.near,
        views_config.far,
    )));
    views.push(Box::new(UiView::new(config.width, config.height)));
    Ok(views)
}
