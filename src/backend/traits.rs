//! Core backend abstraction traits
//!
//! These traits define the interface every rendering backend implements. The
//! shader, material and view layers only ever talk to the GPU through
//! [`RenderBackend`].

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create shader module: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to create binding layout: {0}")]
    LayoutCreationFailed(String),
    #[error("Failed to allocate binding set: {0}")]
    BindingSetAllocationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Write of {size} bytes at offset {offset} is out of bounds")]
    OutOfBounds { offset: u64, size: u64 },
    #[error("Unknown {0} handle")]
    InvalidHandle(&'static str),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

macro_rules! backend_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Wraps a backend-specific identifier.
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

backend_handle!(
    /// Handle to a compiled shader stage
    ShaderModuleHandle
);
backend_handle!(
    /// Handle to a binding (descriptor set) layout
    BindingLayoutHandle
);
backend_handle!(
    /// Handle to an allocated binding (descriptor) set
    BindingSetHandle
);
backend_handle!(
    /// Handle to a graphics pipeline
    PipelineHandle
);
backend_handle!(
    /// Handle to a GPU buffer
    BufferHandle
);
backend_handle!(
    /// Handle to a GPU texture (image, view and sampler)
    TextureHandle
);

/// Rendering backend contract.
///
/// Implementations own every GPU object; the engine refers to them through
/// opaque handles only.
pub trait RenderBackend: Send {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Number of frame-in-flight slots.
    fn frames_in_flight(&self) -> usize;

    /// Required alignment of uniform buffer offsets.
    fn min_uniform_alignment(&self) -> u64 {
        256
    }

    /// Guaranteed push constant budget in bytes.
    fn max_push_constant_size(&self) -> u32 {
        128
    }

    // Frame

    /// Begin a new frame and return its frame-in-flight slot.
    fn begin_frame(&mut self) -> BackendResult<usize>;

    /// Finish the current frame.
    fn end_frame(&mut self) -> BackendResult<()>;

    /// Frame-in-flight slot of the frame being recorded.
    fn current_frame_slot(&self) -> usize;

    // Shader objects

    fn create_shader_stage(
        &mut self,
        stage: ShaderStage,
        bytecode: &[u8],
    ) -> BackendResult<ShaderModuleHandle>;

    fn destroy_shader_stage(&mut self, module: ShaderModuleHandle);

    fn create_binding_layout(
        &mut self,
        scope: ShaderScope,
        entries: &[BindingLayoutEntry],
    ) -> BackendResult<BindingLayoutHandle>;

    fn destroy_binding_layout(&mut self, layout: BindingLayoutHandle);

    fn create_pipeline(&mut self, desc: &PipelineDescriptor) -> BackendResult<PipelineHandle>;

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    // Buffers

    /// Create a host-visible uniform buffer of `size` bytes.
    fn create_uniform_buffer(&mut self, size: u64) -> BackendResult<BufferHandle>;

    /// Copy `data` into the buffer at `offset`.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    // Textures

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        pixels: &[u8],
    ) -> BackendResult<TextureHandle>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    // Bindings

    fn allocate_binding_set(
        &mut self,
        layout: BindingLayoutHandle,
        frame_slot: usize,
    ) -> BackendResult<BindingSetHandle>;

    fn free_binding_set(&mut self, set: BindingSetHandle);

    fn write_binding(
        &mut self,
        set: BindingSetHandle,
        slot: BindingSlot,
        resource: BindingResource,
    ) -> BackendResult<()>;

    fn bind_binding_set(&mut self, pipeline: PipelineHandle, scope: ShaderScope, set: BindingSetHandle);

    // Commands

    fn bind_pipeline(&mut self, pipeline: PipelineHandle);

    fn push_constants(&mut self, pipeline: PipelineHandle, offset: u32, data: &[u8]);

    fn draw(&mut self, vertex_count: u32, instance_count: u32);

    /// Block until the device has finished all submitted work.
    fn wait_idle(&mut self) -> BackendResult<()>;
}
