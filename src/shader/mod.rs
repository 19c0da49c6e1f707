//! Shader binding abstraction.
//!
//! A [`Shader`] is declared first (stages, attributes, uniforms, samplers)
//! while it is `Uninitialized`, then frozen by [`Shader::initialize`], which
//! creates the backend objects and one shared uniform buffer laid out as:
//!
//! ```text
//! | global block (global_ubo_stride) | instance 0 (ubo_stride) | instance 1 | ...
//! ```
//!
//! Uniforms live in one of three scopes. Global uniforms are written once per
//! frame, instance uniforms once per material instance, and local uniforms
//! are push constants written straight into the command stream.
//!
//! Instance binding sets are only rewritten when their recorded state for the
//! current frame slot is stale (sampler slots compare texture generations),
//! so steady-state frames issue no descriptor writes at all.

mod config;
mod instance;
mod system;
mod uniform;

pub use crate::backend::ShaderScope;
pub use config::{AttributeConfig, ShaderConfig, StageConfig, UniformConfig};
pub use instance::{InstanceId, InstanceState};
pub use system::{ShaderId, ShaderSystem, ShaderSystemConfig};
pub use uniform::{parse_attribute_type, Attribute, Uniform, UniformLocation, UniformType};

use std::collections::HashMap;

use thiserror::Error;

use crate::arena::Arena;
use crate::backend::{
    BackendError, BindingLayoutEntry, BindingLayoutHandle, BindingResource, BindingSetHandle,
    BindingSlot, BufferHandle, CullMode, PipelineDescriptor, PipelineHandle, PushConstantRange,
    RenderBackend, ShaderModuleHandle, ShaderStage, VertexAttributeDescriptor, VertexFormat,
};
use crate::resources::{
    align_up, AllocError, ResourceError, ResourceLoader, ResourceType, TextureBinding,
    UniformAllocation, UniformBufferAllocator,
};

/// Push constant space every backend guarantees.
pub const MAX_PUSH_CONSTANT_SIZE: u32 = 128;

/// Binding index of the uniform buffer in each binding set.
const UBO_BINDING: u32 = 0;
/// Binding index of the sampler array in each binding set.
const SAMPLER_BINDING: u32 = 1;

/// Shader errors
#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("Shader '{0}' is already initialized")]
    AlreadyInitialized(String),
    #[error("Shader '{0}' is not initialized")]
    NotInitialized(String),
    #[error("Shader '{0}' has no stages")]
    NoStages(String),
    #[error("Shader '{shader}' already has a {stage:?} stage")]
    DuplicateStage { shader: String, stage: ShaderStage },
    #[error("Empty name passed to shader '{0}'")]
    EmptyName(String),
    #[error("Shader '{shader}' already has a uniform named '{name}'")]
    DuplicateUniform { shader: String, name: String },
    #[error("Shader '{shader}' has too many uniforms (max {max})")]
    TooManyUniforms { shader: String, max: usize },
    #[error("Shader '{shader}' does not use local uniforms; cannot add '{name}'")]
    LocalNotSupported { shader: String, name: String },
    #[error("Shader '{shader}' does not use instances; cannot add '{name}'")]
    InstancesNotSupported { shader: String, name: String },
    #[error("Sampler '{0}' cannot be declared at local scope")]
    LocalSampler(String),
    #[error("Shader '{shader}' exceeds the {scope:?} sampler limit of {max}")]
    TooManySamplers {
        shader: String,
        scope: ShaderScope,
        max: u32,
    },
    #[error("Local uniform '{name}' needs {requested} bytes; push constant budget is {budget}")]
    PushConstantBudget {
        name: String,
        requested: u32,
        budget: u32,
    },
    #[error("Shader '{shader}': declaring '{name}' overflows its block size")]
    BlockTooLarge { shader: String, name: String },
    #[error("Unknown uniform type '{0}'")]
    UnknownUniformType(String),
    #[error("Unknown attribute type '{0}'")]
    UnknownAttributeType(String),
    #[error("Shader '{shader}' has no uniform named '{name}'")]
    UnknownUniform { shader: String, name: String },
    #[error("Invalid uniform location {0:?}")]
    InvalidLocation(UniformLocation),
    #[error("Uniform '{name}' is {expected} bytes, got {actual}")]
    UniformSizeMismatch {
        name: String,
        expected: u32,
        actual: usize,
    },
    #[error("Uniform '{0}' is a sampler")]
    IsSampler(String),
    #[error("Uniform '{0}' is not a sampler")]
    NotSampler(String),
    #[error("No instance bound on shader '{0}'")]
    NoInstanceBound(String),
    #[error("Shader '{shader}' has no instances available (max {max})")]
    NoInstancesAvailable { shader: String, max: usize },
    #[error("Invalid or released instance {0:?}")]
    InvalidInstance(InstanceId),
    #[error("Unknown shader '{0}'")]
    UnknownShader(String),
    #[error("A shader named '{0}' already exists")]
    DuplicateShader(String),
    #[error("Shader limit of {max} reached")]
    TooManyShaders { max: usize },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Lifecycle of a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderState {
    NotCreated,
    /// Accepting declarations.
    Uninitialized,
    /// Backend objects exist; declarations are frozen.
    Initialized,
}

/// Capacity limits applied to every shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderLimits {
    pub max_instances: usize,
    pub max_uniforms: usize,
    pub max_global_textures: u32,
    pub max_instance_textures: u32,
}

impl Default for ShaderLimits {
    fn default() -> Self {
        Self {
            max_instances: 1024,
            max_uniforms: 128,
            max_global_textures: 31,
            max_instance_textures: 31,
        }
    }
}

/// Backend objects owned by an initialized shader.
struct ShaderGpu {
    modules: Vec<ShaderModuleHandle>,
    global_layout: BindingLayoutHandle,
    instance_layout: Option<BindingLayoutHandle>,
    pipeline: PipelineHandle,
    buffer: BufferHandle,
    allocator: UniformBufferAllocator,
    global_allocation: UniformAllocation,
    /// One global binding set per frame in flight.
    global_sets: Vec<BindingSetHandle>,
}

/// Objects created so far during initialization, destroyed if a later step
/// fails.
#[derive(Default)]
struct PartialGpu {
    modules: Vec<ShaderModuleHandle>,
    layouts: Vec<BindingLayoutHandle>,
    pipeline: Option<PipelineHandle>,
    buffer: Option<BufferHandle>,
    sets: Vec<BindingSetHandle>,
}

impl PartialGpu {
    fn destroy(self, backend: &mut dyn RenderBackend) {
        for set in self.sets.into_iter().rev() {
            backend.free_binding_set(set);
        }
        if let Some(buffer) = self.buffer {
            backend.destroy_buffer(buffer);
        }
        if let Some(pipeline) = self.pipeline {
            backend.destroy_pipeline(pipeline);
        }
        for layout in self.layouts.into_iter().rev() {
            backend.destroy_binding_layout(layout);
        }
        for module in self.modules.into_iter().rev() {
            backend.destroy_shader_stage(module);
        }
    }
}

/// A GPU program and its binding surface.
pub struct Shader {
    name: String,
    state: ShaderState,
    use_instances: bool,
    use_local: bool,
    limits: ShaderLimits,

    stages: Vec<StageConfig>,
    attributes: Vec<Attribute>,
    attribute_stride: u32,

    uniforms: Vec<Uniform>,
    lookup: HashMap<String, UniformLocation>,
    global_ubo_size: u32,
    ubo_size: u32,
    push_constant_ranges: Vec<PushConstantRange>,
    push_constant_size: u32,
    global_sampler_count: u32,
    instance_sampler_count: u32,

    global_ubo_stride: u64,
    ubo_stride: u64,
    global_textures: Vec<Option<TextureBinding>>,

    gpu: Option<ShaderGpu>,
    instances: Arena<InstanceState>,
    bound_instance: Option<InstanceId>,
    last_globals_frame: Option<u64>,
}

impl Shader {
    pub fn new(
        name: impl Into<String>,
        use_instances: bool,
        use_local: bool,
        limits: ShaderLimits,
    ) -> Self {
        let instance_capacity = if use_instances { limits.max_instances } else { 0 };
        Self {
            name: name.into(),
            state: ShaderState::Uninitialized,
            use_instances,
            use_local,
            limits,
            stages: Vec::new(),
            attributes: Vec::new(),
            attribute_stride: 0,
            uniforms: Vec::new(),
            lookup: HashMap::new(),
            global_ubo_size: 0,
            ubo_size: 0,
            push_constant_ranges: Vec::new(),
            push_constant_size: 0,
            global_sampler_count: 0,
            instance_sampler_count: 0,
            global_ubo_stride: 0,
            ubo_stride: 0,
            global_textures: Vec::new(),
            gpu: None,
            instances: Arena::with_capacity(instance_capacity),
            bound_instance: None,
            last_globals_frame: None,
        }
    }

    /// Declare every stage, attribute and uniform of `config`.
    pub fn from_config(config: &ShaderConfig, limits: ShaderLimits) -> Result<Self, ShaderError> {
        let mut shader = Self::new(&config.name, config.use_instances, config.use_local, limits);
        for stage in &config.stages {
            shader.add_stage(stage.stage, &stage.file)?;
        }
        for attribute in &config.attributes {
            let format = parse_attribute_type(&attribute.ty)
                .ok_or_else(|| ShaderError::UnknownAttributeType(attribute.ty.clone()))?;
            shader.add_attribute(&attribute.name, format)?;
        }
        for uniform in &config.uniforms {
            let ty = UniformType::parse(&uniform.ty, uniform.size)
                .ok_or_else(|| ShaderError::UnknownUniformType(uniform.ty.clone()))?;
            shader.add_uniform(&uniform.name, ty, uniform.scope)?;
        }
        Ok(shader)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ShaderState {
        self.state
    }

    pub fn use_instances(&self) -> bool {
        self.use_instances
    }

    pub fn use_local(&self) -> bool {
        self.use_local
    }

    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute_stride(&self) -> u32 {
        self.attribute_stride
    }

    pub fn uniforms(&self) -> &[Uniform] {
        &self.uniforms
    }

    pub fn uniform(&self, location: UniformLocation) -> Option<&Uniform> {
        self.uniforms.get(location.index())
    }

    pub fn uniform_location(&self, name: &str) -> Option<UniformLocation> {
        self.lookup.get(name).copied()
    }

    pub fn has_uniform(&self, name: &str) -> bool {
        self.lookup.contains_key(name)
    }

    /// Real (unaligned) size of the global block.
    pub fn global_ubo_size(&self) -> u32 {
        self.global_ubo_size
    }

    /// Real (unaligned) size of one instance block.
    pub fn ubo_size(&self) -> u32 {
        self.ubo_size
    }

    /// Aligned size of the global block; 0 before initialization.
    pub fn global_ubo_stride(&self) -> u64 {
        self.global_ubo_stride
    }

    /// Aligned size of one instance block; 0 before initialization or
    /// without instances.
    pub fn ubo_stride(&self) -> u64 {
        self.ubo_stride
    }

    /// Total size of the shared uniform buffer.
    pub fn uniform_buffer_size(&self) -> u64 {
        self.checked_uniform_buffer_size().unwrap_or(u64::MAX)
    }

    fn checked_uniform_buffer_size(&self) -> Option<u64> {
        self.ubo_stride
            .checked_mul(self.max_instances() as u64)?
            .checked_add(self.global_ubo_stride)
    }

    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    pub fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constant_ranges
    }

    pub fn global_sampler_count(&self) -> u32 {
        self.global_sampler_count
    }

    pub fn instance_sampler_count(&self) -> u32 {
        self.instance_sampler_count
    }

    pub fn max_instances(&self) -> usize {
        self.instances.capacity()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instance(&self, id: InstanceId) -> Option<&InstanceState> {
        self.instances.get(id)
    }

    pub fn bound_instance(&self) -> Option<InstanceId> {
        self.bound_instance
    }

    pub fn pipeline(&self) -> Option<PipelineHandle> {
        self.gpu.as_ref().map(|gpu| gpu.pipeline)
    }

    pub fn uniform_buffer(&self) -> Option<BufferHandle> {
        self.gpu.as_ref().map(|gpu| gpu.buffer)
    }

    /// Offset of the global block in the uniform buffer.
    pub fn global_offset(&self) -> Option<u64> {
        self.gpu.as_ref().map(|gpu| gpu.global_allocation.offset)
    }

    /// Free bytes left in the uniform buffer.
    pub fn uniform_buffer_free_space(&self) -> Option<u64> {
        self.gpu.as_ref().map(|gpu| gpu.allocator.free_space())
    }

    /// Frame number of the last globals application.
    pub fn last_globals_frame(&self) -> Option<u64> {
        self.last_globals_frame
    }

    pub fn set_last_globals_frame(&mut self, frame_number: u64) {
        self.last_globals_frame = Some(frame_number);
    }

    // ---- Declaration -------------------------------------------------------

    fn ensure_uninitialized(&self) -> Result<(), ShaderError> {
        if self.state == ShaderState::Initialized {
            log::error!("Shader '{}' is already initialized", self.name);
            return Err(ShaderError::AlreadyInitialized(self.name.clone()));
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<&ShaderGpu, ShaderError> {
        self.gpu
            .as_ref()
            .ok_or_else(|| ShaderError::NotInitialized(self.name.clone()))
    }

    pub fn add_stage(&mut self, stage: ShaderStage, file: &str) -> Result<(), ShaderError> {
        self.ensure_uninitialized()?;
        if self.stages.iter().any(|s| s.stage == stage) {
            return Err(ShaderError::DuplicateStage {
                shader: self.name.clone(),
                stage,
            });
        }
        self.stages.push(StageConfig {
            stage,
            file: file.to_string(),
        });
        Ok(())
    }

    /// Append a vertex attribute.
    pub fn add_attribute(&mut self, name: &str, format: VertexFormat) -> Result<(), ShaderError> {
        self.ensure_uninitialized()?;
        if name.is_empty() {
            return Err(ShaderError::EmptyName(self.name.clone()));
        }
        let stride = self
            .attribute_stride
            .checked_add(format.size())
            .ok_or_else(|| self.block_too_large(name))?;
        self.attributes.push(Attribute {
            name: name.to_string(),
            format,
            offset: self.attribute_stride,
        });
        self.attribute_stride = stride;
        Ok(())
    }

    /// Declare a uniform. Samplers are routed to [`add_sampler`](Self::add_sampler).
    ///
    /// Global and instance uniforms are packed one after another in their
    /// block. Local uniforms take 4-byte-aligned push constant ranges.
    pub fn add_uniform(
        &mut self,
        name: &str,
        ty: UniformType,
        scope: ShaderScope,
    ) -> Result<UniformLocation, ShaderError> {
        if ty.is_sampler() {
            return self.add_sampler(name, scope);
        }
        self.check_new_uniform(name, scope)?;

        let size = ty.size();
        let offset = match scope {
            ShaderScope::Global => {
                let offset = self.global_ubo_size;
                self.global_ubo_size = offset
                    .checked_add(size)
                    .ok_or_else(|| self.block_too_large(name))?;
                offset
            }
            ShaderScope::Instance => {
                let offset = self.ubo_size;
                self.ubo_size = offset
                    .checked_add(size)
                    .ok_or_else(|| self.block_too_large(name))?;
                offset
            }
            ShaderScope::Local => {
                // Narrowed to u32 only after the budget check.
                let aligned = align_up(u64::from(size), 4);
                let end = u64::from(self.push_constant_size) + aligned;
                if end > u64::from(MAX_PUSH_CONSTANT_SIZE) {
                    log::error!(
                        "Shader '{}': local uniform '{}' overflows push constant budget",
                        self.name,
                        name
                    );
                    return Err(ShaderError::PushConstantBudget {
                        name: name.to_string(),
                        requested: u32::try_from(end).unwrap_or(u32::MAX),
                        budget: MAX_PUSH_CONSTANT_SIZE,
                    });
                }
                let range = PushConstantRange {
                    offset: self.push_constant_size,
                    size: aligned as u32,
                };
                self.push_constant_ranges.push(range);
                self.push_constant_size = range.end();
                range.offset
            }
        };

        Ok(self.push_uniform(name, scope, ty, size, offset, None))
    }

    /// Declare a sampler. The Nth sampler of a scope gets array slot N.
    pub fn add_sampler(
        &mut self,
        name: &str,
        scope: ShaderScope,
    ) -> Result<UniformLocation, ShaderError> {
        if scope == ShaderScope::Local {
            log::error!("Shader '{}': sampler '{}' cannot be local", self.name, name);
            return Err(ShaderError::LocalSampler(name.to_string()));
        }
        self.check_new_uniform(name, scope)?;

        let (count, max) = match scope {
            ShaderScope::Global => (&mut self.global_sampler_count, self.limits.max_global_textures),
            _ => (
                &mut self.instance_sampler_count,
                self.limits.max_instance_textures,
            ),
        };
        if *count >= max {
            return Err(ShaderError::TooManySamplers {
                shader: self.name.clone(),
                scope,
                max,
            });
        }
        let slot = *count;
        *count += 1;
        if scope == ShaderScope::Global {
            self.global_textures.push(None);
        }

        Ok(self.push_uniform(name, scope, UniformType::Sampler, 0, 0, Some(slot)))
    }

    fn block_too_large(&self, name: &str) -> ShaderError {
        log::error!(
            "Shader '{}': declaring '{}' overflows its block size",
            self.name,
            name
        );
        ShaderError::BlockTooLarge {
            shader: self.name.clone(),
            name: name.to_string(),
        }
    }

    fn check_new_uniform(&self, name: &str, scope: ShaderScope) -> Result<(), ShaderError> {
        self.ensure_uninitialized()?;
        if name.is_empty() {
            return Err(ShaderError::EmptyName(self.name.clone()));
        }
        if self.lookup.contains_key(name) {
            log::error!(
                "Shader '{}' already has a uniform named '{}'",
                self.name,
                name
            );
            return Err(ShaderError::DuplicateUniform {
                shader: self.name.clone(),
                name: name.to_string(),
            });
        }
        if self.uniforms.len() >= self.limits.max_uniforms {
            return Err(ShaderError::TooManyUniforms {
                shader: self.name.clone(),
                max: self.limits.max_uniforms,
            });
        }
        match scope {
            ShaderScope::Local if !self.use_local => {
                log::error!(
                    "Shader '{}' does not use local uniforms; rejecting '{}'",
                    self.name,
                    name
                );
                Err(ShaderError::LocalNotSupported {
                    shader: self.name.clone(),
                    name: name.to_string(),
                })
            }
            ShaderScope::Instance if !self.use_instances => {
                log::error!(
                    "Shader '{}' does not use instances; rejecting '{}'",
                    self.name,
                    name
                );
                Err(ShaderError::InstancesNotSupported {
                    shader: self.name.clone(),
                    name: name.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn push_uniform(
        &mut self,
        name: &str,
        scope: ShaderScope,
        ty: UniformType,
        size: u32,
        offset: u32,
        sampler_slot: Option<u32>,
    ) -> UniformLocation {
        let location = UniformLocation(self.uniforms.len() as u16);
        self.uniforms.push(Uniform {
            name: name.to_string(),
            scope,
            ty,
            size,
            offset,
            location,
            sampler_slot,
        });
        self.lookup.insert(name.to_string(), location);
        location
    }

    // ---- Initialization ----------------------------------------------------

    /// Create the backend objects and the shared uniform buffer.
    ///
    /// On failure everything created so far is destroyed and the shader stays
    /// `Uninitialized`.
    pub fn initialize(
        &mut self,
        backend: &mut dyn RenderBackend,
        loader: &dyn ResourceLoader,
    ) -> Result<(), ShaderError> {
        crate::profile_function!();
        self.ensure_uninitialized()?;
        if self.stages.is_empty() {
            log::error!("Shader '{}' has no stages", self.name);
            return Err(ShaderError::NoStages(self.name.clone()));
        }

        let mut partial = PartialGpu::default();
        match self.create_gpu(backend, loader, &mut partial) {
            Ok(gpu) => {
                self.gpu = Some(gpu);
                self.state = ShaderState::Initialized;
                log::debug!(
                    "Shader '{}' initialized (global stride {}, instance stride {}, buffer {} bytes)",
                    self.name,
                    self.global_ubo_stride,
                    self.ubo_stride,
                    self.uniform_buffer_size()
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize shader '{}': {e}", self.name);
                partial.destroy(backend);
                self.global_ubo_stride = 0;
                self.ubo_stride = 0;
                Err(e)
            }
        }
    }

    fn create_gpu(
        &mut self,
        backend: &mut dyn RenderBackend,
        loader: &dyn ResourceLoader,
        partial: &mut PartialGpu,
    ) -> Result<ShaderGpu, ShaderError> {
        let mut stage_handles = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let bytecode = loader.load(&stage.file, ResourceType::ShaderBytecode)?;
            let module = backend.create_shader_stage(stage.stage, &bytecode.data);
            loader.unload(bytecode);
            let module = module?;
            partial.modules.push(module);
            stage_handles.push((stage.stage, module));
        }

        let alignment = backend.min_uniform_alignment();
        self.global_ubo_stride = align_up(u64::from(self.global_ubo_size.max(1)), alignment);
        self.ubo_stride = if self.use_instances {
            align_up(u64::from(self.ubo_size.max(1)), alignment)
        } else {
            0
        };

        let mut global_entries = vec![BindingLayoutEntry::uniform_buffer(UBO_BINDING)];
        if self.global_sampler_count > 0 {
            global_entries.push(BindingLayoutEntry::samplers(
                SAMPLER_BINDING,
                self.global_sampler_count,
            ));
        }
        let global_layout = backend.create_binding_layout(ShaderScope::Global, &global_entries)?;
        partial.layouts.push(global_layout);

        let instance_layout = if self.use_instances {
            let mut entries = vec![BindingLayoutEntry::uniform_buffer(UBO_BINDING)];
            if self.instance_sampler_count > 0 {
                entries.push(BindingLayoutEntry::samplers(
                    SAMPLER_BINDING,
                    self.instance_sampler_count,
                ));
            }
            let layout = backend.create_binding_layout(ShaderScope::Instance, &entries)?;
            partial.layouts.push(layout);
            Some(layout)
        } else {
            None
        };

        let max_push = backend.max_push_constant_size();
        if self.push_constant_size > max_push {
            return Err(ShaderError::PushConstantBudget {
                name: self.name.clone(),
                requested: self.push_constant_size,
                budget: max_push,
            });
        }
        let push_constant_ranges = if self.push_constant_size > 0 {
            vec![PushConstantRange {
                offset: 0,
                size: self.push_constant_size,
            }]
        } else {
            Vec::new()
        };

        let desc = PipelineDescriptor {
            label: Some(self.name.clone()),
            stages: stage_handles,
            binding_layouts: partial.layouts.clone(),
            push_constant_ranges,
            attributes: self
                .attributes
                .iter()
                .enumerate()
                .map(|(location, a)| VertexAttributeDescriptor {
                    location: location as u32,
                    format: a.format,
                    offset: a.offset,
                })
                .collect(),
            attribute_stride: self.attribute_stride,
            cull_mode: CullMode::Back,
        };
        let pipeline = backend.create_pipeline(&desc)?;
        partial.pipeline = Some(pipeline);

        let buffer_size = self
            .checked_uniform_buffer_size()
            .ok_or_else(|| self.block_too_large("uniform buffer"))?;
        let buffer = backend.create_uniform_buffer(buffer_size)?;
        partial.buffer = Some(buffer);

        let allocator = UniformBufferAllocator::new(buffer_size, alignment)?;
        let global_allocation = allocator.allocate(self.global_ubo_stride)?;

        let frames = backend.frames_in_flight();
        let mut global_sets = Vec::with_capacity(frames);
        for frame_slot in 0..frames {
            let set = backend.allocate_binding_set(global_layout, frame_slot)?;
            partial.sets.push(set);
            global_sets.push(set);
        }

        Ok(ShaderGpu {
            modules: partial.modules.clone(),
            global_layout,
            instance_layout,
            pipeline,
            buffer,
            allocator,
            global_allocation,
            global_sets,
        })
    }

    // ---- Per-frame ---------------------------------------------------------

    /// Bind the pipeline.
    pub fn use_shader(&self, backend: &mut dyn RenderBackend) -> Result<(), ShaderError> {
        let gpu = self.ensure_initialized()?;
        backend.bind_pipeline(gpu.pipeline);
        Ok(())
    }

    /// Direct subsequent instance writes at the global block.
    pub fn bind_globals(&mut self) {
        self.bound_instance = None;
    }

    /// Direct subsequent instance-scope writes at `id`'s block.
    pub fn bind_instance(&mut self, id: InstanceId) -> Result<(), ShaderError> {
        if !self.instances.contains(id) {
            return Err(ShaderError::InvalidInstance(id));
        }
        self.bound_instance = Some(id);
        Ok(())
    }

    /// Write the global binding set for the current frame slot and bind it.
    pub fn apply_globals(&mut self, backend: &mut dyn RenderBackend) -> Result<(), ShaderError> {
        let gpu = self.ensure_initialized()?;
        let frame_slot = backend.current_frame_slot();
        let set = *gpu
            .global_sets
            .get(frame_slot)
            .ok_or(BackendError::InvalidHandle("frame slot"))?;

        backend.write_binding(
            set,
            BindingSlot::new(UBO_BINDING, 0),
            BindingResource::UniformBuffer {
                buffer: gpu.buffer,
                offset: gpu.global_allocation.offset,
                size: self.global_ubo_stride,
            },
        )?;
        for (slot, texture) in self.global_textures.iter().enumerate() {
            match texture {
                Some(texture) => backend.write_binding(
                    set,
                    BindingSlot::new(SAMPLER_BINDING, slot as u32),
                    BindingResource::Texture(texture.handle),
                )?,
                None => log::warn!(
                    "Shader '{}': global sampler slot {} has no texture",
                    self.name,
                    slot
                ),
            }
        }

        backend.bind_binding_set(gpu.pipeline, ShaderScope::Global, set);
        Ok(())
    }

    /// Refresh stale descriptors of the bound instance for the current frame
    /// slot, then bind its set.
    pub fn apply_instance(&mut self, backend: &mut dyn RenderBackend) -> Result<(), ShaderError> {
        crate::profile_function!();
        let Some(id) = self.bound_instance else {
            log::error!("apply_instance on shader '{}' with no instance bound", self.name);
            return Err(ShaderError::NoInstanceBound(self.name.clone()));
        };
        let gpu = self
            .gpu
            .as_ref()
            .ok_or_else(|| ShaderError::NotInitialized(self.name.clone()))?;
        let instance = self
            .instances
            .get_mut(id)
            .ok_or(ShaderError::InvalidInstance(id))?;

        let frame_slot = backend.current_frame_slot();
        let set = *instance
            .sets
            .get(frame_slot)
            .ok_or(BackendError::InvalidHandle("frame slot"))?;

        if !instance.ubo_written[frame_slot] {
            backend.write_binding(
                set,
                BindingSlot::new(UBO_BINDING, 0),
                BindingResource::UniformBuffer {
                    buffer: gpu.buffer,
                    offset: instance.allocation.offset,
                    size: self.ubo_stride,
                },
            )?;
            instance.ubo_written[frame_slot] = true;
        }

        for slot in 0..instance.textures.len() {
            let Some(texture) = instance.textures[slot] else {
                log::warn!(
                    "Shader '{}': instance sampler slot {} has no texture; skipping",
                    self.name,
                    slot
                );
                continue;
            };
            if instance.samplers_written[frame_slot][slot] == Some(texture) {
                continue;
            }
            backend.write_binding(
                set,
                BindingSlot::new(SAMPLER_BINDING, slot as u32),
                BindingResource::Texture(texture.handle),
            )?;
            instance.samplers_written[frame_slot][slot] = Some(texture);
        }

        backend.bind_binding_set(gpu.pipeline, ShaderScope::Instance, set);
        Ok(())
    }

    /// Write a uniform value.
    ///
    /// Local uniforms go straight to the command stream as push constants.
    /// Global and instance uniforms are copied into the uniform buffer at the
    /// scope's base offset plus the uniform's offset.
    pub fn set_uniform(
        &mut self,
        backend: &mut dyn RenderBackend,
        location: UniformLocation,
        data: &[u8],
    ) -> Result<(), ShaderError> {
        let gpu = self.ensure_initialized()?;
        let uniform = self
            .uniforms
            .get(location.index())
            .ok_or(ShaderError::InvalidLocation(location))?;
        if uniform.is_sampler() {
            return Err(ShaderError::IsSampler(uniform.name.clone()));
        }
        if data.len() != uniform.size as usize {
            log::error!(
                "Shader '{}': uniform '{}' expects {} bytes, got {}",
                self.name,
                uniform.name,
                uniform.size,
                data.len()
            );
            return Err(ShaderError::UniformSizeMismatch {
                name: uniform.name.clone(),
                expected: uniform.size,
                actual: data.len(),
            });
        }

        match uniform.scope {
            ShaderScope::Local => {
                backend.push_constants(gpu.pipeline, uniform.offset, data);
            }
            ShaderScope::Global => {
                let offset = gpu.global_allocation.offset + u64::from(uniform.offset);
                backend.write_buffer(gpu.buffer, offset, data)?;
            }
            ShaderScope::Instance => {
                let instance = self
                    .bound_instance
                    .and_then(|id| self.instances.get(id))
                    .ok_or_else(|| ShaderError::NoInstanceBound(self.name.clone()))?;
                let offset = instance.allocation.offset + u64::from(uniform.offset);
                backend.write_buffer(gpu.buffer, offset, data)?;
            }
        }
        Ok(())
    }

    pub fn set_uniform_value<T: bytemuck::Pod>(
        &mut self,
        backend: &mut dyn RenderBackend,
        location: UniformLocation,
        value: &T,
    ) -> Result<(), ShaderError> {
        self.set_uniform(backend, location, bytemuck::bytes_of(value))
    }

    pub fn set_uniform_by_name(
        &mut self,
        backend: &mut dyn RenderBackend,
        name: &str,
        data: &[u8],
    ) -> Result<(), ShaderError> {
        let location = self.require_location(name)?;
        self.set_uniform(backend, location, data)
    }

    fn require_location(&self, name: &str) -> Result<UniformLocation, ShaderError> {
        self.uniform_location(name).ok_or_else(|| {
            log::error!("Shader '{}' has no uniform named '{}'", self.name, name);
            ShaderError::UnknownUniform {
                shader: self.name.clone(),
                name: name.to_string(),
            }
        })
    }

    /// Assign a texture to a sampler slot of the global scope or of the bound
    /// instance.
    pub fn set_sampler(
        &mut self,
        location: UniformLocation,
        texture: TextureBinding,
    ) -> Result<(), ShaderError> {
        let uniform = self
            .uniforms
            .get(location.index())
            .ok_or(ShaderError::InvalidLocation(location))?;
        let Some(slot) = uniform.sampler_slot else {
            return Err(ShaderError::NotSampler(uniform.name.clone()));
        };
        let slot = slot as usize;

        match uniform.scope {
            ShaderScope::Global => self.global_textures[slot] = Some(texture),
            _ => {
                let instance = self
                    .bound_instance
                    .and_then(|id| self.instances.get_mut(id))
                    .ok_or_else(|| ShaderError::NoInstanceBound(self.name.clone()))?;
                instance.textures[slot] = Some(texture);
            }
        }
        Ok(())
    }

    pub fn set_sampler_by_name(
        &mut self,
        name: &str,
        texture: TextureBinding,
    ) -> Result<(), ShaderError> {
        let location = self.require_location(name)?;
        self.set_sampler(location, texture)
    }

    // ---- Instances ---------------------------------------------------------

    /// Reserve an instance: a uniform buffer region plus one binding set per
    /// frame in flight.
    ///
    /// Fails with [`ShaderError::NoInstancesAvailable`] once the fixed
    /// instance capacity is used up.
    pub fn acquire_instance_resources(
        &mut self,
        backend: &mut dyn RenderBackend,
    ) -> Result<InstanceId, ShaderError> {
        let gpu = self.ensure_initialized()?;
        let Some(layout) = gpu.instance_layout else {
            return Err(ShaderError::InstancesNotSupported {
                shader: self.name.clone(),
                name: "instance".to_string(),
            });
        };
        if self.instances.len() >= self.instances.capacity() {
            log::error!(
                "Shader '{}': no instances available (max {})",
                self.name,
                self.instances.capacity()
            );
            return Err(ShaderError::NoInstancesAvailable {
                shader: self.name.clone(),
                max: self.instances.capacity(),
            });
        }

        let allocation = gpu.allocator.allocate(self.ubo_stride)?;

        let frames = backend.frames_in_flight();
        let mut sets = Vec::with_capacity(frames);
        for frame_slot in 0..frames {
            match backend.allocate_binding_set(layout, frame_slot) {
                Ok(set) => sets.push(set),
                Err(e) => {
                    log::error!(
                        "Shader '{}': failed to allocate instance binding set: {e}",
                        self.name
                    );
                    for set in sets {
                        backend.free_binding_set(set);
                    }
                    if let Err(free_err) = gpu.allocator.free(allocation) {
                        log::error!("Failed to return instance region: {free_err}");
                    }
                    return Err(e.into());
                }
            }
        }

        let state = InstanceState::new(allocation, sets, self.instance_sampler_count as usize);
        match self.instances.insert(state) {
            Some(id) => {
                log::trace!(
                    "Shader '{}': acquired instance {:?} at offset {}",
                    self.name,
                    id,
                    allocation.offset
                );
                Ok(id)
            }
            None => Err(ShaderError::NoInstancesAvailable {
                shader: self.name.clone(),
                max: self.instances.capacity(),
            }),
        }
    }

    /// Release an instance's region and binding sets.
    ///
    /// Waits for the device to go idle first. Releasing a stale or already
    /// released id fails without touching the allocator.
    pub fn release_instance_resources(
        &mut self,
        backend: &mut dyn RenderBackend,
        id: InstanceId,
    ) -> Result<(), ShaderError> {
        let gpu = self
            .gpu
            .as_ref()
            .ok_or_else(|| ShaderError::NotInitialized(self.name.clone()))?;
        if !self.instances.contains(id) {
            log::warn!(
                "Shader '{}': release of invalid instance {:?}",
                self.name,
                id
            );
            return Err(ShaderError::InvalidInstance(id));
        }

        if let Err(e) = backend.wait_idle() {
            log::warn!("wait_idle failed while releasing instance: {e}");
        }

        let Some(state) = self.instances.remove(id) else {
            return Err(ShaderError::InvalidInstance(id));
        };
        for set in state.sets {
            backend.free_binding_set(set);
        }
        gpu.allocator.free(state.allocation)?;

        if self.bound_instance == Some(id) {
            self.bound_instance = None;
        }
        log::trace!("Shader '{}': released instance {:?}", self.name, id);
        Ok(())
    }

    /// Destroy every backend object. The shader returns to `NotCreated`.
    pub fn destroy(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(gpu) = self.gpu.take() {
            if let Err(e) = backend.wait_idle() {
                log::warn!("wait_idle failed while destroying shader '{}': {e}", self.name);
            }
            for id in self.instances.handles() {
                if let Some(state) = self.instances.remove(id) {
                    for set in state.sets {
                        backend.free_binding_set(set);
                    }
                }
            }
            for set in gpu.global_sets {
                backend.free_binding_set(set);
            }
            backend.destroy_buffer(gpu.buffer);
            backend.destroy_pipeline(gpu.pipeline);
            if let Some(layout) = gpu.instance_layout {
                backend.destroy_binding_layout(layout);
            }
            backend.destroy_binding_layout(gpu.global_layout);
            for module in gpu.modules {
                backend.destroy_shader_stage(module);
            }
        }
        self.bound_instance = None;
        self.state = ShaderState::NotCreated;
        log::debug!("Shader '{}' destroyed", self.name);
    }
}

impl std::fmt::Debug for Shader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shader")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("uniforms", &self.uniforms.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NullBackend, RecordedCommand, TextureHandle};
    use crate::resources::MemoryLoader;

    fn loader() -> MemoryLoader {
        let loader = MemoryLoader::new();
        loader.insert(ResourceType::ShaderBytecode, "test.vert.spv", vec![3, 2, 2, 7]);
        loader.insert(ResourceType::ShaderBytecode, "test.frag.spv", vec![3, 2, 2, 7]);
        loader
    }

    fn shader(use_instances: bool, use_local: bool) -> Shader {
        let limits = ShaderLimits {
            max_instances: 4,
            ..Default::default()
        };
        let mut shader = Shader::new("test", use_instances, use_local, limits);
        shader.add_stage(ShaderStage::Vertex, "test.vert.spv").unwrap();
        shader.add_stage(ShaderStage::Fragment, "test.frag.spv").unwrap();
        shader
    }

    #[test]
    fn local_ranges_are_four_byte_aligned() {
        let mut shader = shader(false, true);
        let a = shader.add_uniform("a", UniformType::U8, ShaderScope::Local).unwrap();
        let b = shader.add_uniform("b", UniformType::Vec3, ShaderScope::Local).unwrap();
        assert_eq!(shader.uniform(a).unwrap().offset, 0);
        assert_eq!(shader.uniform(b).unwrap().offset, 4);
        assert_eq!(shader.push_constant_size(), 16);
    }

    #[test]
    fn push_constant_budget_enforced() {
        let mut shader = shader(false, true);
        shader.add_uniform("m0", UniformType::Mat4, ShaderScope::Local).unwrap();
        shader.add_uniform("m1", UniformType::Mat4, ShaderScope::Local).unwrap();
        let err = shader.add_uniform("extra", UniformType::F32, ShaderScope::Local);
        assert!(matches!(err, Err(ShaderError::PushConstantBudget { .. })));
        assert_eq!(shader.uniforms().len(), 2);
    }

    #[test]
    fn local_requires_push_constant_support() {
        let mut shader = shader(false, false);
        assert!(matches!(
            shader.add_uniform("model", UniformType::Mat4, ShaderScope::Local),
            Err(ShaderError::LocalNotSupported { .. })
        ));
    }

    #[test]
    fn sampler_scope_rules() {
        let mut shader = shader(false, true);
        assert!(matches!(
            shader.add_sampler("s", ShaderScope::Local),
            Err(ShaderError::LocalSampler(_))
        ));
        assert!(matches!(
            shader.add_sampler("s", ShaderScope::Instance),
            Err(ShaderError::InstancesNotSupported { .. })
        ));
        let a = shader.add_sampler("a", ShaderScope::Global).unwrap();
        let b = shader.add_uniform("b", UniformType::Sampler, ShaderScope::Global).unwrap();
        assert_eq!(shader.uniform(a).unwrap().sampler_slot, Some(0));
        assert_eq!(shader.uniform(b).unwrap().sampler_slot, Some(1));
        assert_eq!(shader.global_sampler_count(), 2);
    }

    #[test]
    fn declarations_frozen_after_initialize() {
        let mut backend = NullBackend::new();
        let mut shader = shader(false, false);
        shader.add_uniform("x", UniformType::F32, ShaderScope::Global).unwrap();
        shader.initialize(&mut backend, &loader()).unwrap();
        assert!(matches!(
            shader.add_uniform("y", UniformType::F32, ShaderScope::Global),
            Err(ShaderError::AlreadyInitialized(_))
        ));
        assert!(matches!(
            shader.add_attribute("pos", VertexFormat::Float32x3),
            Err(ShaderError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn zero_stage_shader_fails() {
        let mut backend = NullBackend::new();
        let mut shader = Shader::new("empty", false, false, ShaderLimits::default());
        assert!(matches!(
            shader.initialize(&mut backend, &loader()),
            Err(ShaderError::NoStages(_))
        ));
    }

    #[test]
    fn attribute_stride_accumulates() {
        let mut shader = shader(false, false);
        shader.add_attribute("pos", VertexFormat::Float32x3).unwrap();
        shader.add_attribute("uv", VertexFormat::Float32x2).unwrap();
        assert_eq!(shader.attribute_stride(), 20);
        assert_eq!(shader.attributes()[1].offset, 12);
        assert!(matches!(
            shader.add_attribute("", VertexFormat::Float32),
            Err(ShaderError::EmptyName(_))
        ));
    }

    #[test]
    fn local_uniform_pushes_constants() {
        let mut backend = NullBackend::new();
        let mut shader = shader(false, true);
        let model = shader.add_uniform("model", UniformType::Mat4, ShaderScope::Local).unwrap();
        shader.initialize(&mut backend, &loader()).unwrap();
        shader
            .set_uniform_value(&mut backend, model, &glam::Mat4::IDENTITY)
            .unwrap();
        match backend.commands().last() {
            Some(RecordedCommand::PushConstants { offset, data, .. }) => {
                assert_eq!(*offset, 0);
                assert_eq!(data.len(), 64);
            }
            other => panic!("expected push constants, got {other:?}"),
        }
    }

    #[test]
    fn instance_sampler_write_skipped_when_current() {
        let mut backend = NullBackend::with_frames_in_flight(1);
        let mut shader = shader(true, false);
        let diffuse = shader.add_sampler("diffuse", ShaderScope::Instance).unwrap();
        shader.initialize(&mut backend, &loader()).unwrap();

        let id = shader.acquire_instance_resources(&mut backend).unwrap();
        shader.bind_instance(id).unwrap();
        let texture = TextureBinding {
            handle: TextureHandle(99),
            generation: 1,
        };
        shader.set_sampler(diffuse, texture).unwrap();

        backend.begin_frame().unwrap();
        shader.apply_instance(&mut backend).unwrap();
        let writes = backend.binding_write_count();
        assert_eq!(writes, 2);

        shader.apply_instance(&mut backend).unwrap();
        assert_eq!(backend.binding_write_count(), writes);

        // A new generation of the same texture is rewritten.
        shader
            .set_sampler(
                diffuse,
                TextureBinding {
                    generation: 2,
                    ..texture
                },
            )
            .unwrap();
        shader.apply_instance(&mut backend).unwrap();
        assert_eq!(backend.binding_write_count(), writes + 1);
    }

    #[test]
    fn destroy_releases_backend_objects() {
        let mut backend = NullBackend::new();
        let mut shader = shader(true, false);
        shader.add_uniform("colour", UniformType::Vec4, ShaderScope::Instance).unwrap();
        shader.initialize(&mut backend, &loader()).unwrap();
        shader.acquire_instance_resources(&mut backend).unwrap();

        shader.destroy(&mut backend);
        assert_eq!(shader.state(), ShaderState::NotCreated);
        assert_eq!(backend.stats(), Default::default());
    }
}
