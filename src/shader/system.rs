//! Shader registry.

use std::collections::HashMap;

use serde::Deserialize;

use crate::arena::{Arena, Handle};
use crate::backend::RenderBackend;
use crate::resources::{ResourceLoader, ResourceType};

use super::{Shader, ShaderConfig, ShaderError, ShaderLimits, ShaderState};

/// Handle to a registered shader.
pub type ShaderId = Handle<Shader>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShaderSystemConfig {
    pub max_shader_count: usize,
    /// Instance slots reserved in every instanced shader's uniform buffer.
    pub max_instances: usize,
    pub max_uniform_count: usize,
    pub max_global_textures: u32,
    pub max_instance_textures: u32,
}

impl Default for ShaderSystemConfig {
    fn default() -> Self {
        let limits = ShaderLimits::default();
        Self {
            max_shader_count: 1024,
            max_instances: limits.max_instances,
            max_uniform_count: limits.max_uniforms,
            max_global_textures: limits.max_global_textures,
            max_instance_textures: limits.max_instance_textures,
        }
    }
}

impl ShaderSystemConfig {
    pub fn limits(&self) -> ShaderLimits {
        ShaderLimits {
            max_instances: self.max_instances,
            max_uniforms: self.max_uniform_count,
            max_global_textures: self.max_global_textures,
            max_instance_textures: self.max_instance_textures,
        }
    }
}

/// Owns every shader and maps names to ids.
pub struct ShaderSystem {
    config: ShaderSystemConfig,
    shaders: Arena<Shader>,
    by_name: HashMap<String, ShaderId>,
    current: Option<ShaderId>,
}

impl ShaderSystem {
    pub fn new(config: ShaderSystemConfig) -> Self {
        log::info!(
            "Shader system initialized (max {} shaders, {} instances each)",
            config.max_shader_count,
            config.max_instances
        );
        Self {
            shaders: Arena::with_capacity(config.max_shader_count),
            by_name: HashMap::new(),
            current: None,
            config,
        }
    }

    pub fn config(&self) -> &ShaderSystemConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    /// Register an uninitialized shader with everything `config` declares.
    ///
    /// Nothing is registered if any declaration fails.
    pub fn create(&mut self, config: &ShaderConfig) -> Result<ShaderId, ShaderError> {
        if self.by_name.contains_key(&config.name) {
            log::error!("Shader '{}' already exists", config.name);
            return Err(ShaderError::DuplicateShader(config.name.clone()));
        }
        let shader = Shader::from_config(config, self.config.limits())?;
        let id = self.shaders.insert(shader).ok_or_else(|| {
            log::error!(
                "Cannot create shader '{}': limit of {} reached",
                config.name,
                self.config.max_shader_count
            );
            ShaderError::TooManyShaders {
                max: self.config.max_shader_count,
            }
        })?;
        self.by_name.insert(config.name.clone(), id);
        Ok(id)
    }

    /// Declare and initialize a shader. On failure it is removed again.
    pub fn create_from_config(
        &mut self,
        config: &ShaderConfig,
        backend: &mut dyn RenderBackend,
        loader: &dyn ResourceLoader,
    ) -> Result<ShaderId, ShaderError> {
        let id = self.create(config)?;
        let result = match self.shaders.get_mut(id) {
            Some(shader) => shader.initialize(backend, loader),
            None => Err(ShaderError::UnknownShader(config.name.clone())),
        };
        if let Err(e) = result {
            self.shaders.remove(id);
            self.by_name.remove(&config.name);
            return Err(e);
        }
        log::debug!("Shader '{}' created", config.name);
        Ok(id)
    }

    /// Load `shaders/<name>.toml` and create the shader it describes.
    pub fn load(
        &mut self,
        name: &str,
        backend: &mut dyn RenderBackend,
        loader: &dyn ResourceLoader,
    ) -> Result<ShaderId, ShaderError> {
        if let Some(id) = self.get_id(name) {
            return Ok(id);
        }
        let resource = loader.load(name, ResourceType::ShaderConfig)?;
        let config = resource.parse_toml::<ShaderConfig>();
        loader.unload(resource);
        self.create_from_config(&config?, backend, loader)
    }

    pub fn get_id(&self, name: &str) -> Option<ShaderId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: ShaderId) -> Option<&Shader> {
        self.shaders.get(id)
    }

    pub fn get_mut(&mut self, id: ShaderId) -> Option<&mut Shader> {
        self.shaders.get_mut(id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Shader> {
        self.get_id(name).and_then(|id| self.get(id))
    }

    pub fn require_mut(&mut self, id: ShaderId) -> Result<&mut Shader, ShaderError> {
        self.shaders
            .get_mut(id)
            .ok_or_else(|| ShaderError::UnknownShader(format!("{id:?}")))
    }

    /// Lifecycle state; unknown ids report `NotCreated`.
    pub fn state(&self, id: ShaderId) -> ShaderState {
        self.get(id)
            .map(Shader::state)
            .unwrap_or(ShaderState::NotCreated)
    }

    /// Shader whose pipeline was bound last.
    pub fn current(&self) -> Option<ShaderId> {
        self.current
    }

    /// Bind the shader's pipeline. Rebinding the current shader is a no-op.
    pub fn use_shader(
        &mut self,
        id: ShaderId,
        backend: &mut dyn RenderBackend,
    ) -> Result<(), ShaderError> {
        if self.current == Some(id) {
            return Ok(());
        }
        let shader = self.require_mut(id)?;
        shader.use_shader(backend)?;
        self.current = Some(id);
        Ok(())
    }

    /// Forget the bound pipeline, e.g. at the start of a frame.
    pub fn reset_current(&mut self) {
        self.current = None;
    }

    pub fn destroy(&mut self, id: ShaderId, backend: &mut dyn RenderBackend) {
        let Some(mut shader) = self.shaders.remove(id) else {
            log::warn!("destroy called with unknown shader {id:?}");
            return;
        };
        self.by_name.remove(shader.name());
        if self.current == Some(id) {
            self.current = None;
        }
        shader.destroy(backend);
    }

    pub fn shutdown(&mut self, backend: &mut dyn RenderBackend) {
        for id in self.shaders.handles() {
            self.destroy(id, backend);
        }
        log::info!("Shader system shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FailurePoint, NullBackend, ShaderScope, ShaderStage};
    use crate::resources::MemoryLoader;

    fn loader() -> MemoryLoader {
        let loader = MemoryLoader::new();
        loader.insert(ResourceType::ShaderBytecode, "a.vert.spv", vec![1, 2, 3, 4]);
        loader.insert(ResourceType::ShaderBytecode, "a.frag.spv", vec![1, 2, 3, 4]);
        loader
    }

    fn config(name: &str) -> ShaderConfig {
        ShaderConfig::new(name)
            .with_instances()
            .with_stage(ShaderStage::Vertex, "a.vert.spv")
            .with_stage(ShaderStage::Fragment, "a.frag.spv")
            .with_uniform("projection", "mat4", ShaderScope::Global)
            .with_uniform("colour", "vec4", ShaderScope::Instance)
    }

    #[test]
    fn create_and_lookup() {
        let mut backend = NullBackend::new();
        let mut system = ShaderSystem::new(ShaderSystemConfig::default());
        let id = system
            .create_from_config(&config("a"), &mut backend, &loader())
            .unwrap();
        assert_eq!(system.get_id("a"), Some(id));
        assert_eq!(system.state(id), ShaderState::Initialized);
        assert!(matches!(
            system.create(&config("a")),
            Err(ShaderError::DuplicateShader(_))
        ));
    }

    #[test]
    fn failed_initialize_removes_shader() {
        let mut backend = NullBackend::new();
        backend.inject_failure(FailurePoint::Pipeline);
        let mut system = ShaderSystem::new(ShaderSystemConfig::default());
        assert!(system
            .create_from_config(&config("a"), &mut backend, &loader())
            .is_err());
        assert!(system.get_id("a").is_none());
        assert!(system.is_empty());
        assert_eq!(backend.stats(), Default::default());
    }

    #[test]
    fn bad_declaration_registers_nothing() {
        let mut system = ShaderSystem::new(ShaderSystemConfig::default());
        let bad = config("bad").with_uniform("model", "mat4", ShaderScope::Local);
        assert!(matches!(
            system.create(&bad),
            Err(ShaderError::LocalNotSupported { .. })
        ));
        assert!(system.get_id("bad").is_none());
    }

    #[test]
    fn shader_count_limit() {
        let mut system = ShaderSystem::new(ShaderSystemConfig {
            max_shader_count: 1,
            ..Default::default()
        });
        system.create(&config("a")).unwrap();
        assert!(matches!(
            system.create(&config("b")),
            Err(ShaderError::TooManyShaders { max: 1 })
        ));
    }

    #[test]
    fn use_shader_binds_once() {
        let mut backend = NullBackend::new();
        let mut system = ShaderSystem::new(ShaderSystemConfig::default());
        let id = system
            .create_from_config(&config("a"), &mut backend, &loader())
            .unwrap();
        system.use_shader(id, &mut backend).unwrap();
        system.use_shader(id, &mut backend).unwrap();
        assert_eq!(backend.commands().len(), 1);
    }

    #[test]
    fn unknown_id_reports_not_created() {
        let mut backend = NullBackend::new();
        let mut system = ShaderSystem::new(ShaderSystemConfig::default());
        let id = system.create(&config("a")).unwrap();
        system.destroy(id, &mut backend);
        assert_eq!(system.state(id), ShaderState::NotCreated);
    }

    #[test]
    fn load_from_toml() {
        let mut backend = NullBackend::new();
        let loader = loader();
        loader.insert_text(
            ResourceType::ShaderConfig,
            "builtin.test",
            r#"
            name = "builtin.test"
            stages = [{ stage = "vertex", file = "a.vert.spv" }]
            uniforms = [{ name = "projection", type = "mat4", scope = "global" }]
            "#,
        );
        let mut system = ShaderSystem::new(ShaderSystemConfig::default());
        let id = system.load("builtin.test", &mut backend, &loader).unwrap();
        let shader = system.get(id).unwrap();
        assert_eq!(shader.global_ubo_stride(), 256);
        assert_eq!(shader.ubo_stride(), 0);
    }
}
