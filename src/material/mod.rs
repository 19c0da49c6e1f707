//! Material system
//!
//! Materials are named, reference-counted bundles of instance uniforms and
//! textures on top of a shader instance. Three families exist: standard lit
//! materials, UI materials and multi-layer terrain materials.
//!
//! Binding order per draw is always globals, then instance, then local:
//!
//! ```text
//! apply_global(shader, frame)   once per shader per frame
//! apply_instance(material, ..)  once per material per frame (uniforms), bind every draw
//! apply_local(material, model)  push constants, every draw
//! ```

mod config;

pub use config::{
    MaterialConfig, MaterialKind, TerrainLayerConfig, DEFAULT_SHININESS, MAX_TERRAIN_LAYERS,
};

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use serde::Deserialize;
use thiserror::Error;

use crate::arena::{Arena, Handle};
use crate::backend::{BackendError, RenderBackend};
use crate::jobs::JobSystem;
use crate::resources::{ResourceError, ResourceLoader, ResourceType, TextureId, TextureSystem};
use crate::shader::{InstanceId, Shader, ShaderError, ShaderId, ShaderSystem};

pub const DEFAULT_MATERIAL_NAME: &str = "default";

/// Material errors
#[derive(Error, Debug)]
pub enum MaterialError {
    #[error("Unknown material '{0}'")]
    UnknownMaterial(String),
    #[error("Invalid or released material {0:?}")]
    InvalidMaterial(MaterialId),
    #[error("Material limit of {max} reached")]
    TooManyMaterials { max: usize },
    #[error("Terrain material '{name}' has {count} layers (max {MAX_TERRAIN_LAYERS})")]
    TooManyLayers { name: String, count: usize },
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MaterialSystemConfig {
    pub max_material_count: usize,
}

impl Default for MaterialSystemConfig {
    fn default() -> Self {
        Self {
            max_material_count: 1024,
        }
    }
}

/// Debug visualisation selected per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum RenderMode {
    #[default]
    Default = 0,
    Lighting = 1,
    Normals = 2,
}

/// Per-frame values written into a shader's global block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalUniforms {
    pub projection: Mat4,
    pub view: Mat4,
    pub ambient_colour: Vec4,
    pub view_position: Vec3,
    pub mode: RenderMode,
}

impl Default for GlobalUniforms {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            ambient_colour: Vec4::new(0.25, 0.25, 0.25, 1.0),
            view_position: Vec3::ZERO,
            mode: RenderMode::Default,
        }
    }
}

/// Systems a material operation touches.
pub struct MaterialContext<'a> {
    pub backend: &'a mut dyn RenderBackend,
    pub shaders: &'a mut ShaderSystem,
    pub textures: &'a mut TextureSystem,
    pub loader: &'a Arc<dyn ResourceLoader>,
    /// Textures are loaded in the background when a job system is given;
    /// otherwise they stay on the default texture until uploaded.
    pub jobs: Option<&'a JobSystem>,
}

pub type MaterialId = Handle<Material>;

/// Texture assigned to one of the material shader's samplers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureMap {
    pub sampler: String,
    pub texture: TextureId,
    /// Name the texture was acquired under; `None` for the default texture.
    texture_name: Option<String>,
}

#[derive(Debug)]
pub struct Material {
    pub name: String,
    pub kind: MaterialKind,
    pub shader: ShaderId,
    pub instance: InstanceId,
    pub diffuse_colour: Vec4,
    pub shininess: f32,
    /// Shininess of each terrain layer.
    pub layer_shininess: Vec<f32>,
    pub maps: Vec<TextureMap>,
    /// Frame number the instance uniforms were last written for.
    pub render_frame: Option<u64>,
    ref_count: usize,
    auto_release: bool,
}

impl Material {
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn auto_release(&self) -> bool {
        self.auto_release
    }
}

/// Sampler name paired with the texture configured for it.
fn sampler_assignments(config: &MaterialConfig) -> Vec<(String, Option<String>)> {
    match config.kind {
        MaterialKind::Standard => vec![
            ("diffuse_texture".to_string(), config.diffuse_map.clone()),
            ("specular_texture".to_string(), config.specular_map.clone()),
            ("normal_texture".to_string(), config.normal_map.clone()),
        ],
        MaterialKind::Ui => vec![("diffuse_texture".to_string(), config.diffuse_map.clone())],
        MaterialKind::Terrain => config
            .layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                [
                    (format!("diffuse_texture_{i}"), layer.diffuse_map.clone()),
                    (format!("specular_texture_{i}"), layer.specular_map.clone()),
                    (format!("normal_texture_{i}"), layer.normal_map.clone()),
                ]
            })
            .collect(),
    }
}

/// Write a uniform only if the shader declares it.
fn write_if_declared(
    shader: &mut Shader,
    backend: &mut dyn RenderBackend,
    name: &str,
    data: &[u8],
) -> Result<(), ShaderError> {
    match shader.uniform_location(name) {
        Some(location) => shader.set_uniform(backend, location, data),
        None => Ok(()),
    }
}

/// Named material registry.
pub struct MaterialSystem {
    config: MaterialSystemConfig,
    materials: Arena<Material>,
    by_name: HashMap<String, MaterialId>,
    default_material: MaterialId,
}

impl MaterialSystem {
    /// Create the registry and its built-in default material.
    pub fn new(
        config: MaterialSystemConfig,
        ctx: &mut MaterialContext<'_>,
    ) -> Result<Self, MaterialError> {
        let mut system = Self {
            materials: Arena::with_capacity(config.max_material_count.max(1)),
            by_name: HashMap::new(),
            default_material: Handle::new(0, 0),
            config,
        };
        let default = MaterialConfig::new(DEFAULT_MATERIAL_NAME, MaterialKind::Standard)
            .with_auto_release(false);
        system.default_material = system.acquire_from_config(&default, ctx)?;
        log::info!(
            "Material system initialized (max materials: {})",
            system.config.max_material_count
        );
        Ok(system)
    }

    pub fn config(&self) -> &MaterialSystemConfig {
        &self.config
    }

    pub fn default_material(&self) -> MaterialId {
        self.default_material
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<MaterialId> {
        self.by_name.get(name).copied()
    }

    pub fn material(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id)
    }

    /// Take a reference to `name`, loading `materials/<name>.toml` the first
    /// time.
    pub fn acquire(
        &mut self,
        name: &str,
        ctx: &mut MaterialContext<'_>,
    ) -> Result<MaterialId, MaterialError> {
        if let Some(id) = self.add_reference(name) {
            return Ok(id);
        }
        let resource = ctx.loader.load(name, ResourceType::MaterialConfig)?;
        let config = resource.parse_toml::<MaterialConfig>();
        ctx.loader.unload(resource);
        let mut config = config?;
        if config.name.is_empty() {
            config.name = name.to_string();
        }
        self.acquire_from_config(&config, ctx)
    }

    /// Take a reference to the material `config` describes, creating it if
    /// needed.
    pub fn acquire_from_config(
        &mut self,
        config: &MaterialConfig,
        ctx: &mut MaterialContext<'_>,
    ) -> Result<MaterialId, MaterialError> {
        if let Some(id) = self.add_reference(&config.name) {
            return Ok(id);
        }
        if config.kind == MaterialKind::Terrain && config.layers.len() > MAX_TERRAIN_LAYERS {
            log::error!(
                "Terrain material '{}' has {} layers",
                config.name,
                config.layers.len()
            );
            return Err(MaterialError::TooManyLayers {
                name: config.name.clone(),
                count: config.layers.len(),
            });
        }
        if self.materials.len() >= self.materials.capacity() {
            log::error!(
                "Cannot create material '{}': limit of {} reached",
                config.name,
                self.materials.capacity()
            );
            return Err(MaterialError::TooManyMaterials {
                max: self.materials.capacity(),
            });
        }

        let shader_name = config.shader_name();
        let shader_id = match ctx.shaders.get_id(shader_name) {
            Some(id) => id,
            None => ctx
                .shaders
                .load(shader_name, &mut *ctx.backend, &**ctx.loader)?,
        };

        let maps = acquire_maps(config, shader_id, ctx)?;

        let instance = match ctx
            .shaders
            .require_mut(shader_id)
            .and_then(|shader| shader.acquire_instance_resources(&mut *ctx.backend))
        {
            Ok(instance) => instance,
            Err(e) => {
                log::error!("Failed to acquire instance for material '{}': {e}", config.name);
                release_maps(&maps, ctx);
                return Err(e.into());
            }
        };

        let material = Material {
            name: config.name.clone(),
            kind: config.kind,
            shader: shader_id,
            instance,
            diffuse_colour: Vec4::from_array(config.diffuse_colour),
            shininess: config.shininess,
            layer_shininess: config.layers.iter().map(|l| l.shininess).collect(),
            maps,
            render_frame: None,
            ref_count: 1,
            auto_release: config.auto_release,
        };
        let Some(id) = self.materials.insert(material) else {
            return Err(MaterialError::TooManyMaterials {
                max: self.materials.capacity(),
            });
        };
        self.by_name.insert(config.name.clone(), id);
        log::debug!("Material '{}' created on shader '{}'", config.name, shader_name);
        Ok(id)
    }

    fn add_reference(&mut self, name: &str) -> Option<MaterialId> {
        let id = *self.by_name.get(name)?;
        let material = self.materials.get_mut(id)?;
        material.ref_count += 1;
        log::trace!("Material '{}' acquired ({} refs)", name, material.ref_count);
        Some(id)
    }

    /// Drop a reference; at zero an auto-release material is destroyed.
    /// The default material is never released.
    pub fn release(&mut self, name: &str, ctx: &mut MaterialContext<'_>) -> Result<(), MaterialError> {
        if name == DEFAULT_MATERIAL_NAME {
            log::warn!("Attempted to release the default material");
            return Ok(());
        }
        let Some(&id) = self.by_name.get(name) else {
            log::warn!("Release of unknown material '{name}'");
            return Err(MaterialError::UnknownMaterial(name.to_string()));
        };
        let Some(material) = self.materials.get_mut(id) else {
            return Err(MaterialError::InvalidMaterial(id));
        };
        material.ref_count = material.ref_count.saturating_sub(1);
        if material.ref_count > 0 || !material.auto_release {
            return Ok(());
        }

        self.by_name.remove(name);
        if let Some(material) = self.materials.remove(id) {
            destroy_material(material, ctx);
        }
        log::debug!("Material '{name}' released");
        Ok(())
    }

    /// Write per-frame globals into `shader_id`'s global block and bind it.
    /// Does nothing if that shader already applied globals this frame.
    pub fn apply_global(
        &self,
        shader_id: ShaderId,
        frame_number: u64,
        globals: &GlobalUniforms,
        ctx: &mut MaterialContext<'_>,
    ) -> Result<(), MaterialError> {
        let shader = ctx.shaders.require_mut(shader_id)?;
        if shader.last_globals_frame() == Some(frame_number) {
            return Ok(());
        }
        let backend = &mut *ctx.backend;

        shader.bind_globals();
        write_if_declared(shader, backend, "projection", bytemuck::bytes_of(&globals.projection))?;
        write_if_declared(shader, backend, "view", bytemuck::bytes_of(&globals.view))?;
        write_if_declared(
            shader,
            backend,
            "ambient_colour",
            bytemuck::bytes_of(&globals.ambient_colour),
        )?;
        write_if_declared(
            shader,
            backend,
            "view_position",
            bytemuck::bytes_of(&globals.view_position),
        )?;
        write_if_declared(shader, backend, "mode", bytemuck::bytes_of(&(globals.mode as i32)))?;
        shader.apply_globals(backend)?;
        shader.set_last_globals_frame(frame_number);
        Ok(())
    }

    /// Bind the material's instance. With `needs_update` its uniforms and
    /// samplers are written first.
    pub fn apply_instance(
        &self,
        id: MaterialId,
        needs_update: bool,
        ctx: &mut MaterialContext<'_>,
    ) -> Result<(), MaterialError> {
        crate::profile_function!();
        let material = self
            .materials
            .get(id)
            .ok_or(MaterialError::InvalidMaterial(id))?;
        let shader = ctx.shaders.require_mut(material.shader)?;
        let backend = &mut *ctx.backend;

        shader.bind_instance(material.instance)?;
        if needs_update {
            let colour = bytemuck::bytes_of(&material.diffuse_colour);
            match material.kind {
                MaterialKind::Standard => {
                    write_if_declared(shader, backend, "diffuse_colour", colour)?;
                    write_if_declared(
                        shader,
                        backend,
                        "shininess",
                        bytemuck::bytes_of(&material.shininess),
                    )?;
                }
                MaterialKind::Ui => {
                    write_if_declared(shader, backend, "diffuse_colour", colour)?;
                }
                MaterialKind::Terrain => {
                    let layer_count = material.layer_shininess.len() as i32;
                    write_if_declared(
                        shader,
                        backend,
                        "layer_count",
                        bytemuck::bytes_of(&layer_count),
                    )?;
                    for (i, shininess) in material.layer_shininess.iter().enumerate() {
                        write_if_declared(
                            shader,
                            backend,
                            &format!("shininess_{i}"),
                            bytemuck::bytes_of(shininess),
                        )?;
                    }
                }
            }
            for map in &material.maps {
                shader.set_sampler_by_name(&map.sampler, ctx.textures.binding(map.texture))?;
            }
        }
        shader.apply_instance(backend)?;
        Ok(())
    }

    /// Push the model matrix for the next draw.
    pub fn apply_local(
        &self,
        id: MaterialId,
        model: &Mat4,
        ctx: &mut MaterialContext<'_>,
    ) -> Result<(), MaterialError> {
        let material = self
            .materials
            .get(id)
            .ok_or(MaterialError::InvalidMaterial(id))?;
        let shader = ctx.shaders.require_mut(material.shader)?;
        shader.set_uniform_by_name(&mut *ctx.backend, "model", bytemuck::bytes_of(model))?;
        Ok(())
    }

    /// Frame the material's instance uniforms were last written for.
    pub fn render_frame(&self, id: MaterialId) -> Option<u64> {
        self.materials.get(id).and_then(|m| m.render_frame)
    }

    pub fn mark_rendered(&mut self, id: MaterialId, frame_number: u64) {
        if let Some(material) = self.materials.get_mut(id) {
            material.render_frame = Some(frame_number);
        }
    }

    /// Destroy every material, the default one included.
    pub fn shutdown(&mut self, ctx: &mut MaterialContext<'_>) {
        for id in self.materials.handles() {
            if let Some(material) = self.materials.remove(id) {
                destroy_material(material, ctx);
            }
        }
        self.by_name.clear();
        log::info!("Material system shut down");
    }
}

/// Acquire the textures of every sampler the shader declares.
fn acquire_maps(
    config: &MaterialConfig,
    shader_id: ShaderId,
    ctx: &mut MaterialContext<'_>,
) -> Result<Vec<TextureMap>, MaterialError> {
    let Some(shader) = ctx.shaders.get(shader_id) else {
        return Err(ShaderError::UnknownShader(config.shader_name().to_string()).into());
    };
    let declared: Vec<(String, Option<String>)> = sampler_assignments(config)
        .into_iter()
        .filter(|(sampler, _)| shader.has_uniform(sampler))
        .collect();

    let mut maps = Vec::with_capacity(declared.len());
    for (sampler, texture_name) in declared {
        let texture = match &texture_name {
            Some(name) => {
                let acquired = match (ctx.jobs, ctx.textures.find(name)) {
                    (Some(jobs), None) => {
                        ctx.textures.load_async(name, jobs, Arc::clone(ctx.loader))
                    }
                    _ => ctx.textures.acquire(name, true),
                };
                match acquired {
                    Ok(id) => id,
                    Err(e) => {
                        log::error!(
                            "Material '{}': failed to acquire texture '{}': {e}",
                            config.name,
                            name
                        );
                        release_maps(&maps, ctx);
                        return Err(e.into());
                    }
                }
            }
            None => ctx.textures.default_texture(),
        };
        maps.push(TextureMap {
            sampler,
            texture,
            texture_name,
        });
    }
    Ok(maps)
}

fn release_maps(maps: &[TextureMap], ctx: &mut MaterialContext<'_>) {
    for map in maps {
        if let Some(name) = &map.texture_name {
            ctx.textures.release(name, &mut *ctx.backend);
        }
    }
}

fn destroy_material(material: Material, ctx: &mut MaterialContext<'_>) {
    if let Some(shader) = ctx.shaders.get_mut(material.shader) {
        if let Err(e) = shader.release_instance_resources(&mut *ctx.backend, material.instance) {
            log::error!(
                "Failed to release instance of material '{}': {e}",
                material.name
            );
        }
    }
    release_maps(&material.maps, ctx);
}

impl std::fmt::Debug for MaterialSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterialSystem")
            .field("materials", &self.materials.len())
            .finish()
    }
}
