//! Renderer configuration.
//!
//! Every field has a default, so a partial file (or an empty one) is valid:
//!
//! ```toml
//! asset_root = "assets"
//! backend = "null"
//! frames_in_flight = 3
//!
//! [shaders]
//! max_instances = 256
//!
//! [views]
//! fov = 45.0
//! skybox_texture = "skybox"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::jobs::JobSystemConfig;
use crate::material::MaterialSystemConfig;
use crate::resources::TextureSystemConfig;
use crate::shader::ShaderSystemConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Records commands without a GPU
    #[default]
    Null,
    /// Vulkan via ash (requires the `vulkan-backend` feature)
    Vulkan,
}

/// Settings of the built-in views.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Vertical field of view of the world view, in degrees.
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    pub skybox_shader: String,
    /// Cube texture of the skybox. No skybox view is created when unset.
    pub skybox_texture: Option<String>,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            fov: 60.0,
            near: 0.1,
            far: 1000.0,
            skybox_shader: "builtin.skybox".to_string(),
            skybox_texture: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Directory the file system loader resolves resources against.
    pub asset_root: PathBuf,
    pub backend: BackendType,
    pub frames_in_flight: usize,
    pub width: u32,
    pub height: u32,
    pub shaders: ShaderSystemConfig,
    pub textures: TextureSystemConfig,
    pub materials: MaterialSystemConfig,
    pub jobs: JobSystemConfig,
    pub views: ViewConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            asset_root: PathBuf::from("assets"),
            backend: BackendType::default(),
            frames_in_flight: 3,
            width: 1280,
            height: 720,
            shaders: ShaderSystemConfig::default(),
            textures: TextureSystemConfig::default(),
            materials: MaterialSystemConfig::default(),
            jobs: JobSystemConfig::default(),
            views: ViewConfig::default(),
        }
    }
}

impl RendererConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("Loaded renderer config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobType;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RendererConfig::from_toml_str("").unwrap();
        assert_eq!(config.backend, BackendType::Null);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.views.skybox_texture, None);
        assert_eq!(config.shaders.max_shader_count, 1024);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = RendererConfig::from_toml_str(
            r#"
            backend = "vulkan"
            width = 800

            [shaders]
            max_instances = 16

            [jobs]
            thread_types = ["GENERAL", "GENERAL | RESOURCE_LOAD"]

            [views]
            skybox_texture = "sky"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendType::Vulkan);
        assert_eq!(config.width, 800);
        assert_eq!(config.height, 720);
        assert_eq!(config.shaders.max_instances, 16);
        assert_eq!(config.shaders.max_shader_count, 1024);
        assert_eq!(config.jobs.thread_types.len(), 2);
        assert_eq!(
            config.jobs.thread_types[1],
            JobType::GENERAL | JobType::RESOURCE_LOAD
        );
        assert_eq!(config.views.skybox_texture.as_deref(), Some("sky"));
        assert_eq!(config.views.fov, 60.0);
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        let err = RendererConfig::from_toml_str("backend = \"metal\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = RendererConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
