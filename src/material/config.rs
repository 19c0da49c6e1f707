//! Material definition files.
//!
//! ```toml
//! name = "crate_wood"
//! kind = "standard"
//! diffuse_colour = [1.0, 1.0, 1.0, 1.0]
//! shininess = 16.0
//! diffuse_map = "crate_diffuse"
//! specular_map = "crate_specular"
//! ```
//!
//! Terrain materials list their layers instead:
//!
//! ```toml
//! name = "valley"
//! kind = "terrain"
//! layers = [
//!     { diffuse_map = "grass", shininess = 4.0 },
//!     { diffuse_map = "rock", normal_map = "rock_normal" },
//! ]
//! ```

use serde::Deserialize;

/// Terrain materials blend at most this many layers.
pub const MAX_TERRAIN_LAYERS: usize = 4;

pub const DEFAULT_SHININESS: f32 = 32.0;

/// Material family. Selects the default shader and the uniforms written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialKind {
    #[default]
    Standard,
    Ui,
    Terrain,
}

impl MaterialKind {
    /// Shader used when the config names none.
    pub fn default_shader(&self) -> &'static str {
        match self {
            MaterialKind::Standard => "builtin.world",
            MaterialKind::Ui => "builtin.ui",
            MaterialKind::Terrain => "builtin.terrain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TerrainLayerConfig {
    pub diffuse_map: Option<String>,
    pub specular_map: Option<String>,
    pub normal_map: Option<String>,
    pub shininess: f32,
}

impl Default for TerrainLayerConfig {
    fn default() -> Self {
        Self {
            diffuse_map: None,
            specular_map: None,
            normal_map: None,
            shininess: DEFAULT_SHININESS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MaterialConfig {
    pub name: String,
    pub kind: MaterialKind,
    /// Shader name; the family's builtin shader when absent.
    pub shader: Option<String>,
    pub diffuse_colour: [f32; 4],
    pub shininess: f32,
    pub diffuse_map: Option<String>,
    pub specular_map: Option<String>,
    pub normal_map: Option<String>,
    pub layers: Vec<TerrainLayerConfig>,
    /// Destroy the material when its last reference is released.
    pub auto_release: bool,
}

impl Default for MaterialConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: MaterialKind::Standard,
            shader: None,
            diffuse_colour: [1.0; 4],
            shininess: DEFAULT_SHININESS,
            diffuse_map: None,
            specular_map: None,
            normal_map: None,
            layers: Vec::new(),
            auto_release: true,
        }
    }
}

impl MaterialConfig {
    pub fn new(name: impl Into<String>, kind: MaterialKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Default::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn shader_name(&self) -> &str {
        self.shader
            .as_deref()
            .unwrap_or_else(|| self.kind.default_shader())
    }

    pub fn with_shader(mut self, shader: impl Into<String>) -> Self {
        self.shader = Some(shader.into());
        self
    }

    pub fn with_diffuse_colour(mut self, colour: [f32; 4]) -> Self {
        self.diffuse_colour = colour;
        self
    }

    pub fn with_diffuse_map(mut self, texture: impl Into<String>) -> Self {
        self.diffuse_map = Some(texture.into());
        self
    }

    pub fn with_layer(mut self, layer: TerrainLayerConfig) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn with_auto_release(mut self, auto_release: bool) -> Self {
        self.auto_release = auto_release;
        self
    }
}
