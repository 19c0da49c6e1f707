//! Shader definition files.
//!
//! ```toml
//! name = "builtin.world"
//! use_instances = true
//! use_local = true
//!
//! stages = [
//!     { stage = "vertex", file = "builtin.world.vert.spv" },
//!     { stage = "fragment", file = "builtin.world.frag.spv" },
//! ]
//!
//! attributes = [
//!     { name = "in_position", type = "vec3" },
//!     { name = "in_texcoord", type = "vec2" },
//! ]
//!
//! uniforms = [
//!     { name = "projection", type = "mat4", scope = "global" },
//!     { name = "diffuse_colour", type = "vec4", scope = "instance" },
//!     { name = "diffuse_texture", type = "sampler", scope = "instance" },
//!     { name = "model", type = "mat4", scope = "local" },
//! ]
//! ```

use serde::Deserialize;

use crate::backend::{ShaderScope, ShaderStage};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StageConfig {
    pub stage: ShaderStage,
    /// Bytecode resource name.
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttributeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UniformConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    /// Byte size for `type = "custom"`.
    #[serde(default)]
    pub size: Option<u32>,
    pub scope: ShaderScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShaderConfig {
    pub name: String,
    #[serde(default)]
    pub use_instances: bool,
    #[serde(default)]
    pub use_local: bool,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub attributes: Vec<AttributeConfig>,
    #[serde(default)]
    pub uniforms: Vec<UniformConfig>,
}

impl ShaderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            use_instances: false,
            use_local: false,
            stages: Vec::new(),
            attributes: Vec::new(),
            uniforms: Vec::new(),
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn with_instances(mut self) -> Self {
        self.use_instances = true;
        self
    }

    pub fn with_local(mut self) -> Self {
        self.use_local = true;
        self
    }

    pub fn with_stage(mut self, stage: ShaderStage, file: impl Into<String>) -> Self {
        self.stages.push(StageConfig {
            stage,
            file: file.into(),
        });
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        self.attributes.push(AttributeConfig {
            name: name.into(),
            ty: ty.into(),
        });
        self
    }

    pub fn with_uniform(
        mut self,
        name: impl Into<String>,
        ty: impl Into<String>,
        scope: ShaderScope,
    ) -> Self {
        self.uniforms.push(UniformConfig {
            name: name.into(),
            ty: ty.into(),
            size: None,
            scope,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let config = ShaderConfig::from_toml_str(
            r#"
            name = "builtin.ui"
            use_instances = true
            stages = [
                { stage = "vertex", file = "ui.vert.spv" },
                { stage = "fragment", file = "ui.frag.spv" },
            ]
            attributes = [{ name = "in_position", type = "vec2" }]
            uniforms = [
                { name = "projection", type = "mat4", scope = "global" },
                { name = "block", type = "custom", size = 48, scope = "instance" },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "builtin.ui");
        assert!(config.use_instances);
        assert!(!config.use_local);
        assert_eq!(config.stages[1].stage, ShaderStage::Fragment);
        assert_eq!(config.uniforms[1].size, Some(48));
        assert_eq!(config.uniforms[0].scope, ShaderScope::Global);
    }

    #[test]
    fn unknown_scope_is_rejected() {
        let result = ShaderConfig::from_toml_str(
            r#"
            name = "bad"
            uniforms = [{ name = "x", type = "f32", scope = "frame" }]
            "#,
        );
        assert!(result.is_err());
    }
}
