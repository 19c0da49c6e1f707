//! Uniform and attribute declarations.

use crate::backend::{ShaderScope, VertexFormat};

/// Data type of a uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    F32,
    Vec2,
    Vec3,
    Vec4,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    Mat4,
    Sampler,
    /// Opaque block of the given size in bytes.
    Custom(u32),
}

impl UniformType {
    /// Size in bytes. Samplers occupy no buffer space.
    pub fn size(&self) -> u32 {
        match self {
            UniformType::F32 | UniformType::I32 | UniformType::U32 => 4,
            UniformType::Vec2 => 8,
            UniformType::Vec3 => 12,
            UniformType::Vec4 => 16,
            UniformType::I8 | UniformType::U8 => 1,
            UniformType::I16 | UniformType::U16 => 2,
            UniformType::Mat4 => 64,
            UniformType::Sampler => 0,
            UniformType::Custom(size) => *size,
        }
    }

    pub fn is_sampler(&self) -> bool {
        matches!(self, UniformType::Sampler)
    }

    /// Parse a type name as written in shader configs. `custom` needs `size`.
    pub fn parse(name: &str, size: Option<u32>) -> Option<Self> {
        Some(match name {
            "f32" | "float" => UniformType::F32,
            "vec2" => UniformType::Vec2,
            "vec3" => UniformType::Vec3,
            "vec4" => UniformType::Vec4,
            "i8" => UniformType::I8,
            "u8" => UniformType::U8,
            "i16" => UniformType::I16,
            "u16" => UniformType::U16,
            "i32" | "int" => UniformType::I32,
            "u32" | "uint" => UniformType::U32,
            "mat4" => UniformType::Mat4,
            "sampler" | "samp" => UniformType::Sampler,
            "custom" => UniformType::Custom(size.filter(|&s| s > 0)?),
            _ => return None,
        })
    }
}

/// Parse a vertex attribute type name.
pub fn parse_attribute_type(name: &str) -> Option<VertexFormat> {
    Some(match name {
        "f32" | "float" => VertexFormat::Float32,
        "vec2" => VertexFormat::Float32x2,
        "vec3" => VertexFormat::Float32x3,
        "vec4" => VertexFormat::Float32x4,
        "mat4" => VertexFormat::Matrix4,
        "i8" => VertexFormat::Int8,
        "u8" => VertexFormat::Uint8,
        "i16" => VertexFormat::Int16,
        "u16" => VertexFormat::Uint16,
        "i32" | "int" => VertexFormat::Int32,
        "u32" | "uint" => VertexFormat::Uint32,
        _ => return None,
    })
}

/// Stable index of a uniform within its shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UniformLocation(pub(crate) u16);

impl UniformLocation {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A declared uniform or sampler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uniform {
    pub name: String,
    pub scope: ShaderScope,
    pub ty: UniformType,
    /// Byte size; 0 for samplers.
    pub size: u32,
    /// Byte offset inside the scope's block (push constant range for Local).
    pub offset: u32,
    pub location: UniformLocation,
    /// Descriptor array slot for samplers.
    pub sampler_slot: Option<u32>,
}

impl Uniform {
    pub fn is_sampler(&self) -> bool {
        self.ty.is_sampler()
    }
}

/// A declared vertex attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub format: VertexFormat,
    pub offset: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_sizes() {
        assert_eq!(UniformType::Mat4.size(), 64);
        assert_eq!(UniformType::Vec3.size(), 12);
        assert_eq!(UniformType::U16.size(), 2);
        assert_eq!(UniformType::Sampler.size(), 0);
        assert_eq!(UniformType::Custom(48).size(), 48);
    }

    #[test]
    fn parse_type_names() {
        assert_eq!(UniformType::parse("vec4", None), Some(UniformType::Vec4));
        assert_eq!(UniformType::parse("samp", None), Some(UniformType::Sampler));
        assert_eq!(
            UniformType::parse("custom", Some(32)),
            Some(UniformType::Custom(32))
        );
        assert_eq!(UniformType::parse("custom", None), None);
        assert_eq!(UniformType::parse("double", None), None);
    }

    #[test]
    fn parse_attribute_names() {
        assert_eq!(parse_attribute_type("vec3"), Some(VertexFormat::Float32x3));
        assert_eq!(parse_attribute_type("sampler"), None);
    }
}
