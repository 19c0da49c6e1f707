//! Common types shared between backends

use serde::Deserialize;

use crate::backend::traits::{BufferHandle, ShaderModuleHandle, TextureHandle};

/// Programmable pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderStage {
    Vertex,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Short name used in bytecode file names (`<shader>.<stage>.spv`).
    pub fn short_name(&self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Geometry => "geom",
            ShaderStage::Fragment => "frag",
            ShaderStage::Compute => "comp",
        }
    }

    pub fn flag(&self) -> ShaderStageFlags {
        match self {
            ShaderStage::Vertex => ShaderStageFlags::VERTEX,
            ShaderStage::Geometry => ShaderStageFlags::GEOMETRY,
            ShaderStage::Fragment => ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => ShaderStageFlags::COMPUTE,
        }
    }
}

bitflags::bitflags! {
    /// Shader stages that can access a binding or push constant range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const GEOMETRY = 1 << 1;
        const FRAGMENT = 1 << 2;
        const COMPUTE = 1 << 3;
        const VERTEX_FRAGMENT = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

/// Update-frequency tier of a uniform.
///
/// Global and Instance scopes live in the shared uniform buffer and are bound
/// through binding sets 0 and 1. Local scope maps to push constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderScope {
    Global,
    Instance,
    Local,
}

impl ShaderScope {
    /// Binding set index for buffer-backed scopes.
    pub fn set_index(&self) -> Option<u32> {
        match self {
            ShaderScope::Global => Some(0),
            ShaderScope::Instance => Some(1),
            ShaderScope::Local => None,
        }
    }
}

/// Kind of resource expected at a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingType {
    UniformBuffer,
    Sampler,
}

/// One binding in a binding layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingLayoutEntry {
    pub binding: u32,
    pub ty: BindingType,
    /// Array length; samplers of one scope share a single arrayed binding.
    pub count: u32,
    pub visibility: ShaderStageFlags,
}

impl BindingLayoutEntry {
    pub fn uniform_buffer(binding: u32) -> Self {
        Self {
            binding,
            ty: BindingType::UniformBuffer,
            count: 1,
            visibility: ShaderStageFlags::VERTEX_FRAGMENT,
        }
    }

    pub fn samplers(binding: u32, count: u32) -> Self {
        Self {
            binding,
            ty: BindingType::Sampler,
            count,
            visibility: ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Address of a single descriptor inside a binding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingSlot {
    pub binding: u32,
    pub array_element: u32,
}

impl BindingSlot {
    pub fn new(binding: u32, array_element: u32) -> Self {
        Self {
            binding,
            array_element,
        }
    }
}

/// Resource written into a binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResource {
    UniformBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    Texture(TextureHandle),
}

/// Byte range of push constant data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
}

impl PushConstantRange {
    pub fn end(&self) -> u32 {
        self.offset.saturating_add(self.size)
    }
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Matrix4,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
}

impl VertexFormat {
    /// Size of one attribute of this format in bytes.
    pub fn size(&self) -> u32 {
        match self {
            VertexFormat::Float32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
            VertexFormat::Matrix4 => 64,
            VertexFormat::Int8 | VertexFormat::Uint8 => 1,
            VertexFormat::Int16 | VertexFormat::Uint16 => 2,
            VertexFormat::Int32 | VertexFormat::Uint32 => 4,
        }
    }
}

/// Vertex attribute as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexAttributeDescriptor {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

/// Pipeline creation input assembled by a shader at initialization.
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    pub label: Option<String>,
    pub stages: Vec<(ShaderStage, ShaderModuleHandle)>,
    /// Binding layouts in set order (global first, then instance when present).
    pub binding_layouts: Vec<crate::backend::traits::BindingLayoutHandle>,
    pub push_constant_ranges: Vec<PushConstantRange>,
    pub attributes: Vec<VertexAttributeDescriptor>,
    pub attribute_stride: u32,
    pub cull_mode: CullMode,
}

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureKind {
    #[default]
    D2,
    Cube,
}

/// Texture descriptor
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub kind: TextureKind,
}

impl TextureDescriptor {
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self {
            label: None,
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            kind: TextureKind::D2,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Expected byte length of the pixel data for this descriptor.
    pub fn data_size(&self) -> usize {
        let layers = match self.kind {
            TextureKind::D2 => 1,
            TextureKind::Cube => 6,
        };
        (self.width * self.height * self.format.bytes_per_pixel()) as usize * layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_format_sizes() {
        assert_eq!(VertexFormat::Float32x3.size(), 12);
        assert_eq!(VertexFormat::Matrix4.size(), 64);
        assert_eq!(VertexFormat::Uint8.size(), 1);
    }

    #[test]
    fn scope_set_index() {
        assert_eq!(ShaderScope::Global.set_index(), Some(0));
        assert_eq!(ShaderScope::Instance.set_index(), Some(1));
        assert_eq!(ShaderScope::Local.set_index(), None);
    }

    #[test]
    fn cube_texture_data_size() {
        let mut desc = TextureDescriptor::new_2d(4, 4);
        assert_eq!(desc.data_size(), 64);
        desc.kind = TextureKind::Cube;
        assert_eq!(desc.data_size(), 384);
    }
}
