//! Resource management
//!
//! Uniform buffer sub-allocation, resource loading and the texture registry.

pub mod loader;
pub mod texture;
pub mod uniform_buffer;

pub use loader::{
    load_async, FileSystemLoader, MemoryLoader, Resource, ResourceError, ResourceLoader,
    ResourceType,
};
pub use texture::{
    TextureBinding, TextureId, TextureSystem, TextureSystemConfig, DEFAULT_TEXTURE_NAME,
};
pub use uniform_buffer::{align_up, AllocError, UniformAllocation, UniformBufferAllocator};
