//! Backend abstraction layer
//!
//! Provides the [`RenderBackend`] contract plus the null and Vulkan
//! implementations.

pub mod null;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use null::{FailurePoint, NullBackend, NullBackendStats, RecordedCommand};
pub use traits::*;
pub use types::*;
