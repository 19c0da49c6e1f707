//! Named, reference-counted textures.
//!
//! A texture acquired by name starts out pointing at the default checkerboard
//! texture. When an asynchronous load finishes, the decoded pixels are
//! uploaded in [`TextureSystem::process_loaded`] and the texture's generation
//! is bumped, so every sampler bound to it is rewritten on its next apply.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use serde::Deserialize;

use crate::arena::{Arena, Handle};
use crate::backend::{RenderBackend, TextureDescriptor, TextureHandle};
use crate::jobs::{JobInfo, JobSystem, JobType};
use crate::resources::loader::{ResourceError, ResourceLoader, ResourceType};

pub const DEFAULT_TEXTURE_NAME: &str = "default";
const DEFAULT_TEXTURE_SIZE: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TextureSystemConfig {
    pub max_texture_count: usize,
}

impl Default for TextureSystemConfig {
    fn default() -> Self {
        Self {
            max_texture_count: 1024,
        }
    }
}

pub type TextureId = Handle<Texture>;

/// Backend texture plus the generation it had when bound.
///
/// Comparing bindings is how sampler descriptors detect that a texture was
/// replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureBinding {
    pub handle: TextureHandle,
    pub generation: u32,
}

#[derive(Debug)]
pub struct Texture {
    pub name: String,
    pub width: u32,
    pub height: u32,
    handle: TextureHandle,
    /// Incremented on every upload; 0 while still showing the default texture.
    pub generation: u32,
    ref_count: usize,
    auto_release: bool,
    /// False while the handle is borrowed from the default texture.
    owns_handle: bool,
}

impl Texture {
    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn binding(&self) -> TextureBinding {
        TextureBinding {
            handle: self.handle,
            generation: self.generation,
        }
    }
}

/// Decoded RGBA8 image waiting for upload.
struct DecodedImage {
    name: String,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

/// Encodes a decoded image into a job result blob.
fn encode_image(width: u32, height: u32, pixels: &[u8], out: &mut Vec<u8>) {
    out.reserve(8 + pixels.len());
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(pixels);
}

fn decode_blob(name: String, blob: &[u8]) -> Option<DecodedImage> {
    let width = u32::from_le_bytes(blob.get(0..4)?.try_into().ok()?);
    let height = u32::from_le_bytes(blob.get(4..8)?.try_into().ok()?);
    let pixels = blob.get(8..)?.to_vec();
    let expected = u64::from(width)
        .checked_mul(u64::from(height))?
        .checked_mul(4)?;
    if pixels.len() as u64 != expected {
        return None;
    }
    Some(DecodedImage {
        name,
        width,
        height,
        pixels,
    })
}

/// 16x16 white/magenta checkerboard.
fn checkerboard() -> Vec<u8> {
    let size = DEFAULT_TEXTURE_SIZE;
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let pixel: [u8; 4] = if ((x / 4) + (y / 4)) % 2 == 0 {
                [255, 255, 255, 255]
            } else {
                [255, 0, 255, 255]
            };
            pixels.extend_from_slice(&pixel);
        }
    }
    pixels
}

/// Texture registry.
pub struct TextureSystem {
    textures: Arena<Texture>,
    by_name: HashMap<String, TextureId>,
    default_texture: TextureId,
    /// Filled by job callbacks, drained by `process_loaded`.
    loaded: Rc<RefCell<VecDeque<DecodedImage>>>,
}

impl TextureSystem {
    pub fn new(
        config: &TextureSystemConfig,
        backend: &mut dyn RenderBackend,
    ) -> Result<Self, ResourceError> {
        let size = DEFAULT_TEXTURE_SIZE;
        let desc = TextureDescriptor::new_2d(size, size).with_label(DEFAULT_TEXTURE_NAME);
        let handle = backend.create_texture(&desc, &checkerboard())?;

        let mut textures = Arena::with_capacity(config.max_texture_count.max(1));
        let default_texture = textures
            .insert(Texture {
                name: DEFAULT_TEXTURE_NAME.to_string(),
                width: size,
                height: size,
                handle,
                generation: 0,
                ref_count: 1,
                auto_release: false,
                owns_handle: true,
            })
            .ok_or(ResourceError::TooManyTextures {
                max: config.max_texture_count,
            })?;

        let mut by_name = HashMap::new();
        by_name.insert(DEFAULT_TEXTURE_NAME.to_string(), default_texture);

        log::info!(
            "Texture system initialized (max textures: {})",
            config.max_texture_count
        );
        Ok(Self {
            textures,
            by_name,
            default_texture,
            loaded: Rc::new(RefCell::new(VecDeque::new())),
        })
    }

    pub fn default_texture(&self) -> TextureId {
        self.default_texture
    }

    pub fn get(&self, id: TextureId) -> Option<&Texture> {
        self.textures.get(id)
    }

    pub fn find(&self, name: &str) -> Option<TextureId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Current binding of a texture. Stale ids resolve to the default texture.
    pub fn binding(&self, id: TextureId) -> TextureBinding {
        self.textures
            .get(id)
            .or_else(|| self.textures.get(self.default_texture))
            .map(Texture::binding)
            .unwrap_or(TextureBinding {
                handle: TextureHandle(0),
                generation: 0,
            })
    }

    /// Take a reference to a texture, creating a placeholder if the name is new.
    pub fn acquire(&mut self, name: &str, auto_release: bool) -> Result<TextureId, ResourceError> {
        if let Some(&id) = self.by_name.get(name) {
            if let Some(texture) = self.textures.get_mut(id) {
                texture.ref_count += 1;
                log::trace!("Texture '{}' acquired ({} refs)", name, texture.ref_count);
                return Ok(id);
            }
        }

        let default = self
            .textures
            .get(self.default_texture)
            .map(|t| (t.handle, t.width, t.height))
            .ok_or_else(|| ResourceError::UnknownTexture(DEFAULT_TEXTURE_NAME.to_string()))?;
        let id = self
            .textures
            .insert(Texture {
                name: name.to_string(),
                width: default.1,
                height: default.2,
                handle: default.0,
                generation: 0,
                ref_count: 1,
                auto_release,
                owns_handle: false,
            })
            .ok_or_else(|| {
                log::error!("Cannot acquire texture '{name}': texture limit reached");
                ResourceError::TooManyTextures {
                    max: self.textures.capacity(),
                }
            })?;
        self.by_name.insert(name.to_string(), id);
        log::debug!("Texture '{name}' created as placeholder");
        Ok(id)
    }

    /// Create (or replace) a texture from pixel data right away.
    pub fn create_from_pixels(
        &mut self,
        name: &str,
        desc: &TextureDescriptor,
        pixels: &[u8],
        backend: &mut dyn RenderBackend,
    ) -> Result<TextureId, ResourceError> {
        let id = self.acquire(name, true)?;
        if let Err(e) = self.upload(id, desc, pixels, backend) {
            self.release(name, backend);
            return Err(e);
        }
        Ok(id)
    }

    /// Drop a reference. At zero references an auto-release texture is
    /// destroyed. The default texture is never released.
    pub fn release(&mut self, name: &str, backend: &mut dyn RenderBackend) {
        let Some(&id) = self.by_name.get(name) else {
            log::warn!("Release of unknown texture '{name}'");
            return;
        };
        if id == self.default_texture {
            return;
        }
        let Some(texture) = self.textures.get_mut(id) else {
            return;
        };
        texture.ref_count = texture.ref_count.saturating_sub(1);
        if texture.ref_count > 0 || !texture.auto_release {
            return;
        }

        if let Some(texture) = self.textures.remove(id) {
            if texture.owns_handle {
                if let Err(e) = backend.wait_idle() {
                    log::warn!("wait_idle failed while releasing texture '{name}': {e}");
                }
                backend.destroy_texture(texture.handle);
            }
            self.by_name.remove(name);
            log::debug!("Texture '{name}' released");
        }
    }

    /// Acquire `name` and start loading its image on a `RESOURCE_LOAD` worker.
    ///
    /// The texture shows the default texture until the decoded image is
    /// uploaded by [`process_loaded`](Self::process_loaded).
    pub fn load_async(
        &mut self,
        name: &str,
        jobs: &JobSystem,
        loader: Arc<dyn ResourceLoader>,
    ) -> Result<TextureId, ResourceError> {
        let id = self.acquire(name, true)?;

        let job_name = name.to_string();
        let queue = Rc::clone(&self.loaded);
        let result_name = name.to_string();
        let failure_name = name.to_string();

        let info = JobInfo::new(move |_, result| {
            let resource = match loader.load(&job_name, ResourceType::Image) {
                Ok(resource) => resource,
                Err(e) => {
                    result.extend_from_slice(e.to_string().as_bytes());
                    return false;
                }
            };
            match image::load_from_memory(&resource.data) {
                Ok(image) => {
                    let rgba = image.to_rgba8();
                    encode_image(rgba.width(), rgba.height(), rgba.as_raw(), result);
                    true
                }
                Err(e) => {
                    result.extend_from_slice(format!("decode failed: {e}").as_bytes());
                    false
                }
            }
        })
        .with_type(JobType::RESOURCE_LOAD)
        .on_success(move |blob| match decode_blob(result_name, blob) {
            Some(image) => queue.borrow_mut().push_back(image),
            None => log::error!("Malformed image result blob"),
        })
        .on_failure(move |blob| {
            log::warn!(
                "Failed to load texture '{}': {}",
                failure_name,
                String::from_utf8_lossy(blob)
            );
        });

        jobs.submit(info)?;
        Ok(id)
    }

    /// Upload images finished by background loads. Returns how many were
    /// uploaded.
    pub fn process_loaded(&mut self, backend: &mut dyn RenderBackend) -> usize {
        let pending: Vec<DecodedImage> = self.loaded.borrow_mut().drain(..).collect();
        let mut uploaded = 0;
        for image in pending {
            let Some(&id) = self.by_name.get(&image.name) else {
                log::debug!("Texture '{}' released before its load finished", image.name);
                continue;
            };
            let desc = TextureDescriptor::new_2d(image.width, image.height).with_label(&image.name);
            match self.upload(id, &desc, &image.pixels, backend) {
                Ok(()) => uploaded += 1,
                Err(e) => log::error!("Failed to upload texture '{}': {e}", image.name),
            }
        }
        uploaded
    }

    fn upload(
        &mut self,
        id: TextureId,
        desc: &TextureDescriptor,
        pixels: &[u8],
        backend: &mut dyn RenderBackend,
    ) -> Result<(), ResourceError> {
        let handle = backend.create_texture(desc, pixels)?;
        let texture = self
            .textures
            .get_mut(id)
            .ok_or_else(|| ResourceError::UnknownTexture(format!("{id:?}")))?;

        if texture.owns_handle {
            // The old image may still be sampled by frames in flight.
            backend.wait_idle()?;
            backend.destroy_texture(texture.handle);
        }
        texture.handle = handle;
        texture.width = desc.width;
        texture.height = desc.height;
        texture.owns_handle = true;
        texture.generation = texture.generation.wrapping_add(1);
        log::debug!(
            "Texture '{}' uploaded ({}x{}, generation {})",
            texture.name,
            desc.width,
            desc.height,
            texture.generation
        );
        Ok(())
    }

    /// Destroy every texture.
    pub fn shutdown(&mut self, backend: &mut dyn RenderBackend) {
        for id in self.textures.handles() {
            if let Some(texture) = self.textures.remove(id) {
                if texture.owns_handle {
                    backend.destroy_texture(texture.handle);
                }
            }
        }
        self.by_name.clear();
        log::info!("Texture system shut down");
    }
}

impl std::fmt::Debug for TextureSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureSystem")
            .field("textures", &self.textures.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;

    fn system(backend: &mut NullBackend) -> TextureSystem {
        TextureSystem::new(&TextureSystemConfig::default(), backend).unwrap()
    }

    #[test]
    fn default_texture_exists() {
        let mut backend = NullBackend::new();
        let textures = system(&mut backend);
        let default = textures.get(textures.default_texture()).unwrap();
        assert_eq!((default.width, default.height), (16, 16));
        assert_eq!(backend.stats().textures, 1);
    }

    #[test]
    fn placeholder_shares_default_handle() {
        let mut backend = NullBackend::new();
        let mut textures = system(&mut backend);
        let id = textures.acquire("stone", true).unwrap();
        let default = textures.binding(textures.default_texture());
        assert_eq!(textures.binding(id).handle, default.handle);
        assert_eq!(textures.binding(id).generation, 0);
    }

    #[test]
    fn ref_counting_releases_at_zero() {
        let mut backend = NullBackend::new();
        let mut textures = system(&mut backend);
        let desc = TextureDescriptor::new_2d(2, 2);
        let id = textures
            .create_from_pixels("brick", &desc, &[0; 16], &mut backend)
            .unwrap();
        textures.acquire("brick", true).unwrap();
        assert_eq!(textures.get(id).unwrap().ref_count(), 2);

        textures.release("brick", &mut backend);
        assert!(textures.get(id).is_some());
        textures.release("brick", &mut backend);
        assert!(textures.get(id).is_none());
        assert_eq!(backend.stats().textures, 1);
    }

    #[test]
    fn upload_bumps_generation() {
        let mut backend = NullBackend::new();
        let mut textures = system(&mut backend);
        let desc = TextureDescriptor::new_2d(1, 1);
        let id = textures
            .create_from_pixels("dot", &desc, &[1, 2, 3, 4], &mut backend)
            .unwrap();
        let first = textures.binding(id);
        assert_eq!(first.generation, 1);

        textures.upload(id, &desc, &[5, 6, 7, 8], &mut backend).unwrap();
        let second = textures.binding(id);
        assert_eq!(second.generation, 2);
        assert_ne!(first.handle, second.handle);
    }

    #[test]
    fn blob_encoding_round_trip() {
        let mut blob = Vec::new();
        encode_image(1, 2, &[9; 8], &mut blob);
        let image = decode_blob("x".into(), &blob).unwrap();
        assert_eq!((image.width, image.height), (1, 2));
        assert!(decode_blob("x".into(), &blob[..10]).is_none());
    }

    #[test]
    fn blob_with_overflowing_dimensions_is_rejected() {
        // 65536 * 65536 * 4 wraps to zero in 32 bits.
        let mut blob = Vec::new();
        encode_image(0x1_0000, 0x1_0000, &[], &mut blob);
        assert!(decode_blob("huge".into(), &blob).is_none());
    }
}
