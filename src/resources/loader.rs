//! Resource loading.
//!
//! A [`ResourceLoader`] turns a name and a [`ResourceType`] into raw bytes.
//! Parsing (TOML configs, images, bytecode) is left to the consumer.
//! [`load_async`] runs a load on a job worker and hands the result back on the
//! main thread.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::backend::BackendError;
use crate::jobs::{JobError, JobId, JobInfo, JobSystem, JobType};

/// Resource errors
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Resource '{name}' ({ty:?}) not found")]
    NotFound { name: String, ty: ResourceType },
    #[error("Failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Resource '{0}' is not valid UTF-8")]
    InvalidUtf8(String),
    #[error("Failed to parse '{name}': {message}")]
    Parse { name: String, message: String },
    #[error("Failed to decode image '{name}': {message}")]
    Decode { name: String, message: String },
    #[error("Failed to load '{name}': {message}")]
    LoadFailed { name: String, message: String },
    #[error("Texture limit of {max} reached")]
    TooManyTextures { max: usize },
    #[error("Unknown texture '{0}'")]
    UnknownTexture(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Kind of resource being requested; selects the lookup location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Binary,
    Text,
    Image,
    ShaderConfig,
    ShaderBytecode,
    MaterialConfig,
}

impl ResourceType {
    /// Subdirectory of the asset root holding this kind of resource.
    pub fn directory(&self) -> &'static str {
        match self {
            ResourceType::Binary | ResourceType::Text => "",
            ResourceType::Image => "textures",
            ResourceType::ShaderConfig | ResourceType::ShaderBytecode => "shaders",
            ResourceType::MaterialConfig => "materials",
        }
    }

    /// Extension appended when the name has none.
    fn default_extension(&self) -> Option<&'static str> {
        match self {
            ResourceType::Image => Some("png"),
            ResourceType::ShaderConfig | ResourceType::MaterialConfig => Some("toml"),
            ResourceType::ShaderBytecode => Some("spv"),
            ResourceType::Binary | ResourceType::Text => None,
        }
    }
}

/// A loaded resource blob.
#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub ty: ResourceType,
    pub data: Vec<u8>,
}

impl Resource {
    pub fn as_str(&self) -> Result<&str, ResourceError> {
        std::str::from_utf8(&self.data).map_err(|_| ResourceError::InvalidUtf8(self.name.clone()))
    }

    /// Parse the blob as a TOML document.
    pub fn parse_toml<T: serde::de::DeserializeOwned>(&self) -> Result<T, ResourceError> {
        toml::from_str(self.as_str()?).map_err(|e| ResourceError::Parse {
            name: self.name.clone(),
            message: e.to_string(),
        })
    }
}

/// Source of engine resources.
pub trait ResourceLoader: Send + Sync {
    fn load(&self, name: &str, ty: ResourceType) -> Result<Resource, ResourceError>;

    /// Release a resource obtained from [`load`](Self::load).
    fn unload(&self, resource: Resource) {
        drop(resource);
    }
}

/// Loads resources from a directory tree:
/// `<root>/shaders`, `<root>/materials` and `<root>/textures`.
#[derive(Debug, Clone)]
pub struct FileSystemLoader {
    root: PathBuf,
}

impl FileSystemLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a resource resolves to.
    pub fn resolve(&self, name: &str, ty: ResourceType) -> PathBuf {
        let mut path = self.root.join(ty.directory()).join(name);
        if path.extension().is_none() {
            if let Some(ext) = ty.default_extension() {
                path.set_extension(ext);
            }
        }
        path
    }
}

impl ResourceLoader for FileSystemLoader {
    fn load(&self, name: &str, ty: ResourceType) -> Result<Resource, ResourceError> {
        let path = self.resolve(name, ty);
        log::debug!("Loading {:?} '{}' from {}", ty, name, path.display());
        let data = std::fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ResourceError::NotFound {
                    name: name.to_string(),
                    ty,
                }
            } else {
                ResourceError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        Ok(Resource {
            name: name.to_string(),
            ty,
            data,
        })
    }
}

/// In-memory resource store, mainly for tests and embedded assets.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    entries: RwLock<HashMap<(ResourceType, String), Arc<[u8]>>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ty: ResourceType, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        let data: Vec<u8> = data.into();
        self.entries.write().insert((ty, name.into()), data.into());
    }

    pub fn insert_text(&self, ty: ResourceType, name: impl Into<String>, text: &str) {
        self.insert(ty, name, text.as_bytes().to_vec());
    }

    pub fn contains(&self, ty: ResourceType, name: &str) -> bool {
        self.entries.read().contains_key(&(ty, name.to_string()))
    }
}

impl ResourceLoader for MemoryLoader {
    fn load(&self, name: &str, ty: ResourceType) -> Result<Resource, ResourceError> {
        let entries = self.entries.read();
        let data = entries
            .get(&(ty, name.to_string()))
            .ok_or_else(|| ResourceError::NotFound {
                name: name.to_string(),
                ty,
            })?;
        Ok(Resource {
            name: name.to_string(),
            ty,
            data: data.to_vec(),
        })
    }
}

/// Load a resource on a `RESOURCE_LOAD` worker.
///
/// `on_loaded` runs on the thread calling [`JobSystem::update`].
pub fn load_async<F>(
    loader: Arc<dyn ResourceLoader>,
    jobs: &JobSystem,
    name: &str,
    ty: ResourceType,
    on_loaded: F,
) -> Result<JobId, ResourceError>
where
    F: FnOnce(Result<Resource, ResourceError>) + 'static,
{
    let job_name = name.to_string();
    let name = name.to_string();

    // Success and failure callbacks share the one-shot handler.
    let handler = std::rc::Rc::new(std::cell::RefCell::new(Some(on_loaded)));
    let on_failure = std::rc::Rc::clone(&handler);
    let failure_name = name.clone();

    let info = JobInfo::new(move |_, result| match loader.load(&job_name, ty) {
        Ok(resource) => {
            *result = resource.data;
            true
        }
        Err(e) => {
            result.extend_from_slice(e.to_string().as_bytes());
            false
        }
    })
    .with_type(JobType::RESOURCE_LOAD)
    .on_success(move |data| {
        if let Some(callback) = handler.borrow_mut().take() {
            callback(Ok(Resource {
                name,
                ty,
                data: data.to_vec(),
            }));
        }
    })
    .on_failure(move |data| {
        let message = String::from_utf8_lossy(data).into_owned();
        log::warn!("Async load of '{failure_name}' failed: {message}");
        if let Some(callback) = on_failure.borrow_mut().take() {
            callback(Err(ResourceError::LoadFailed {
                name: failure_name,
                message,
            }));
        }
    });

    Ok(jobs.submit(info)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_adds_directory_and_extension() {
        let loader = FileSystemLoader::new("assets");
        assert_eq!(
            loader.resolve("builtin.world", ResourceType::ShaderConfig),
            Path::new("assets/shaders/builtin.world.toml")
        );
        assert_eq!(
            loader.resolve("stone.jpg", ResourceType::Image),
            Path::new("assets/textures/stone.jpg")
        );
        assert_eq!(
            loader.resolve("grass", ResourceType::MaterialConfig),
            Path::new("assets/materials/grass.toml")
        );
    }

    #[test]
    fn missing_file_is_not_found() {
        let loader = FileSystemLoader::new("/nonexistent-asset-root");
        assert!(matches!(
            loader.load("nothing", ResourceType::Text),
            Err(ResourceError::NotFound { .. })
        ));
    }

    #[test]
    fn memory_loader_round_trip() {
        let loader = MemoryLoader::new();
        loader.insert_text(ResourceType::Text, "greeting", "hello");
        let resource = loader.load("greeting", ResourceType::Text).unwrap();
        assert_eq!(resource.as_str().unwrap(), "hello");
        assert!(loader.load("greeting", ResourceType::Binary).is_err());
    }

    #[test]
    fn parse_toml_reports_name() {
        #[derive(serde::Deserialize)]
        struct Doc {
            #[allow(dead_code)]
            value: u32,
        }

        let loader = MemoryLoader::new();
        loader.insert_text(ResourceType::Text, "bad", "value = \"nope\"");
        let resource = loader.load("bad", ResourceType::Text).unwrap();
        match resource.parse_toml::<Doc>() {
            Err(ResourceError::Parse { name, .. }) => assert_eq!(name, "bad"),
            other => panic!("expected parse error, got {:?}", other.map(|_| ())),
        }
    }
}
