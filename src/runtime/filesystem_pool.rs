// src/runtime/filesystem_pool.rs
//! Filesystem accessor pool
//!
//! Each accessor is bound to a fixed set of allowed root paths and refuses
//! to touch anything outside them.

use crate::observability::event_bus::EventBus;
use crate::runtime::dependency_pool::{InstanceFactory, Pingable, ResourcePool};
use crate::utils::errors::{Result, ToolkitError};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Dependency kind served by filesystem pools
pub const FILESYSTEM_DEPENDENCY: &str = "filesystem";

/// Default capacity of a filesystem pool
pub const DEFAULT_FILESYSTEM_INSTANCES: usize = 10;

/// Filesystem pool type
pub type FileSystemPool = ResourcePool<FileSystemFactory>;

/// Directory entry returned by `list_directory`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Path-restricted filesystem accessor
#[derive(Debug)]
pub struct FileSystemAccessor {
    allowed_paths: Vec<PathBuf>,
    closed: AtomicBool,
}

impl FileSystemAccessor {
    /// Create an accessor for the given roots
    pub fn new(allowed_paths: Vec<PathBuf>) -> Self {
        Self {
            allowed_paths,
            closed: AtomicBool::new(false),
        }
    }

    /// Allowed root paths
    pub fn allowed_paths(&self) -> &[PathBuf] {
        &self.allowed_paths
    }

    /// Check whether `path` falls under one of the allowed roots
    pub fn is_allowed(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path.as_ref()).is_ok()
    }

    /// List a directory under one of the allowed roots
    pub async fn list_directory(&self, path: impl AsRef<Path>) -> Result<Vec<DirEntryInfo>> {
        let dir = self.resolve(path.as_ref())?;

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(entries)
    }

    /// Read a file under one of the allowed roots
    pub async fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String> {
        let file = self.resolve(path.as_ref())?;
        Ok(tokio::fs::read_to_string(file).await?)
    }

    /// Mark the accessor unusable
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToolkitError::RuntimeError("filesystem accessor is closed".into()));
        }

        if !path.is_absolute() {
            return Err(ToolkitError::AccessDenied(
                format!("relative path not allowed: {}", path.display())
            ));
        }

        let candidate = canonical_or_lexical(path);
        let allowed = self
            .allowed_paths
            .iter()
            .map(|root| canonical_or_lexical(root))
            .any(|root| candidate.starts_with(&root));

        if allowed {
            Ok(candidate)
        } else {
            Err(ToolkitError::AccessDenied(
                format!("{} is outside the allowed paths", path.display())
            ))
        }
    }
}

#[async_trait]
impl Pingable for FileSystemAccessor {
    async fn ping(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ToolkitError::RuntimeError("filesystem accessor is closed".into()))
        } else {
            Ok(())
        }
    }
}

/// Factory for path-restricted accessors
#[derive(Debug, Clone)]
pub struct FileSystemFactory {
    allowed_paths: Vec<PathBuf>,
}

impl FileSystemFactory {
    /// Create a factory; trailing slashes on roots are ignored
    pub fn new<I, S>(allowed_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_paths = allowed_paths
            .into_iter()
            .map(|p| {
                let trimmed = p.as_ref().trim_end_matches('/');
                PathBuf::from(if trimmed.is_empty() { "/" } else { trimmed })
            })
            .collect();

        Self { allowed_paths }
    }

    /// Roots every accessor is bound to
    pub fn allowed_paths(&self) -> &[PathBuf] {
        &self.allowed_paths
    }
}

#[async_trait]
impl InstanceFactory for FileSystemFactory {
    type Instance = FileSystemAccessor;

    async fn create_instance(&self) -> Result<FileSystemAccessor> {
        info!("Created filesystem accessor for paths: {:?}", self.allowed_paths);
        Ok(FileSystemAccessor::new(self.allowed_paths.clone()))
    }

    async fn destroy_instance(&self, instance: &FileSystemAccessor) -> Result<()> {
        instance.close();
        debug!("Destroyed filesystem accessor");
        Ok(())
    }
}

/// Build a filesystem pool
pub fn filesystem_pool<I, S>(allowed_paths: I, max_instances: usize, event_bus: Arc<EventBus>) -> FileSystemPool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    ResourcePool::new(
        FILESYSTEM_DEPENDENCY,
        max_instances,
        FileSystemFactory::new(allowed_paths),
        event_bus,
    )
}

/// Canonicalize the deepest existing ancestor so symlinks cannot escape a
/// root, then re-append the components that do not exist yet
fn canonical_or_lexical(path: &Path) -> PathBuf {
    let normalized = normalize(path);
    let mut existing = normalized.as_path();
    let mut missing = Vec::new();

    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            return missing.iter().rev().fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
