//! Local stand-ins for a remote image registry.
//!
//! The build service only ever asks a registry one question: does
//! `image:tag` already exist? No real registry protocol is spoken here.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{
    ContainerError, ContainerResult, image_reference, validate_image_name, validate_image_tag,
};

/// Answers whether an image is already available, so a build can be skipped.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn image_exists(&self, image: &str, tag: &str) -> ContainerResult<bool>;
}

/// Registry stand-in that never has anything, which forces every build.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAbsentRegistry;

#[async_trait]
impl ImageRegistry for AlwaysAbsentRegistry {
    async fn image_exists(&self, _image: &str, _tag: &str) -> ContainerResult<bool> {
        Ok(false)
    }
}

/// Checks the engine's local image store via `<binary> image exists image:tag`.
///
/// Exit code zero means present and any other exit code means absent. Failing
/// to run the command at all is a [`ContainerError::ProbeExecution`].
#[derive(Debug, Clone)]
pub struct ImageExistenceOracle {
    binary: String,
}

impl ImageExistenceOracle {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub async fn exists(&self, image: &str, tag: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;
        validate_image_tag(tag)?;

        let reference = image_reference(image, tag);
        let command = format!("{} image exists {}", self.binary, reference);
        debug!("{command}");

        let status = Command::new(&self.binary)
            .args(["image", "exists", reference.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ContainerError::probe_execution(&command, e))?;

        Ok(status.success())
    }
}

#[async_trait]
impl ImageRegistry for ImageExistenceOracle {
    async fn image_exists(&self, image: &str, tag: &str) -> ContainerResult<bool> {
        self.exists(image, tag).await
    }
}

/// Which registry stand-in the build service uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryKind {
    /// Remote existence checks disabled; always rebuild.
    AlwaysAbsent,
    /// Ask the local engine CLI.
    LocalCli { binary: String },
}

impl RegistryKind {
    /// Whether the build service should consult the registry at all.
    pub fn uses_registry(&self) -> bool {
        matches!(self, RegistryKind::LocalCli { .. })
    }

    pub fn into_registry(self) -> Arc<dyn ImageRegistry> {
        match self {
            RegistryKind::AlwaysAbsent => Arc::new(AlwaysAbsentRegistry),
            RegistryKind::LocalCli { binary } => Arc::new(ImageExistenceOracle::new(binary)),
        }
    }
}
