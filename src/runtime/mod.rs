//! Container runtime seam.
//!
//! Everything mysqlbox needs from a container engine goes through the
//! [`ContainerRuntime`] trait. [`DockerRuntime`] is the production
//! implementation; tests use [`crate::testing::FakeRuntime`].

mod docker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub use docker::{DockerRuntime, connect_docker};

/// Errors reported by a container runtime.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// The image or container does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request had no effect (e.g. stopping a stopped container).
    #[error("not modified: {0}")]
    NotModified(String),

    /// Any other engine or transport failure.
    #[error("{0}")]
    Api(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Everything needed to create a MySQL container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables in `KEY=value` form.
    pub env: Vec<String>,
    /// Arguments passed to the image entrypoint.
    pub cmd: Vec<String>,
    /// Exposed container port, e.g. `3306/tcp`.
    pub container_port: String,
    /// Host port to bind on 127.0.0.1 (0 = let Docker choose).
    pub host_port: u16,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
    /// Read-only bind mount: (host path, container path).
    pub bind_mount: Option<(PathBuf, String)>,
}

/// One frame of the combined container log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// A single image pull progress event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    /// Layer ID, when the event is about a layer.
    pub id: Option<String>,
    /// Status text ("Downloading", "Pull complete", ...).
    pub status: Option<String>,
    /// Progress bar text.
    pub progress: Option<String>,
}

impl std::fmt::Display for PullProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = &self.id {
            write!(f, "{}: ", id)?;
        }
        write!(f, "{}", self.status.as_deref().unwrap_or_default())?;
        if let Some(progress) = &self.progress {
            write!(f, " {}", progress)?;
        }
        Ok(())
    }
}

/// Operations the box needs from a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container, returning its ID. A missing image is reported as
    /// [`RuntimeError::NotFound`].
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Pull an image, yielding progress events as they arrive.
    fn pull_image(&self, image: &str) -> BoxStream<'static, Result<PullProgress, RuntimeError>>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Host port bound to `container_port`, if any.
    async fn host_port(&self, id: &str, container_port: &str)
    -> Result<Option<String>, RuntimeError>;

    /// Follow the combined stdout/stderr log stream from the beginning.
    fn logs(&self, id: &str) -> BoxStream<'static, Result<LogChunk, RuntimeError>>;

    /// Request a graceful stop, killing the container after `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Block until the container has been removed.
    async fn wait_removed(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// IDs of all containers (running or not) carrying `key=value`.
    async fn list_labeled(&self, key: &str, value: &str) -> Result<Vec<String>, RuntimeError>;
}
