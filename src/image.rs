//! Image-manager seam.
//!
//! Container records (rootfs layers, image config) are owned by an
//! external image manager; the daemon only creates, inspects, and removes
//! containers through this trait and consumes the inspect result during
//! the prepare pipeline.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request to create a container for a pod.
#[derive(Debug, Clone, Default)]
pub struct ContainerCreateRequest {
    /// Container name (unique per pod).
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command override from the pod spec.
    pub command: Vec<String>,
    /// Entrypoint override from the pod spec.
    pub entrypoint: Vec<String>,
    /// Pod containers get their networking from the VM, never from the
    /// image manager.
    pub network_disabled: bool,
}

/// Inspect result for one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerJson {
    /// Container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Trailing arguments appended after the image command.
    pub args: Vec<String>,
    /// Image-derived configuration.
    pub config: ContainerConfig,
}

/// Image-derived container configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image reference.
    pub image: String,
    /// Working directory.
    pub working_dir: String,
    /// Entrypoint from the image (or create-time override).
    pub entrypoint: Vec<String>,
    /// Command from the image (or create-time override).
    pub cmd: Vec<String>,
    /// Environment as `NAME=value` strings.
    pub env: Vec<String>,
    /// Volume mount points declared by the image (`VOLUME` directives).
    /// Ordered so volume synthesis is deterministic.
    pub volumes: BTreeMap<String, serde_json::Value>,
}

/// Interface to the container-image manager.
#[async_trait]
pub trait ImageManager: Send + Sync {
    /// Creates a container and returns its id.
    async fn create_container(&self, req: ContainerCreateRequest) -> Result<String>;

    /// Inspects an existing container.
    async fn inspect_container(&self, id: &str) -> Result<ContainerJson>;

    /// Removes a container and its writable layer.
    async fn remove_container(&self, id: &str) -> Result<()>;
}
