//! Pod specification types.
//!
//! A pod spec arrives as an opaque JSON blob (from the CLI or HTTP
//! front-end) and is parsed and validated here before any resources are
//! allocated for it. The wire format uses camelCase keys; every section
//! is optional except `containers`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// =============================================================================
// Pod Specification
// =============================================================================

/// A parsed and validated pod specification.
///
/// This is the declarative input to the create pipeline: an ordered group
/// of containers plus the pod-level volumes, files, and DNS configuration
/// they reference. The prepare pipeline mutates a working copy of the spec
/// (adding the hosts volume, the resolv.conf file, image-declared volumes)
/// before handing it to the VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodSpec {
    /// Pod id; filled in by the create pipeline when absent from the blob.
    pub id: String,
    /// Pod name; defaults to the id.
    pub name: String,
    /// Pod kind; `"kubernetes"` pods get restart-policy handling on VM
    /// shutdown, `"service-discovery"` pods carry a sidecar at index 0.
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form labels. Keys are unique by construction.
    pub labels: HashMap<String, String>,
    /// VM sizing for this pod.
    pub resource: PodResource,
    /// Ordered container specifications (at least one required).
    pub containers: Vec<UserContainer>,
    /// Pod-level volume definitions.
    pub volumes: Vec<UserVolume>,
    /// Pod-level file definitions for injection.
    pub files: Vec<UserFile>,
    /// Nameserver addresses; when non-empty the daemon leaves DNS alone.
    pub dns: Vec<String>,
    /// Log-driver selection and options.
    pub log_config: LogConfig,
    /// What to do when the pod terminates (kubernetes pods only).
    pub restart_policy: RestartPolicy,
}

impl PodSpec {
    /// Parses a pod spec from a JSON blob. The id is owned by the create
    /// pipeline and always taken from `pod_id`, regardless of what the
    /// blob carries.
    ///
    /// # Errors
    ///
    /// Returns `ValidationFailed` when the blob is not valid JSON or the
    /// parsed spec violates the rules in [`PodSpec::validate`].
    pub fn parse(blob: &[u8], pod_id: &str) -> Result<Self> {
        let mut spec: PodSpec = serde_json::from_slice(blob)
            .map_err(|e| Error::ValidationFailed(format!("malformed pod spec: {e}")))?;

        spec.id = pod_id.to_string();
        if spec.name.is_empty() {
            spec.name = spec.id.clone();
        }

        spec.validate()?;
        Ok(spec)
    }

    /// Validates the structural rules of the spec.
    ///
    /// - at least one container
    /// - container, volume, and file names unique within the pod
    /// - each file declares a uri or literal contents, not both
    /// - file encodings limited to `raw` and `base64`
    /// - container volume references resolve to declared volumes
    pub fn validate(&self) -> Result<()> {
        if self.containers.is_empty() {
            return Err(Error::ValidationFailed(
                "pod requires at least one container".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for c in &self.containers {
            if c.name.is_empty() {
                return Err(Error::ValidationFailed(
                    "container name cannot be empty".to_string(),
                ));
            }
            if !names.insert(c.name.as_str()) {
                return Err(Error::ValidationFailed(format!(
                    "duplicate container name: {}",
                    c.name
                )));
            }
            if c.image.is_empty() {
                return Err(Error::ValidationFailed(format!(
                    "container {} has no image",
                    c.name
                )));
            }
        }

        let mut volumes = HashSet::new();
        for v in &self.volumes {
            if !volumes.insert(v.name.as_str()) {
                return Err(Error::ValidationFailed(format!(
                    "duplicate volume name: {}",
                    v.name
                )));
            }
        }

        let mut files = HashSet::new();
        for f in &self.files {
            if !files.insert(f.name.as_str()) {
                return Err(Error::ValidationFailed(format!(
                    "duplicate file name: {}",
                    f.name
                )));
            }
            if !f.uri.is_empty() && !f.contents.is_empty() {
                return Err(Error::ValidationFailed(format!(
                    "file {} declares both a uri and literal contents",
                    f.name
                )));
            }
            match f.encoding.as_str() {
                "" | "raw" | "base64" => {}
                other => {
                    return Err(Error::ValidationFailed(format!(
                        "file {} has unknown encoding: {other}",
                        f.name
                    )));
                }
            }
        }

        for c in &self.containers {
            for vref in &c.volumes {
                if !volumes.contains(vref.volume.as_str()) {
                    return Err(Error::ValidationFailed(format!(
                        "container {} references undeclared volume {}",
                        c.name, vref.volume
                    )));
                }
            }
        }

        Ok(())
    }
}

/// VM sizing requested by the pod.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PodResource {
    /// Virtual CPU count.
    pub vcpu: u32,
    /// Memory in MiB.
    pub memory: u32,
}

impl Default for PodResource {
    fn default() -> Self {
        Self {
            vcpu: crate::constants::DEFAULT_VM_CPU,
            memory: crate::constants::DEFAULT_VM_MEMORY_MIB,
        }
    }
}

/// Log-driver selection for a pod.
///
/// An empty `kind` inherits the daemon default at start time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Driver name, e.g. `json-file` or `none`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Driver-specific options.
    pub config: HashMap<String, String>,
}

/// Restart policy for kubernetes pods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Restart whenever the pod terminates.
    #[serde(rename = "always")]
    Always,
    /// Restart only if the pod failed.
    #[serde(rename = "on-failure")]
    OnFailure,
    /// Never restart.
    #[default]
    #[serde(rename = "never")]
    Never,
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Never => write!(f, "never"),
        }
    }
}

// =============================================================================
// Container Specification
// =============================================================================

/// A single container within a pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserContainer {
    /// Container name (unique within the pod).
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command; overrides the image default when non-empty.
    pub command: Vec<String>,
    /// Entrypoint; overrides the image default when non-empty.
    pub entrypoint: Vec<String>,
    /// Environment overrides applied on top of the image environment.
    pub envs: Vec<EnvVar>,
    /// References to pod-level files to inject into this container.
    pub files: Vec<UserFileReference>,
    /// References to pod-level volumes to mount into this container.
    pub volumes: Vec<UserVolumeReference>,
}

/// One environment variable override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub env: String,
    /// Variable value.
    pub value: String,
}

/// A container's reference to a pod-level file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserFileReference {
    /// Name of the pod-level file.
    pub filename: String,
    /// Target path inside the container. A trailing `/` means the file
    /// keeps its declared name under that directory.
    pub path: String,
    /// Octal permission string, e.g. `"0644"`. Empty means 0644.
    pub perm: String,
    /// Owning uid as a decimal string. Empty means 0.
    pub user: String,
    /// Owning gid as a decimal string. Empty means 0.
    pub group: String,
}

/// A container's reference to a pod-level volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserVolumeReference {
    /// Name of the pod-level volume.
    pub volume: String,
    /// Mount path inside the container.
    pub path: String,
    /// Mount read-only.
    #[serde(rename = "readOnly")]
    pub read_only: bool,
}

// =============================================================================
// Pod-Level Files and Volumes
// =============================================================================

/// A pod-level file available for injection into containers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserFile {
    /// File name referenced by containers.
    pub name: String,
    /// `raw` (default) or `base64`.
    pub encoding: String,
    /// Source URI, e.g. `file:///etc/resolv.conf`. Mutually exclusive
    /// with `contents`.
    pub uri: String,
    /// Literal file contents.
    pub contents: String,
}

/// A pod-level volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserVolume {
    /// Volume name referenced by containers.
    pub name: String,
    /// Host source path; empty means the storage driver allocates one.
    pub source: String,
    /// Volume driver: `vfs`, `raw`, or a backend-specific name. Filled in
    /// by the prepare pipeline for allocated volumes.
    pub driver: String,
}
