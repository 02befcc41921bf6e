//! Storage-driver seam and shared-directory staging helpers.
//!
//! The image-layer storage backend (devicemapper, overlay, vfs, ...) lives
//! outside this crate behind the [`StorageDriver`] trait. What lives here
//! is the narrow surface the prepare pipeline needs: container rootfs
//! preparation, file injection, volume creation, plus the host-side
//! helpers that stage volume sources into a VM's shared directory.

use crate::constants::{RAW_VOLUME_DRIVER, VFS_VOLUME_DRIVER};
use crate::error::{Error, Result};
use crate::spec::UserVolume;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;
use tracing::debug;

// =============================================================================
// Prepared Artifacts
// =============================================================================

/// Host-side description of one prepared container, handed to the VM at
/// pod start.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    /// Container id.
    pub id: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Opaque layer-db mount id resolved for this container.
    pub mount_id: String,
    /// Rootfs location exposed to the VM (driver-specific).
    pub rootfs: String,
    /// Filesystem type of the rootfs, if the driver reports one.
    pub fstype: String,
    /// Working directory for the container process.
    pub workdir: String,
    /// Resolved entrypoint.
    pub entrypoint: Vec<String>,
    /// Resolved command (image cmd plus trailing args).
    pub cmd: Vec<String>,
    /// Merged environment: image env overlaid with spec overrides.
    pub envs: HashMap<String, String>,
}

/// Host-side description of one prepared volume.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    /// Volume name from the pod spec.
    pub name: String,
    /// Host path the VM consumes (under the shared dir for vfs volumes).
    pub filepath: PathBuf,
    /// `dir` or `file` for staged sources, driver-specific otherwise.
    pub fstype: String,
    /// `vfs` or `raw`.
    pub format: String,
}

// =============================================================================
// Storage Driver Seam
// =============================================================================

/// Interface to the container-image storage backend.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Backend name: `"devicemapper"`, `"vfs"`, `"overlay"`, ...
    fn kind(&self) -> &str;

    /// Root of the backend's on-disk state.
    fn root_path(&self) -> &Path;

    /// Makes a container's layered rootfs reachable from `shared_dir` and
    /// returns its description.
    async fn prepare_container(&self, mount_id: &str, shared_dir: &Path)
        -> Result<ContainerInfo>;

    /// Writes `src` into the container filesystem identified by
    /// `mount_id` at `target_path` with the given ownership and mode.
    async fn inject_file(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        mount_id: &str,
        target_path: &str,
        shared_dir: &Path,
        perm: u32,
        uid: u32,
        gid: u32,
    ) -> Result<()>;

    /// Allocates backing storage for a pod-level volume with no source.
    async fn create_volume(&self, pod_id: &str, name: &str) -> Result<VolumeInfo>;
}

// =============================================================================
// Layer DB
// =============================================================================

/// Reads the mount id recorded for a container in the image layer
/// database: `<root>/image/<driver>/layerdb/mounts/<cid>/mount-id`.
pub async fn mount_id_for_container(root: &Path, driver: &str, cid: &str) -> Result<String> {
    let id_path = root
        .join("image")
        .join(driver)
        .join("layerdb")
        .join("mounts")
        .join(cid)
        .join("mount-id");

    let id = tokio::fs::read_to_string(&id_path).await.map_err(|e| {
        Error::Storage(format!(
            "no mount id for container {cid} at {}: {e}",
            id_path.display()
        ))
    })?;

    Ok(id.trim().to_string())
}

// =============================================================================
// Shared-Directory Staging
// =============================================================================

/// Bind-mounts a volume source directory into the VM's shared directory
/// and returns the mountpoint.
#[cfg(target_os = "linux")]
pub fn mount_vfs_volume(source: &Path, shared_dir: &Path) -> Result<PathBuf> {
    use nix::mount::{mount, MsFlags};

    let mountpoint = shared_dir.join(crate::ids::rand_str_alphanum(8));
    std::fs::create_dir_all(&mountpoint)?;

    mount(
        Some(source),
        &mountpoint,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        Error::Storage(format!(
            "bind mount {} -> {}: {e}",
            source.display(),
            mountpoint.display()
        ))
    })?;

    debug!(source = %source.display(), mountpoint = %mountpoint.display(), "bound volume into shared dir");
    Ok(mountpoint)
}

#[cfg(not(target_os = "linux"))]
pub fn mount_vfs_volume(_source: &Path, _shared_dir: &Path) -> Result<PathBuf> {
    Err(Error::Storage(
        "vfs volume bind mounts require linux".to_string(),
    ))
}

/// Stages an existing volume source for the VM.
///
/// Directory sources are bind-mounted into the shared directory; regular
/// files (generated hosts files and the like) are copied in. Anything
/// else is rejected.
pub fn probe_existing_volume(volume: &UserVolume, shared_dir: &Path) -> Result<VolumeInfo> {
    if volume.source.is_empty() {
        return Err(Error::Storage(format!(
            "volume {} has no source to probe",
            volume.name
        )));
    }

    let source = Path::new(&volume.source);
    let meta = std::fs::metadata(source).map_err(|e| {
        Error::Storage(format!("volume source {}: {e}", source.display()))
    })?;

    if meta.is_dir() {
        let mountpoint = mount_vfs_volume(source, shared_dir)?;
        return Ok(VolumeInfo {
            name: volume.name.clone(),
            filepath: mountpoint,
            fstype: "dir".to_string(),
            format: VFS_VOLUME_DRIVER.to_string(),
        });
    }

    if meta.is_file() {
        if volume.driver == RAW_VOLUME_DRIVER {
            // Raw image files are consumed in place, not staged.
            return Ok(VolumeInfo {
                name: volume.name.clone(),
                filepath: source.to_path_buf(),
                fstype: "file".to_string(),
                format: RAW_VOLUME_DRIVER.to_string(),
            });
        }

        std::fs::create_dir_all(shared_dir)?;
        let staged = shared_dir.join(format!(
            "{}-{}",
            volume.name,
            crate::ids::rand_str_alphanum(8)
        ));
        std::fs::copy(source, &staged)?;
        debug!(source = %source.display(), staged = %staged.display(), "staged volume file into shared dir");

        return Ok(VolumeInfo {
            name: volume.name.clone(),
            filepath: staged,
            fstype: "file".to_string(),
            format: VFS_VOLUME_DRIVER.to_string(),
        });
    }

    Err(Error::Storage(format!(
        "volume source {} is neither a directory nor a regular file",
        source.display()
    )))
}
