//! The prepare pipeline: everything that must happen between binding a VM
//! and launching the pod inside it.
//!
//! Ordered phases, each idempotent against a freshly-parsed spec:
//!
//! 1. service-discovery rendering
//! 2. /etc/hosts volume synthesis
//! 3. DNS (resolv.conf) propagation
//! 4. container rootfs preparation and file injection
//! 5. volume provisioning
//!
//! Phases 2 and 3 mutate the working copy of the spec; phases 4 and 5
//! produce the [`ContainerInfo`]/[`VolumeInfo`] lists handed to the VM.

use crate::constants::{
    DEVICEMAPPER_DRIVER, ETC_HOSTS_PATH, ETC_HOSTS_VOLUME, RAW_VOLUME_DRIVER, RESOLV_CONF_FILE_SUFFIX,
    RESOLV_CONF_PATH, RESOLV_CONF_PERM, VFS_VOLUME_DRIVER,
};
use crate::error::{Error, Result};
use crate::image::{ContainerJson, ImageManager};
use crate::pod::Pod;
use crate::service::ServiceDiscovery;
use crate::spec::{PodSpec, UserContainer, UserFile, UserFileReference, UserVolume, UserVolumeReference};
use crate::storage::{mount_id_for_container, mount_vfs_volume, probe_existing_volume, StorageDriver};
use crate::uri::uri_reader;
use base64::Engine as _;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info};

impl Pod {
    /// Phase 1: renders service-discovery configuration for the pod.
    pub fn prepare_services(&mut self, sd: &dyn ServiceDiscovery) -> Result<()> {
        sd.prepare_services(&self.spec, &self.status.id).map_err(|e| {
            error!(pod = %self.status.id, error = %e, "service preparation failed");
            e
        })
    }

    /// Phase 2: gives every container a /etc/hosts mount.
    ///
    /// Containers that already declare a volume mount or file injection at
    /// `/etc/hosts` are left alone. The first container that needs one
    /// triggers generation of a pod-level hosts file, shared through the
    /// `etchosts-volume` volume.
    pub fn prepare_etc_hosts(&mut self) -> Result<()> {
        let mut hosts_volume_path: Option<String> = None;

        for idx in 0..self.spec.containers.len() {
            let c = &self.spec.containers[idx];

            let declared = c.volumes.iter().any(|v| v.path == ETC_HOSTS_PATH)
                || c.files.iter().any(|f| f.path == ETC_HOSTS_PATH);
            if declared {
                continue;
            }

            if hosts_volume_path.is_none() {
                let path = write_hosts_file(
                    &self.status.id,
                    &self.spec.name,
                    &self.status.resource_path,
                )?;
                self.spec.volumes.push(UserVolume {
                    name: ETC_HOSTS_VOLUME.to_string(),
                    source: path.clone(),
                    driver: VFS_VOLUME_DRIVER.to_string(),
                });
                hosts_volume_path = Some(path);
            }

            self.spec.containers[idx].volumes.push(UserVolumeReference {
                volume: ETC_HOSTS_VOLUME.to_string(),
                path: ETC_HOSTS_PATH.to_string(),
                read_only: false,
            });
        }

        Ok(())
    }

    /// Phase 3: propagates the host's resolv.conf into the pod.
    ///
    /// Skipped entirely when the pod declares its own `dns` servers, when
    /// the host file is missing or not regular, or when a pod-level file
    /// already sources it (the user is handling DNS themselves). Containers
    /// that declare their own `/etc/resolv.conf` file keep it.
    pub fn prepare_dns(&mut self) -> Result<()> {
        self.prepare_dns_from(Path::new(RESOLV_CONF_PATH))
    }

    /// DNS propagation from an explicit host resolv.conf path.
    pub fn prepare_dns_from(&mut self, resolvconf: &Path) -> Result<()> {
        if !self.spec.dns.is_empty() {
            debug!(pod = %self.status.id, "pod declares dns servers, skipping resolv.conf propagation");
            return Ok(());
        }

        match std::fs::metadata(resolvconf) {
            Ok(meta) if meta.is_file() => {}
            _ => {
                debug!(
                    pod = %self.status.id,
                    path = %resolvconf.display(),
                    "host resolv.conf missing or not a regular file, skipping"
                );
                return Ok(());
            }
        }

        let uri = format!("file://{}", resolvconf.display());
        if self.spec.files.iter().any(|f| f.uri == uri) {
            debug!(pod = %self.status.id, "resolv.conf already configured, skipping");
            return Ok(());
        }

        let file_id = format!("{}{}", self.status.id, RESOLV_CONF_FILE_SUFFIX);
        self.spec.files.push(UserFile {
            name: file_id.clone(),
            encoding: "raw".to_string(),
            uri,
            contents: String::new(),
        });

        for idx in 0..self.spec.containers.len() {
            let declared = self.spec.containers[idx]
                .files
                .iter()
                .any(|f| f.path == RESOLV_CONF_PATH);
            if declared {
                continue;
            }

            self.spec.containers[idx].files.push(UserFileReference {
                filename: file_id.clone(),
                path: RESOLV_CONF_PATH.to_string(),
                perm: RESOLV_CONF_PERM.to_string(),
                user: String::new(),
                group: String::new(),
            });
        }

        Ok(())
    }

    /// Phase 4: prepares every container's rootfs and injects its files.
    ///
    /// For each container in status order: inspect it through the image
    /// manager, resolve its layer-db mount id under `root`, have the
    /// storage driver expose the rootfs through `shared_dir`, merge the
    /// image environment with the spec overrides, synthesize pod-level
    /// volumes for image-declared `VOLUME` paths, and inject referenced
    /// files.
    pub async fn prepare_containers(
        &mut self,
        storage: &dyn StorageDriver,
        images: &dyn ImageManager,
        root: &Path,
        shared_dir: &Path,
    ) -> Result<()> {
        self.containers.clear();

        let files: HashMap<String, UserFile> = self
            .spec
            .files
            .iter()
            .map(|f| (f.name.clone(), f.clone()))
            .collect();

        for idx in 0..self.status.containers.len() {
            let cid = self.status.containers[idx].id.clone();
            let info = images.inspect_container(&cid).await?;

            if self.status.containers[idx].name.is_empty() {
                self.status.containers[idx].name = info.name.clone();
            }
            if self.status.containers[idx].image.is_empty() {
                self.status.containers[idx].image = info.config.image.clone();
            }

            let mount_id = mount_id_for_container(root, storage.kind(), &cid).await?;
            debug!(container = %cid, mount_id = %mount_id, "resolved container mount id");

            let mut ci = storage.prepare_container(&mount_id, shared_dir).await?;
            ci.id = cid.clone();
            ci.mount_id = mount_id.clone();
            if ci.image.is_empty() {
                ci.image = info.config.image.clone();
            }
            ci.workdir = info.config.working_dir.clone();
            ci.entrypoint = info.config.entrypoint.clone();
            ci.cmd = info.config.cmd.clone();
            ci.cmd.extend(info.args.iter().cloned());

            let mut envs: HashMap<String, String> = HashMap::new();
            for pair in &info.config.env {
                if let Some((name, value)) = pair.split_once('=') {
                    envs.insert(name.to_string(), value.to_string());
                }
            }
            for e in &self.spec.containers[idx].envs {
                envs.insert(e.env.clone(), e.value.clone());
            }
            ci.envs = envs;

            process_image_volumes(&info, &cid, &mut self.spec, idx);

            process_inject_files(
                &self.spec.containers[idx],
                &files,
                storage,
                &mount_id,
                shared_dir,
            )
            .await?;

            info!(
                pod = %self.status.id,
                container = %cid,
                image = %ci.image,
                "container prepared"
            );
            self.containers.push(ci);
        }

        Ok(())
    }

    /// Phase 5: provisions every pod-level volume.
    ///
    /// Sourceless volumes are allocated by the storage driver; unless the
    /// backend is devicemapper the allocation is staged through the shared
    /// directory as a `vfs` volume, otherwise it stays `raw`. Volumes with
    /// an existing source are probed and staged as-is.
    pub async fn prepare_volumes(
        &mut self,
        storage: &dyn StorageDriver,
        shared_dir: &Path,
    ) -> Result<()> {
        self.volumes.clear();
        let pod_id = self.status.id.clone();

        for v in self.spec.volumes.iter_mut() {
            let vol = if v.source.is_empty() {
                let mut vol = storage.create_volume(&pod_id, &v.name).await?;
                v.source = vol.filepath.display().to_string();

                if storage.kind() != DEVICEMAPPER_DRIVER {
                    v.driver = VFS_VOLUME_DRIVER.to_string();
                    vol.filepath = mount_vfs_volume(Path::new(&v.source), shared_dir)?;
                    vol.format = VFS_VOLUME_DRIVER.to_string();
                    debug!(volume = %v.name, path = %vol.filepath.display(), "volume bound into shared dir");
                } else {
                    v.driver = RAW_VOLUME_DRIVER.to_string();
                    vol.format = RAW_VOLUME_DRIVER.to_string();
                }
                vol
            } else {
                probe_existing_volume(v, shared_dir)?
            };

            self.volumes.push(vol);
        }

        Ok(())
    }
}

// =============================================================================
// Spec Transformations
// =============================================================================

/// Synthesizes a pod-level volume for every `VOLUME` path the image
/// declares, named `<cid><path with slashes replaced by underscores>`,
/// and references each from the container.
pub fn process_image_volumes(
    info: &ContainerJson,
    cid: &str,
    spec: &mut PodSpec,
    container_idx: usize,
) {
    for target in info.config.volumes.keys() {
        let name = format!("{}{}", cid, target.replace('/', "_"));
        spec.volumes.push(UserVolume {
            name: name.clone(),
            source: String::new(),
            driver: String::new(),
        });
        spec.containers[container_idx].volumes.push(UserVolumeReference {
            volume: name,
            path: target.clone(),
            read_only: false,
        });
    }
}

/// Injects every file the container references into its rootfs.
///
/// Target paths ending in `/` get the file's declared name appended.
/// References to undeclared files are skipped. Sources come from a
/// `file://` URI or the literal contents, optionally base64-decoded.
pub async fn process_inject_files(
    container: &UserContainer,
    files: &HashMap<String, UserFile>,
    storage: &dyn StorageDriver,
    mount_id: &str,
    shared_dir: &Path,
) -> Result<()> {
    for fref in &container.files {
        let mut target = fref.path.clone();
        if target.ends_with('/') {
            target.push_str(&fref.filename);
        }

        let Some(file) = files.get(&fref.filename) else {
            continue;
        };

        let mut src: Box<dyn AsyncRead + Send + Unpin> = if !file.uri.is_empty() {
            uri_reader(&file.uri).await?
        } else {
            Box::new(Cursor::new(file.contents.clone().into_bytes()))
        };

        if file.encoding == "base64" {
            let mut encoded = Vec::new();
            src.read_to_end(&mut encoded).await?;
            encoded.retain(|b| !b.is_ascii_whitespace());
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&encoded)
                .map_err(|e| {
                    Error::ValidationFailed(format!("file {}: invalid base64: {e}", file.name))
                })?;
            src = Box::new(Cursor::new(decoded));
        }

        let perm = parse_octal_perm(&fref.perm)?;
        let uid = fref.user.parse::<u32>().unwrap_or(0);
        let gid = fref.group.parse::<u32>().unwrap_or(0);

        storage
            .inject_file(&mut *src, mount_id, &target, shared_dir, perm, uid, gid)
            .await
            .map_err(|e| {
                error!(file = %fref.filename, target = %target, error = %e, "file injection failed");
                e
            })?;
    }

    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

/// Writes the generated hosts file for a pod under its resource directory
/// and returns the path.
fn write_hosts_file(pod_id: &str, hostname: &str, resource_path: &Path) -> Result<String> {
    std::fs::create_dir_all(resource_path)?;
    let path = resource_path.join("hosts");

    let contents = format!(
        "127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n127.0.0.1\t{hostname}\n"
    );
    std::fs::write(&path, contents)?;

    debug!(pod = %pod_id, path = %path.display(), "generated hosts file");
    Ok(path.display().to_string())
}

/// Parses an octal permission string such as `"0644"`; empty means 0644.
fn parse_octal_perm(perm: &str) -> Result<u32> {
    if perm.is_empty() {
        return Ok(0o644);
    }
    u32::from_str_radix(perm, 8)
        .map_err(|_| Error::ValidationFailed(format!("invalid permission string: {perm}")))
}
