//! The daemon: pod registry, VM registry, and the lifecycle pipelines.
//!
//! All pod mutations (create, start, remove, label writes, exit-code
//! registration) serialize on one readers-writer lock around the pod
//! registry. The write guard is held across entire pipelines, including
//! VM launch and image-manager calls: a conscious simplification that
//! trades startup concurrency for registry consistency and a bounded pod
//! count. Readers (listing, inspection) take the shared lock.

use crate::constants::{DEFAULT_VM_CPU, DEFAULT_VM_MEMORY_MIB, JSON_FILE_LOG_DRIVER, LOG_DRIVER_NONE, SERVICE_DISCOVERY_POD_KIND, SHARE_DIR_TAG};
use crate::error::{Error, Result};
use crate::ids;
use crate::image::{ContainerCreateRequest, ImageManager};
use crate::kv::KvStore;
use crate::logging::{json_file_log_path, LogContext, LogCopier, LogDriverRegistry};
use crate::pod::{Pod, PodPhase, PodRegistry, PodStatus};
use crate::service::ServiceDiscovery;
use crate::spec::{LogConfig, PodSpec};
use crate::storage::StorageDriver;
use crate::vm::{BootConfig, HypervisorDriver, KeepPolicy, Vm, VmExit, VmRegistry, VmStartResponse};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

/// Capacity of a VM's event channel; events are consumed promptly by the
/// per-VM event task, this only absorbs bursts.
const VM_EVENT_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// Configuration
// =============================================================================

/// Static daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root for per-pod resource directories and the image layer db.
    pub resource_root: PathBuf,
    /// Base directory under which each VM gets its shared directory.
    pub vm_base_dir: PathBuf,
    /// Guest kernel image for VM boot.
    pub kernel: Option<PathBuf>,
    /// Guest initrd image for VM boot.
    pub initrd: Option<PathBuf>,
    /// Firmware image for VM boot.
    pub bios: Option<PathBuf>,
    /// CBFS image for VM boot.
    pub cbfs: Option<PathBuf>,
    /// Log configuration for pods that don't pick their own driver.
    pub default_log: LogConfig,
}

impl DaemonConfig {
    /// Builds a configuration with the given directories and a `json-file`
    /// default log driver.
    pub fn new(resource_root: PathBuf, vm_base_dir: PathBuf) -> Self {
        Self {
            resource_root,
            vm_base_dir,
            kernel: None,
            initrd: None,
            bios: None,
            cbfs: None,
            default_log: LogConfig {
                kind: JSON_FILE_LOG_DRIVER.to_string(),
                config: HashMap::new(),
            },
        }
    }
}

// =============================================================================
// Client-Facing Types
// =============================================================================

/// A client terminal attachment for one container.
pub struct TtyIo {
    /// Client input; closing it signals EOF to the in-VM process.
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    /// Client output.
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    /// Tag routing exit codes back to this client.
    pub client_tag: String,
}

/// Result of starting a pod.
#[derive(Debug)]
pub struct StartResult {
    /// Driver status code.
    pub code: i32,
    /// Human-readable cause.
    pub cause: String,
    /// Exit-code delivery channel, when the caller attached a TTY.
    pub exit_code: Option<oneshot::Receiver<u8>>,
}

/// Result of a standalone VM create.
#[derive(Debug, Clone)]
pub struct VmInfo {
    /// VM id.
    pub id: String,
    /// Driver status code.
    pub code: i32,
    /// Human-readable cause.
    pub cause: String,
}

/// Lightweight pod description for listing.
#[derive(Debug, Clone)]
pub struct PodSummary {
    /// Pod id.
    pub id: String,
    /// Pod name.
    pub name: String,
    /// Current phase.
    pub phase: PodPhase,
    /// Bound VM id, if any.
    pub vm: Option<String>,
    /// Container ids in spec order.
    pub container_ids: Vec<String>,
}

// =============================================================================
// Daemon
// =============================================================================

/// The pod-on-VM orchestration daemon core.
pub struct Daemon {
    pub(crate) config: DaemonConfig,
    pub(crate) driver: Arc<dyn HypervisorDriver>,
    pub(crate) storage: Arc<dyn StorageDriver>,
    pub(crate) images: Arc<dyn ImageManager>,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) services: Arc<dyn ServiceDiscovery>,
    pub(crate) log_drivers: LogDriverRegistry,
    pub(crate) pods: RwLock<PodRegistry>,
    pub(crate) vms: RwLock<VmRegistry>,
}

impl Daemon {
    /// Assembles a daemon around the given collaborators.
    ///
    /// The hypervisor driver is expected to come out of
    /// [`crate::vm::probe_drivers`].
    pub fn new(
        config: DaemonConfig,
        driver: Arc<dyn HypervisorDriver>,
        storage: Arc<dyn StorageDriver>,
        images: Arc<dyn ImageManager>,
        kv: Arc<dyn KvStore>,
        services: Arc<dyn ServiceDiscovery>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.resource_root)?;
        std::fs::create_dir_all(&config.vm_base_dir)?;

        Ok(Arc::new(Self {
            config,
            driver,
            storage,
            images,
            kv,
            services,
            log_drivers: LogDriverRegistry::with_builtin(),
            pods: RwLock::new(PodRegistry::new()),
            vms: RwLock::new(VmRegistry::new()),
        }))
    }

    /// The shared directory the VM mounts as the host/guest conduit.
    pub fn shared_dir(&self, vm_id: &str) -> PathBuf {
        self.config.vm_base_dir.join(vm_id).join(SHARE_DIR_TAG)
    }

    fn boot_config(&self, cpu: u32, memory: u32) -> BootConfig {
        BootConfig {
            cpu,
            memory,
            kernel: self.config.kernel.clone(),
            initrd: self.config.initrd.clone(),
            bios: self.config.bios.clone(),
            cbfs: self.config.cbfs.clone(),
        }
    }

    // =========================================================================
    // Create Pipeline
    // =========================================================================

    /// Creates a pod from a spec blob and returns its id.
    ///
    /// The whole pipeline runs under the registry write lock: resource
    /// directory, spec validation, container creation (adopting containers
    /// that already exist for this pod id), spec persistence, registry
    /// insertion. On failure every container created by this call is
    /// removed again, in reverse order.
    pub async fn create_pod(
        &self,
        pod_id: Option<&str>,
        spec_blob: &[u8],
        autoremove: bool,
    ) -> Result<String> {
        let mut reg = self.pods.write().await;

        let pod_id = match pod_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => ids::new_pod_id(),
        };
        if reg.contains(&pod_id) {
            return Err(Error::Conflict(format!("pod {pod_id} already exists")));
        }

        self.create_pod_locked(&mut reg, pod_id.clone(), spec_blob, autoremove)
            .await?;
        Ok(pod_id)
    }

    /// Create pipeline body; the caller holds the registry write lock.
    async fn create_pod_locked(
        &self,
        reg: &mut PodRegistry,
        pod_id: String,
        spec_blob: &[u8],
        autoremove: bool,
    ) -> Result<()> {
        if reg.is_full() {
            return Err(Error::CapacityExceeded {
                what: "pod",
                limit: crate::constants::MAX_PODS,
            });
        }

        let resource_path = self.config.resource_root.join(&pod_id);
        create_resource_dir(&resource_path)?;

        let spec = PodSpec::parse(spec_blob, &pod_id)?;
        let status = PodStatus::new(&pod_id, &spec, resource_path, autoremove);
        let mut pod = Pod::new(pod_id.clone(), status, spec);

        let mut created: Vec<String> = Vec::new();
        if let Err(e) = self.init_containers(&mut pod, &mut created).await {
            self.rollback_created(&created).await;
            return Err(e);
        }

        if let Err(e) = self.kv.write_pod(&pod_id, spec_blob) {
            self.rollback_created(&created).await;
            return Err(e);
        }

        if let Err(e) = reg.insert(pod) {
            self.rollback_created(&created).await;
            let _ = self.kv.delete_pod(&pod_id);
            return Err(e);
        }

        info!(pod = %pod_id, "pod created");
        Ok(())
    }

    /// Creates (or adopts) a container record for every container in the
    /// spec. Ids of containers created by this call are appended to
    /// `created` so the caller can compensate on failure; adopted
    /// containers are never rolled back.
    async fn init_containers(&self, pod: &mut Pod, created: &mut Vec<String>) -> Result<()> {
        let mut existing: HashMap<String, (String, String, String)> = HashMap::new();
        for id in self.kv.pod_containers(pod.id())? {
            if let Ok(info) = self.images.inspect_container(&id).await {
                let name = info.name.trim_start_matches('/').to_string();
                debug!(container = %id, name = %name, image = %info.config.image, "adopting existing container");
                existing.insert(name, (id, info.name, info.config.image));
            }
        }

        for c in pod.spec.containers.clone() {
            if let Some((id, name, image)) = existing.get(&c.name) {
                pod.status.add_container(id, name, image);
                continue;
            }

            let id = self
                .images
                .create_container(ContainerCreateRequest {
                    name: c.name.clone(),
                    image: c.image.clone(),
                    command: c.command.clone(),
                    entrypoint: c.entrypoint.clone(),
                    network_disabled: true,
                })
                .await?;
            info!(pod = %pod.id(), container = %id, name = %c.name, "container created");
            created.push(id.clone());

            let info = self.images.inspect_container(&id).await?;
            pod.status.add_container(&id, &info.name, &info.config.image);
        }

        Ok(())
    }

    async fn rollback_created(&self, created: &[String]) {
        for id in created.iter().rev() {
            if let Err(e) = self.images.remove_container(id).await {
                warn!(container = %id, error = %e, "failed to remove container during create rollback");
            }
        }
    }

    // =========================================================================
    // Start Pipeline
    // =========================================================================

    /// Starts an existing pod, optionally attaching one client TTY.
    ///
    /// When a TTY is supplied, its tag is registered for exit-code
    /// delivery after the pod starts and the receiver is handed back on
    /// the result.
    pub async fn start_pod(
        self: &Arc<Self>,
        pod_id: &str,
        vm_id: Option<&str>,
        tty: Option<TtyIo>,
    ) -> Result<StartResult> {
        let tag = tty.as_ref().map(|t| t.client_tag.clone());
        if let Some(tag) = &tag {
            debug!(pod = %pod_id, tag = %tag, "pod start with client terminal");
        }

        let lazy = self.driver.supports_lazy_mode() && vm_id.is_none();
        let ttys: Vec<TtyIo> = tty.into_iter().collect();

        let (code, cause) = {
            let mut reg = self.pods.write().await;
            if !reg.contains(pod_id) {
                return Err(Error::PodNotFound(pod_id.to_string()));
            }
            self.start_pod_locked(&mut reg, pod_id, vm_id, lazy, KeepPolicy::None, ttys)
                .await?
        };

        let exit_code = match tag {
            Some(tag) => {
                let (tx, rx) = oneshot::channel();
                self.get_exit_code(pod_id, &tag, tx).await?;
                Some(rx)
            }
            None => None,
        };

        Ok(StartResult {
            code,
            cause,
            exit_code,
        })
    }

    /// Creates the pod if it does not exist yet, then starts it, all under
    /// one acquisition of the registry write lock.
    pub async fn run_pod(
        self: &Arc<Self>,
        pod_id: &str,
        spec_blob: &[u8],
        vm_id: Option<&str>,
        lazy: bool,
        autoremove: bool,
        keep: KeepPolicy,
        ttys: Vec<TtyIo>,
    ) -> Result<(i32, String)> {
        let mut reg = self.pods.write().await;

        if !reg.contains(pod_id) {
            self.create_pod_locked(&mut reg, pod_id.to_string(), spec_blob, autoremove)
                .await?;
        }

        self.start_pod_locked(&mut reg, pod_id, vm_id, lazy, keep, ttys)
            .await
    }

    /// Start pipeline body; the caller holds the registry write lock.
    ///
    /// Compensation is LIFO: a failure after VM acquisition stops any
    /// configured loggers, and kills the VM only when it was freshly
    /// allocated by this call.
    async fn start_pod_locked(
        self: &Arc<Self>,
        reg: &mut PodRegistry,
        pod_id: &str,
        vm_id: Option<&str>,
        lazy: bool,
        keep: KeepPolicy,
        ttys: Vec<TtyIo>,
    ) -> Result<(i32, String)> {
        let pod = reg
            .get_mut(pod_id)
            .ok_or_else(|| Error::PodNotFound(pod_id.to_string()))?;
        if pod.has_vm() {
            return Err(Error::Conflict(format!("pod {pod_id} is already running")));
        }

        let (vm, fresh) = match vm_id {
            Some(id) => {
                let vms = self.vms.read().await;
                let vm = vms
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::VmNotFound(id.to_string()))?;
                (vm, false)
            }
            None => {
                let vm = self
                    .new_vm(None, pod.spec.resource.vcpu, pod.spec.resource.memory)
                    .await?;
                let boot = self.boot_config(pod.spec.resource.vcpu, pod.spec.resource.memory);
                vm.launch(&boot, lazy).await?;
                if let Err(e) = self.vms.write().await.add(Arc::clone(&vm)) {
                    let _ = vm.kill().await;
                    return Err(e);
                }
                (vm, true)
            }
        };

        info!(pod = %pod_id, vm = vm.id(), fresh, lazy, "starting pod");
        vm.set_keep(keep);
        pod.set_vm(Arc::clone(&vm));

        match self.start_pod_steps(pod, &vm, ttys).await {
            Ok(resp) => {
                pod.status.phase = PodPhase::Running;
                self.spawn_event_loop(pod_id.to_string(), Arc::clone(&vm));
                info!(pod = %pod_id, vm = vm.id(), "pod running");
                Ok((resp.code, resp.cause))
            }
            Err(e) => {
                error!(pod = %pod_id, vm = vm.id(), error = %e, "pod start failed");
                pod.status.stop_loggers();
                pod.clear_vm();
                if fresh {
                    if let Err(ke) = vm.kill().await {
                        warn!(vm = vm.id(), error = %ke, "failed to kill vm during start compensation");
                    }
                    self.vms.write().await.remove(vm.id());
                }
                Err(e)
            }
        }
    }

    /// The fallible middle of the start pipeline: prepare, loggers, TTY
    /// attachment, in-VM launch, persistence.
    async fn start_pod_steps(
        &self,
        pod: &mut Pod,
        vm: &Arc<Vm>,
        ttys: Vec<TtyIo>,
    ) -> Result<VmStartResponse> {
        let shared_dir = self.shared_dir(vm.id());

        pod.prepare_services(self.services.as_ref())?;
        pod.prepare_etc_hosts()?;
        pod.prepare_dns()?;
        pod.prepare_containers(
            self.storage.as_ref(),
            self.images.as_ref(),
            &self.config.resource_root,
            &shared_dir,
        )
        .await?;
        pod.prepare_volumes(self.storage.as_ref(), &shared_dir).await?;

        self.configure_loggers(pod)?;
        self.start_logging(pod, vm).await?;
        self.attach_ttys(pod, vm, ttys).await?;

        let resp = vm
            .start_pod(&pod.status, &pod.spec, &pod.containers, &pod.volumes)
            .await?;

        self.kv.update_vm_data(vm.id(), &resp.data)?;
        self.kv.update_vm_by_pod(pod.id(), vm.id())?;

        Ok(resp)
    }

    /// Attaches client TTYs to containers by index. For service-discovery
    /// pods the sidecar at index 0 is skipped. Extra streams beyond the
    /// container count are dropped.
    async fn attach_ttys(&self, pod: &Pod, vm: &Vm, ttys: Vec<TtyIo>) -> Result<()> {
        let offset = if pod.spec.kind == SERVICE_DISCOVERY_POD_KIND {
            1
        } else {
            0
        };
        let targets = pod.containers.iter().skip(offset);

        for (tty, ci) in ttys.into_iter().zip(targets) {
            debug!(tag = %tty.client_tag, container = %ci.id, "attaching client tty");
            vm.attach(tty.stdin, tty.stdout, &tty.client_tag, &ci.id).await?;
        }

        Ok(())
    }

    // =========================================================================
    // Log Plumbing
    // =========================================================================

    /// Instantiates a log driver for every container that lacks one.
    fn configure_loggers(&self, pod: &mut Pod) -> Result<()> {
        if pod.spec.log_config.kind.is_empty() {
            pod.spec.log_config = self.config.default_log.clone();
        }
        let kind = pod.spec.log_config.kind.clone();
        if kind.is_empty() || kind == LOG_DRIVER_NONE {
            return Ok(());
        }

        let needs_any = pod
            .status
            .containers
            .iter()
            .any(|c| c.logs.driver.is_none());
        if !needs_any && pod.status.phase == PodPhase::Running {
            return Ok(());
        }

        self.log_drivers
            .validate_opts(&kind, &pod.spec.log_config.config)?;
        let creator = self.log_drivers.creator(&kind)?;
        debug!(pod = %pod.id(), driver = %kind, "configuring log driver");

        for i in 0..pod.status.containers.len() {
            if pod.status.containers[i].logs.driver.is_some() {
                continue;
            }

            let container_id = pod.status.containers[i].id.clone();
            let mut ctx = LogContext {
                config: pod.spec.log_config.config.clone(),
                container_id: container_id.clone(),
                container_name: pod.status.containers[i].name.clone(),
                image_name: pod
                    .spec
                    .containers
                    .get(i)
                    .map(|c| c.image.clone())
                    .unwrap_or_default(),
                entrypoint: pod
                    .containers
                    .get(i)
                    .map(|ci| ci.entrypoint.clone())
                    .unwrap_or_default(),
                cmd: pod
                    .containers
                    .get(i)
                    .map(|ci| ci.cmd.clone())
                    .unwrap_or_default(),
                created: Some(chrono::Utc::now()),
                log_path: None,
            };
            if kind == JSON_FILE_LOG_DRIVER {
                ctx.log_path = Some(json_file_log_path(
                    &pod.status.resource_path,
                    &container_id,
                ));
            }

            pod.status.containers[i].logs.driver = Some(creator(&ctx)?);
        }

        Ok(())
    }

    /// Requests tagged log streams from the VM and starts a copier per
    /// container.
    async fn start_logging(&self, pod: &mut Pod, vm: &Vm) -> Result<()> {
        if pod.spec.log_config.kind == LOG_DRIVER_NONE || pod.spec.log_config.kind.is_empty() {
            return Ok(());
        }

        for i in 0..pod.status.containers.len() {
            let container_id = pod.status.containers[i].id.clone();
            let Some(driver) = pod.status.containers[i].logs.driver.clone() else {
                continue;
            };

            let tag = ids::new_log_tag();
            let (stdout, stderr) = vm.log_output(&container_id, &tag).await?;
            let copier = LogCopier::spawn(&container_id, stdout, stderr, Arc::clone(&driver));

            pod.status.containers[i].logs.copier = Some(copier);
            pod.status.containers[i].logs.log_path = driver.log_path();
        }

        Ok(())
    }

    // =========================================================================
    // Labels / Inspection
    // =========================================================================

    /// Updates a pod's labels and re-persists its spec.
    ///
    /// Takes the exclusive lock: label writes mutate the record in place,
    /// and readers must never observe a partially applied update.
    pub async fn set_pod_labels(
        &self,
        id_or_name: &str,
        override_existing: bool,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        let mut reg = self.pods.write().await;
        let pod_id = reg
            .resolve_id(id_or_name)
            .ok_or_else(|| Error::PodNotFound(id_or_name.to_string()))?;
        let pod = reg
            .get_mut(&pod_id)
            .ok_or_else(|| Error::PodNotFound(pod_id.clone()))?;

        for key in labels.keys() {
            if pod.spec.labels.contains_key(key) && !override_existing {
                return Err(Error::Conflict(format!(
                    "cannot update label {key} without override"
                )));
            }
        }

        pod.spec.labels.extend(labels);

        let blob = serde_json::to_vec(&pod.spec)?;
        self.kv.write_pod(&pod_id, &blob)?;
        Ok(())
    }

    /// Lists all pods (shared lock).
    pub async fn list_pods(&self) -> Vec<PodSummary> {
        let reg = self.pods.read().await;
        reg.iter()
            .map(|pod| PodSummary {
                id: pod.id().to_string(),
                name: pod.status.name.clone(),
                phase: pod.status.phase,
                vm: pod.status.vm.clone(),
                container_ids: pod.status.containers.iter().map(|c| c.id.clone()).collect(),
            })
            .collect()
    }

    /// Returns a summary for one pod, by id or name (shared lock).
    pub async fn pod_summary(&self, id_or_name: &str) -> Result<PodSummary> {
        let reg = self.pods.read().await;
        let pod_id = reg
            .resolve_id(id_or_name)
            .ok_or_else(|| Error::PodNotFound(id_or_name.to_string()))?;
        let pod = reg
            .get(&pod_id)
            .ok_or_else(|| Error::PodNotFound(pod_id.clone()))?;

        Ok(PodSummary {
            id: pod.id().to_string(),
            name: pod.status.name.clone(),
            phase: pod.status.phase,
            vm: pod.status.vm.clone(),
            container_ids: pod.status.containers.iter().map(|c| c.id.clone()).collect(),
        })
    }

    // =========================================================================
    // Exit-Code Delivery
    // =========================================================================

    /// Routes the exit code for `client_tag` to `tx`.
    ///
    /// Exactly one value is delivered per tag. Fails when the pod is
    /// unknown or no longer has a VM.
    pub async fn get_exit_code(
        &self,
        pod_id: &str,
        client_tag: &str,
        tx: oneshot::Sender<u8>,
    ) -> Result<()> {
        let reg = self.pods.write().await;
        let pod = reg
            .get(pod_id)
            .ok_or_else(|| Error::PodNotFound(pod_id.to_string()))?;
        let vm = pod
            .vm
            .as_ref()
            .ok_or_else(|| Error::Conflict(format!("pod {pod_id} is already stopped")))?;

        vm.exit_code(client_tag, tx).await
    }

    // =========================================================================
    // Cleanup / Restart
    // =========================================================================

    /// Removes a pod: containers, registry record, and durable rows.
    pub async fn clean_pod(&self, pod_id: &str) -> Result<()> {
        let pod = {
            let mut reg = self.pods.write().await;
            reg.remove(pod_id)
                .ok_or_else(|| Error::PodNotFound(pod_id.to_string()))?
        };

        for c in &pod.status.containers {
            debug!(pod = %pod_id, container = %c.id, "removing container");
            if let Err(e) = self.images.remove_container(&c.id).await {
                debug!(container = %c.id, error = %e, "failed to remove container");
            }
        }

        self.kv.delete_pod(pod_id)?;
        self.kv.delete_pod_containers(pod_id)?;
        self.kv.delete_volume_ids(pod_id)?;

        info!(pod = %pod_id, "pod cleaned");
        Ok(())
    }

    /// Recomposes a pod after its VM terminated: tear down the stopped
    /// instance, reload the persisted spec, and run it again.
    ///
    /// The caller is responsible for having checked the restart policy.
    pub async fn restart_pod(self: &Arc<Self>, pod_id: &str) -> Result<()> {
        let removed = {
            let mut reg = self.pods.write().await;
            reg.remove(pod_id)
        };
        if let Some(pod) = &removed {
            for c in &pod.status.containers {
                debug!(pod = %pod_id, container = %c.id, "removing container for restart");
                if let Err(e) = self.images.remove_container(&c.id).await {
                    debug!(container = %c.id, error = %e, "failed to remove container");
                }
            }
        }
        self.kv.delete_pod_containers(pod_id)?;
        self.kv.delete_volume_ids(pod_id)?;

        let blob = self.kv.pod(pod_id)?;
        let lazy = self.driver.supports_lazy_mode();

        self.run_pod(pod_id, &blob, None, lazy, false, KeepPolicy::None, Vec::new())
            .await?;

        self.write_pod_and_containers(pod_id).await?;
        info!(pod = %pod_id, "pod restarted");
        Ok(())
    }

    /// Persists the container-id index for a pod.
    async fn write_pod_and_containers(&self, pod_id: &str) -> Result<()> {
        let reg = self.pods.read().await;
        let pod = reg
            .get(pod_id)
            .ok_or_else(|| Error::PodNotFound(pod_id.to_string()))?;
        let ids: Vec<String> = pod.status.containers.iter().map(|c| c.id.clone()).collect();
        self.kv.write_pod_containers(pod_id, &ids)
    }

    // =========================================================================
    // VM Management
    // =========================================================================

    /// Creates a VM handle through the hypervisor driver. With no id
    /// given, a fresh `vm-` id is generated, retrying on collision.
    pub async fn new_vm(&self, id: Option<&str>, cpu: u32, memory: u32) -> Result<Arc<Vm>> {
        let vm_id = match id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let vms = self.vms.read().await;
                loop {
                    let candidate = ids::new_vm_id();
                    if !vms.contains(&candidate) {
                        break candidate;
                    }
                }
            }
        };

        let (tx, rx) = mpsc::channel(VM_EVENT_CHANNEL_CAPACITY);
        let backend = self.driver.create_vm(&vm_id, cpu, memory, tx).await?;
        Ok(Arc::new(Vm::new(vm_id, cpu, memory, backend, rx)))
    }

    /// Creates and launches a standalone VM.
    pub async fn create_vm(&self, cpu: Option<u32>, memory: Option<u32>) -> Result<VmInfo> {
        let cpu = cpu.unwrap_or(DEFAULT_VM_CPU);
        let memory = memory.unwrap_or(DEFAULT_VM_MEMORY_MIB);

        let vm = self.new_vm(None, cpu, memory).await?;
        let boot = self.boot_config(cpu, memory);
        vm.launch(&boot, false).await?;

        let id = vm.id().to_string();
        self.vms.write().await.add(vm)?;

        info!(vm = %id, cpu, memory, "vm created");
        Ok(VmInfo {
            id,
            code: 0,
            cause: String::new(),
        })
    }

    /// Kills a VM by id. Unknown ids are a no-op, mirroring the
    /// idempotent front-end semantics.
    pub async fn kill_vm(&self, vm_id: &str) -> Result<VmExit> {
        let vm = self.vms.read().await.get(vm_id).cloned();
        let Some(vm) = vm else {
            return Ok(VmExit::default());
        };

        let exit = vm.kill().await?;
        self.vms.write().await.remove(vm_id);
        info!(vm = %vm_id, code = exit.code, "vm killed");
        Ok(exit)
    }

    /// Rebinds VMs that survived a daemon restart.
    ///
    /// For every registered pod whose status records a VM id, the persisted
    /// spec and VM data are reloaded and a fresh handle is associated.
    /// Pods whose state cannot be reconstructed are skipped.
    pub async fn associate_all_vms(self: &Arc<Self>) -> Result<()> {
        let mut reg = self.pods.write().await;
        let mut loops: Vec<(String, Arc<Vm>)> = Vec::new();

        for pod in reg.iter_mut() {
            let Some(vm_id) = pod.status.vm.clone() else {
                continue;
            };
            let Ok(blob) = self.kv.pod(pod.id()) else {
                continue;
            };
            let Ok(spec) = PodSpec::parse(&blob, pod.id()) else {
                continue;
            };
            let Ok(data) = self.kv.vm_data(&vm_id) else {
                continue;
            };

            info!(pod = %pod.id(), vm = %vm_id, "associating pod with surviving vm");
            let Ok(vm) = self
                .new_vm(Some(&vm_id), spec.resource.vcpu, spec.resource.memory)
                .await
            else {
                continue;
            };
            if vm.associate(&pod.status, &data).await.is_err() {
                continue;
            }
            if self.vms.write().await.add(Arc::clone(&vm)).is_err() {
                continue;
            }

            pod.vm = Some(Arc::clone(&vm));
            loops.push((pod.id().to_string(), vm));
        }
        drop(reg);

        for (pod_id, vm) in loops {
            self.spawn_event_loop(pod_id, vm);
        }
        Ok(())
    }

    /// Releases every VM on daemon shutdown. Best-effort: stops at the
    /// first error and returns it.
    pub async fn release_all_vms(&self) -> Result<i32> {
        let vms = self.vms.read().await.all();
        let mut code = 0;
        for vm in vms {
            code = vm.release().await?;
        }
        Ok(code)
    }
}

/// Creates a per-pod resource directory with mode 0755.
fn create_resource_dir(path: &std::path::Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(path)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
