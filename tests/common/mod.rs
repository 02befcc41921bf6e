//! Shared test doubles: a scriptable hypervisor driver, an in-memory
//! image manager, and a recording storage driver.

#![allow(dead_code)]

use async_trait::async_trait;
use podvisor::error::{Error, Result};
use podvisor::image::{ContainerCreateRequest, ContainerJson, ImageManager};
use podvisor::kv::MemoryKvStore;
use podvisor::pod::PodStatus;
use podvisor::service::NoopServiceDiscovery;
use podvisor::spec::PodSpec;
use podvisor::storage::{ContainerInfo, StorageDriver, VolumeInfo};
use podvisor::vm::{BootConfig, HypervisorDriver, VmBackend, VmEvent, VmExit, VmStartResponse};
use podvisor::{Daemon, DaemonConfig};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// Storage-driver kind used across the harness; matches the layer-db path
/// the fake image manager seeds.
pub const TEST_STORAGE_KIND: &str = "devicemapper";

// =============================================================================
// Fake Hypervisor Driver
// =============================================================================

/// Observable state of one fake VM.
pub struct VmState {
    pub id: String,
    events: mpsc::Sender<VmEvent>,
    exit_txs: Mutex<HashMap<String, oneshot::Sender<u8>>>,
    pub killed: AtomicBool,
    pub released: AtomicBool,
    pub launched: AtomicBool,
    pub associated: AtomicBool,
    /// Container ids passed to `start_pod`, per call.
    pub start_calls: Mutex<Vec<Vec<String>>>,
    /// Client tags attached via `attach`.
    pub attached_tags: Mutex<Vec<String>>,
}

impl VmState {
    /// Injects a pod-finished event with the given exit codes.
    pub async fn finish_pod(&self, exit_codes: Vec<u8>) {
        self.events
            .send(VmEvent::PodFinished { exit_codes })
            .await
            .expect("event channel closed");
    }

    /// Injects a VM-shutdown event.
    pub async fn shutdown(&self) {
        self.events
            .send(VmEvent::VmShutdown)
            .await
            .expect("event channel closed");
    }

    /// Delivers the exit code registered for a client tag.
    pub fn deliver_exit(&self, tag: &str, code: u8) {
        let tx = self
            .exit_txs
            .lock()
            .unwrap()
            .remove(tag)
            .expect("no exit watcher for tag");
        let _ = tx.send(code);
    }

    /// Whether an exit watcher is registered for a tag.
    pub fn has_exit_watcher(&self, tag: &str) -> bool {
        self.exit_txs.lock().unwrap().contains_key(tag)
    }
}

/// Scriptable hypervisor driver.
pub struct FakeDriver {
    name: &'static str,
    lazy: bool,
    pub fail_init: AtomicBool,
    /// Makes every subsequent `start_pod` fail.
    pub fail_start: Arc<AtomicBool>,
    vms: Mutex<Vec<Arc<VmState>>>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Self::named("qemu")
    }

    pub fn named(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            lazy: false,
            fail_init: AtomicBool::new(false),
            fail_start: Arc::new(AtomicBool::new(false)),
            vms: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(name: &'static str) -> Arc<Self> {
        let driver = Self::named(name);
        driver.fail_init.store(true, Ordering::SeqCst);
        driver
    }

    /// Number of VMs created through this driver.
    pub fn vm_count(&self) -> usize {
        self.vms.lock().unwrap().len()
    }

    /// The most recently created VM.
    pub fn last_vm(&self) -> Arc<VmState> {
        self.vms.lock().unwrap().last().cloned().expect("no vm created")
    }

    /// Looks up a VM's observable state by id.
    pub fn vm_state(&self, id: &str) -> Option<Arc<VmState>> {
        self.vms.lock().unwrap().iter().find(|v| v.id == id).cloned()
    }
}

#[async_trait]
impl HypervisorDriver for FakeDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn initialize(&self) -> Result<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(Error::Hypervisor(format!("{} not present", self.name)));
        }
        Ok(())
    }

    fn supports_lazy_mode(&self) -> bool {
        self.lazy
    }

    async fn create_vm(
        &self,
        id: &str,
        _cpu: u32,
        _memory: u32,
        events: mpsc::Sender<VmEvent>,
    ) -> Result<Box<dyn VmBackend>> {
        let state = Arc::new(VmState {
            id: id.to_string(),
            events,
            exit_txs: Mutex::new(HashMap::new()),
            killed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            launched: AtomicBool::new(false),
            associated: AtomicBool::new(false),
            start_calls: Mutex::new(Vec::new()),
            attached_tags: Mutex::new(Vec::new()),
        });
        self.vms.lock().unwrap().push(Arc::clone(&state));
        Ok(Box::new(FakeVmBackend {
            state,
            fail_start: Arc::clone(&self.fail_start),
        }))
    }
}

struct FakeVmBackend {
    state: Arc<VmState>,
    fail_start: Arc<AtomicBool>,
}

#[async_trait]
impl VmBackend for FakeVmBackend {
    async fn launch(&self, _boot: &BootConfig, _lazy: bool) -> Result<()> {
        self.state.launched.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) -> Result<VmExit> {
        self.state.killed.store(true, Ordering::SeqCst);
        Ok(VmExit {
            code: 0,
            cause: String::new(),
        })
    }

    async fn start_pod(
        &self,
        _status: &PodStatus,
        _spec: &PodSpec,
        containers: &[ContainerInfo],
        _volumes: &[VolumeInfo],
    ) -> Result<VmStartResponse> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Hypervisor("scripted start failure".to_string()));
        }
        self.state
            .start_calls
            .lock()
            .unwrap()
            .push(containers.iter().map(|c| c.id.clone()).collect());
        Ok(VmStartResponse {
            code: 0,
            cause: String::new(),
            data: b"vm-data".to_vec(),
        })
    }

    async fn attach(
        &self,
        _stdin: Box<dyn AsyncRead + Send + Unpin>,
        _stdout: Box<dyn AsyncWrite + Send + Unpin>,
        client_tag: &str,
        _container_id: &str,
    ) -> Result<()> {
        self.state
            .attached_tags
            .lock()
            .unwrap()
            .push(client_tag.to_string());
        Ok(())
    }

    async fn log_output(
        &self,
        _container_id: &str,
        _tag: &str,
    ) -> Result<(
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncRead + Send + Unpin>,
    )> {
        Ok((Box::new(tokio::io::empty()), Box::new(tokio::io::empty())))
    }

    async fn exit_code(&self, client_tag: &str, tx: oneshot::Sender<u8>) -> Result<()> {
        self.state
            .exit_txs
            .lock()
            .unwrap()
            .insert(client_tag.to_string(), tx);
        Ok(())
    }

    async fn associate(&self, _status: &PodStatus, _data: &[u8]) -> Result<()> {
        self.state.associated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> Result<i32> {
        self.state.released.store(true, Ordering::SeqCst);
        Ok(0)
    }
}

// =============================================================================
// Fake Image Manager
// =============================================================================

#[derive(Default)]
struct FakeImagesInner {
    next: usize,
    containers: HashMap<String, ContainerJson>,
    removed: Vec<String>,
    /// Remaining successful creates before a scripted failure.
    fail_after: Option<usize>,
    /// Image reference → VOLUME paths reported on inspect.
    image_volumes: HashMap<String, Vec<String>>,
}

/// In-memory image manager that also seeds the layer-db mount-id file for
/// every container it creates, so the prepare pipeline can resolve it.
pub struct FakeImageManager {
    root: PathBuf,
    inner: Mutex<FakeImagesInner>,
}

impl FakeImageManager {
    pub fn new(root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            root,
            inner: Mutex::new(FakeImagesInner::default()),
        })
    }

    /// Fails container creation after `n` more successes.
    pub fn fail_create_after(&self, n: usize) {
        self.inner.lock().unwrap().fail_after = Some(n);
    }

    /// Declares `VOLUME` paths for an image.
    pub fn set_image_volumes(&self, image: &str, paths: &[&str]) {
        self.inner
            .lock()
            .unwrap()
            .image_volumes
            .insert(image.to_string(), paths.iter().map(|p| p.to_string()).collect());
    }

    pub fn created_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<String> = inner.containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().removed.clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().containers.contains_key(id)
    }

    fn seed_mount_id(&self, cid: &str) {
        let dir = self
            .root
            .join("image")
            .join(TEST_STORAGE_KIND)
            .join("layerdb")
            .join("mounts")
            .join(cid);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("mount-id"), format!("mnt-{cid}")).unwrap();
    }
}

#[async_trait]
impl ImageManager for FakeImageManager {
    async fn create_container(&self, req: ContainerCreateRequest) -> Result<String> {
        let id = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(remaining) = inner.fail_after {
                if remaining == 0 {
                    return Err(Error::Image("scripted create failure".to_string()));
                }
                inner.fail_after = Some(remaining - 1);
            }

            inner.next += 1;
            let id = format!("ctr-{:04}", inner.next);

            let mut volumes = BTreeMap::new();
            if let Some(paths) = inner.image_volumes.get(&req.image) {
                for p in paths {
                    volumes.insert(p.clone(), serde_json::Value::Null);
                }
            }

            let json = ContainerJson {
                id: id.clone(),
                name: format!("/{}", req.name),
                args: Vec::new(),
                config: podvisor::image::ContainerConfig {
                    image: req.image.clone(),
                    working_dir: String::new(),
                    entrypoint: req.entrypoint.clone(),
                    cmd: req.command.clone(),
                    env: vec!["PATH=/usr/local/bin:/usr/bin".to_string()],
                    volumes,
                },
            };
            inner.containers.insert(id.clone(), json);
            id
        };

        self.seed_mount_id(&id);
        Ok(id)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerJson> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.containers.remove(id);
        inner.removed.push(id.to_string());
        Ok(())
    }
}

// =============================================================================
// Fake Storage Driver
// =============================================================================

/// One recorded `inject_file` call.
#[derive(Debug, Clone)]
pub struct InjectRecord {
    pub mount_id: String,
    pub target_path: String,
    pub contents: Vec<u8>,
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Recording storage driver.
pub struct FakeStorage {
    kind: String,
    root: PathBuf,
    pub injected: Mutex<Vec<InjectRecord>>,
    pub prepared: AtomicUsize,
}

impl FakeStorage {
    pub fn new(root: PathBuf) -> Arc<Self> {
        Self::with_kind(root, TEST_STORAGE_KIND)
    }

    pub fn with_kind(root: PathBuf, kind: &str) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.to_string(),
            root,
            injected: Mutex::new(Vec::new()),
            prepared: AtomicUsize::new(0),
        })
    }

    pub fn injections(&self) -> Vec<InjectRecord> {
        self.injected.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageDriver for FakeStorage {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn root_path(&self) -> &Path {
        &self.root
    }

    async fn prepare_container(
        &self,
        mount_id: &str,
        _shared_dir: &Path,
    ) -> Result<ContainerInfo> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(ContainerInfo {
            mount_id: mount_id.to_string(),
            rootfs: format!("rootfs/{mount_id}"),
            fstype: "dir".to_string(),
            ..ContainerInfo::default()
        })
    }

    async fn inject_file(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        mount_id: &str,
        target_path: &str,
        _shared_dir: &Path,
        perm: u32,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        let mut contents = Vec::new();
        src.read_to_end(&mut contents).await?;
        self.injected.lock().unwrap().push(InjectRecord {
            mount_id: mount_id.to_string(),
            target_path: target_path.to_string(),
            contents,
            perm,
            uid,
            gid,
        });
        Ok(())
    }

    async fn create_volume(&self, pod_id: &str, name: &str) -> Result<VolumeInfo> {
        let dir = self.root.join("volumes").join(pod_id).join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(VolumeInfo {
            name: name.to_string(),
            filepath: dir,
            fstype: "dir".to_string(),
            format: String::new(),
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Everything a lifecycle test needs in one place.
pub struct Harness {
    pub daemon: Arc<Daemon>,
    pub driver: Arc<FakeDriver>,
    pub images: Arc<FakeImageManager>,
    pub storage: Arc<FakeStorage>,
    pub kv: Arc<MemoryKvStore>,
    pub root: TempDir,
    pub vm_base: TempDir,
}

/// Builds a daemon wired to fresh fakes and temp directories.
pub fn harness() -> Harness {
    let root = TempDir::new().unwrap();
    let vm_base = TempDir::new().unwrap();

    let driver = FakeDriver::new();
    let images = FakeImageManager::new(root.path().to_path_buf());
    let storage = FakeStorage::new(root.path().to_path_buf());
    let kv = Arc::new(MemoryKvStore::new());

    let daemon = Daemon::new(
        DaemonConfig::new(root.path().to_path_buf(), vm_base.path().to_path_buf()),
        driver.clone(),
        storage.clone(),
        images.clone(),
        kv.clone(),
        Arc::new(NoopServiceDiscovery),
    )
    .unwrap();

    Harness {
        daemon,
        driver,
        images,
        storage,
        kv,
        root,
        vm_base,
    }
}

/// Builds a minimal pod-spec blob with the given containers.
pub fn spec_blob(kind: &str, restart_policy: &str, containers: &[&str]) -> Vec<u8> {
    let containers: Vec<serde_json::Value> = containers
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name,
                "image": format!("{name}-image:latest"),
            })
        })
        .collect();

    let mut spec = serde_json::json!({
        "containers": containers,
        "resource": { "vcpu": 1, "memory": 128 },
    });
    if !kind.is_empty() {
        spec["type"] = serde_json::json!(kind);
    }
    if !restart_policy.is_empty() {
        spec["restartPolicy"] = serde_json::json!(restart_policy);
    }

    serde_json::to_vec(&spec).unwrap()
}

/// Polls an async condition until it returns true or a ~2.5s deadline
/// passes. The closure must produce an owned future (clone what it needs).
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached before deadline");
}
