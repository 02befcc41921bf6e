//! VM handles and the hypervisor seam.
//!
//! A [`Vm`] is the in-process handle to one guest: identity, sizing,
//! coarse status, keep policy, and the driver backend that actually talks
//! to the hypervisor. Each pod is bound to exactly one VM for its
//! lifetime; the daemon owns the VM registry and the per-VM event loop.

mod driver;
mod registry;

pub use driver::{
    probe_drivers, BootConfig, HypervisorDriver, VmBackend, VmEvent, VmExit, VmStartResponse,
    DRIVER_PROBE_ORDER,
};
pub use registry::VmRegistry;

use crate::error::Result;
use crate::pod::PodStatus;
use crate::spec::PodSpec;
use crate::storage::{ContainerInfo, VolumeInfo};
use std::sync::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// Coarse VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    /// Created but not yet running a pod.
    Pending,
    /// Running (or lazily booting on first use).
    Running,
    /// Pod finished; VM retained for reuse.
    Idle,
    /// Destroyed.
    Destroyed,
}

/// Whether a VM is retained after its pod finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeepPolicy {
    /// Tear the VM down with its pod.
    #[default]
    None,
    /// Keep the VM around in `Idle` for potential reuse.
    Idle,
}

/// In-process handle to one VM.
pub struct Vm {
    id: String,
    cpu: u32,
    memory: u32,
    status: RwLock<VmStatus>,
    keep: RwLock<KeepPolicy>,
    backend: Box<dyn VmBackend>,
    events: Mutex<Option<mpsc::Receiver<VmEvent>>>,
}

impl Vm {
    /// Wraps a driver backend into a handle. The receiver half of the
    /// event channel is parked here until a pod event loop claims it.
    pub fn new(
        id: String,
        cpu: u32,
        memory: u32,
        backend: Box<dyn VmBackend>,
        events: mpsc::Receiver<VmEvent>,
    ) -> Self {
        Self {
            id,
            cpu,
            memory,
            status: RwLock::new(VmStatus::Pending),
            keep: RwLock::new(KeepPolicy::None),
            backend,
            events: Mutex::new(Some(events)),
        }
    }

    /// VM identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Virtual CPU count.
    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Memory in MiB.
    pub fn memory(&self) -> u32 {
        self.memory
    }

    /// Current lifecycle state.
    pub fn status(&self) -> VmStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_status(&self, status: VmStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Keep policy applied when the pod finishes.
    pub fn keep(&self) -> KeepPolicy {
        *self.keep.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_keep(&self, keep: KeepPolicy) {
        *self.keep.write().unwrap_or_else(|e| e.into_inner()) = keep;
    }

    /// Takes the event receiver for this VM. Returns `None` if an event
    /// loop already claimed it.
    pub(crate) fn take_events(&self) -> Option<mpsc::Receiver<VmEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Boots the VM and marks it running.
    pub async fn launch(&self, boot: &BootConfig, lazy: bool) -> Result<()> {
        self.backend.launch(boot, lazy).await?;
        self.set_status(VmStatus::Running);
        Ok(())
    }

    /// Destroys the VM.
    pub async fn kill(&self) -> Result<VmExit> {
        let exit = self.backend.kill().await?;
        self.set_status(VmStatus::Destroyed);
        Ok(exit)
    }

    /// Launches a prepared pod inside the VM.
    pub async fn start_pod(
        &self,
        status: &PodStatus,
        spec: &PodSpec,
        containers: &[ContainerInfo],
        volumes: &[VolumeInfo],
    ) -> Result<VmStartResponse> {
        self.backend.start_pod(status, spec, containers, volumes).await
    }

    /// Attaches a client TTY to a container.
    pub async fn attach(
        &self,
        stdin: Box<dyn AsyncRead + Send + Unpin>,
        stdout: Box<dyn AsyncWrite + Send + Unpin>,
        client_tag: &str,
        container_id: &str,
    ) -> Result<()> {
        self.backend
            .attach(stdin, stdout, client_tag, container_id)
            .await
    }

    /// Opens tagged (stdout, stderr) log readers for a container.
    pub async fn log_output(
        &self,
        container_id: &str,
        tag: &str,
    ) -> Result<(
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncRead + Send + Unpin>,
    )> {
        self.backend.log_output(container_id, tag).await
    }

    /// Routes the exit code for `client_tag` to `tx`.
    pub async fn exit_code(&self, client_tag: &str, tx: oneshot::Sender<u8>) -> Result<()> {
        self.backend.exit_code(client_tag, tx).await
    }

    /// Rebinds this handle to a VM that survived a daemon restart.
    pub async fn associate(&self, status: &PodStatus, data: &[u8]) -> Result<()> {
        self.backend.associate(status, data).await?;
        self.set_status(VmStatus::Running);
        Ok(())
    }

    /// Detaches from the VM without destroying it.
    pub async fn release(&self) -> Result<i32> {
        self.backend.release().await
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("cpu", &self.cpu)
            .field("memory", &self.memory)
            .field("status", &self.status())
            .field("keep", &self.keep())
            .finish()
    }
}
