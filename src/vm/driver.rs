//! Hypervisor driver seam and driver probe.
//!
//! Concrete hypervisor integrations (xen, qemu, ...) live outside this
//! crate. The daemon is handed one [`HypervisorDriver`] at construction;
//! [`probe_drivers`] picks it from a candidate list by initializing each
//! in priority order.

use crate::error::{Error, Result};
use crate::pod::PodStatus;
use crate::spec::PodSpec;
use crate::storage::{ContainerInfo, VolumeInfo};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Driver names in probe priority order: xen is preferred, qemu is the
/// fallback.
pub const DRIVER_PROBE_ORDER: [&str; 2] = ["xen", "qemu"];

// =============================================================================
// Boot / Response Types
// =============================================================================

/// Boot parameters for a new VM.
#[derive(Debug, Clone, Default)]
pub struct BootConfig {
    /// Virtual CPU count.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory: u32,
    /// Guest kernel image.
    pub kernel: Option<PathBuf>,
    /// Guest initrd image.
    pub initrd: Option<PathBuf>,
    /// Firmware image, for drivers that boot through one.
    pub bios: Option<PathBuf>,
    /// CBFS image, for drivers that boot through one.
    pub cbfs: Option<PathBuf>,
}

/// Result of launching a pod inside a VM.
#[derive(Debug, Clone, Default)]
pub struct VmStartResponse {
    /// Driver status code (0 means success).
    pub code: i32,
    /// Human-readable cause.
    pub cause: String,
    /// Opaque VM state blob to persist for post-restart association.
    pub data: Vec<u8>,
}

/// Result of killing or releasing a VM.
#[derive(Debug, Clone, Default)]
pub struct VmExit {
    /// Driver status code.
    pub code: i32,
    /// Human-readable cause.
    pub cause: String,
}

/// Typed lifecycle events a VM delivers to the daemon.
#[derive(Debug, Clone)]
pub enum VmEvent {
    /// Every container in the pod has exited; payload carries per-container
    /// exit codes in status order.
    PodFinished { exit_codes: Vec<u8> },
    /// The VM itself has shut down.
    VmShutdown,
}

// =============================================================================
// Driver Traits
// =============================================================================

/// A hypervisor integration capable of creating VM backends.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Driver name, e.g. `"xen"` or `"qemu"`.
    fn name(&self) -> &'static str;

    /// Probes the host for this hypervisor. Called once at daemon start.
    async fn initialize(&self) -> Result<()>;

    /// Whether the driver can defer VM boot until the first container is
    /// ready to execute.
    fn supports_lazy_mode(&self) -> bool;

    /// Creates a backend for a new VM. Lifecycle events must be delivered
    /// on `events` in emission order.
    async fn create_vm(
        &self,
        id: &str,
        cpu: u32,
        memory: u32,
        events: mpsc::Sender<VmEvent>,
    ) -> Result<Box<dyn VmBackend>>;
}

impl std::fmt::Debug for dyn HypervisorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorDriver")
            .field("name", &self.name())
            .finish()
    }
}

/// Per-VM operations exposed by a hypervisor driver.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Boots the VM and returns once it is reachable. With `lazy` set the
    /// driver defers the actual boot until the first container runs.
    async fn launch(&self, boot: &BootConfig, lazy: bool) -> Result<()>;

    /// Destroys the VM.
    async fn kill(&self) -> Result<VmExit>;

    /// Launches a prepared pod inside the VM.
    async fn start_pod(
        &self,
        status: &PodStatus,
        spec: &PodSpec,
        containers: &[ContainerInfo],
        volumes: &[VolumeInfo],
    ) -> Result<VmStartResponse>;

    /// Attaches a client TTY to a container. The streams must stay usable
    /// for the lifetime of the attachment; closing stdin signals EOF to
    /// the in-VM process.
    async fn attach(
        &self,
        stdin: Box<dyn AsyncRead + Send + Unpin>,
        stdout: Box<dyn AsyncWrite + Send + Unpin>,
        client_tag: &str,
        container_id: &str,
    ) -> Result<()>;

    /// Opens (stdout, stderr) log readers for a container, tagged so the
    /// VM can tell log streams from client TTYs.
    async fn log_output(
        &self,
        container_id: &str,
        tag: &str,
    ) -> Result<(
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncRead + Send + Unpin>,
    )>;

    /// Routes the exit code for `client_tag` to `tx`. Exactly one value
    /// is delivered per tag.
    async fn exit_code(&self, client_tag: &str, tx: oneshot::Sender<u8>) -> Result<()>;

    /// Reconstructs this backend's association with a VM that survived a
    /// daemon restart, from the persisted data blob.
    async fn associate(&self, status: &PodStatus, data: &[u8]) -> Result<()>;

    /// Detaches the daemon from the VM without destroying it.
    async fn release(&self) -> Result<i32>;
}

// =============================================================================
// Driver Probe
// =============================================================================

/// Selects the hypervisor driver for this host.
///
/// Candidates are tried in [`DRIVER_PROBE_ORDER`]; candidates with names
/// outside that list are tried afterwards in the order given. The first
/// driver whose `initialize` succeeds wins.
pub async fn probe_drivers(
    candidates: Vec<Arc<dyn HypervisorDriver>>,
) -> Result<Arc<dyn HypervisorDriver>> {
    let rank = |d: &Arc<dyn HypervisorDriver>| {
        DRIVER_PROBE_ORDER
            .iter()
            .position(|n| *n == d.name())
            .unwrap_or(DRIVER_PROBE_ORDER.len())
    };

    let mut ordered = candidates;
    ordered.sort_by_key(rank);

    for driver in ordered {
        match driver.initialize().await {
            Ok(()) => {
                info!(driver = driver.name(), "hypervisor driver loaded");
                return Ok(driver);
            }
            Err(e) => {
                warn!(driver = driver.name(), error = %e, "hypervisor driver failed to initialize");
            }
        }
    }

    Err(Error::DriverUnavailable)
}
