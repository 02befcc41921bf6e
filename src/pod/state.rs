//! Pod runtime state types.

use crate::constants::KUBERNETES_POD_KIND;
use crate::logging::ContainerLogs;
use crate::spec::{PodSpec, RestartPolicy};
use std::path::PathBuf;

// =============================================================================
// Pod Phase
// =============================================================================

/// Pod lifecycle state.
///
/// ```text
///   Created ──start──▶ Running ──exit codes──▶ Succeeded | Failed
///      ▲                                            │
///      └───────────── restart (policy-driven) ◀─────┘
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PodPhase {
    /// Containers created, pod not yet started.
    #[default]
    Created,
    /// Pod is running inside its VM.
    Running,
    /// All containers exited with code zero.
    Succeeded,
    /// At least one container exited non-zero.
    Failed,
    /// Pod was halted by an explicit stop.
    Stopped,
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodPhase::Created => write!(f, "Created"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Failed => write!(f, "Failed"),
            PodPhase::Stopped => write!(f, "Stopped"),
        }
    }
}

// =============================================================================
// Pod Kind
// =============================================================================

/// Behavioral variant of a pod.
///
/// Only kubernetes pods get restart-policy handling when their VM shuts
/// down; everything else just stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodKind {
    /// Plain pod: no automatic recomposition.
    Default,
    /// Kubernetes pod: the restart policy decides what happens on VM
    /// shutdown.
    Kubernetes { restart_policy: RestartPolicy },
}

impl PodKind {
    /// Derives the variant from a validated spec.
    pub fn from_spec(spec: &PodSpec) -> Self {
        if spec.kind == KUBERNETES_POD_KIND {
            PodKind::Kubernetes {
                restart_policy: spec.restart_policy,
            }
        } else {
            PodKind::Default
        }
    }
}

// =============================================================================
// Container State
// =============================================================================

/// Runtime state of one container in a pod.
#[derive(Debug, Default)]
pub struct ContainerState {
    /// Container id assigned by the image manager.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Container phase; tracks the pod until exit codes arrive.
    pub phase: PodPhase,
    /// Exit code, once the VM reports one.
    pub exit_code: Option<u8>,
    /// Log driver / copier state.
    pub logs: ContainerLogs,
}

// =============================================================================
// Pod Status
// =============================================================================

/// Runtime status of a pod.
#[derive(Debug)]
pub struct PodStatus {
    /// Pod id.
    pub id: String,
    /// Pod name (defaults to the id).
    pub name: String,
    /// Current phase.
    pub phase: PodPhase,
    /// Bound VM id, while one exists.
    pub vm: Option<String>,
    /// Per-container state in spec order.
    pub containers: Vec<ContainerState>,
    /// Remove the pod automatically once its VM reports it finished.
    pub autoremove: bool,
    /// Per-pod resource directory on the host.
    pub resource_path: PathBuf,
    /// Behavioral variant.
    pub kind: PodKind,
}

impl PodStatus {
    /// Builds the initial status for a freshly created pod.
    pub fn new(pod_id: &str, spec: &PodSpec, resource_path: PathBuf, autoremove: bool) -> Self {
        Self {
            id: pod_id.to_string(),
            name: spec.name.clone(),
            phase: PodPhase::Created,
            vm: None,
            containers: Vec::new(),
            autoremove,
            resource_path,
            kind: PodKind::from_spec(spec),
        }
    }

    /// Appends a container in `Created` phase.
    pub fn add_container(&mut self, id: &str, name: &str, image: &str) {
        self.containers.push(ContainerState {
            id: id.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            phase: PodPhase::Created,
            exit_code: None,
            logs: ContainerLogs::default(),
        });
    }

    /// Applies per-container exit codes reported by the VM, in status
    /// order, and derives the pod phase: `Failed` if any container exited
    /// non-zero, `Succeeded` otherwise.
    ///
    /// A shorter code vector than the container list leaves the remaining
    /// containers untouched.
    pub fn set_container_exit_codes(&mut self, codes: &[u8]) {
        let mut failed = false;
        for (container, code) in self.containers.iter_mut().zip(codes) {
            container.exit_code = Some(*code);
            container.phase = if *code == 0 {
                PodPhase::Succeeded
            } else {
                failed = true;
                PodPhase::Failed
            };
        }
        self.phase = if failed {
            PodPhase::Failed
        } else {
            PodPhase::Succeeded
        };
    }

    /// Propagates one phase to the pod and every container.
    pub fn set_all(&mut self, phase: PodPhase) {
        self.phase = phase;
        for container in &mut self.containers {
            container.phase = phase;
        }
    }

    /// Closes every container's log driver and copier.
    pub fn stop_loggers(&mut self) {
        for container in &mut self.containers {
            container.logs.close();
        }
    }
}
