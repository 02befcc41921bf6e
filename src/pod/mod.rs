//! Pod records and the pod lifecycle pipelines.
//!
//! A [`Pod`] is the in-memory aggregate the daemon tracks per pod: the
//! validated spec, the runtime status, the bound VM handle, and the
//! prepared container/volume descriptions built for the current start.
//!
//! Invariants:
//! - whenever `vm` is set, `status.vm` names the same VM
//! - prepared container/volume infos are non-empty exactly while the pod
//!   is running
//! - a record is registered exactly while its spec blob is persisted

mod events;
mod prepare;
mod registry;
mod state;

pub use prepare::{process_image_volumes, process_inject_files};
pub use registry::PodRegistry;
pub use state::{ContainerState, PodKind, PodPhase, PodStatus};

use crate::spec::PodSpec;
use crate::storage::{ContainerInfo, VolumeInfo};
use crate::vm::Vm;
use std::sync::Arc;

/// In-memory aggregate for one pod.
#[derive(Debug)]
pub struct Pod {
    id: String,
    /// Runtime status.
    pub status: PodStatus,
    /// Validated spec; the prepare pipeline works on this copy.
    pub spec: PodSpec,
    /// Bound VM, while one exists.
    pub vm: Option<Arc<Vm>>,
    /// Prepared container infos from the current start.
    pub containers: Vec<ContainerInfo>,
    /// Prepared volume infos from the current start.
    pub volumes: Vec<VolumeInfo>,
}

impl Pod {
    /// Builds a record for a freshly created pod.
    pub fn new(id: String, status: PodStatus, spec: PodSpec) -> Self {
        Self {
            id,
            status,
            spec,
            vm: None,
            containers: Vec::new(),
            volumes: Vec::new(),
        }
    }

    /// Pod id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Binds a VM, keeping `status.vm` in sync.
    pub fn set_vm(&mut self, vm: Arc<Vm>) {
        self.status.vm = Some(vm.id().to_string());
        self.vm = Some(vm);
    }

    /// Clears the VM binding and the prepared infos that belong to it.
    pub fn clear_vm(&mut self) {
        self.status.vm = None;
        self.vm = None;
        self.containers.clear();
        self.volumes.clear();
    }

    /// Whether the pod currently has a VM bound.
    pub fn has_vm(&self) -> bool {
        self.vm.is_some()
    }
}
