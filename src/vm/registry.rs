//! VM registry: vm id → handle.

use crate::constants::MAX_VMS;
use crate::error::{Error, Result};
use crate::vm::Vm;
use std::collections::HashMap;
use std::sync::Arc;

/// Table of live VM handles.
#[derive(Default)]
pub struct VmRegistry {
    vms: HashMap<String, Arc<Vm>>,
}

impl VmRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a VM handle.
    ///
    /// Fails with `CapacityExceeded` at the VM cap and `Conflict` when
    /// the id is already registered.
    pub fn add(&mut self, vm: Arc<Vm>) -> Result<()> {
        if self.vms.len() >= MAX_VMS {
            return Err(Error::CapacityExceeded {
                what: "VM",
                limit: MAX_VMS,
            });
        }
        if self.vms.contains_key(vm.id()) {
            return Err(Error::Conflict(format!("vm {} already exists", vm.id())));
        }
        self.vms.insert(vm.id().to_string(), vm);
        Ok(())
    }

    /// Looks up a VM by id.
    pub fn get(&self, id: &str) -> Option<&Arc<Vm>> {
        self.vms.get(id)
    }

    /// Removes a VM by id, returning the handle if present.
    pub fn remove(&mut self, id: &str) -> Option<Arc<Vm>> {
        self.vms.remove(id)
    }

    /// Whether an id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.vms.contains_key(id)
    }

    /// Number of registered VMs.
    pub fn len(&self) -> usize {
        self.vms.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    /// Snapshot of all handles, for shutdown-style sweeps.
    pub fn all(&self) -> Vec<Arc<Vm>> {
        self.vms.values().cloned().collect()
    }
}
