//! Persistence seam for pod specs, container indexes, and VM bindings.
//!
//! The daemon treats durable metadata as a key-value store with a handful
//! of typed rows. Production deployments plug in an on-disk store; the
//! in-memory [`MemoryKvStore`] ships for embedding and tests.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Durable metadata rows the daemon maintains.
///
/// Writes must be visible to subsequent reads as soon as the call
/// returns; the create pipeline relies on this to keep the registry and
/// the store in lockstep.
pub trait KvStore: Send + Sync {
    /// Persists the validated spec blob for a pod.
    fn write_pod(&self, pod_id: &str, spec: &[u8]) -> Result<()>;

    /// Loads the persisted spec blob for a pod.
    fn pod(&self, pod_id: &str) -> Result<Vec<u8>>;

    /// Deletes a pod's spec blob.
    fn delete_pod(&self, pod_id: &str) -> Result<()>;

    /// Persists the container-id index for a pod.
    fn write_pod_containers(&self, pod_id: &str, ids: &[String]) -> Result<()>;

    /// Returns the container-id index for a pod (empty when absent).
    fn pod_containers(&self, pod_id: &str) -> Result<Vec<String>>;

    /// Deletes a pod's container-id index.
    fn delete_pod_containers(&self, pod_id: &str) -> Result<()>;

    /// Persists the opaque VM data blob returned by the hypervisor.
    fn update_vm_data(&self, vm_id: &str, data: &[u8]) -> Result<()>;

    /// Loads the opaque VM data blob.
    fn vm_data(&self, vm_id: &str) -> Result<Vec<u8>>;

    /// Records the VM a pod is bound to.
    fn update_vm_by_pod(&self, pod_id: &str, vm_id: &str) -> Result<()>;

    /// Deletes the volume-id rows recorded for a pod.
    fn delete_volume_ids(&self, pod_id: &str) -> Result<()>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Default)]
struct MemoryKvInner {
    pods: HashMap<String, Vec<u8>>,
    pod_containers: HashMap<String, Vec<String>>,
    vm_data: HashMap<String, Vec<u8>>,
    vm_by_pod: HashMap<String, String>,
    volume_ids: HashMap<String, Vec<String>>,
}

/// In-memory [`KvStore`] implementation.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<MemoryKvInner>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a pod spec row exists (test/introspection helper).
    pub fn has_pod(&self, pod_id: &str) -> bool {
        self.lock().pods.contains_key(pod_id)
    }

    /// Returns the VM recorded for a pod, if any.
    pub fn vm_for_pod(&self, pod_id: &str) -> Option<String> {
        self.lock().vm_by_pod.get(pod_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryKvInner> {
        // Mutex poisoning only happens if a writer panicked; the maps are
        // still structurally sound, so keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KvStore for MemoryKvStore {
    fn write_pod(&self, pod_id: &str, spec: &[u8]) -> Result<()> {
        self.lock().pods.insert(pod_id.to_string(), spec.to_vec());
        Ok(())
    }

    fn pod(&self, pod_id: &str) -> Result<Vec<u8>> {
        self.lock()
            .pods
            .get(pod_id)
            .cloned()
            .ok_or_else(|| Error::PodNotFound(pod_id.to_string()))
    }

    fn delete_pod(&self, pod_id: &str) -> Result<()> {
        self.lock().pods.remove(pod_id);
        Ok(())
    }

    fn write_pod_containers(&self, pod_id: &str, ids: &[String]) -> Result<()> {
        self.lock()
            .pod_containers
            .insert(pod_id.to_string(), ids.to_vec());
        Ok(())
    }

    fn pod_containers(&self, pod_id: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .pod_containers
            .get(pod_id)
            .cloned()
            .unwrap_or_default())
    }

    fn delete_pod_containers(&self, pod_id: &str) -> Result<()> {
        self.lock().pod_containers.remove(pod_id);
        Ok(())
    }

    fn update_vm_data(&self, vm_id: &str, data: &[u8]) -> Result<()> {
        self.lock().vm_data.insert(vm_id.to_string(), data.to_vec());
        Ok(())
    }

    fn vm_data(&self, vm_id: &str) -> Result<Vec<u8>> {
        self.lock()
            .vm_data
            .get(vm_id)
            .cloned()
            .ok_or_else(|| Error::VmNotFound(vm_id.to_string()))
    }

    fn update_vm_by_pod(&self, pod_id: &str, vm_id: &str) -> Result<()> {
        self.lock()
            .vm_by_pod
            .insert(pod_id.to_string(), vm_id.to_string());
        Ok(())
    }

    fn delete_volume_ids(&self, pod_id: &str) -> Result<()> {
        self.lock().volume_ids.remove(pod_id);
        Ok(())
    }
}
