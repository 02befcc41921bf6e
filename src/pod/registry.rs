//! Pod registry: pod id → record, with a by-name index.
//!
//! The registry itself is a plain map; the daemon wraps it in a single
//! readers-writer lock. Writers hold the exclusive lock across whole
//! create/start pipelines, readers (listing, label inspection) take the
//! shared lock.

use crate::constants::{MAX_PODS, POD_ID_PREFIX};
use crate::error::{Error, Result};
use crate::pod::Pod;
use std::collections::HashMap;

/// Table of live pod records.
#[derive(Default)]
pub struct PodRegistry {
    pods: HashMap<String, Pod>,
    /// name → id.
    names: HashMap<String, String>,
}

impl PodRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live pods.
    pub fn running_count(&self) -> usize {
        self.pods.len()
    }

    /// Whether the registry is at the pod cap.
    pub fn is_full(&self) -> bool {
        self.pods.len() >= MAX_PODS
    }

    /// Inserts a record.
    ///
    /// Fails with `CapacityExceeded` at the pod cap and `Conflict` when
    /// the id is already registered.
    pub fn insert(&mut self, pod: Pod) -> Result<()> {
        if self.is_full() {
            return Err(Error::CapacityExceeded {
                what: "pod",
                limit: MAX_PODS,
            });
        }
        if self.pods.contains_key(pod.id()) {
            return Err(Error::Conflict(format!("pod {} already exists", pod.id())));
        }
        self.names
            .insert(pod.status.name.clone(), pod.id().to_string());
        self.pods.insert(pod.id().to_string(), pod);
        Ok(())
    }

    /// Looks up a record by id.
    pub fn get(&self, id: &str) -> Option<&Pod> {
        self.pods.get(id)
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Pod> {
        self.pods.get_mut(id)
    }

    /// Looks up a record by name.
    pub fn get_by_name(&self, name: &str) -> Option<&Pod> {
        self.names.get(name).and_then(|id| self.pods.get(id))
    }

    /// Resolves an identifier to a pod id. Identifiers containing the
    /// `pod-` prefix are treated as ids, everything else as names.
    pub fn resolve_id(&self, id_or_name: &str) -> Option<String> {
        if id_or_name.contains(POD_ID_PREFIX) {
            self.pods.get(id_or_name).map(|p| p.id().to_string())
        } else {
            self.names.get(id_or_name).cloned()
        }
    }

    /// Removes a record by id, returning it if present.
    pub fn remove(&mut self, id: &str) -> Option<Pod> {
        let pod = self.pods.remove(id)?;
        self.names.remove(&pod.status.name);
        Some(pod)
    }

    /// Whether an id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.pods.contains_key(id)
    }

    /// Iterates over all records.
    pub fn iter(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    /// Iterates mutably over all records.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pod> {
        self.pods.values_mut()
    }
}
