//! Service-discovery seam.
//!
//! Service definitions in a pod spec are rendered by an external
//! generator (it emits the sidecar configuration consumed inside the VM).
//! The prepare pipeline only needs a hook to invoke before anything else
//! touches the spec.

use crate::error::Result;
use crate::spec::PodSpec;

/// Generator invoked at the head of the prepare pipeline.
pub trait ServiceDiscovery: Send + Sync {
    /// Renders service-discovery configuration for the pod.
    fn prepare_services(&self, spec: &PodSpec, pod_id: &str) -> Result<()>;
}

/// Service discovery for daemons that don't run the sidecar.
#[derive(Debug, Default)]
pub struct NoopServiceDiscovery;

impl ServiceDiscovery for NoopServiceDiscovery {
    fn prepare_services(&self, _spec: &PodSpec, _pod_id: &str) -> Result<()> {
        Ok(())
    }
}
