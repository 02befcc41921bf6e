//! Error types for the pod/VM lifecycle engine.

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the pod/VM lifecycle engine.
///
/// Local recovery is confined to compensating actions (removing
/// half-created containers, killing a freshly-booted VM, stopping
/// loggers); everything else surfaces to the caller through these
/// variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Capacity / Lookup
    // =========================================================================
    /// A registry reached its capacity limit.
    #[error("{what} full, the maximum is {limit}")]
    CapacityExceeded { what: &'static str, limit: usize },

    /// Pod not found.
    #[error("pod not found: {0}")]
    PodNotFound(String),

    /// VM not found.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Operation conflicts with the current state of the target.
    #[error("conflict: {0}")]
    Conflict(String),

    // =========================================================================
    // Specification
    // =========================================================================
    /// Pod specification failed validation.
    #[error("invalid pod spec: {0}")]
    ValidationFailed(String),

    // =========================================================================
    // Collaborators
    // =========================================================================
    /// Image manager operation failed.
    #[error("image manager error: {0}")]
    Image(String),

    /// Storage driver operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Hypervisor driver or VM backend operation failed.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// No hypervisor driver could be initialized.
    #[error("no hypervisor driver available")]
    DriverUnavailable,

    /// Key-value store operation failed.
    #[error("kv store error: {0}")]
    Store(String),

    /// Log driver error.
    #[error("log driver error: {0}")]
    Logger(String),

    // =========================================================================
    // I/O
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
