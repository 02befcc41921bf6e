//! Constants for the pod/VM lifecycle engine.
//!
//! All caps, identifier formats, and well-known paths are defined here to
//! ensure consistency and prevent magic numbers throughout the codebase.

// =============================================================================
// Capacity Limits
// =============================================================================

/// Maximum number of live pods per daemon instance.
pub const MAX_PODS: usize = 1024;

/// Maximum number of VMs per daemon instance.
pub const MAX_VMS: usize = 1024;

// =============================================================================
// Identifier Formats
// =============================================================================

/// Prefix for generated pod identifiers.
///
/// An identifier containing this prefix is treated as a pod id during
/// lookup; anything else is treated as a pod name.
pub const POD_ID_PREFIX: &str = "pod-";

/// Prefix for generated VM identifiers.
pub const VM_ID_PREFIX: &str = "vm-";

/// Prefix for generated log-stream tags.
pub const LOG_TAG_PREFIX: &str = "log-";

/// Random alphabetic suffix length for pod and VM identifiers.
pub const ID_RANDOM_LEN: usize = 10;

/// Random alphanumeric suffix length for log-stream tags.
pub const LOG_TAG_RANDOM_LEN: usize = 8;

// =============================================================================
// Filesystem Layout
// =============================================================================

/// Name of the per-VM directory the guest mounts as the host/guest conduit.
///
/// The full path is `<vm base dir>/<vm id>/share_dir`.
pub const SHARE_DIR_TAG: &str = "share_dir";

// =============================================================================
// Prepare Pipeline
// =============================================================================

/// Name of the shared pod-level volume backing each container's /etc/hosts.
pub const ETC_HOSTS_VOLUME: &str = "etchosts-volume";

/// In-guest path of the hosts file.
pub const ETC_HOSTS_PATH: &str = "/etc/hosts";

/// Host path of the resolver configuration propagated into containers.
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Suffix appended to the pod id to name the injected resolv.conf file.
pub const RESOLV_CONF_FILE_SUFFIX: &str = "-resolvconf";

/// Permission string for the injected resolv.conf.
pub const RESOLV_CONF_PERM: &str = "0644";

// =============================================================================
// Pod Kinds
// =============================================================================

/// Pod kind whose termination is governed by the restart policy.
pub const KUBERNETES_POD_KIND: &str = "kubernetes";

/// Pod kind whose first container is a service-discovery sidecar; client
/// TTY attachment starts at container index 1.
pub const SERVICE_DISCOVERY_POD_KIND: &str = "service-discovery";

// =============================================================================
// Storage Drivers
// =============================================================================

/// Storage backend whose volumes are raw block devices and never pass
/// through the shared directory.
pub const DEVICEMAPPER_DRIVER: &str = "devicemapper";

/// Volume driver for sources staged through the shared directory.
pub const VFS_VOLUME_DRIVER: &str = "vfs";

/// Volume driver for raw block-device volumes.
pub const RAW_VOLUME_DRIVER: &str = "raw";

// =============================================================================
// Logging
// =============================================================================

/// Name of the built-in JSON-lines file log driver.
pub const JSON_FILE_LOG_DRIVER: &str = "json-file";

/// Log driver name that disables logging for a pod.
pub const LOG_DRIVER_NONE: &str = "none";

// =============================================================================
// VM Defaults
// =============================================================================

/// Default vCPU count for standalone VM creation.
pub const DEFAULT_VM_CPU: u32 = 1;

/// Default memory (MiB) for standalone VM creation.
pub const DEFAULT_VM_MEMORY_MIB: u32 = 128;
