//! # podvisor
//!
//! **Pod-on-VM orchestration daemon core**
//!
//! podvisor runs each *pod* (a group of co-located containers with shared
//! volumes, files, and DNS) inside one dedicated lightweight VM obtained
//! from a pluggable hypervisor driver. Containers live inside the VM;
//! their image layers are managed on the host and exposed to the guest
//! through a per-VM shared directory.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Daemon                                │
//! │  ┌────────────────┐   ┌────────────────┐   ┌─────────────────┐   │
//! │  │  Pod Registry  │   │  VM Registry   │   │  Log Registry   │   │
//! │  │  (RwLock, cap  │   │  (RwLock, cap  │   │  (json-file,    │   │
//! │  │   1024 pods)   │   │   1024 VMs)    │   │   pluggable)    │   │
//! │  └────────────────┘   └────────────────┘   └─────────────────┘   │
//! │          │                                                       │
//! │   create ──▶ prepare ──▶ start ──▶ events ──▶ restart / clean    │
//! └──────────┼───────────────────────────────────────────────────────┘
//!            │ narrow trait seams
//!   ┌────────┼──────────┬──────────────┬──────────────┬───────────┐
//!   ▼        ▼          ▼              ▼              ▼           ▼
//! Hypervisor Storage  Image         KV store     Service      file://
//! driver     driver   manager       (specs, VM   discovery    sources
//! (xen/qemu) (layers) (containers)  bindings)    generator
//! ```
//!
//! # Pod Lifecycle
//!
//! ```text
//!   Created ──start──▶ Running ──pod finished──▶ exit codes applied
//!      ▲                  │                             │
//!      │                  └────────vm shutdown──────────┤
//!      │                                                ▼
//!      └──── restart (kubernetes policy) ◀── Succeeded | Failed
//! ```
//!
//! A pod is bound to exactly one VM for its lifetime. The start pipeline
//! acquires a VM, runs the prepare pipeline (services, /etc/hosts, DNS,
//! container rootfs, file injection, volumes), wires up log drivers and
//! client TTYs, and launches the pod in the guest. VM events drive the
//! rest: exit codes, autoremove cleanup, and restart-policy-driven
//! recomposition for kubernetes pods.
//!
//! # Example
//!
//! ```rust,ignore
//! use podvisor::{Daemon, DaemonConfig, probe_drivers};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> podvisor::Result<()> {
//!     let driver = probe_drivers(vec![xen_driver, qemu_driver]).await?;
//!     let daemon = Daemon::new(
//!         DaemonConfig::new("/var/lib/podvisor".into(), "/var/run/podvisor".into()),
//!         driver,
//!         storage,
//!         images,
//!         kv,
//!         services,
//!     )?;
//!
//!     let pod_id = daemon.create_pod(None, spec_blob, false).await?;
//!     let result = daemon.start_pod(&pod_id, None, None).await?;
//!     println!("pod {pod_id} started: {}", result.code);
//!     Ok(())
//! }
//! ```

pub mod constants;
pub mod daemon;
pub mod error;
pub mod image;
pub mod kv;
pub mod logging;
pub mod pod;
pub mod service;
pub mod spec;
pub mod storage;
pub mod vm;

mod ids;
mod uri;

pub use daemon::{Daemon, DaemonConfig, PodSummary, StartResult, TtyIo, VmInfo};
pub use error::{Error, Result};
pub use pod::{Pod, PodKind, PodPhase, PodStatus};
pub use spec::{PodSpec, RestartPolicy};
pub use vm::{probe_drivers, HypervisorDriver, KeepPolicy, VmEvent};
