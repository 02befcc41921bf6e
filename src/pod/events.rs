//! VM event handling and restart-policy-driven recomposition.
//!
//! Every pod-bound VM gets one event task that consumes the VM's typed
//! event channel and hands each event to the daemon. Handler errors are
//! logged and swallowed: nothing may propagate back into the VM's event
//! delivery. The registry write lock is released before any policy-driven
//! follow-up (restart or delete), which re-acquires it itself.

use crate::daemon::Daemon;
use crate::pod::{PodKind, PodPhase};
use crate::spec::RestartPolicy;
use crate::vm::{KeepPolicy, Vm, VmEvent, VmStatus};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What to do with a kubernetes pod after its VM shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownAction {
    Restart,
    Delete,
    Keep,
}

impl Daemon {
    /// Spawns the event task for a pod-bound VM.
    ///
    /// The task runs until the VM's channel closes or a handled event
    /// requests detachment.
    pub(crate) fn spawn_event_loop(self: &Arc<Self>, pod_id: String, vm: Arc<Vm>) {
        let Some(mut events) = vm.take_events() else {
            debug!(vm = vm.id(), "event loop already attached");
            return;
        };

        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if daemon.handle_pod_event(&pod_id, &vm, event).await {
                    break;
                }
            }
            debug!(pod = %pod_id, vm = vm.id(), "detached from vm events");
        });
    }

    /// Handles one VM event. Returns whether to detach from further
    /// events.
    async fn handle_pod_event(self: &Arc<Self>, pod_id: &str, vm: &Arc<Vm>, event: VmEvent) -> bool {
        match event {
            VmEvent::PodFinished { exit_codes } => {
                self.on_pod_finished(pod_id, vm, &exit_codes).await;
                false
            }
            VmEvent::VmShutdown => self.on_vm_shutdown(pod_id, vm).await,
        }
    }

    /// The pod's containers have all exited.
    ///
    /// VMs with a keep policy go idle untouched so the pod can be reused.
    /// Otherwise loggers stop, the reported exit codes decide the pod
    /// phase, and autoremove pods are cleaned immediately.
    async fn on_pod_finished(self: &Arc<Self>, pod_id: &str, vm: &Arc<Vm>, exit_codes: &[u8]) {
        if vm.keep() != KeepPolicy::None {
            vm.set_status(VmStatus::Idle);
            return;
        }

        let autoremove = {
            let mut reg = self.pods.write().await;
            let Some(pod) = reg.get_mut(pod_id) else {
                return;
            };

            pod.status.stop_loggers();
            pod.status.set_container_exit_codes(exit_codes);
            vm.set_status(VmStatus::Idle);

            info!(pod = %pod_id, phase = %pod.status.phase, ?exit_codes, "pod finished");
            pod.status.autoremove
        };

        if autoremove {
            if let Err(e) = self.clean_pod(pod_id).await {
                warn!(pod = %pod_id, error = %e, "autoremove cleanup failed");
            }
        }
    }

    /// The VM itself shut down.
    ///
    /// A pod still marked running succeeded implicitly (the VM exited
    /// before per-container codes arrived). The VM binding is dropped
    /// either way, and kubernetes pods get their restart policy applied.
    /// Always detaches.
    async fn on_vm_shutdown(self: &Arc<Self>, pod_id: &str, vm: &Arc<Vm>) -> bool {
        let action = {
            let mut reg = self.pods.write().await;
            let Some(pod) = reg.get_mut(pod_id) else {
                vm.set_status(VmStatus::Destroyed);
                self.vms.write().await.remove(vm.id());
                return true;
            };

            if pod.status.phase == PodPhase::Running {
                pod.status.stop_loggers();
                pod.status.set_all(PodPhase::Succeeded);
            }

            pod.clear_vm();
            vm.set_status(VmStatus::Destroyed);
            self.vms.write().await.remove(vm.id());

            info!(pod = %pod_id, phase = %pod.status.phase, "vm shut down, pod stopped");

            match pod.status.kind {
                PodKind::Kubernetes { restart_policy } => {
                    shutdown_action(pod.status.phase, restart_policy)
                }
                PodKind::Default => ShutdownAction::Keep,
            }
        };

        match action {
            ShutdownAction::Restart => {
                info!(pod = %pod_id, "restart policy triggers recomposition");
                if let Err(e) = self.restart_pod(pod_id).await {
                    error!(pod = %pod_id, error = %e, "pod restart failed");
                }
            }
            ShutdownAction::Delete => {
                if let Err(e) = self.clean_pod(pod_id).await {
                    warn!(pod = %pod_id, error = %e, "pod deletion failed");
                }
            }
            ShutdownAction::Keep => {}
        }

        true
    }
}

/// The restart-policy table for kubernetes pods.
///
/// | phase     | policy              | action  |
/// |-----------|---------------------|---------|
/// | Succeeded | always              | restart |
/// | Succeeded | on-failure / never  | delete  |
/// | Failed    | always / on-failure | restart |
/// | Failed    | never               | delete  |
fn shutdown_action(phase: PodPhase, policy: RestartPolicy) -> ShutdownAction {
    match (phase, policy) {
        (PodPhase::Succeeded, RestartPolicy::Always) => ShutdownAction::Restart,
        (PodPhase::Succeeded, _) => ShutdownAction::Delete,
        (PodPhase::Failed, RestartPolicy::Always | RestartPolicy::OnFailure) => {
            ShutdownAction::Restart
        }
        (PodPhase::Failed, RestartPolicy::Never) => ShutdownAction::Delete,
        _ => ShutdownAction::Keep,
    }
}
