// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestrator facade
//!
//! [`Orchestrator`] owns the wiring: the backend client, the quota
//! ledger, the stores, and the step observer.  The request layer (out of
//! scope here) calls [`Orchestrator::provision`],
//! [`Orchestrator::task_status`], [`Orchestrator::delete_vm`], and
//! [`Orchestrator::clone_template`]; the pipeline implementations live
//! in the sibling modules and hang off this struct.

use crate::observer::StepObserver;
use crate::observer::StoreStepObserver;
use crate::poll::await_task;
use crate::poll::PollOutcome;
use crate::poll::PollPolicy;
use crate::poll::DELETE_POLL;
use crate::quota::QuotaLedger;
use crate::store::OwnershipStore;
use crate::store::PlanStore;
use crate::store::TaskStore;
use crate::store::TemplateStore;
use crate::store::TASK_RETENTION_DAYS;
use crate::store::TASK_RETENTION_KEEP;
use crate::task::ProvisioningTask;
use crate::task::StepUpdate;
use crate::task::TaskState;
use anvil_common::Error;
use anvil_common::Resources;
use anvil_common::VmName;
use anvil_virt_client::RemoteTaskStatus;
use anvil_virt_client::TaskHandle;
use anvil_virt_client::VirtClient;
use anvil_virt_client::VmId;
use anvil_virt_client::WriteOutcome;
use chrono::Utc;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use uuid::Uuid;

/// A caller's request to provision a VM from a template.
#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    pub tenant_id: Uuid,
    /// Quota plan name, resolved from the tenant record by the request
    /// layer.
    pub plan: String,
    pub template_id: Uuid,
    /// Proposed VM name; sanitized to a DNS-safe token before use.
    pub name: String,
    /// Target node; the template's node when absent.
    pub target_node: Option<String>,
    /// Target storage; the backend's default when absent.
    pub storage: Option<String>,
    pub resources: Resources,
    pub ci_user: Option<String>,
    pub ci_password: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ProvisionResponse {
    pub task_id: Uuid,
    pub vm_id: VmId,
    pub vm_name: VmName,
}

/// A task snapshot, optionally merged with a live remote status lookup
/// for the step currently in flight.
#[derive(Clone, Debug)]
pub struct TaskStatusView {
    pub task: ProvisioningTask,
    pub remote: Option<RemoteTaskStatus>,
}

#[derive(Clone, Debug)]
pub struct DeleteVmResponse {
    pub vm_id: VmId,
    pub node: String,
    /// Remote deletion task, when the backend ran one.
    pub task_handle: Option<TaskHandle>,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct CloneTemplateRequest {
    pub tenant_id: Uuid,
    pub source_template_id: Uuid,
    pub description: String,
    /// Proposed name for the new template's backing VM.
    pub name: String,
    pub target_node: Option<String>,
    pub storage: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CloneTemplateResponse {
    pub template_id: Uuid,
    pub task_id: Uuid,
}

pub struct Orchestrator {
    pub(crate) log: Logger,
    pub(crate) client: Arc<dyn VirtClient>,
    pub(crate) ledger: Arc<QuotaLedger>,
    pub(crate) tasks: Arc<dyn TaskStore>,
    pub(crate) ownership: Arc<dyn OwnershipStore>,
    pub(crate) templates: Arc<dyn TemplateStore>,
    pub(crate) plans: Arc<dyn PlanStore>,
    pub(crate) observer: Arc<dyn StepObserver>,
}

impl Orchestrator {
    pub fn new(
        log: &Logger,
        client: Arc<dyn VirtClient>,
        tasks: Arc<dyn TaskStore>,
        ownership: Arc<dyn OwnershipStore>,
        templates: Arc<dyn TemplateStore>,
        plans: Arc<dyn PlanStore>,
    ) -> Orchestrator {
        let log = log.new(o!("component" => "Orchestrator"));
        let observer =
            Arc::new(StoreStepObserver::new(Arc::clone(&tasks), &log));
        Orchestrator {
            ledger: QuotaLedger::new(&log),
            log,
            client,
            tasks,
            ownership,
            templates,
            plans,
            observer,
        }
    }

    /// The quota ledger (exposed for admin views and tests).
    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    /// Fetch a task snapshot
    ///
    /// With `include_remote`, an in-progress task whose active step has
    /// a remote handle also gets a live status lookup attached; lookup
    /// failures degrade to a plain snapshot.
    pub async fn task_status(
        &self,
        task_id: Uuid,
        include_remote: bool,
    ) -> Result<TaskStatusView, Error> {
        let task = self.tasks.fetch_task(task_id).await?;
        let mut remote = None;
        if include_remote && task.state == TaskState::InProgress {
            if let Some((_, step)) = task.active_step() {
                if let Some(handle) = &step.handle {
                    match self.client.task_status(&task.node, handle).await {
                        Ok(status) => remote = Some(status),
                        Err(e) => {
                            warn!(self.log,
                                "live status lookup failed";
                                "task_id" => %task_id,
                                "error" => %e,
                            );
                        }
                    }
                }
            }
        }
        Ok(TaskStatusView { task, remote })
    }

    /// A tenant's tasks, most recently created first.
    pub async fn list_tenant_tasks(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<ProvisioningTask>, Error> {
        self.tasks.list_tenant_tasks(tenant_id).await
    }

    /// Apply the retention policy to a tenant's task history: keep the
    /// most recent [`TASK_RETENTION_KEEP`] terminal tasks and purge
    /// anything terminal older than [`TASK_RETENTION_DAYS`] days.
    pub async fn run_task_retention(
        &self,
        tenant_id: Uuid,
    ) -> Result<(), Error> {
        let trimmed = self
            .tasks
            .trim_tenant_tasks(tenant_id, TASK_RETENTION_KEEP)
            .await?;
        let cutoff = Utc::now() - chrono::Duration::days(TASK_RETENTION_DAYS);
        let purged = self.tasks.purge_tasks_before(cutoff).await?;
        if trimmed + purged > 0 {
            info!(self.log, "task retention pass";
                "tenant_id" => %tenant_id,
                "trimmed" => trimmed,
                "purged" => purged,
            );
        }
        Ok(())
    }

    /// Settle a write outcome for the step at `index`: record the
    /// handle when one is issued, poll it to completion, and map every
    /// failure mode to the error (and handle) the step should be failed
    /// with.
    pub(crate) async fn settle_write(
        &self,
        task_id: Uuid,
        index: usize,
        node: &str,
        label: &str,
        outcome: WriteOutcome,
        policy: &PollPolicy,
    ) -> Result<Option<TaskHandle>, (Option<TaskHandle>, Error)> {
        match outcome {
            WriteOutcome::Applied => Ok(None),
            WriteOutcome::Failed(message) => Err((
                None,
                Error::backend_operation(&format!(
                    "{}: {}",
                    label, message
                )),
            )),
            WriteOutcome::Submitted(handle) => {
                self.observer
                    .on_step_update(
                        task_id,
                        index,
                        StepUpdate::TaskSubmitted { handle: handle.clone() },
                    )
                    .await;
                match await_task(
                    &*self.client,
                    &self.log,
                    node,
                    &handle,
                    label,
                    policy,
                )
                .await
                {
                    PollOutcome::Success => Ok(Some(handle)),
                    PollOutcome::Failure(message) => Err((
                        Some(handle),
                        Error::backend_operation(&format!(
                            "{}: {}",
                            label, message
                        )),
                    )),
                    PollOutcome::TimedOut => Err((
                        Some(handle),
                        Error::BackendTimeout {
                            label: label.to_owned(),
                            attempts: policy.max_attempts,
                        },
                    )),
                }
            }
        }
    }

    pub(crate) async fn start_step(&self, task_id: Uuid, index: usize) {
        self.observer
            .on_step_update(task_id, index, StepUpdate::Started)
            .await;
    }

    pub(crate) async fn complete_step(
        &self,
        task_id: Uuid,
        index: usize,
        handle: Option<TaskHandle>,
        message: Option<String>,
    ) {
        self.observer
            .on_step_update(
                task_id,
                index,
                StepUpdate::Completed { handle, message },
            )
            .await;
    }

    pub(crate) async fn fail_step(
        &self,
        task_id: Uuid,
        index: usize,
        handle: Option<TaskHandle>,
        error: &Error,
    ) {
        self.observer
            .on_step_update(
                task_id,
                index,
                StepUpdate::Failed { handle, error: error.to_string() },
            )
            .await;
    }

    /// Run one whole write-backed step: mark it started, settle the
    /// outcome, and record completion or failure.
    pub(crate) async fn run_step(
        &self,
        task_id: Uuid,
        index: usize,
        node: &str,
        label: &str,
        outcome: WriteOutcome,
        policy: &PollPolicy,
        message: Option<String>,
    ) -> Result<Option<TaskHandle>, Error> {
        match self
            .settle_write(task_id, index, node, label, outcome, policy)
            .await
        {
            Ok(handle) => {
                self.complete_step(task_id, index, handle.clone(), message)
                    .await;
                Ok(handle)
            }
            Err((handle, error)) => {
                self.fail_step(task_id, index, handle, &error).await;
                Err(error)
            }
        }
    }

    /// Best-effort deletion of a half-built VM after a pipeline failure
    ///
    /// Failures here are logged and swallowed; the pipeline's original
    /// error is the one the caller sees.
    pub(crate) async fn cleanup_vm(&self, node: &str, vm_id: VmId) {
        info!(self.log, "cleaning up after failed pipeline";
            "node" => node, "vm_id" => %vm_id);
        let cleanup_error = match self.client.delete_vm(node, vm_id).await {
            WriteOutcome::Applied => None,
            WriteOutcome::Failed(message) => {
                Some(Error::Cleanup { message })
            }
            WriteOutcome::Submitted(handle) => {
                match await_task(
                    &*self.client,
                    &self.log,
                    node,
                    &handle,
                    "cleanup-delete",
                    &DELETE_POLL,
                )
                .await
                {
                    PollOutcome::Success => None,
                    PollOutcome::Failure(message) => {
                        Some(Error::Cleanup { message })
                    }
                    PollOutcome::TimedOut => Some(Error::Cleanup {
                        message: format!(
                            "timed out waiting for cleanup delete of {}/{}",
                            node, vm_id
                        ),
                    }),
                }
            }
        };
        match cleanup_error {
            None => {
                info!(self.log, "cleanup delete succeeded";
                    "node" => node, "vm_id" => %vm_id);
            }
            Some(error) => {
                warn!(self.log, "cleanup delete failed; leaving remnant VM";
                    "node" => node,
                    "vm_id" => %vm_id,
                    "error" => %error,
                );
            }
        }
    }
}
