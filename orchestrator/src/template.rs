// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Template cloning pipeline
//!
//! Produces a new template from an existing one: clone the source, then
//! promote the copy to a sealed template.  The result is a private
//! template owned by the requesting tenant, inheriting the source's
//! cloud-init defaults.  Template copies live outside the quota ledger;
//! they are administrative stock, not tenant workload.

use crate::app::CloneTemplateRequest;
use crate::app::CloneTemplateResponse;
use crate::app::Orchestrator;
use crate::disk::await_disk_ready;
use crate::disk::DISK_READY_POLL;
use crate::poll::CLONE_POLL;
use crate::poll::CONFIG_POLL;
use crate::store::Template;
use crate::task::ProvisioningTask;
use anvil_common::vm_name::sanitize_vm_name;
use anvil_common::Error;
use anvil_common::VmName;
use anvil_virt_client::CloneParams;
use anvil_virt_client::VmId;
use anvil_virt_client::WriteOutcome;
use chrono::Utc;
use slog::error;
use slog::info;
use uuid::Uuid;

pub const TEMPLATE_STEPS: [&str; 2] = ["clone", "promote"];

const STEP_CLONE: usize = 0;
const STEP_PROMOTE: usize = 1;

impl Orchestrator {
    /// Clone an existing template into a new, private one
    ///
    /// A failure after the clone has created a VM deletes it
    /// best-effort, so a failed run does not leave a half-promoted VM
    /// that is neither usable nor clonable.
    pub async fn clone_template(
        &self,
        request: CloneTemplateRequest,
    ) -> Result<CloneTemplateResponse, Error> {
        let source = self
            .templates
            .fetch_template(request.source_template_id)
            .await?;
        if !source.public && source.tenant_id != request.tenant_id {
            return Err(Error::Forbidden);
        }

        let vm_name = sanitize_vm_name(&request.name)
            .and_then(|name| VmName::try_from(name).ok())
            .ok_or_else(|| {
                Error::invalid_request(&format!(
                    "proposed name {:?} cannot be reduced to a usable \
                     VM name",
                    request.name
                ))
            })?;

        let vm_id = self.client.next_vm_id().await?;
        let node = request
            .target_node
            .clone()
            .unwrap_or_else(|| source.node.clone());

        let task = ProvisioningTask::new(
            request.tenant_id,
            &node,
            Some(vm_id),
            Some(request.source_template_id),
            &TEMPLATE_STEPS,
        );
        let task_id = task.id;
        self.tasks.insert_task(task).await?;

        info!(self.log, "cloning template";
            "task_id" => %task_id,
            "source_template_id" => %request.source_template_id,
            "vm_id" => %vm_id,
            "node" => &node,
        );

        let mut created = false;
        let result = self
            .run_template_pipeline(
                task_id, &node, vm_id, &vm_name, &source, &request,
                &mut created,
            )
            .await;

        match result {
            Ok(()) => {
                let template = Template {
                    id: Uuid::new_v4(),
                    description: request.description.clone(),
                    node: node.clone(),
                    vm_id,
                    tenant_id: request.tenant_id,
                    ci_user: source.ci_user.clone(),
                    ci_password: source.ci_password.clone(),
                    public: false,
                    time_created: Utc::now(),
                };
                let template_id = template.id;
                // The VM is already promoted; a bookkeeping failure
                // here must not undo that or leave the task dangling.
                if let Err(e) =
                    self.templates.insert_template(template).await
                {
                    error!(self.log, "failed to persist template record";
                        "template_id" => %template_id,
                        "vm_id" => %vm_id,
                        "error" => %e,
                    );
                }
                self.observer.on_task_completed(task_id).await;
                info!(self.log, "cloned template";
                    "task_id" => %task_id,
                    "template_id" => %template_id,
                    "vm_id" => %vm_id,
                );
                Ok(CloneTemplateResponse { template_id, task_id })
            }
            Err(error) => {
                if created {
                    self.cleanup_vm(&node, vm_id).await;
                }
                Err(error)
            }
        }
    }

    async fn run_template_pipeline(
        &self,
        task_id: Uuid,
        node: &str,
        vm_id: VmId,
        vm_name: &VmName,
        source: &Template,
        request: &CloneTemplateRequest,
        created: &mut bool,
    ) -> Result<(), Error> {
        self.start_step(task_id, STEP_CLONE).await;
        let params = CloneParams {
            source_node: source.node.clone(),
            source_vm: source.vm_id,
            new_vm: vm_id,
            name: vm_name.as_str().to_owned(),
            target_node: node.to_owned(),
            storage: request.storage.clone(),
            full: true,
        };
        let outcome = self.client.clone_vm(&params).await;
        if !matches!(outcome, WriteOutcome::Failed(_)) {
            *created = true;
        }
        let clone_handle = match self
            .settle_write(
                task_id,
                STEP_CLONE,
                node,
                "template clone",
                outcome,
                &CLONE_POLL,
            )
            .await
        {
            Ok(handle) => handle,
            Err((handle, error)) => {
                self.fail_step(task_id, STEP_CLONE, handle, &error).await;
                return Err(error);
            }
        };
        // Promotion of a VM whose disk is still materializing fails on
        // the backend side.
        if let Err(error) = await_disk_ready(
            &*self.client,
            &self.log,
            node,
            vm_id,
            &DISK_READY_POLL,
        )
        .await
        {
            self.fail_step(task_id, STEP_CLONE, clone_handle, &error).await;
            return Err(error);
        }
        self.complete_step(task_id, STEP_CLONE, clone_handle, None).await;

        self.start_step(task_id, STEP_PROMOTE).await;
        let outcome = self.client.convert_to_template(node, vm_id).await;
        self.run_step(
            task_id,
            STEP_PROMOTE,
            node,
            "template promote",
            outcome,
            &CONFIG_POLL,
            None,
        )
        .await?;
        Ok(())
    }
}
