// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM provisioning pipeline
//!
//! Clones a template and shapes the result: CPU, memory, disk, then
//! cloud-init credentials, each as one recorded step of a
//! [`crate::task::ProvisioningTask`].  Validation and quota admission
//! happen before any remote write; once the clone has (or may have)
//! created a VM, any later failure triggers a best-effort delete so a
//! failed run leaves nothing behind on the backend.

use crate::app::Orchestrator;
use crate::app::ProvisionRequest;
use crate::app::ProvisionResponse;
use crate::disk::await_disk_ready;
use crate::disk::DISK_READY_POLL;
use crate::poll::CLONE_POLL;
use crate::poll::CONFIG_POLL;
use crate::store::OwnershipRecord;
use crate::store::Template;
use crate::task::ProvisioningTask;
use anvil_common::vm_name::sanitize_vm_name;
use anvil_common::Error;
use anvil_common::VmName;
use anvil_virt_client::CloneParams;
use anvil_virt_client::ConfigPatch;
use anvil_virt_client::DiskDescriptor;
use anvil_virt_client::VmId;
use anvil_virt_client::WriteOutcome;
use chrono::Utc;
use slog::error;
use slog::info;
use uuid::Uuid;

/// Step names, in pipeline order.
pub const PROVISION_STEPS: [&str; 5] =
    ["clone", "cpu", "memory", "disk", "cloud-init"];

const STEP_CLONE: usize = 0;
const STEP_CPU: usize = 1;
const STEP_MEMORY: usize = 2;
const STEP_DISK: usize = 3;
const STEP_CLOUD_INIT: usize = 4;

impl Orchestrator {
    /// Provision a VM from a template
    ///
    /// Validates the request, reserves quota, runs the pipeline, and on
    /// success commits the reservation and records ownership.  On any
    /// pipeline failure the reservation is released, a VM created by the
    /// clone step is deleted best-effort, and the root-cause error is
    /// returned (the task record holds the per-step detail).
    pub async fn provision(
        &self,
        request: ProvisionRequest,
    ) -> Result<ProvisionResponse, Error> {
        if request.resources.any_zero() {
            return Err(Error::invalid_request(
                "cpu, memory, and disk must all be nonzero",
            ));
        }
        if request.ci_user.is_some() != request.ci_password.is_some() {
            return Err(Error::invalid_request(
                "cloud-init user and password must be supplied together",
            ));
        }

        let template =
            self.templates.fetch_template(request.template_id).await?;
        if !template.public && template.tenant_id != request.tenant_id {
            return Err(Error::Forbidden);
        }

        let plan = self.plans.fetch_plan(&request.plan).await?;
        let reservation = self.ledger.reserve(
            request.tenant_id,
            &plan,
            request.resources,
        )?;

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
            .unwrap_or_else(|| template.node.clone());

        let task = ProvisioningTask::new(
            request.tenant_id,
            &node,
            Some(vm_id),
            Some(request.template_id),
            &PROVISION_STEPS,
        );
        let task_id = task.id;
        self.tasks.insert_task(task).await?;

        info!(self.log, "provisioning VM";
            "task_id" => %task_id,
            "tenant_id" => %request.tenant_id,
            "vm_id" => %vm_id,
            "node" => &node,
            "name" => vm_name.as_str(),
        );

        let mut created = false;
        let result = self
            .run_provision_pipeline(
                task_id,
                &node,
                vm_id,
                &vm_name,
                &template,
                &request,
                &mut created,
            )
            .await;

        match result {
            Ok(()) => {
                reservation.commit();
                let record = OwnershipRecord {
                    node: node.clone(),
                    vm_id,
                    tenant_id: request.tenant_id,
                    time_created: Utc::now(),
                };
                // The VM exists and is paid for; a bookkeeping failure
                // here must not undo that.
                if let Err(e) = self.ownership.insert_ownership(record).await
                {
                    error!(self.log, "failed to record VM ownership";
                        "vm_id" => %vm_id, "error" => %e);
                }
                self.observer.on_task_completed(task_id).await;
                info!(self.log, "provisioned VM";
                    "task_id" => %task_id, "vm_id" => %vm_id);
                Ok(ProvisionResponse { task_id, vm_id, vm_name })
            }
            Err(error) => {
                if created {
                    self.cleanup_vm(&node, vm_id).await;
                }
                // Dropping the reservation returns the quota hold.
                drop(reservation);
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_provision_pipeline(
        &self,
        task_id: Uuid,
        node: &str,
        vm_id: VmId,
        vm_name: &VmName,
        template: &Template,
        request: &ProvisionRequest,
        created: &mut bool,
    ) -> Result<(), Error> {
        // Step 0: clone the template.
        self.start_step(task_id, STEP_CLONE).await;
        let params = CloneParams {
            source_node: template.node.clone(),
            source_vm: template.vm_id,
            new_vm: vm_id,
            name: vm_name.as_str().to_owned(),
            target_node: node.to_owned(),
            storage: request.storage.clone(),
            full: true,
        };
        let outcome = self.client.clone_vm(&params).await;
        // Anything but an outright rejection may have created the VM
        // (a timed-out clone can still finish remotely).
        if !matches!(outcome, WriteOutcome::Failed(_)) {
            *created = true;
        }
        let clone_handle = match self
            .settle_write(
                task_id,
                STEP_CLONE,
                node,
                "clone",
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
        // The clone task finishing does not mean the new disk is
        // usable yet.
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

        // Step 1: CPU.
        self.start_step(task_id, STEP_CPU).await;
        let outcome = self
            .client
            .update_config(
                node,
                vm_id,
                &ConfigPatch::cores(request.resources.cpu_cores),
            )
            .await;
        self.run_step(
            task_id,
            STEP_CPU,
            node,
            "cpu config",
            outcome,
            &CONFIG_POLL,
            None,
        )
        .await?;

        // Step 2: memory.
        self.start_step(task_id, STEP_MEMORY).await;
        let outcome = self
            .client
            .update_config(
                node,
                vm_id,
                &ConfigPatch::memory_mib(request.resources.memory_mib),
            )
            .await;
        self.run_step(
            task_id,
            STEP_MEMORY,
            node,
            "memory config",
            outcome,
            &CONFIG_POLL,
            None,
        )
        .await?;

        // Step 3: disk.
        self.run_disk_step(task_id, node, vm_id, request).await?;

        // Step 4: cloud-init credentials.
        self.start_step(task_id, STEP_CLOUD_INIT).await;
        let credentials = match (&request.ci_user, &request.ci_password) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => match (&template.ci_user, &template.ci_password) {
                (Some(user), Some(password)) => Some((user, password)),
                _ => None,
            },
        };
        match credentials {
            None => {
                self.complete_step(
                    task_id,
                    STEP_CLOUD_INIT,
                    None,
                    Some("skipped: no credentials configured".to_owned()),
                )
                .await;
            }
            Some((user, password)) => {
                let outcome = self
                    .client
                    .update_config(
                        node,
                        vm_id,
                        &ConfigPatch::cloud_init(user, password),
                    )
                    .await;
                self.run_step(
                    task_id,
                    STEP_CLOUD_INIT,
                    node,
                    "cloud-init config",
                    outcome,
                    &CONFIG_POLL,
                    None,
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Grow the primary disk to the requested size
    ///
    /// The backend can only grow disks, so a request at or below the
    /// template's current size completes the step without a remote
    /// call.  A grow re-checks disk readiness first: the gate after the
    /// clone usually covers it, but a resize against a still-transient
    /// volume is rejected outright by the backend.
    async fn run_disk_step(
        &self,
        task_id: Uuid,
        node: &str,
        vm_id: VmId,
        request: &ProvisionRequest,
    ) -> Result<(), Error> {
        self.start_step(task_id, STEP_DISK).await;

        let config = match self.client.vm_config(node, vm_id).await {
            Ok(config) => config,
            Err(error) => {
                self.fail_step(task_id, STEP_DISK, None, &error).await;
                return Err(error);
            }
        };
        let (slot, current_gib) = match (
            config.primary_disk_slot.as_deref(),
            config
                .primary_disk
                .as_deref()
                .and_then(|raw| DiskDescriptor::parse(raw).size_gib()),
        ) {
            (Some(slot), Some(size)) => (slot.to_owned(), size),
            _ => {
                let error = Error::backend_operation(&format!(
                    "vm {} reports no sized primary disk",
                    vm_id
                ));
                self.fail_step(task_id, STEP_DISK, None, &error).await;
                return Err(error);
            }
        };

        let requested_gib = request.resources.disk_gib;
        if requested_gib <= current_gib {
            self.complete_step(
                task_id,
                STEP_DISK,
                None,
                Some(format!(
                    "no resize needed: disk is {}G, requested {}G",
                    current_gib, requested_gib
                )),
            )
            .await;
            return Ok(());
        }

        if let Err(error) = await_disk_ready(
            &*self.client,
            &self.log,
            node,
            vm_id,
            &DISK_READY_POLL,
        )
        .await
        {
            self.fail_step(task_id, STEP_DISK, None, &error).await;
            return Err(error);
        }

        let grow_gib = requested_gib - current_gib;
        let outcome =
            self.client.resize_disk(node, vm_id, &slot, grow_gib).await;
        self.run_step(
            task_id,
            STEP_DISK,
            node,
            "disk resize",
            outcome,
            &CONFIG_POLL,
            Some(format!("grew {} by {}G", slot, grow_gib)),
        )
        .await?;
        Ok(())
    }
}
