// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM reclamation
//!
//! Deleting a VM is the reverse of provisioning: confirm the backend
//! deletion, then return the VM's footprint to the owning tenant's
//! quota and drop the ownership record.  Reclaim only ever follows a
//! confirmed delete; if the deletion fails or times out, the ledger and
//! ownership record are left alone so the resources stay visibly
//! charged to the tenant.

use crate::app::DeleteVmResponse;
use crate::app::Orchestrator;
use crate::poll::await_task;
use crate::poll::PollOutcome;
use crate::poll::DELETE_POLL;
use anvil_common::Error;
use anvil_common::ResourceType;
use anvil_common::Resources;
use anvil_virt_client::DiskDescriptor;
use anvil_virt_client::TaskHandle;
use anvil_virt_client::VmId;
use anvil_virt_client::WriteOutcome;
use slog::error;
use slog::info;
use slog::warn;

impl Orchestrator {
    /// Delete a VM and reclaim its quota footprint
    ///
    /// The footprint is read from the VM's live config just before
    /// deletion.  If that read fails the deletion still proceeds, but
    /// no reclaim happens: guessing at a footprint could hand the
    /// tenant headroom they never consumed.
    pub async fn delete_vm(
        &self,
        vm_id: VmId,
    ) -> Result<DeleteVmResponse, Error> {
        let record = self.ownership.find_vm(vm_id).await?.ok_or_else(|| {
            Error::not_found_by_label(
                ResourceType::Vm,
                &vm_id.to_string(),
            )
        })?;
        let node = record.node.clone();

        let footprint = match self.client.vm_config(&node, vm_id).await {
            Ok(config) => {
                let disk_gib = config
                    .primary_disk
                    .as_deref()
                    .and_then(|raw| DiskDescriptor::parse(raw).size_gib())
                    .unwrap_or(0);
                Some(Resources {
                    cpu_cores: config.cores,
                    memory_mib: config.memory_mib,
                    disk_gib,
                })
            }
            Err(e) => {
                warn!(self.log,
                    "could not read config before delete; skipping reclaim";
                    "vm_id" => %vm_id, "error" => %e);
                None
            }
        };

        info!(self.log, "deleting VM";
            "vm_id" => %vm_id, "node" => &node,
            "tenant_id" => %record.tenant_id);

        let task_handle: Option<TaskHandle> =
            match self.client.delete_vm(&node, vm_id).await {
                WriteOutcome::Applied => None,
                WriteOutcome::Failed(message) => {
                    return Err(Error::backend_operation(&format!(
                        "delete vm {}: {}",
                        vm_id, message
                    )));
                }
                WriteOutcome::Submitted(handle) => {
                    match await_task(
                        &*self.client,
                        &self.log,
                        &node,
                        &handle,
                        "delete",
                        &DELETE_POLL,
                    )
                    .await
                    {
                        PollOutcome::Success => Some(handle),
                        PollOutcome::Failure(message) => {
                            return Err(Error::backend_operation(&format!(
                                "delete vm {}: {}",
                                vm_id, message
                            )));
                        }
                        PollOutcome::TimedOut => {
                            return Err(Error::BackendTimeout {
                                label: format!("delete vm {}", vm_id),
                                attempts: DELETE_POLL.max_attempts,
                            });
                        }
                    }
                }
            };

        // Deletion confirmed: return the footprint and drop ownership.
        match footprint {
            Some(delta) => {
                self.ledger.reclaim(record.tenant_id, delta);
            }
            None => {
                warn!(self.log, "deleted VM without reclaiming quota";
                    "vm_id" => %vm_id,
                    "tenant_id" => %record.tenant_id);
            }
        }
        if let Err(e) = self.ownership.remove_ownership(&node, vm_id).await {
            error!(self.log, "failed to remove ownership record";
                "vm_id" => %vm_id, "error" => %e);
        }

        info!(self.log, "deleted VM"; "vm_id" => %vm_id, "node" => &node);
        Ok(DeleteVmResponse {
            vm_id,
            node,
            task_handle,
            message: format!("vm {} deleted", vm_id),
        })
    }
}
