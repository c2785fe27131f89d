// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated virtualization backend
//!
//! An in-process [`VirtClient`] with deterministic, programmable
//! behavior: operations can be made to fail, to apply synchronously, or
//! to return tasks that settle after a chosen number of polls.  Freshly
//! cloned VMs can report a transient disk descriptor for a chosen
//! number of config reads.  Every operation is recorded so tests can
//! assert exactly which remote calls a pipeline issued.

use crate::types::CloneParams;
use crate::types::ConfigPatch;
use crate::types::RemoteTaskState;
use crate::types::RemoteTaskStatus;
use crate::types::TaskHandle;
use crate::types::VmConfig;
use crate::types::VmId;
use crate::types::WriteOutcome;
use crate::VirtClient;
use crate::TASK_EXIT_OK;
use anvil_common::Error;
use async_trait::async_trait;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Operation labels used to program failures and async behavior.
pub mod ops {
    pub const NEXT_ID: &str = "nextid";
    pub const CLONE: &str = "clone";
    pub const CONFIG_CORES: &str = "config.cores";
    pub const CONFIG_MEMORY: &str = "config.memory";
    pub const CONFIG_CLOUDINIT: &str = "config.cloudinit";
    pub const RESIZE: &str = "resize";
    pub const TEMPLATE: &str = "template";
    pub const DELETE: &str = "delete";
    pub const READ_CONFIG: &str = "read.config";
    pub const READ_TASK: &str = "read.task";
}

/// A VM (or template) known to the simulated backend.
#[derive(Clone, Debug)]
pub struct SimVm {
    pub name: String,
    pub cores: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
    pub disk_slot: String,
    pub is_template: bool,
    pub ci_user: Option<String>,
    pub ci_password: Option<String>,
    /// Config reads left that report a transient disk descriptor.
    transient_reads_left: u32,
}

#[derive(Debug)]
struct SimTask {
    /// Status reads returning `running` before the task stops.
    polls_left: u32,
    /// Status reads after stopping that report no exit status yet.
    ambiguous_left: u32,
    /// Failure text; `None` means the task succeeds.
    failure: Option<String>,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u32,
    vms: BTreeMap<(String, u32), SimVm>,
    tasks: BTreeMap<String, SimTask>,
    task_seq: u64,
    /// One-shot programmed failures by op label.
    fail_ops: BTreeMap<String, String>,
    /// Ops that return task handles, with polls-until-settled.
    async_ops: BTreeMap<String, u32>,
    /// Tasks minted by these ops settle with a failure exit status.
    fail_tasks: BTreeMap<String, String>,
    /// `stopped`-with-no-exit reads each new task reports once stopped.
    ambiguous_polls: u32,
    /// Transient disk descriptor reads each fresh clone reports.
    transient_config_reads: u32,
    calls: Vec<String>,
}

pub struct SimVirtClient {
    log: Logger,
    state: Mutex<SimState>,
}

impl SimVirtClient {
    /// A simulator with the common defaults: clone and template-convert
    /// return tasks that settle successfully after one poll; config
    /// patches, resizes, and deletes apply synchronously.
    pub fn new(log: &Logger) -> SimVirtClient {
        let mut async_ops = BTreeMap::new();
        async_ops.insert(ops::CLONE.to_string(), 1);
        async_ops.insert(ops::TEMPLATE.to_string(), 1);
        SimVirtClient {
            log: log.new(o!("component" => "SimVirtClient")),
            state: Mutex::new(SimState {
                next_id: 100,
                async_ops,
                ..Default::default()
            }),
        }
    }

    /// Register a template VM that clones can start from.
    pub fn insert_template(
        &self,
        node: &str,
        vm: VmId,
        cores: u32,
        memory_mib: u64,
        disk_gib: u64,
    ) {
        let mut state = self.state.lock().unwrap();
        state.vms.insert(
            (node.to_string(), vm.0),
            SimVm {
                name: format!("template-{}", vm),
                cores,
                memory_mib,
                disk_gib,
                disk_slot: "scsi0".to_string(),
                is_template: true,
                ci_user: None,
                ci_password: None,
                transient_reads_left: 0,
            },
        );
    }

    /// Make the next occurrence of `op` fail outright.
    pub fn fail_next(&self, op: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.fail_ops.insert(op.to_string(), message.to_string());
    }

    /// Make tasks minted by `op` settle with a failing exit status.
    pub fn fail_task(&self, op: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.fail_tasks.insert(op.to_string(), message.to_string());
    }

    /// Make `op` return a task handle that settles after `polls` status
    /// reads.
    pub fn set_async(&self, op: &str, polls: u32) {
        let mut state = self.state.lock().unwrap();
        state.async_ops.insert(op.to_string(), polls);
    }

    /// Make `op` apply synchronously.
    pub fn set_sync(&self, op: &str) {
        let mut state = self.state.lock().unwrap();
        state.async_ops.remove(op);
    }

    /// Once stopped, new tasks report no exit status for `polls` reads.
    pub fn set_ambiguous_polls(&self, polls: u32) {
        self.state.lock().unwrap().ambiguous_polls = polls;
    }

    /// Fresh clones report a transient disk descriptor for `reads`
    /// config reads.
    pub fn set_transient_config_reads(&self, reads: u32) {
        self.state.lock().unwrap().transient_config_reads = reads;
    }

    /// Every recorded operation, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded operations starting with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn vm(&self, node: &str, vm: VmId) -> Option<SimVm> {
        self.state
            .lock()
            .unwrap()
            .vms
            .get(&(node.to_string(), vm.0))
            .cloned()
    }

    pub fn vm_exists(&self, node: &str, vm: VmId) -> bool {
        self.vm(node, vm).is_some()
    }

    /// Consume a programmed one-shot failure for `op`, if any.
    fn take_failure(state: &mut SimState, op: &str) -> Option<String> {
        state.fail_ops.remove(op)
    }

    /// Finish a write: mint a settling task if `op` is async, otherwise
    /// report it applied.
    fn write_outcome(state: &mut SimState, op: &str) -> WriteOutcome {
        match state.async_ops.get(op).copied() {
            None => WriteOutcome::Applied,
            Some(polls) => {
                state.task_seq += 1;
                let handle =
                    format!("UPID:sim:{:08x}:{}", state.task_seq, op);
                state.tasks.insert(
                    handle.clone(),
                    SimTask {
                        polls_left: polls,
                        ambiguous_left: state.ambiguous_polls,
                        failure: state.fail_tasks.remove(op),
                    },
                );
                WriteOutcome::Submitted(TaskHandle::new(handle))
            }
        }
    }
}

#[async_trait]
impl VirtClient for SimVirtClient {
    async fn next_vm_id(&self) -> Result<VmId, Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ops::NEXT_ID.to_string());
        if let Some(message) = Self::take_failure(&mut state, ops::NEXT_ID) {
            return Err(Error::backend_operation(&message));
        }
        let id = state.next_id;
        state.next_id += 1;
        Ok(VmId(id))
    }

    async fn clone_vm(&self, params: &CloneParams) -> WriteOutcome {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("{} {}->{}", ops::CLONE, params.source_vm, params.new_vm));
        if let Some(message) = Self::take_failure(&mut state, ops::CLONE) {
            return WriteOutcome::Failed(message);
        }

        let source = match state
            .vms
            .get(&(params.source_node.clone(), params.source_vm.0))
        {
            Some(source) => source.clone(),
            None => {
                return WriteOutcome::Failed(format!(
                    "no such vm {}/{}",
                    params.source_node, params.source_vm
                ))
            }
        };

        let transient_reads_left = state.transient_config_reads;
        state.vms.insert(
            (params.target_node.clone(), params.new_vm.0),
            SimVm {
                name: params.name.clone(),
                is_template: false,
                transient_reads_left,
                ..source
            },
        );
        debug!(self.log, "cloned vm";
            "source" => %params.source_vm, "new" => %params.new_vm);
        Self::write_outcome(&mut state, ops::CLONE)
    }

    async fn update_config(
        &self,
        node: &str,
        vm: VmId,
        patch: &ConfigPatch,
    ) -> WriteOutcome {
        let op = if patch.cores.is_some() {
            ops::CONFIG_CORES
        } else if patch.memory_mib.is_some() {
            ops::CONFIG_MEMORY
        } else {
            ops::CONFIG_CLOUDINIT
        };
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", op, vm));
        if let Some(message) = Self::take_failure(&mut state, op) {
            return WriteOutcome::Failed(message);
        }

        match state.vms.get_mut(&(node.to_string(), vm.0)) {
            None => {
                return WriteOutcome::Failed(format!(
                    "no such vm {}/{}",
                    node, vm
                ))
            }
            Some(entry) => {
                if let Some(cores) = patch.cores {
                    entry.cores = cores;
                }
                if let Some(memory_mib) = patch.memory_mib {
                    entry.memory_mib = memory_mib;
                }
                if let Some(user) = &patch.ci_user {
                    entry.ci_user = Some(user.clone());
                }
                if let Some(password) = &patch.ci_password {
                    entry.ci_password = Some(password.clone());
                }
            }
        }
        Self::write_outcome(&mut state, op)
    }

    async fn resize_disk(
        &self,
        node: &str,
        vm: VmId,
        slot: &str,
        grow_gib: u64,
    ) -> WriteOutcome {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("{} {} {} +{}G", ops::RESIZE, vm, slot, grow_gib));
        if let Some(message) = Self::take_failure(&mut state, ops::RESIZE) {
            return WriteOutcome::Failed(message);
        }
        match state.vms.get_mut(&(node.to_string(), vm.0)) {
            None => {
                return WriteOutcome::Failed(format!(
                    "no such vm {}/{}",
                    node, vm
                ))
            }
            Some(entry) => entry.disk_gib += grow_gib,
        }
        Self::write_outcome(&mut state, ops::RESIZE)
    }

    async fn convert_to_template(&self, node: &str, vm: VmId) -> WriteOutcome {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", ops::TEMPLATE, vm));
        if let Some(message) = Self::take_failure(&mut state, ops::TEMPLATE) {
            return WriteOutcome::Failed(message);
        }
        match state.vms.get_mut(&(node.to_string(), vm.0)) {
            None => {
                return WriteOutcome::Failed(format!(
                    "no such vm {}/{}",
                    node, vm
                ))
            }
            Some(entry) => entry.is_template = true,
        }
        Self::write_outcome(&mut state, ops::TEMPLATE)
    }

    async fn delete_vm(&self, node: &str, vm: VmId) -> WriteOutcome {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", ops::DELETE, vm));
        if let Some(message) = Self::take_failure(&mut state, ops::DELETE) {
            return WriteOutcome::Failed(message);
        }
        if state.vms.remove(&(node.to_string(), vm.0)).is_none() {
            return WriteOutcome::Failed(format!("no such vm {}/{}", node, vm));
        }
        Self::write_outcome(&mut state, ops::DELETE)
    }

    async fn vm_config(&self, node: &str, vm: VmId) -> Result<VmConfig, Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", ops::READ_CONFIG, vm));
        if let Some(message) = Self::take_failure(&mut state, ops::READ_CONFIG)
        {
            return Err(Error::backend_operation(&message));
        }
        let entry = state
            .vms
            .get_mut(&(node.to_string(), vm.0))
            .ok_or_else(|| {
                Error::backend_operation(&format!("no such vm {}/{}", node, vm))
            })?;

        let primary_disk = if entry.transient_reads_left > 0 {
            entry.transient_reads_left -= 1;
            format!("storageA:cloning/vm-{}-disk-0", vm)
        } else {
            format!(
                "storageA:{id}/vm-{id}-disk-0.raw,size={}G",
                entry.disk_gib,
                id = vm
            )
        };
        Ok(VmConfig {
            cores: entry.cores,
            memory_mib: entry.memory_mib,
            primary_disk_slot: Some(entry.disk_slot.clone()),
            primary_disk: Some(primary_disk),
        })
    }

    async fn task_status(
        &self,
        _node: &str,
        handle: &TaskHandle,
    ) -> Result<RemoteTaskStatus, Error> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("{} {}", ops::READ_TASK, handle.as_str()));
        if let Some(message) = Self::take_failure(&mut state, ops::READ_TASK) {
            return Err(Error::backend_operation(&message));
        }
        let task =
            state.tasks.get_mut(handle.as_str()).ok_or_else(|| {
                Error::backend_operation(&format!(
                    "no such task {}",
                    handle.as_str()
                ))
            })?;

        if task.polls_left > 0 {
            task.polls_left -= 1;
            return Ok(RemoteTaskStatus {
                state: RemoteTaskState::Running,
                exit_status: None,
            });
        }
        if task.ambiguous_left > 0 {
            task.ambiguous_left -= 1;
            return Ok(RemoteTaskStatus {
                state: RemoteTaskState::Stopped,
                exit_status: None,
            });
        }
        Ok(RemoteTaskStatus {
            state: RemoteTaskState::Stopped,
            exit_status: Some(
                task.failure.clone().unwrap_or_else(|| TASK_EXIT_OK.to_string()),
            ),
        })
    }
}
