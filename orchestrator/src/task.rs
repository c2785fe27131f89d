// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning task records
//!
//! A [`ProvisioningTask`] is the persisted progress record for one
//! pipeline run: an ordered list of named steps, each moving
//! `pending → in_progress → {completed | failed}`.  The record enforces
//! the ordering invariant itself: a step can only start once every
//! earlier step has completed, and once a step fails the task is failed
//! and no later step ever leaves `pending`.
//!
//! All mutation goes through [`ProvisioningTask::apply_step_update`],
//! which takes a step index and a typed [`StepUpdate`] rather than a
//! free-form field map.

use anvil_common::Error;
use anvil_virt_client::TaskHandle;
use anvil_virt_client::VmId;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Overall status of a provisioning task.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Reserved: no code path currently produces it.  Kept so persisted
    /// records have a stable shape if cancellation is ever added.
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Status of a single step.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One named step of a provisioning task.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Step {
    pub name: String,
    pub state: StepState,
    /// Remote task handle, once the backend has issued one.
    pub handle: Option<TaskHandle>,
    /// Human-readable note ("skipped: ...", "no resize needed", ...).
    pub message: Option<String>,
    pub error: Option<String>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_finished: Option<DateTime<Utc>>,
}

impl Step {
    fn new(name: &str) -> Step {
        Step {
            name: name.to_owned(),
            state: StepState::Pending,
            handle: None,
            message: None,
            error: None,
            time_started: None,
            time_finished: None,
        }
    }
}

/// Typed outcome applied to a step, by index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StepUpdate {
    /// The pipeline is beginning this step.
    Started,
    /// The backend issued a task handle for the in-progress step.
    TaskSubmitted { handle: TaskHandle },
    /// The step finished successfully.
    Completed { handle: Option<TaskHandle>, message: Option<String> },
    /// The step failed; this fails the whole task.
    Failed { handle: Option<TaskHandle>, error: String },
}

/// Persisted progress record for one pipeline run.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProvisioningTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Remote id of the VM being produced, once assigned.
    pub vm_id: Option<VmId>,
    /// Source template, when the pipeline starts from one.
    pub template_id: Option<Uuid>,
    pub node: String,
    pub state: TaskState,
    /// Whole percent of steps completed.
    pub progress: u8,
    pub time_created: DateTime<Utc>,
    pub time_updated: DateTime<Utc>,
    pub steps: Vec<Step>,
}

impl ProvisioningTask {
    pub fn new(
        tenant_id: Uuid,
        node: &str,
        vm_id: Option<VmId>,
        template_id: Option<Uuid>,
        step_names: &[&str],
    ) -> ProvisioningTask {
        let now = Utc::now();
        ProvisioningTask {
            id: Uuid::new_v4(),
            tenant_id,
            vm_id,
            template_id,
            node: node.to_owned(),
            state: TaskState::Pending,
            progress: 0,
            time_created: now,
            time_updated: now,
            steps: step_names.iter().map(|name| Step::new(name)).collect(),
        }
    }

    /// Apply a typed update to the step at `index`
    ///
    /// Enforces the record's invariants: terminal tasks are immutable, a
    /// step may start only when every earlier step has completed, and a
    /// failed step immediately fails the task (pinning later steps at
    /// `pending`).
    pub fn apply_step_update(
        &mut self,
        index: usize,
        update: StepUpdate,
    ) -> Result<(), Error> {
        if self.state.is_terminal() {
            return Err(Error::internal_error(&format!(
                "update to step {} of task {} after terminal state {:?}",
                index, self.id, self.state
            )));
        }
        let nsteps = self.steps.len();
        if index >= nsteps {
            return Err(Error::internal_error(&format!(
                "step index {} out of range for task {} ({} steps)",
                index, self.id, nsteps
            )));
        }
        if !self.steps[..index]
            .iter()
            .all(|step| step.state == StepState::Completed)
        {
            return Err(Error::internal_error(&format!(
                "update to step {} of task {} before earlier steps completed",
                index, self.id
            )));
        }

        let now = Utc::now();
        let step = &mut self.steps[index];
        match update {
            StepUpdate::Started => {
                if step.state != StepState::Pending {
                    return Err(Error::internal_error(&format!(
                        "step {} of task {} started twice",
                        index, self.id
                    )));
                }
                step.state = StepState::InProgress;
                step.time_started = Some(now);
                self.state = TaskState::InProgress;
            }
            StepUpdate::TaskSubmitted { handle } => {
                if step.state != StepState::InProgress {
                    return Err(Error::internal_error(&format!(
                        "handle issued for step {} of task {} while {:?}",
                        index, self.id, step.state
                    )));
                }
                step.handle = Some(handle);
            }
            StepUpdate::Completed { handle, message } => {
                if step.state != StepState::InProgress {
                    return Err(Error::internal_error(&format!(
                        "step {} of task {} completed while {:?}",
                        index, self.id, step.state
                    )));
                }
                step.state = StepState::Completed;
                if handle.is_some() {
                    step.handle = handle;
                }
                step.message = message;
                step.time_finished = Some(now);
            }
            StepUpdate::Failed { handle, error } => {
                if step.state != StepState::InProgress {
                    return Err(Error::internal_error(&format!(
                        "step {} of task {} failed while {:?}",
                        index, self.id, step.state
                    )));
                }
                step.state = StepState::Failed;
                if handle.is_some() {
                    step.handle = handle;
                }
                step.error = Some(error);
                step.time_finished = Some(now);
                self.state = TaskState::Failed;
            }
        }

        self.progress = self.completed_percent();
        self.time_updated = now;
        Ok(())
    }

    /// Mark the task completed.  Valid only once every step has
    /// completed.
    pub fn complete(&mut self) -> Result<(), Error> {
        if !self
            .steps
            .iter()
            .all(|step| step.state == StepState::Completed)
        {
            return Err(Error::internal_error(&format!(
                "task {} completed with unfinished steps",
                self.id
            )));
        }
        self.state = TaskState::Completed;
        self.progress = 100;
        self.time_updated = Utc::now();
        Ok(())
    }

    /// Index and step currently `in_progress`, if any.
    pub fn active_step(&self) -> Option<(usize, &Step)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, step)| step.state == StepState::InProgress)
    }

    fn completed_percent(&self) -> u8 {
        if self.steps.is_empty() {
            return 0;
        }
        let completed = self
            .steps
            .iter()
            .filter(|step| step.state == StepState::Completed)
            .count();
        ((completed * 100) / self.steps.len()) as u8
    }
}
