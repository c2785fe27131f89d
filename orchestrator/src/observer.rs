// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step observers
//!
//! Pipelines report every step transition to a [`StepObserver`] instead
//! of writing task records themselves; persistence hangs off this seam.
//! The store-backed observer is the production wiring.  Persistence
//! failures are logged and swallowed: by the time a step outcome is
//! being recorded the remote operation has already happened, and
//! aborting the pipeline over a bookkeeping write would strand it.

use crate::store::TaskStore;
use crate::task::StepUpdate;
use async_trait::async_trait;
use slog::error;
use slog::o;
use slog::Logger;
use std::sync::Arc;
use uuid::Uuid;

/// Receives every step transition a pipeline makes.
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn on_step_update(
        &self,
        task_id: Uuid,
        index: usize,
        update: StepUpdate,
    );

    /// The pipeline finished with every step completed.
    async fn on_task_completed(&self, task_id: Uuid);
}

/// [`StepObserver`] that persists transitions to a [`TaskStore`].
pub struct StoreStepObserver {
    tasks: Arc<dyn TaskStore>,
    log: Logger,
}

impl StoreStepObserver {
    pub fn new(tasks: Arc<dyn TaskStore>, log: &Logger) -> StoreStepObserver {
        StoreStepObserver {
            tasks,
            log: log.new(o!("component" => "StoreStepObserver")),
        }
    }
}

#[async_trait]
impl StepObserver for StoreStepObserver {
    async fn on_step_update(
        &self,
        task_id: Uuid,
        index: usize,
        update: StepUpdate,
    ) {
        if let Err(e) = self.tasks.update_step(task_id, index, update).await {
            error!(self.log, "failed to persist step update";
                "task_id" => %task_id,
                "step_index" => index,
                "error" => %e,
            );
        }
    }

    async fn on_task_completed(&self, task_id: Uuid) {
        if let Err(e) = self.tasks.complete_task(task_id).await {
            error!(self.log, "failed to persist task completion";
                "task_id" => %task_id,
                "error" => %e,
            );
        }
    }
}
