// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Store interfaces for the orchestrator's collaborators
//!
//! Persistence schemas are someone else's problem; the orchestrator
//! programs against these traits.  The in-memory implementations here
//! back the tests and any single-process deployment.

use crate::quota::QuotaPlan;
use crate::task::ProvisioningTask;
use crate::task::StepUpdate;
use anvil_common::Error;
use anvil_common::ResourceType;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

use anvil_virt_client::VmId;

/// Default number of terminal tasks kept per tenant.
pub const TASK_RETENTION_KEEP: usize = 50;

/// Default age after which terminal tasks are purged.
pub const TASK_RETENTION_DAYS: i64 = 30;

/// Maps a (node, remote VM id) pair to exactly one owning tenant.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OwnershipRecord {
    pub node: String,
    pub vm_id: VmId,
    pub tenant_id: Uuid,
    pub time_created: DateTime<Utc>,
}

/// A clonable VM template.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Template {
    pub id: Uuid,
    pub description: String,
    pub node: String,
    pub vm_id: VmId,
    pub tenant_id: Uuid,
    /// Default first-boot credentials injected into clones.
    pub ci_user: Option<String>,
    pub ci_password: Option<String>,
    /// Public templates are visible to every tenant.
    pub public: bool,
    pub time_created: DateTime<Utc>,
}

/// Persisted provisioning task records, keyed by task and tenant.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: ProvisioningTask) -> Result<(), Error>;

    /// Apply a typed update to one step of a task.
    async fn update_step(
        &self,
        task_id: Uuid,
        index: usize,
        update: StepUpdate,
    ) -> Result<(), Error>;

    /// Mark a task completed (all steps must be).
    async fn complete_task(&self, task_id: Uuid) -> Result<(), Error>;

    async fn fetch_task(
        &self,
        task_id: Uuid,
    ) -> Result<ProvisioningTask, Error>;

    /// A tenant's tasks, most recently created first.
    async fn list_tenant_tasks(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<ProvisioningTask>, Error>;

    /// Drop a tenant's oldest terminal tasks beyond `keep`.  Returns
    /// how many were removed.
    async fn trim_tenant_tasks(
        &self,
        tenant_id: Uuid,
        keep: usize,
    ) -> Result<usize, Error>;

    /// Drop terminal tasks last updated before `cutoff`.  Returns how
    /// many were removed.
    async fn purge_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, Error>;
}

/// VM ownership records.
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    async fn insert_ownership(
        &self,
        record: OwnershipRecord,
    ) -> Result<(), Error>;

    async fn remove_ownership(
        &self,
        node: &str,
        vm_id: VmId,
    ) -> Result<(), Error>;

    /// Find the record for a VM id, whichever node it lives on.
    async fn find_vm(
        &self,
        vm_id: VmId,
    ) -> Result<Option<OwnershipRecord>, Error>;
}

/// Template records.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn insert_template(&self, template: Template) -> Result<(), Error>;
    async fn fetch_template(&self, id: Uuid) -> Result<Template, Error>;
}

/// Quota plan reference data, owned by an administrative collaborator.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn insert_plan(&self, plan: QuotaPlan) -> Result<(), Error>;
    async fn fetch_plan(&self, name: &str) -> Result<QuotaPlan, Error>;
}

/// In-memory [`TaskStore`].
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<BTreeMap<Uuid, ProvisioningTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> InMemoryTaskStore {
        InMemoryTaskStore::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: ProvisioningTask) -> Result<(), Error> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.insert(task.id, task).is_some() {
            return Err(Error::internal_error("task id collision"));
        }
        Ok(())
    }

    async fn update_step(
        &self,
        task_id: Uuid,
        index: usize,
        update: StepUpdate,
    ) -> Result<(), Error> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&task_id).ok_or_else(|| {
            Error::not_found_by_id(ResourceType::ProvisioningTask, &task_id)
        })?;
        task.apply_step_update(index, update)
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), Error> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&task_id).ok_or_else(|| {
            Error::not_found_by_id(ResourceType::ProvisioningTask, &task_id)
        })?;
        task.complete()
    }

    async fn fetch_task(
        &self,
        task_id: Uuid,
    ) -> Result<ProvisioningTask, Error> {
        self.tasks.lock().unwrap().get(&task_id).cloned().ok_or_else(|| {
            Error::not_found_by_id(ResourceType::ProvisioningTask, &task_id)
        })
    }

    async fn list_tenant_tasks(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<ProvisioningTask>, Error> {
        let tasks = self.tasks.lock().unwrap();
        let mut result: Vec<ProvisioningTask> = tasks
            .values()
            .filter(|task| task.tenant_id == tenant_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.time_created.cmp(&a.time_created));
        Ok(result)
    }

    async fn trim_tenant_tasks(
        &self,
        tenant_id: Uuid,
        keep: usize,
    ) -> Result<usize, Error> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut terminal: Vec<(Uuid, DateTime<Utc>)> = tasks
            .values()
            .filter(|task| {
                task.tenant_id == tenant_id && task.state.is_terminal()
            })
            .map(|task| (task.id, task.time_created))
            .collect();
        if terminal.len() <= keep {
            return Ok(0);
        }
        // Oldest first; everything beyond the newest `keep` goes.
        terminal.sort_by_key(|(_, created)| *created);
        let excess = terminal.len() - keep;
        for (id, _) in terminal.into_iter().take(excess) {
            tasks.remove(&id);
        }
        Ok(excess)
    }

    async fn purge_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, Error> {
        let mut tasks = self.tasks.lock().unwrap();
        let doomed: Vec<Uuid> = tasks
            .values()
            .filter(|task| {
                task.state.is_terminal() && task.time_updated < cutoff
            })
            .map(|task| task.id)
            .collect();
        let count = doomed.len();
        for id in doomed {
            tasks.remove(&id);
        }
        Ok(count)
    }
}

/// In-memory [`OwnershipStore`].
#[derive(Default)]
pub struct InMemoryOwnershipStore {
    records: Mutex<BTreeMap<(String, u32), OwnershipRecord>>,
}

impl InMemoryOwnershipStore {
    pub fn new() -> InMemoryOwnershipStore {
        InMemoryOwnershipStore::default()
    }
}

#[async_trait]
impl OwnershipStore for InMemoryOwnershipStore {
    async fn insert_ownership(
        &self,
        record: OwnershipRecord,
    ) -> Result<(), Error> {
        let key = (record.node.clone(), record.vm_id.0);
        let mut records = self.records.lock().unwrap();
        if records.insert(key, record).is_some() {
            return Err(Error::internal_error(
                "ownership record already exists for VM",
            ));
        }
        Ok(())
    }

    async fn remove_ownership(
        &self,
        node: &str,
        vm_id: VmId,
    ) -> Result<(), Error> {
        let mut records = self.records.lock().unwrap();
        records
            .remove(&(node.to_string(), vm_id.0))
            .map(|_| ())
            .ok_or_else(|| {
                Error::not_found_by_label(
                    ResourceType::Vm,
                    &format!("{}/{}", node, vm_id),
                )
            })
    }

    async fn find_vm(
        &self,
        vm_id: VmId,
    ) -> Result<Option<OwnershipRecord>, Error> {
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .find(|record| record.vm_id == vm_id)
            .cloned())
    }
}

/// In-memory [`TemplateStore`].
#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: Mutex<BTreeMap<Uuid, Template>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> InMemoryTemplateStore {
        InMemoryTemplateStore::default()
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn insert_template(&self, template: Template) -> Result<(), Error> {
        let mut templates = self.templates.lock().unwrap();
        if templates.insert(template.id, template).is_some() {
            return Err(Error::internal_error("template id collision"));
        }
        Ok(())
    }

    async fn fetch_template(&self, id: Uuid) -> Result<Template, Error> {
        self.templates
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found_by_id(ResourceType::Template, &id))
    }
}

/// In-memory [`PlanStore`].
#[derive(Default)]
pub struct InMemoryPlanStore {
    plans: Mutex<BTreeMap<String, QuotaPlan>>,
}

impl InMemoryPlanStore {
    pub fn new() -> InMemoryPlanStore {
        InMemoryPlanStore::default()
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn insert_plan(&self, plan: QuotaPlan) -> Result<(), Error> {
        let mut plans = self.plans.lock().unwrap();
        plans.insert(plan.name.clone(), plan);
        Ok(())
    }

    async fn fetch_plan(&self, name: &str) -> Result<QuotaPlan, Error> {
        self.plans.lock().unwrap().get(name).cloned().ok_or_else(|| {
            Error::not_found_by_label(ResourceType::QuotaPlan, name)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::StepState;
    use crate::task::TaskState;
    use assert_matches::assert_matches;
    use chrono::Duration;

    fn terminal_task(tenant_id: Uuid) -> ProvisioningTask {
        let mut task = ProvisioningTask::new(
            tenant_id,
            "pve1",
            Some(VmId(100)),
            None,
            &["clone"],
        );
        task.apply_step_update(0, StepUpdate::Started).unwrap();
        task.apply_step_update(
            0,
            StepUpdate::Failed { handle: None, error: "boom".into() },
        )
        .unwrap();
        task
    }

    #[tokio::test]
    async fn test_update_step_round_trips() {
        let store = InMemoryTaskStore::new();
        let tenant_id = Uuid::new_v4();
        let task = ProvisioningTask::new(
            tenant_id,
            "pve1",
            Some(VmId(100)),
            None,
            &["clone", "cpu"],
        );
        let task_id = task.id;
        store.insert_task(task).await.unwrap();

        store.update_step(task_id, 0, StepUpdate::Started).await.unwrap();
        store
            .update_step(
                task_id,
                0,
                StepUpdate::Completed { handle: None, message: None },
            )
            .await
            .unwrap();

        let fetched = store.fetch_task(task_id).await.unwrap();
        assert_eq!(fetched.steps[0].state, StepState::Completed);
        assert_eq!(fetched.steps[1].state, StepState::Pending);
        assert_eq!(fetched.state, TaskState::InProgress);
    }

    #[tokio::test]
    async fn test_trim_keeps_newest_terminal_tasks() {
        let store = InMemoryTaskStore::new();
        let tenant_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut task = terminal_task(tenant_id);
            // Distinct creation times, oldest first.
            task.time_created =
                Utc::now() - Duration::minutes(10 - i as i64);
            ids.push(task.id);
            store.insert_task(task).await.unwrap();
        }
        // An in-flight task is never trimmed.
        let live = ProvisioningTask::new(
            tenant_id,
            "pve1",
            Some(VmId(200)),
            None,
            &["clone"],
        );
        let live_id = live.id;
        store.insert_task(live).await.unwrap();

        let removed = store.trim_tenant_tasks(tenant_id, 2).await.unwrap();
        assert_eq!(removed, 3);
        assert!(store.fetch_task(live_id).await.is_ok());
        assert!(store.fetch_task(ids[4]).await.is_ok());
        assert!(store.fetch_task(ids[3]).await.is_ok());
        assert_matches!(
            store.fetch_task(ids[0]).await,
            Err(Error::ObjectNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_purge_by_age_spares_recent_and_live() {
        let store = InMemoryTaskStore::new();
        let tenant_id = Uuid::new_v4();

        let mut old = terminal_task(tenant_id);
        old.time_updated = Utc::now() - Duration::days(40);
        let old_id = old.id;
        store.insert_task(old).await.unwrap();

        let recent = terminal_task(tenant_id);
        let recent_id = recent.id;
        store.insert_task(recent).await.unwrap();

        let cutoff = Utc::now() - Duration::days(TASK_RETENTION_DAYS);
        let removed = store.purge_tasks_before(cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert_matches!(
            store.fetch_task(old_id).await,
            Err(Error::ObjectNotFound { .. })
        );
        assert!(store.fetch_task(recent_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_ownership_is_exclusive() {
        let store = InMemoryOwnershipStore::new();
        let record = OwnershipRecord {
            node: "pve1".to_string(),
            vm_id: VmId(100),
            tenant_id: Uuid::new_v4(),
            time_created: Utc::now(),
        };
        store.insert_ownership(record.clone()).await.unwrap();
        assert_matches!(
            store.insert_ownership(record.clone()).await,
            Err(Error::InternalError { .. })
        );

        let found = store.find_vm(VmId(100)).await.unwrap().unwrap();
        assert_eq!(found.tenant_id, record.tenant_id);

        store.remove_ownership("pve1", VmId(100)).await.unwrap();
        assert!(store.find_vm(VmId(100)).await.unwrap().is_none());
        assert_matches!(
            store.remove_ownership("pve1", VmId(100)).await,
            Err(Error::ObjectNotFound { .. })
        );
    }
}
