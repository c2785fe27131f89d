// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end pipeline tests against the simulated backend.

use anvil_common::dev;
use anvil_common::Error;
use anvil_common::Resources;
use anvil_orchestrator::quota::QuotaPlan;
use anvil_orchestrator::store::InMemoryOwnershipStore;
use anvil_orchestrator::store::InMemoryPlanStore;
use anvil_orchestrator::store::InMemoryTaskStore;
use anvil_orchestrator::store::InMemoryTemplateStore;
use anvil_orchestrator::store::OwnershipStore;
use anvil_orchestrator::store::PlanStore;
use anvil_orchestrator::store::TaskStore;
use anvil_orchestrator::store::Template;
use anvil_orchestrator::store::TemplateStore;
use anvil_orchestrator::task::StepState;
use anvil_orchestrator::task::StepUpdate;
use anvil_orchestrator::task::TaskState;
use anvil_orchestrator::CloneTemplateRequest;
use anvil_orchestrator::Orchestrator;
use anvil_orchestrator::ProvisionRequest;
use anvil_orchestrator::ProvisioningTask;
use anvil_virt_client::sim::ops;
use anvil_virt_client::sim::SimVirtClient;
use anvil_virt_client::CloneParams;
use anvil_virt_client::RemoteTaskState;
use anvil_virt_client::VirtClient;
use anvil_virt_client::VmId;
use anvil_virt_client::WriteOutcome;
use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Duration;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

const NODE: &str = "pve1";
const TEMPLATE_VM: VmId = VmId(9000);
const PLAN: &str = "lab-default";

struct TestContext {
    orchestrator: Orchestrator,
    sim: Arc<SimVirtClient>,
    tasks: Arc<InMemoryTaskStore>,
    ownership: Arc<InMemoryOwnershipStore>,
    templates: Arc<InMemoryTemplateStore>,
    tenant_id: Uuid,
    template_id: Uuid,
}

impl TestContext {
    /// An orchestrator wired to a simulated backend holding one public
    /// 2-core / 2048 MiB / 32 GiB template and one quota plan.
    async fn new() -> TestContext {
        let log = dev::null_logger();
        let sim = Arc::new(SimVirtClient::new(&log));
        sim.insert_template(NODE, TEMPLATE_VM, 2, 2048, 32);

        let tasks = Arc::new(InMemoryTaskStore::new());
        let ownership = Arc::new(InMemoryOwnershipStore::new());
        let templates = Arc::new(InMemoryTemplateStore::new());
        let plans = Arc::new(InMemoryPlanStore::new());

        let tenant_id = Uuid::new_v4();
        let template_id = Uuid::new_v4();
        templates
            .insert_template(Template {
                id: template_id,
                description: "debian 12 base".to_string(),
                node: NODE.to_string(),
                vm_id: TEMPLATE_VM,
                tenant_id: Uuid::new_v4(),
                ci_user: None,
                ci_password: None,
                public: true,
                time_created: Utc::now(),
            })
            .await
            .unwrap();

        plans
            .insert_plan(QuotaPlan {
                name: PLAN.to_string(),
                per_vm: Resources::new(8, 16384, 200),
                aggregate: Resources::new(16, 32768, 400),
                max_vms: 10,
            })
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(
            &log,
            sim.clone(),
            tasks.clone(),
            ownership.clone(),
            templates.clone(),
            plans,
        );
        TestContext {
            orchestrator,
            sim,
            tasks,
            ownership,
            templates,
            tenant_id,
            template_id,
        }
    }

    fn request(&self) -> ProvisionRequest {
        ProvisionRequest {
            tenant_id: self.tenant_id,
            plan: PLAN.to_string(),
            template_id: self.template_id,
            name: "Web Server 01".to_string(),
            target_node: None,
            storage: None,
            resources: Resources::new(2, 4096, 48),
            ci_user: None,
            ci_password: None,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_provision_happy_path() {
    let ctx = TestContext::new().await;
    let request = ctx.request();
    let response = ctx.orchestrator.provision(request.clone()).await.unwrap();
    assert_eq!(response.vm_id, VmId(100));
    assert_eq!(response.vm_name.as_str(), "web-server-01");

    // The task completed with every step recorded.
    let view = ctx
        .orchestrator
        .task_status(response.task_id, false)
        .await
        .unwrap();
    assert_eq!(view.task.state, TaskState::Completed);
    assert_eq!(view.task.progress, 100);
    assert_eq!(view.task.steps.len(), 5);
    for step in &view.task.steps {
        assert_eq!(step.state, StepState::Completed);
    }
    // The clone ran as a remote task and its handle was recorded.
    assert!(view.task.steps[0].handle.is_some());

    // The quota ledger charged exactly the requested footprint.
    let ledger = ctx.orchestrator.ledger();
    assert_eq!(ledger.used(ctx.tenant_id), request.resources);
    assert_eq!(ledger.vms_used(ctx.tenant_id), 1);

    // Ownership maps the VM back to the tenant.
    let record = ctx.ownership.find_vm(VmId(100)).await.unwrap().unwrap();
    assert_eq!(record.tenant_id, ctx.tenant_id);
    assert_eq!(record.node, NODE);

    // The backend VM was shaped to the request.
    let vm = ctx.sim.vm(NODE, VmId(100)).unwrap();
    assert_eq!(vm.cores, 2);
    assert_eq!(vm.memory_mib, 4096);
    assert_eq!(vm.disk_gib, 48);
    assert_eq!(ctx.sim.call_count(ops::RESIZE), 1);
}

#[tokio::test(start_paused = true)]
async fn test_provision_failure_cleans_up() {
    let ctx = TestContext::new().await;
    ctx.sim.fail_next(ops::CONFIG_CORES, "invalid cores value");

    let response = ctx.orchestrator.provision(ctx.request()).await;
    let error = response.unwrap_err();
    assert_matches!(error, Error::BackendOperation { .. });
    assert!(error.to_string().contains("invalid cores value"));

    // One task exists, failed at the cpu step; later steps never left
    // pending.
    let tasks =
        ctx.orchestrator.list_tenant_tasks(ctx.tenant_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.steps[0].state, StepState::Completed);
    assert_eq!(task.steps[1].state, StepState::Failed);
    for step in &task.steps[2..] {
        assert_eq!(step.state, StepState::Pending);
    }

    // The half-built VM was deleted and the quota hold released.
    assert_eq!(ctx.sim.call_count(ops::DELETE), 1);
    assert!(!ctx.sim.vm_exists(NODE, VmId(100)));
    let ledger = ctx.orchestrator.ledger();
    assert_eq!(ledger.used(ctx.tenant_id), Resources::ZERO);
    assert_eq!(ledger.vms_used(ctx.tenant_id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_provision_validation() {
    let ctx = TestContext::new().await;

    // Zero-sized resources.
    let mut request = ctx.request();
    request.resources = Resources::new(0, 4096, 48);
    assert_matches!(
        ctx.orchestrator.provision(request).await,
        Err(Error::InvalidRequest { .. })
    );

    // Cloud-init user without a password.
    let mut request = ctx.request();
    request.ci_user = Some("admin".to_string());
    assert_matches!(
        ctx.orchestrator.provision(request).await,
        Err(Error::InvalidRequest { .. })
    );

    // A name that sanitizes to nothing.
    let mut request = ctx.request();
    request.name = "!!!".to_string();
    assert_matches!(
        ctx.orchestrator.provision(request).await,
        Err(Error::InvalidRequest { .. })
    );

    // Unknown template.
    let mut request = ctx.request();
    request.template_id = Uuid::new_v4();
    assert_matches!(
        ctx.orchestrator.provision(request).await,
        Err(Error::ObjectNotFound { .. })
    );

    // Per-VM quota maximum.
    let mut request = ctx.request();
    request.resources = Resources::new(16, 4096, 48);
    assert_matches!(
        ctx.orchestrator.provision(request).await,
        Err(Error::QuotaExceeded { .. })
    );

    // None of these reached the backend.
    assert!(ctx.sim.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_provision_private_template_forbidden() {
    let ctx = TestContext::new().await;
    let private_id = Uuid::new_v4();
    ctx.templates
        .insert_template(Template {
            id: private_id,
            description: "someone else's".to_string(),
            node: NODE.to_string(),
            vm_id: TEMPLATE_VM,
            tenant_id: Uuid::new_v4(),
            ci_user: None,
            ci_password: None,
            public: false,
            time_created: Utc::now(),
        })
        .await
        .unwrap();

    let mut request = ctx.request();
    request.template_id = private_id;
    assert_matches!(
        ctx.orchestrator.provision(request).await,
        Err(Error::Forbidden)
    );
}

#[tokio::test(start_paused = true)]
async fn test_provision_skips_unneeded_resize() {
    let ctx = TestContext::new().await;
    // Template disk is 32G; requesting 20G must not shrink it.
    let mut request = ctx.request();
    request.resources = Resources::new(2, 4096, 20);

    let response = ctx.orchestrator.provision(request).await.unwrap();
    assert_eq!(ctx.sim.call_count(ops::RESIZE), 0);
    assert_eq!(ctx.sim.vm(NODE, VmId(100)).unwrap().disk_gib, 32);

    let view =
        ctx.orchestrator.task_status(response.task_id, false).await.unwrap();
    assert_eq!(view.task.state, TaskState::Completed);
    let disk_step = &view.task.steps[3];
    assert_eq!(disk_step.state, StepState::Completed);
    assert!(disk_step.message.as_deref().unwrap().contains("no resize"));
}

#[tokio::test(start_paused = true)]
async fn test_provision_cloud_init() {
    // No credentials anywhere: the step is skipped.
    let ctx = TestContext::new().await;
    let response = ctx.orchestrator.provision(ctx.request()).await.unwrap();
    assert_eq!(ctx.sim.call_count(ops::CONFIG_CLOUDINIT), 0);
    let view =
        ctx.orchestrator.task_status(response.task_id, false).await.unwrap();
    assert!(view.task.steps[4]
        .message
        .as_deref()
        .unwrap()
        .contains("skipped"));

    // Request credentials are applied.
    let ctx = TestContext::new().await;
    let mut request = ctx.request();
    request.ci_user = Some("admin".to_string());
    request.ci_password = Some("hunter2".to_string());
    ctx.orchestrator.provision(request).await.unwrap();
    assert_eq!(ctx.sim.call_count(ops::CONFIG_CLOUDINIT), 1);
    let vm = ctx.sim.vm(NODE, VmId(100)).unwrap();
    assert_eq!(vm.ci_user.as_deref(), Some("admin"));
    assert_eq!(vm.ci_password.as_deref(), Some("hunter2"));
}

#[tokio::test(start_paused = true)]
async fn test_provision_waits_for_disk_to_settle() {
    let ctx = TestContext::new().await;
    // The fresh clone reports a transient descriptor for a few reads.
    ctx.sim.set_transient_config_reads(2);
    let response = ctx.orchestrator.provision(ctx.request()).await.unwrap();
    let view =
        ctx.orchestrator.task_status(response.task_id, false).await.unwrap();
    assert_eq!(view.task.state, TaskState::Completed);
    assert_eq!(ctx.sim.vm(NODE, VmId(100)).unwrap().disk_gib, 48);
}

#[tokio::test(start_paused = true)]
async fn test_clone_template() {
    let ctx = TestContext::new().await;
    let response = ctx
        .orchestrator
        .clone_template(CloneTemplateRequest {
            tenant_id: ctx.tenant_id,
            source_template_id: ctx.template_id,
            description: "debian 12 + site tooling".to_string(),
            name: "Debian 12 Tooling".to_string(),
            target_node: None,
            storage: None,
        })
        .await
        .unwrap();

    // The new template record points at the promoted VM and is private
    // to the requesting tenant.
    let template = ctx
        .templates
        .fetch_template(response.template_id)
        .await
        .unwrap();
    assert_eq!(template.vm_id, VmId(100));
    assert_eq!(template.tenant_id, ctx.tenant_id);
    assert!(!template.public);
    assert!(ctx.sim.vm(NODE, VmId(100)).unwrap().is_template);

    let view =
        ctx.orchestrator.task_status(response.task_id, false).await.unwrap();
    assert_eq!(view.task.state, TaskState::Completed);
    assert_eq!(view.task.steps.len(), 2);

    // Template stock is not tenant workload: the ledger is untouched.
    assert_eq!(
        ctx.orchestrator.ledger().used(ctx.tenant_id),
        Resources::ZERO
    );
}

#[tokio::test(start_paused = true)]
async fn test_clone_template_promote_failure_cleans_up() {
    let ctx = TestContext::new().await;
    ctx.sim.fail_next(ops::TEMPLATE, "vm is running");

    let result = ctx
        .orchestrator
        .clone_template(CloneTemplateRequest {
            tenant_id: ctx.tenant_id,
            source_template_id: ctx.template_id,
            description: "doomed".to_string(),
            name: "doomed".to_string(),
            target_node: None,
            storage: None,
        })
        .await;
    assert_matches!(result, Err(Error::BackendOperation { .. }));

    // The half-promoted VM was deleted.
    assert_eq!(ctx.sim.call_count(ops::DELETE), 1);
    assert!(!ctx.sim.vm_exists(NODE, VmId(100)));
}

#[tokio::test(start_paused = true)]
async fn test_delete_vm_reclaims_quota() {
    let ctx = TestContext::new().await;
    let request = ctx.request();
    let response = ctx.orchestrator.provision(request.clone()).await.unwrap();
    let ledger = ctx.orchestrator.ledger();
    assert_eq!(ledger.used(ctx.tenant_id), request.resources);

    let deleted = ctx.orchestrator.delete_vm(response.vm_id).await.unwrap();
    assert_eq!(deleted.vm_id, response.vm_id);
    assert_eq!(deleted.node, NODE);

    assert!(!ctx.sim.vm_exists(NODE, response.vm_id));
    assert_eq!(ledger.used(ctx.tenant_id), Resources::ZERO);
    assert_eq!(ledger.vms_used(ctx.tenant_id), 0);
    assert!(ctx.ownership.find_vm(response.vm_id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_delete_vm_unreadable_config_skips_reclaim() {
    let ctx = TestContext::new().await;
    let request = ctx.request();
    let response = ctx.orchestrator.provision(request.clone()).await.unwrap();

    // The footprint read fails; the delete still goes through, but no
    // quota is handed back.
    ctx.sim.fail_next(ops::READ_CONFIG, "node unreachable");
    ctx.orchestrator.delete_vm(response.vm_id).await.unwrap();

    assert!(!ctx.sim.vm_exists(NODE, response.vm_id));
    let ledger = ctx.orchestrator.ledger();
    assert_eq!(ledger.used(ctx.tenant_id), request.resources);
    assert!(ctx.ownership.find_vm(response.vm_id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_delete_vm_failure_leaves_ledger_alone() {
    let ctx = TestContext::new().await;
    let request = ctx.request();
    let response = ctx.orchestrator.provision(request.clone()).await.unwrap();

    ctx.sim.fail_next(ops::DELETE, "vm is locked");
    let result = ctx.orchestrator.delete_vm(response.vm_id).await;
    assert_matches!(result, Err(Error::BackendOperation { .. }));

    // Nothing was reclaimed and ownership still stands.
    let ledger = ctx.orchestrator.ledger();
    assert_eq!(ledger.used(ctx.tenant_id), request.resources);
    assert_eq!(ledger.vms_used(ctx.tenant_id), 1);
    assert!(ctx.ownership.find_vm(response.vm_id).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_delete_unknown_vm() {
    let ctx = TestContext::new().await;
    assert_matches!(
        ctx.orchestrator.delete_vm(VmId(424242)).await,
        Err(Error::ObjectNotFound { .. })
    );
}

#[tokio::test(start_paused = true)]
async fn test_aggregate_quota_across_provisions() {
    let ctx = TestContext::new().await;
    // Aggregate allows 16 cores; three 6-core VMs cannot all fit.
    let mut request = ctx.request();
    request.resources = Resources::new(6, 1024, 10);
    ctx.orchestrator.provision(request.clone()).await.unwrap();
    ctx.orchestrator.provision(request.clone()).await.unwrap();
    let error = ctx.orchestrator.provision(request).await.unwrap_err();
    assert_matches!(error, Error::QuotaExceeded { .. });

    let ledger = ctx.orchestrator.ledger();
    assert_eq!(ledger.vms_used(ctx.tenant_id), 2);
    assert_eq!(ledger.used(ctx.tenant_id), Resources::new(12, 2048, 20));
}

#[tokio::test(start_paused = true)]
async fn test_task_status_live_merge() {
    let ctx = TestContext::new().await;
    // Mint a slow remote task by submitting a clone directly, then
    // stage a task record holding its handle.
    ctx.sim.set_async(ops::CLONE, 5);
    let outcome = ctx
        .sim
        .clone_vm(&CloneParams {
            source_node: NODE.to_string(),
            source_vm: TEMPLATE_VM,
            new_vm: VmId(100),
            name: "merge-test".to_string(),
            target_node: NODE.to_string(),
            storage: None,
            full: true,
        })
        .await;
    let handle = match outcome {
        WriteOutcome::Submitted(handle) => handle,
        other => panic!("expected task handle, got {:?}", other),
    };

    let task = ProvisioningTask::new(
        ctx.tenant_id,
        NODE,
        Some(VmId(100)),
        None,
        &["clone"],
    );
    let task_id = task.id;
    ctx.tasks.insert_task(task).await.unwrap();
    ctx.tasks.update_step(task_id, 0, StepUpdate::Started).await.unwrap();
    ctx.tasks
        .update_step(task_id, 0, StepUpdate::TaskSubmitted { handle })
        .await
        .unwrap();

    let view = ctx.orchestrator.task_status(task_id, true).await.unwrap();
    assert_eq!(view.task.state, TaskState::InProgress);
    assert_eq!(view.remote.unwrap().state, RemoteTaskState::Running);

    // Without the flag, no remote lookup happens.
    let view = ctx.orchestrator.task_status(task_id, false).await.unwrap();
    assert!(view.remote.is_none());
}

#[tokio::test]
async fn test_task_retention_purges_old_terminal_tasks() {
    let ctx = TestContext::new().await;
    let mut old =
        ProvisioningTask::new(ctx.tenant_id, NODE, None, None, &["clone"]);
    old.apply_step_update(0, StepUpdate::Started).unwrap();
    old.apply_step_update(
        0,
        StepUpdate::Failed { handle: None, error: "boom".to_string() },
    )
    .unwrap();
    old.time_updated = Utc::now() - Duration::days(45);
    let old_id = old.id;
    ctx.tasks.insert_task(old).await.unwrap();

    let recent =
        ProvisioningTask::new(ctx.tenant_id, NODE, None, None, &["clone"]);
    let recent_id = recent.id;
    ctx.tasks.insert_task(recent).await.unwrap();

    ctx.orchestrator.run_task_retention(ctx.tenant_id).await.unwrap();
    assert_matches!(
        ctx.tasks.fetch_task(old_id).await,
        Err(Error::ObjectNotFound { .. })
    );
    assert!(ctx.tasks.fetch_task(recent_id).await.is_ok());
}

/// Template store whose writes always fail; reads delegate to a seeded
/// in-memory store.
struct BrokenWriteTemplateStore {
    inner: InMemoryTemplateStore,
}

#[async_trait]
impl TemplateStore for BrokenWriteTemplateStore {
    async fn insert_template(&self, _template: Template) -> Result<(), Error> {
        Err(Error::internal_error("template store unavailable"))
    }

    async fn fetch_template(&self, id: Uuid) -> Result<Template, Error> {
        self.inner.fetch_template(id).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_clone_template_record_write_failure_still_completes() {
    let log = dev::null_logger();
    let sim = Arc::new(SimVirtClient::new(&log));
    sim.insert_template(NODE, TEMPLATE_VM, 2, 2048, 32);

    let inner = InMemoryTemplateStore::new();
    let source_id = Uuid::new_v4();
    let tenant_id = Uuid::new_v4();
    inner
        .insert_template(Template {
            id: source_id,
            description: "debian 12 base".to_string(),
            node: NODE.to_string(),
            vm_id: TEMPLATE_VM,
            tenant_id: Uuid::new_v4(),
            ci_user: None,
            ci_password: None,
            public: true,
            time_created: Utc::now(),
        })
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(
        &log,
        sim.clone(),
        Arc::new(InMemoryTaskStore::new()),
        Arc::new(InMemoryOwnershipStore::new()),
        Arc::new(BrokenWriteTemplateStore { inner }),
        Arc::new(InMemoryPlanStore::new()),
    );

    // The record write fails, but the VM is already promoted: the call
    // still succeeds and the task reaches a terminal state rather than
    // hanging in progress over a half-recorded template.
    let response = orchestrator
        .clone_template(CloneTemplateRequest {
            tenant_id,
            source_template_id: source_id,
            description: "tooling image".to_string(),
            name: "tooling".to_string(),
            target_node: None,
            storage: None,
        })
        .await
        .unwrap();

    assert!(sim.vm(NODE, VmId(100)).unwrap().is_template);
    assert_eq!(sim.call_count(ops::DELETE), 0);
    let view =
        orchestrator.task_status(response.task_id, false).await.unwrap();
    assert_eq!(view.task.state, TaskState::Completed);
}
