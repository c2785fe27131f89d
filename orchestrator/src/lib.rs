// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM provisioning and reclamation orchestrator
//!
//! Sits between tenant-facing request handling (not part of this crate)
//! and a virtualization control plane reached through
//! [`anvil_virt_client::VirtClient`].  The orchestrator turns a
//! provisioning request into an ordered, persisted pipeline of remote
//! operations — clone, CPU, memory, disk, cloud-init — with quota
//! admission up front, per-step progress records throughout, and
//! best-effort cleanup of anything a failed pipeline left on the
//! backend.  Deletion confirms the remote teardown before returning a
//! VM's footprint to its tenant's quota.

pub mod app;
pub mod delete;
pub mod disk;
pub mod observer;
pub mod poll;
pub mod provision;
pub mod quota;
pub mod store;
pub mod task;
pub mod template;

pub use app::CloneTemplateRequest;
pub use app::CloneTemplateResponse;
pub use app::DeleteVmResponse;
pub use app::Orchestrator;
pub use app::ProvisionRequest;
pub use app::ProvisionResponse;
pub use app::TaskStatusView;
pub use quota::QuotaPlan;
pub use store::OwnershipRecord;
pub use store::Template;
pub use task::ProvisioningTask;
pub use task::TaskState;
