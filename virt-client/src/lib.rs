// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the virtualization control plane
//!
//! The orchestrator drives every remote VM operation through the
//! [`VirtClient`] trait.  [`http::HttpVirtClient`] is the real
//! implementation; [`sim::SimVirtClient`] is a deterministic in-process
//! backend for tests and development.
//!
//! Write operations return a [`WriteOutcome`] rather than a `Result`:
//! the backend either applies a change synchronously, hands back an
//! opaque [`TaskHandle`] to poll, or fails — and transport errors are
//! deliberately folded into that failure arm so no exception-shaped
//! control flow crosses into the orchestrator.

use anvil_common::Error;
use async_trait::async_trait;

pub mod http;
pub mod sim;
pub mod types;

pub use types::CloneParams;
pub use types::ConfigPatch;
pub use types::DiskDescriptor;
pub use types::RemoteTaskState;
pub use types::RemoteTaskStatus;
pub use types::TaskHandle;
pub use types::VmConfig;
pub use types::VmId;
pub use types::WriteOutcome;
pub use types::TASK_EXIT_OK;

/// Operations the orchestrator consumes from the virtualization
/// control plane
///
/// Writes never error across this boundary (see [`WriteOutcome`]);
/// reads return ordinary `Result`s because the caller decides whether a
/// failed read is fatal or retryable.
#[async_trait]
pub trait VirtClient: Send + Sync {
    /// Ask the backend for a fresh, unused VM identifier.
    async fn next_vm_id(&self) -> Result<VmId, Error>;

    /// Clone a VM or template to a new identifier.
    async fn clone_vm(&self, params: &CloneParams) -> WriteOutcome;

    /// Patch a VM's configuration (CPU, memory, cloud-init fields).
    async fn update_config(
        &self,
        node: &str,
        vm: VmId,
        patch: &ConfigPatch,
    ) -> WriteOutcome;

    /// Grow a disk in `slot` by `grow_gib` GiB.  Shrinking is not
    /// supported by the backend.
    async fn resize_disk(
        &self,
        node: &str,
        vm: VmId,
        slot: &str,
        grow_gib: u64,
    ) -> WriteOutcome;

    /// Convert a stopped VM into a sealed, clonable template.
    async fn convert_to_template(&self, node: &str, vm: VmId) -> WriteOutcome;

    /// Delete a VM and its disks.
    async fn delete_vm(&self, node: &str, vm: VmId) -> WriteOutcome;

    /// Read the subset of the VM's configuration the orchestrator cares
    /// about.
    async fn vm_config(&self, node: &str, vm: VmId) -> Result<VmConfig, Error>;

    /// Read the status of an asynchronous task.
    async fn task_status(
        &self,
        node: &str,
        handle: &TaskHandle,
    ) -> Result<RemoteTaskStatus, Error>;
}
