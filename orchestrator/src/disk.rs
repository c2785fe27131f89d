// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk readiness gate
//!
//! A freshly cloned disk spends time in a transient state (importing,
//! cloning) during which a resize is rejected by the backend.  This gate
//! polls the VM's config until the primary disk descriptor shows a
//! settled storage format.  It runs after every clone and again,
//! defensively, immediately before any resize.

use crate::poll::PollPolicy;
use anvil_common::poll;
use anvil_common::poll::CondCheckError;
use anvil_common::poll::PollError;
use anvil_common::Error;
use anvil_virt_client::DiskDescriptor;
use anvil_virt_client::VirtClient;
use anvil_virt_client::VmId;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::time::Duration;

pub const DISK_READY_POLL: PollPolicy =
    PollPolicy { max_attempts: 20, interval: Duration::from_secs(10) };

/// Wait until `vm`'s primary disk has left its transient post-clone
/// state
///
/// A transient marker in the descriptor means not ready; a known
/// storage-format suffix means ready.  A descriptor matching neither is
/// ambiguous — logged and retried, not failed — as is a missing
/// descriptor or a failed config read.  Exhausting the budget returns
/// [`Error::BackendTimeout`].
pub async fn await_disk_ready(
    client: &dyn VirtClient,
    log: &Logger,
    node: &str,
    vm: VmId,
    policy: &PollPolicy,
) -> Result<(), Error> {
    let result = poll::wait_for_condition::<(), Error, _, _>(
        || async {
            let config = match client.vm_config(node, vm).await {
                Ok(config) => config,
                Err(e) => {
                    warn!(log, "config read failed while waiting for disk";
                        "vm_id" => %vm, "error" => %e);
                    return Err(CondCheckError::NotYet);
                }
            };
            let raw = match config.primary_disk.as_deref() {
                Some(raw) => DiskDescriptor::parse(raw),
                None => {
                    warn!(log, "vm config has no primary disk yet";
                        "vm_id" => %vm);
                    return Err(CondCheckError::NotYet);
                }
            };
            if raw.is_transient() {
                debug!(log, "disk still materializing";
                    "vm_id" => %vm, "descriptor" => raw.as_str());
                return Err(CondCheckError::NotYet);
            }
            if raw.has_known_format() {
                return Ok(());
            }
            // Neither transient nor a recognized format; don't treat an
            // unfamiliar descriptor as fatal.
            warn!(log, "ambiguous disk descriptor; will retry";
                "vm_id" => %vm, "descriptor" => raw.as_str());
            Err(CondCheckError::NotYet)
        },
        &policy.interval,
        policy.max_attempts,
    )
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(PollError::PermanentError(e)) => Err(e),
        Err(PollError::TimedOut { attempts, .. }) => {
            Err(Error::BackendTimeout {
                label: format!("disk-ready vm {}", vm),
                attempts,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anvil_common::dev;
    use anvil_virt_client::sim::ops;
    use anvil_virt_client::sim::SimVirtClient;
    use anvil_virt_client::CloneParams;
    use assert_matches::assert_matches;

    async fn sim_with_clone(transient_reads: u32) -> SimVirtClient {
        let log = dev::null_logger();
        let sim = SimVirtClient::new(&log);
        sim.insert_template("pve1", VmId(9000), 2, 2048, 32);
        sim.set_transient_config_reads(transient_reads);
        sim.clone_vm(&CloneParams {
            source_node: "pve1".to_string(),
            source_vm: VmId(9000),
            new_vm: VmId(100),
            name: "disk-test".to_string(),
            target_node: "pve1".to_string(),
            storage: None,
            full: true,
        })
        .await;
        sim
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_out_transient_state() {
        let log = dev::null_logger();
        let sim = sim_with_clone(3).await;
        await_disk_ready(&sim, &log, "pve1", VmId(100), &DISK_READY_POLL)
            .await
            .unwrap();
        // Three transient reads, then the settled one.
        assert_eq!(sim.call_count(ops::READ_CONFIG), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_disk_never_settles() {
        let log = dev::null_logger();
        let sim = sim_with_clone(u32::MAX).await;
        let policy = PollPolicy {
            max_attempts: 4,
            interval: Duration::from_secs(10),
        };
        let result =
            await_disk_ready(&sim, &log, "pve1", VmId(100), &policy).await;
        assert_matches!(
            result,
            Err(Error::BackendTimeout { attempts: 4, .. })
        );
    }
}
