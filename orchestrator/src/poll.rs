// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote task poller
//!
//! Resolves an opaque backend task handle to success, failure, or
//! timeout within a fixed attempt budget.  A timeout is local only: the
//! remote operation is not told to abort and may well keep running after
//! the orchestrator has given up on it.

use anvil_common::poll;
use anvil_common::poll::CondCheckError;
use anvil_common::poll::PollError;
use anvil_virt_client::RemoteTaskState;
use anvil_virt_client::TaskHandle;
use anvil_virt_client::VirtClient;
use anvil_virt_client::TASK_EXIT_OK;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::time::Duration;

/// Attempt budget for one polled wait.
#[derive(Clone, Copy, Debug)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

/// Long operations: clones copy whole disks.  10-minute ceiling.
pub const CLONE_POLL: PollPolicy =
    PollPolicy { max_attempts: 120, interval: Duration::from_secs(5) };

/// Config-style operations normally apply synchronously; this budget
/// only matters when the backend unexpectedly hands back a task.
pub const CONFIG_POLL: PollPolicy =
    PollPolicy { max_attempts: 30, interval: Duration::from_secs(2) };

/// Deletes tear down disks; slower than config, faster than clone.
pub const DELETE_POLL: PollPolicy =
    PollPolicy { max_attempts: 60, interval: Duration::from_secs(5) };

/// How a polled remote task resolved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollOutcome {
    Success,
    /// The task stopped with a failing exit status.
    Failure(String),
    /// The attempt budget ran out.  The remote task may still be
    /// running.
    TimedOut,
}

/// Poll `handle` until it settles or `policy` is exhausted
///
/// `running` waits; `stopped` with exit `"OK"` succeeds; `stopped` with
/// a non-empty error string fails with that text.  `stopped` with no
/// exit status yet is treated as not-yet-settled and retried: the
/// backend briefly reports that shape between a task ending and its
/// result being posted.  Status-read errors are also retried; a flaky
/// read is indistinguishable from a slow task, and the budget bounds
/// both.
pub async fn await_task(
    client: &dyn VirtClient,
    log: &Logger,
    node: &str,
    handle: &TaskHandle,
    label: &str,
    policy: &PollPolicy,
) -> PollOutcome {
    let result = poll::wait_for_condition::<(), String, _, _>(
        || async {
            let status = match client.task_status(node, handle).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(log, "task status read failed; will retry";
                        "task" => label,
                        "handle" => handle.as_str(),
                        "error" => %e,
                    );
                    return Err(CondCheckError::NotYet);
                }
            };
            match (status.state, status.exit_status.as_deref()) {
                (RemoteTaskState::Running, _) => {
                    Err(CondCheckError::NotYet)
                }
                (RemoteTaskState::Stopped, Some(TASK_EXIT_OK)) => Ok(()),
                (RemoteTaskState::Stopped, Some("")) | (RemoteTaskState::Stopped, None) => {
                    // Stopped but no result posted yet.
                    debug!(log, "task stopped without exit status; will retry";
                        "task" => label,
                        "handle" => handle.as_str(),
                    );
                    Err(CondCheckError::NotYet)
                }
                (RemoteTaskState::Stopped, Some(error)) => {
                    Err(CondCheckError::Failed(error.to_string()))
                }
            }
        },
        &policy.interval,
        policy.max_attempts,
    )
    .await;

    match result {
        Ok(()) => PollOutcome::Success,
        Err(PollError::PermanentError(message)) => {
            PollOutcome::Failure(message)
        }
        Err(PollError::TimedOut { attempts, .. }) => {
            warn!(log, "gave up polling task; remote may still be running";
                "task" => label,
                "handle" => handle.as_str(),
                "attempts" => attempts,
            );
            PollOutcome::TimedOut
        }
    }
}
