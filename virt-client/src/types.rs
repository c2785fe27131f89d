// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-adjacent types for the virtualization control plane.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Numeric VM identifier, unique per cluster on the remote side.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct VmId(pub u32);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque handle for an asynchronous remote operation
///
/// The backend mints these for long-running writes; the only thing to do
/// with one is poll `task_status` until it settles.
#[derive(
    Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new<S: Into<String>>(handle: S) -> TaskHandle {
        TaskHandle(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discriminated result of a backend write operation
///
/// Writes never produce an `Err` across the client boundary: transport
/// and protocol failures are folded into [`WriteOutcome::Failed`] so the
/// orchestrator deals with exactly one shape.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    /// The backend applied the change synchronously.
    Applied,
    /// The backend accepted the work and returned a task to poll.
    Submitted(TaskHandle),
    /// The backend rejected the operation, or it could not be reached.
    Failed(String),
}

/// Remote view of an asynchronous task.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoteTaskStatus {
    pub state: RemoteTaskState,
    /// Settled outcome: `Some("OK")` for success, `Some(err)` for
    /// failure.  `None` while the task is running, and occasionally also
    /// just after it stops, before the backend has posted a result.
    pub exit_status: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTaskState {
    Running,
    Stopped,
}

/// Exit status string the backend uses for a successful task.
pub const TASK_EXIT_OK: &str = "OK";

/// Subset of a VM's remote configuration the orchestrator reads.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VmConfig {
    pub cores: u32,
    pub memory_mib: u64,
    /// Config slot holding the primary disk (e.g. `"scsi0"`).
    pub primary_disk_slot: Option<String>,
    /// Raw descriptor string for the primary disk.
    pub primary_disk: Option<String>,
}

/// Parameters for cloning a VM or template.
#[derive(Clone, Debug)]
pub struct CloneParams {
    pub source_node: String,
    pub source_vm: VmId,
    pub new_vm: VmId,
    pub name: String,
    pub target_node: String,
    /// Target storage for the new disks; backend default when `None`.
    pub storage: Option<String>,
    /// Full copy rather than a linked clone.
    pub full: bool,
}

/// Sparse patch of a VM's configuration
///
/// Only the populated fields are sent.  The pipeline patches one concern
/// at a time (CPU, then memory, then cloud-init), so a patch usually
/// carries a single field.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "memory")]
    pub memory_mib: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "ciuser")]
    pub ci_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "cipassword")]
    pub ci_password: Option<String>,
}

impl ConfigPatch {
    pub fn cores(cores: u32) -> ConfigPatch {
        ConfigPatch { cores: Some(cores), ..Default::default() }
    }

    pub fn memory_mib(memory_mib: u64) -> ConfigPatch {
        ConfigPatch { memory_mib: Some(memory_mib), ..Default::default() }
    }

    pub fn cloud_init(user: &str, password: &str) -> ConfigPatch {
        ConfigPatch {
            ci_user: Some(user.to_owned()),
            ci_password: Some(password.to_owned()),
            ..Default::default()
        }
    }
}

/// Parsed view of a disk descriptor string
///
/// Descriptors look like `"storageA:105/vm-105-disk-0.raw,size=32G"`:
/// a storage id, a volume path, and comma-separated options.  While a
/// clone is still materializing the volume, the descriptor instead
/// carries a transient marker such as `importing` or `cloning`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskDescriptor {
    raw: String,
}

/// Markers that mean the volume is still materializing.
const TRANSIENT_MARKERS: [&str; 2] = ["importing", "cloning"];

/// Storage format suffixes that mean the volume is settled and usable.
const FORMAT_SUFFIXES: [&str; 3] = [".raw", ".qcow2", ".vmdk"];

impl DiskDescriptor {
    pub fn parse(raw: &str) -> DiskDescriptor {
        DiskDescriptor { raw: raw.to_owned() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The volume portion of the descriptor (everything before the
    /// first option separator).
    fn volume(&self) -> &str {
        self.raw.split(',').next().unwrap_or("")
    }

    /// True if the descriptor indicates the volume is still
    /// materializing (fresh clone, import in progress).
    pub fn is_transient(&self) -> bool {
        TRANSIENT_MARKERS.iter().any(|m| self.raw.contains(m))
    }

    /// True if the volume carries a known settled storage format.
    pub fn has_known_format(&self) -> bool {
        let volume = self.volume();
        FORMAT_SUFFIXES.iter().any(|s| volume.ends_with(s))
    }

    /// The `size=` option, converted to whole GiB, if present and
    /// parseable.
    pub fn size_gib(&self) -> Option<u64> {
        let size = self
            .raw
            .split(',')
            .filter_map(|opt| opt.trim().strip_prefix("size="))
            .next()?;
        let (digits, unit) = match size.char_indices().find(|(_, c)| !c.is_ascii_digit())
        {
            Some((idx, _)) => size.split_at(idx),
            None => (size, ""),
        };
        let value: u64 = digits.parse().ok()?;
        match unit {
            "G" => Some(value),
            "T" => Some(value * 1024),
            "M" => Some(value / 1024),
            // Bare numbers are bytes.
            "" => Some(value / (1024 * 1024 * 1024)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::DiskDescriptor;

    #[test]
    fn test_descriptor_ready() {
        let d =
            DiskDescriptor::parse("storageA:105/vm-105-disk-0.raw,size=32G");
        assert!(!d.is_transient());
        assert!(d.has_known_format());
        assert_eq!(d.size_gib(), Some(32));
    }

    #[test]
    fn test_descriptor_transient() {
        let d = DiskDescriptor::parse("storageA:importing/vm-105-disk-0.raw");
        assert!(d.is_transient());

        let d = DiskDescriptor::parse("storageA:cloning");
        assert!(d.is_transient());
        assert!(!d.has_known_format());
    }

    #[test]
    fn test_descriptor_ambiguous() {
        // Neither transient nor a known format: the gate logs and
        // retries on these.
        let d = DiskDescriptor::parse("storageA:105/vm-105-disk-0,size=8G");
        assert!(!d.is_transient());
        assert!(!d.has_known_format());
        assert_eq!(d.size_gib(), Some(8));
    }

    #[test]
    fn test_descriptor_sizes() {
        let gib = |raw| DiskDescriptor::parse(raw).size_gib();
        assert_eq!(gib("s:v.qcow2,size=2048M"), Some(2));
        assert_eq!(gib("s:v.vmdk,size=1T"), Some(1024));
        assert_eq!(gib("s:v.raw,cache=none,size=16G,ssd=1"), Some(16));
        assert_eq!(gib("s:v.raw"), None);
        assert_eq!(gib("s:v.raw,size=notasize"), None);
    }
}
