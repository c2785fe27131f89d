// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compute resource quantities used by quota accounting and VM sizing.

use serde::Deserialize;
use serde::Serialize;

/// A triple of compute quantities: CPU cores, memory in MiB, and disk
/// storage in GiB
///
/// Used both for a VM's requested footprint and for per-tenant quota
/// accounting.  The units are fixed here rather than carried per-value:
/// the backend expresses memory in MiB and disk sizes in GiB, and the
/// ledger only ever compares like with like.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct Resources {
    pub cpu_cores: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
}

impl Resources {
    pub fn new(cpu_cores: u32, memory_mib: u64, disk_gib: u64) -> Resources {
        Resources { cpu_cores, memory_mib, disk_gib }
    }

    /// Component-wise sum.  Quota limits are far below integer range;
    /// saturating keeps the ledger well-defined even on nonsense input.
    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores.saturating_add(other.cpu_cores),
            memory_mib: self.memory_mib.saturating_add(other.memory_mib),
            disk_gib: self.disk_gib.saturating_add(other.disk_gib),
        }
    }

    /// Component-wise difference, floored at zero per dimension
    ///
    /// This is the reclaim rule: returning more than is currently
    /// recorded never drives a ledger field negative.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
            memory_mib: self.memory_mib.saturating_sub(other.memory_mib),
            disk_gib: self.disk_gib.saturating_sub(other.disk_gib),
        }
    }

    /// Returns true if every dimension of `self` is within `limit`
    pub fn fits_within(&self, limit: &Resources) -> bool {
        self.cpu_cores <= limit.cpu_cores
            && self.memory_mib <= limit.memory_mib
            && self.disk_gib <= limit.disk_gib
    }

    /// Returns true if any dimension is zero
    pub fn any_zero(&self) -> bool {
        self.cpu_cores == 0 || self.memory_mib == 0 || self.disk_gib == 0
    }

    pub const ZERO: Resources =
        Resources { cpu_cores: 0, memory_mib: 0, disk_gib: 0 };
}
