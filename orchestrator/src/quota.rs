// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-tenant compute quota ledger
//!
//! Tracks consumed CPU/memory/storage (and VM count) per tenant against
//! an immutable [`QuotaPlan`].  Admission works as a reservation: the
//! availability check and the hold are taken under one ledger lock, so
//! two concurrent pipelines for the same tenant cannot both pass the
//! check and overshoot the aggregate cap.  A [`Reservation`] is either
//! committed (on full pipeline success) or released — explicitly, or by
//! being dropped on any early-error path.
//!
//! Reclaim is separate from release: it subtracts confirmed-deleted
//! resources from `used`, floored at zero per dimension.

use anvil_common::Error;
use anvil_common::Resources;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use uuid::Uuid;

/// Immutable quota reference data for a tenant
///
/// `per_vm` bounds any single request; `aggregate` bounds the tenant's
/// total footprint; `max_vms` bounds how many VMs the tenant may hold
/// at once.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct QuotaPlan {
    pub name: String,
    pub per_vm: Resources,
    pub aggregate: Resources,
    pub max_vms: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct TenantUsage {
    used: Resources,
    reserved: Resources,
    vms_used: u32,
    vms_reserved: u32,
}

/// Live per-tenant resource accounting.
pub struct QuotaLedger {
    log: Logger,
    tenants: Mutex<BTreeMap<Uuid, TenantUsage>>,
}

impl fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("tenants", &self.tenants)
            .finish_non_exhaustive()
    }
}

impl QuotaLedger {
    pub fn new(log: &Logger) -> Arc<QuotaLedger> {
        Arc::new(QuotaLedger {
            log: log.new(o!("component" => "QuotaLedger")),
            tenants: Mutex::new(BTreeMap::new()),
        })
    }

    /// Check availability and, if the request fits, hold the resources
    ///
    /// The returned [`Reservation`] keeps the hold until it is either
    /// committed or dropped.  Fails with [`Error::QuotaExceeded`] when
    /// the request exceeds the per-VM maxima or would push the tenant's
    /// held-plus-used footprint past the plan's aggregate maxima.
    pub fn reserve(
        self: &Arc<Self>,
        tenant_id: Uuid,
        plan: &QuotaPlan,
        requested: Resources,
    ) -> Result<Reservation, Error> {
        let mut tenants = self.tenants.lock().unwrap();
        let usage = tenants.entry(tenant_id).or_default();

        if !requested.fits_within(&plan.per_vm) {
            return Err(Error::quota_exceeded(&format!(
                "requested {:?} exceeds plan \"{}\" per-VM maximum {:?}",
                requested, plan.name, plan.per_vm
            )));
        }

        let held = usage.used.saturating_add(&usage.reserved);
        let would_be = held.saturating_add(&requested);
        if !would_be.fits_within(&plan.aggregate) {
            return Err(Error::quota_exceeded(&format!(
                "requested {:?} exceeds plan \"{}\" aggregate maximum {:?} \
                 (already held: {:?})",
                requested, plan.name, plan.aggregate, held
            )));
        }

        let vms_held = usage.vms_used + usage.vms_reserved;
        if vms_held + 1 > plan.max_vms {
            return Err(Error::quota_exceeded(&format!(
                "plan \"{}\" allows {} VMs; {} already held",
                plan.name, plan.max_vms, vms_held
            )));
        }

        usage.reserved = usage.reserved.saturating_add(&requested);
        usage.vms_reserved += 1;
        Ok(Reservation {
            ledger: Arc::clone(self),
            tenant_id,
            delta: requested,
            state: ReservationState::Held,
        })
    }

    /// Subtract a confirmed-deleted footprint from `used`, floored at
    /// zero per dimension.
    pub fn reclaim(&self, tenant_id: Uuid, delta: Resources) {
        let mut tenants = self.tenants.lock().unwrap();
        let usage = tenants.entry(tenant_id).or_default();
        let before = usage.used;
        usage.used = usage.used.saturating_sub(&delta);
        if usage.vms_used == 0 {
            warn!(self.log, "reclaim with no VMs on ledger";
                "tenant_id" => %tenant_id);
        }
        usage.vms_used = usage.vms_used.saturating_sub(1);
        info!(self.log, "reclaimed resources";
            "tenant_id" => %tenant_id,
            "delta" => ?delta,
            "used_before" => ?before,
            "used_after" => ?usage.used,
        );
    }

    /// Current committed usage for a tenant.
    pub fn used(&self, tenant_id: Uuid) -> Resources {
        self.tenants
            .lock()
            .unwrap()
            .get(&tenant_id)
            .map(|usage| usage.used)
            .unwrap_or(Resources::ZERO)
    }

    /// Current committed VM count for a tenant.
    pub fn vms_used(&self, tenant_id: Uuid) -> u32 {
        self.tenants
            .lock()
            .unwrap()
            .get(&tenant_id)
            .map(|usage| usage.vms_used)
            .unwrap_or(0)
    }

    fn settle(
        &self,
        tenant_id: Uuid,
        delta: &Resources,
        commit: bool,
    ) {
        let mut tenants = self.tenants.lock().unwrap();
        let usage = tenants.entry(tenant_id).or_default();
        usage.reserved = usage.reserved.saturating_sub(delta);
        usage.vms_reserved = usage.vms_reserved.saturating_sub(1);
        if commit {
            usage.used = usage.used.saturating_add(delta);
            usage.vms_used += 1;
            info!(self.log, "committed reservation";
                "tenant_id" => %tenant_id,
                "delta" => ?delta,
                "used" => ?usage.used,
            );
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReservationState {
    Held,
    Settled,
}

/// A held quota reservation
///
/// Commit on full pipeline success; anything else (explicit release or
/// drop on an error path) returns the hold to the tenant's available
/// headroom without touching `used`.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<QuotaLedger>,
    tenant_id: Uuid,
    delta: Resources,
    state: ReservationState,
}

impl Reservation {
    /// The resources this reservation holds.
    pub fn delta(&self) -> Resources {
        self.delta
    }

    /// Move the hold into committed usage.
    pub fn commit(mut self) {
        self.ledger.settle(self.tenant_id, &self.delta, true);
        self.state = ReservationState::Settled;
    }

    /// Drop the hold without committing.
    pub fn release(mut self) {
        self.ledger.settle(self.tenant_id, &self.delta, false);
        self.state = ReservationState::Settled;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.state == ReservationState::Held {
            self.ledger.settle(self.tenant_id, &self.delta, false);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anvil_common::dev;

    fn plan() -> QuotaPlan {
        QuotaPlan {
            name: "lab-default".to_string(),
            per_vm: Resources::new(4, 8192, 100),
            aggregate: Resources::new(8, 16384, 200),
            max_vms: 4,
        }
    }

    #[test]
    fn test_reserve_commit_adds_exactly_delta() {
        let log = dev::null_logger();
        let ledger = QuotaLedger::new(&log);
        let tenant = Uuid::new_v4();
        let before = ledger.used(tenant);

        let requested = Resources::new(2, 2048, 20);
        let reservation =
            ledger.reserve(tenant, &plan(), requested).unwrap();
        // Holds are not usage.
        assert_eq!(ledger.used(tenant), before);

        reservation.commit();
        assert_eq!(ledger.used(tenant), before.saturating_add(&requested));
        assert_eq!(ledger.vms_used(tenant), 1);
    }

    #[test]
    fn test_release_and_drop_leave_used_untouched() {
        let log = dev::null_logger();
        let ledger = QuotaLedger::new(&log);
        let tenant = Uuid::new_v4();
        let requested = Resources::new(2, 2048, 20);

        let reservation =
            ledger.reserve(tenant, &plan(), requested).unwrap();
        reservation.release();
        assert_eq!(ledger.used(tenant), Resources::ZERO);

        // Dropped (e.g. an early `?` return) behaves like release.
        {
            let _reservation =
                ledger.reserve(tenant, &plan(), requested).unwrap();
        }
        assert_eq!(ledger.used(tenant), Resources::ZERO);

        // The headroom really is back: the full aggregate fits again.
        let all = ledger
            .reserve(tenant, &plan(), Resources::new(4, 8192, 100))
            .unwrap();
        all.commit();
        assert_eq!(ledger.used(tenant), Resources::new(4, 8192, 100));
    }

    #[test]
    fn test_per_vm_maximum_rejected() {
        let log = dev::null_logger();
        let ledger = QuotaLedger::new(&log);
        let err = ledger
            .reserve(Uuid::new_v4(), &plan(), Resources::new(5, 1024, 10))
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));
    }

    #[test]
    fn test_aggregate_accounts_for_held_reservations() {
        let log = dev::null_logger();
        let ledger = QuotaLedger::new(&log);
        let tenant = Uuid::new_v4();

        // Two concurrent 3-core requests against an 8-core aggregate:
        // both fit.  A third does not, even though neither of the first
        // two has committed yet.
        let r1 = ledger
            .reserve(tenant, &plan(), Resources::new(3, 1024, 10))
            .unwrap();
        let r2 = ledger
            .reserve(tenant, &plan(), Resources::new(3, 1024, 10))
            .unwrap();
        let err = ledger
            .reserve(tenant, &plan(), Resources::new(3, 1024, 10))
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));

        drop(r1);
        drop(r2);
    }

    #[test]
    fn test_scenario_a_and_b() {
        let log = dev::null_logger();
        let ledger = QuotaLedger::new(&log);
        let tenant = Uuid::new_v4();

        // Aggregate available cpu = 4: a 2-core request passes.
        let mut p = plan();
        p.aggregate = Resources::new(4, 16384, 200);
        let r = ledger
            .reserve(tenant, &p, Resources::new(2, 1024, 10))
            .unwrap();
        r.release();

        // Aggregate available cpu = 1: a 2-core request is rejected and
        // the ledger is untouched.
        p.aggregate = Resources::new(1, 16384, 200);
        assert!(ledger
            .reserve(tenant, &p, Resources::new(2, 1024, 10))
            .is_err());
        assert_eq!(ledger.used(tenant), Resources::ZERO);
    }

    #[test]
    fn test_vm_count_limit() {
        let log = dev::null_logger();
        let ledger = QuotaLedger::new(&log);
        let tenant = Uuid::new_v4();
        let mut p = plan();
        p.max_vms = 1;

        let small = Resources::new(1, 512, 5);
        let r = ledger.reserve(tenant, &p, small).unwrap();
        r.commit();
        let err = ledger.reserve(tenant, &p, small).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));
    }

    #[test]
    fn test_reservation_renders_debug() {
        // `unwrap_err()` on reserve results needs `Reservation: Debug`,
        // which in turn formats the ledger it points back at.
        let log = dev::null_logger();
        let ledger = QuotaLedger::new(&log);
        let r = ledger
            .reserve(Uuid::new_v4(), &plan(), Resources::new(1, 512, 5))
            .unwrap();
        let rendered = format!("{:?}", r);
        assert!(rendered.contains("Reservation"));
        assert!(rendered.contains("QuotaLedger"));
        r.release();
    }

    #[test]
    fn test_reclaim_floors_at_zero() {
        let log = dev::null_logger();
        let ledger = QuotaLedger::new(&log);
        let tenant = Uuid::new_v4();

        let r = ledger
            .reserve(tenant, &plan(), Resources::new(2, 2048, 20))
            .unwrap();
        r.commit();

        // Reclaim more than is recorded: every field floors at zero.
        ledger.reclaim(tenant, Resources::new(4, 1024, 50));
        assert_eq!(ledger.used(tenant), Resources::new(0, 1024, 0));
        assert_eq!(ledger.vms_used(tenant), 0);

        ledger.reclaim(tenant, Resources::new(1, 2048, 1));
        assert_eq!(ledger.used(tenant), Resources::ZERO);
        assert_eq!(ledger.vms_used(tenant), 0);
    }
}
