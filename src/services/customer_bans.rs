//! Customer bans issued when a hail ends in `customer_banned`
//!
//! A first ban lasts `base_ms`. A ban issued while another is still running
//! extends it by its current length, so repeat offenders double each time.
//! Bans are keyed by the hail that caused them, so a redelivered event does
//! not extend the ban twice.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::types::{CustomerId, HailId};
use crate::infra::metrics::Metrics;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// 24 hours
pub const DEFAULT_BAN_MS: u64 = 24 * 3600 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ban {
    pub begin_ms: u64,
    pub end_ms: u64,
    /// Hail whose outcome last set or extended the ban
    pub hail_id: HailId,
}

pub struct CustomerBans {
    bans: DashMap<CustomerId, Ban>,
    base_ms: u64,
    metrics: Arc<Metrics>,
}

impl CustomerBans {
    pub fn new(base_ms: u64, metrics: Arc<Metrics>) -> Self {
        Self { bans: DashMap::new(), base_ms: base_ms.max(1), metrics }
    }

    /// Ban `customer` for the outcome of `hail_id`; returns the ban end
    pub fn ban(&self, customer: &CustomerId, hail_id: &HailId, now_ms: u64) -> u64 {
        let mut entry = self.bans.entry(customer.clone()).or_insert_with(|| Ban {
            begin_ms: now_ms,
            end_ms: now_ms,
            hail_id: hail_id.clone(),
        });
        let ban = entry.value_mut();

        if ban.hail_id == *hail_id && ban.end_ms > ban.begin_ms {
            debug!(customer_id = %customer, hail_id = %hail_id, "customer_ban_already_applied");
            return ban.end_ms;
        }

        if ban.end_ms > now_ms && ban.end_ms > ban.begin_ms {
            ban.end_ms += ban.end_ms - ban.begin_ms;
        } else {
            ban.begin_ms = now_ms;
            ban.end_ms = now_ms + self.base_ms;
        }
        ban.hail_id = hail_id.clone();

        self.metrics.record_customer_banned();
        info!(
            customer_id = %customer,
            hail_id = %hail_id,
            until_ms = %ban.end_ms,
            duration_ms = %(ban.end_ms - ban.begin_ms),
            "customer_banned"
        );
        ban.end_ms
    }

    /// Lift a ban; false if none was recorded
    pub fn lift(&self, customer: &CustomerId) -> bool {
        let lifted = self.bans.remove(customer).is_some();
        if lifted {
            info!(customer_id = %customer, "customer_ban_lifted");
        }
        lifted
    }

    /// End of the running ban, if any
    pub fn banned_until(&self, customer: &CustomerId, now_ms: u64) -> Option<u64> {
        self.bans
            .get(customer)
            .map(|ban| ban.end_ms)
            .filter(|end_ms| *end_ms > now_ms)
    }

    /// Refuse a new hail request from a banned customer
    pub fn check(&self, customer: &CustomerId, now_ms: u64) -> DispatchResult<()> {
        match self.banned_until(customer, now_ms) {
            Some(until_ms) => {
                self.metrics.record_hail_refused_banned();
                debug!(customer_id = %customer, until_ms = %until_ms, "hail_refused_customer_banned");
                Err(DispatchError::CustomerBanned { customer_id: customer.clone(), until_ms })
            }
            None => Ok(()),
        }
    }

    pub fn get(&self, customer: &CustomerId) -> Option<Ban> {
        self.bans.get(customer).map(|ban| ban.value().clone())
    }

    /// Forget bans that ended before `now_ms`; returns how many were removed
    pub fn prune_expired(&self, now_ms: u64) -> usize {
        let before = self.bans.len();
        self.bans.retain(|_, ban| ban.end_ms > now_ms);
        before - self.bans.len()
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}
