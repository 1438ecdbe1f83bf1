//! Customer sessions: which operator's customer owns a session id, and which
//! session a returning customer should keep using

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::types::{CustomerId, OperatorId, SessionId};
use dashmap::DashMap;
use tracing::debug;

/// 5 minutes
pub const DEFAULT_SESSION_REUSE_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOwner {
    pub operator_id: OperatorId,
    pub customer_id: CustomerId,
    pub last_hail_ms: u64,
}

pub struct SessionTracker {
    owners: DashMap<SessionId, SessionOwner>,
    /// Most recent session per (operator, customer)
    latest: DashMap<(OperatorId, CustomerId), SessionId>,
    reuse_window_ms: u64,
}

impl SessionTracker {
    pub fn new(reuse_window_ms: u64) -> Self {
        Self { owners: DashMap::new(), latest: DashMap::new(), reuse_window_ms }
    }

    /// Session for a new hail request.
    ///
    /// A supplied id must already belong to this operator's customer. Without
    /// one, a customer who hailed within the reuse window keeps that session,
    /// anyone else gets a fresh id.
    pub fn resolve(
        &self,
        operator: &OperatorId,
        customer: &CustomerId,
        supplied: Option<SessionId>,
        now_ms: u64,
    ) -> DispatchResult<SessionId> {
        if let Some(session_id) = supplied {
            let owner = self
                .owners
                .get(&session_id)
                .filter(|owner| owner.operator_id == *operator)
                .ok_or_else(|| DispatchError::Validation(format!("session {session_id} does not exist")))?;
            if owner.customer_id != *customer {
                return Err(DispatchError::Validation(format!(
                    "session {session_id} is linked to another customer"
                )));
            }
            return Ok(session_id);
        }

        let key = (operator.clone(), customer.clone());
        let recent = self.latest.get(&key).and_then(|session_id| {
            self.owners
                .get(session_id.value())
                .filter(|owner| now_ms.saturating_sub(owner.last_hail_ms) <= self.reuse_window_ms)
                .map(|_| session_id.value().clone())
        });
        match recent {
            Some(session_id) => {
                debug!(session_id = %session_id, customer_id = %customer, "session_reused");
                Ok(session_id)
            }
            None => Ok(SessionId::generate()),
        }
    }

    /// Record that `session_id` issued a hail at `now_ms`
    pub fn touch(&self, session_id: &SessionId, operator: &OperatorId, customer: &CustomerId, now_ms: u64) {
        self.owners
            .entry(session_id.clone())
            .and_modify(|owner| owner.last_hail_ms = owner.last_hail_ms.max(now_ms))
            .or_insert_with(|| SessionOwner {
                operator_id: operator.clone(),
                customer_id: customer.clone(),
                last_hail_ms: now_ms,
            });
        self.latest.insert((operator.clone(), customer.clone()), session_id.clone());
    }

    pub fn owner(&self, session_id: &SessionId) -> Option<SessionOwner> {
        self.owners.get(session_id).map(|owner| owner.value().clone())
    }

    /// Forget sessions idle since before `cutoff_ms`; returns how many were removed
    pub fn prune_idle(&self, cutoff_ms: u64) -> usize {
        let before = self.owners.len();
        self.owners.retain(|_, owner| owner.last_hail_ms >= cutoff_ms);
        self.latest.retain(|_, session_id| self.owners.contains_key(session_id));
        before - self.owners.len()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
