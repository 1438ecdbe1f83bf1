//! Hail state machine: creation, guarded transitions, taxi binding
//!
//! Each hail lives in a `DashMap` entry; its entry lock serializes the
//! check-log-commit sequence of a transition. Callers that must not clobber a
//! concurrent change pass the status they observed (`TransitionRequest::expecting`)
//! and get `ConcurrentModification` when it no longer holds.
//!
//! Lock order is taxi binding then hail. Transitions take the hail lock alone
//! and release the taxi binding only after it is dropped. Events are queued
//! under the hail lock, so one hail's events reach the worker in log order.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::hail::{Hail, HailEvent, HailStatus, NewHail, TransitionLogEntry};
use crate::domain::types::{Actor, HailId, SessionId, TaxiId};
use crate::infra::metrics::Metrics;
use crate::io::event_channel::HailEventSender;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, info};

/// A requested move, built with `new` and refined with the builder methods
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub hail_id: HailId,
    pub to: HailStatus,
    pub actor: Actor,
    pub reason: Option<String>,
    pub expected: Option<HailStatus>,
}

impl TransitionRequest {
    pub fn new(hail_id: HailId, to: HailStatus, actor: Actor) -> Self {
        Self { hail_id, to, actor, reason: None, expected: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Only apply if the hail is still in `status`
    pub fn expecting(mut self, status: HailStatus) -> Self {
        self.expected = Some(status);
        self
    }
}

/// A live hail's id, status and time of entering that status
#[derive(Debug, Clone, PartialEq)]
pub struct HailSnapshot {
    pub hail_id: HailId,
    pub status: HailStatus,
    pub entered_at_ms: u64,
}

pub struct HailMachine {
    hails: DashMap<HailId, Hail>,
    /// Taxi -> its single non-terminal hail
    active_by_taxi: DashMap<TaxiId, HailId>,
    sessions: DashMap<SessionId, SmallVec<[HailId; 2]>>,
    events: Option<HailEventSender>,
    metrics: Arc<Metrics>,
}

impl HailMachine {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            hails: DashMap::new(),
            active_by_taxi: DashMap::new(),
            sessions: DashMap::new(),
            events: None,
            metrics,
        }
    }

    /// Publish committed transitions to the notification worker
    pub fn with_events(mut self, events: HailEventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Create a hail in `emitted`, bound to its taxi
    pub fn create(&self, params: NewHail, actor: Actor, now_ms: u64) -> DispatchResult<Hail> {
        let taxi_id = params.taxi_id.clone();
        let session_id = params.session_id.clone();

        let hail = match self.active_by_taxi.entry(taxi_id.clone()) {
            Entry::Occupied(mut bound) => {
                let still_active = self
                    .hails
                    .get(bound.get())
                    .map_or(false, |existing| !existing.is_terminal());
                if still_active {
                    return Err(DispatchError::TaxiBusy {
                        taxi_id,
                        hail_id: bound.get().clone(),
                    });
                }
                let hail = Hail::new(HailId::generate(), params, actor, now_ms);
                self.hails.insert(hail.id().clone(), hail.clone());
                bound.insert(hail.id().clone());
                hail
            }
            Entry::Vacant(vacant) => {
                let hail = Hail::new(HailId::generate(), params, actor, now_ms);
                self.hails.insert(hail.id().clone(), hail.clone());
                vacant.insert(hail.id().clone());
                hail
            }
        };

        self.sessions.entry(session_id).or_default().push(hail.id().clone());
        self.metrics.record_hail_created();
        info!(
            hail_id = %hail.id(),
            taxi_id = %hail.taxi_id(),
            operator = %hail.operator_id(),
            session_id = %hail.session_id(),
            "hail_created"
        );
        Ok(hail)
    }

    /// Apply a transition atomically and return the updated hail
    pub fn transition(&self, request: TransitionRequest, now_ms: u64) -> DispatchResult<Hail> {
        let TransitionRequest { hail_id, to, actor, reason, expected } = request;

        let (snapshot, event) = {
            let mut hail = self
                .hails
                .get_mut(&hail_id)
                .ok_or_else(|| DispatchError::not_found("hail", &hail_id))?;

            if let Err(e) = hail.check_transition(to, expected, reason.as_deref()) {
                if matches!(e, DispatchError::ConcurrentModification { .. }) {
                    self.metrics.record_transition_conflict();
                } else {
                    self.metrics.record_transition_rejected();
                }
                return Err(e);
            }

            let entry = hail.record(to, actor, reason, now_ms).clone();
            let event = HailEvent::from_entry(&hail, &entry);
            // Queue order must follow log order for this hail
            if let Some(events) = &self.events {
                events.send(event.clone());
            }
            (hail.clone(), event)
        };

        if to.is_terminal() {
            self.active_by_taxi.remove_if(snapshot.taxi_id(), |_, bound| bound == &hail_id);
        }

        self.metrics.record_transition();
        info!(
            hail_id = %hail_id,
            from = %event.from,
            to = %event.to,
            actor = %event.actor,
            reason = event.reason.as_deref().unwrap_or(""),
            "hail_transition"
        );
        Ok(snapshot)
    }

    pub fn get(&self, hail_id: &HailId) -> DispatchResult<Hail> {
        self.hails
            .get(hail_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| DispatchError::not_found("hail", hail_id))
    }

    pub fn status(&self, hail_id: &HailId) -> DispatchResult<HailStatus> {
        self.hails
            .get(hail_id)
            .map(|h| h.status())
            .ok_or_else(|| DispatchError::not_found("hail", hail_id))
    }

    pub fn transition_log(&self, hail_id: &HailId) -> DispatchResult<Vec<TransitionLogEntry>> {
        self.hails
            .get(hail_id)
            .map(|h| h.log().to_vec())
            .ok_or_else(|| DispatchError::not_found("hail", hail_id))
    }

    /// Record the phone number an operator returned for the assigned taxi
    pub fn set_taxi_phone_number(&self, hail_id: &HailId, phone: String) -> DispatchResult<()> {
        let mut hail = self
            .hails
            .get_mut(hail_id)
            .ok_or_else(|| DispatchError::not_found("hail", hail_id))?;
        hail.set_taxi_phone_number(phone);
        Ok(())
    }

    pub fn active_hail_for_taxi(&self, taxi_id: &TaxiId) -> Option<HailId> {
        self.active_by_taxi.get(taxi_id).map(|h| h.value().clone())
    }

    /// Hails issued from one customer session, oldest first
    pub fn hails_for_session(&self, session_id: &SessionId) -> Vec<HailId> {
        self.sessions.get(session_id).map(|ids| ids.to_vec()).unwrap_or_default()
    }

    /// Live hails currently in one of `statuses`
    pub fn hails_in(&self, statuses: &[HailStatus]) -> Vec<HailSnapshot> {
        self.hails
            .iter()
            .filter(|h| statuses.contains(&h.status()))
            .map(|h| HailSnapshot {
                hail_id: h.id().clone(),
                status: h.status(),
                entered_at_ms: h.entered_status_at_ms(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hails.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active_by_taxi.len()
    }

    /// Remove and return terminal hails that reached their final state at or before `cutoff_ms`
    pub fn drain_terminal(&self, cutoff_ms: u64) -> Vec<Hail> {
        let mut drained = Vec::new();
        self.hails.retain(|_, hail| {
            if hail.is_terminal() && hail.entered_status_at_ms() <= cutoff_ms {
                drained.push(hail.clone());
                false
            } else {
                true
            }
        });
        for hail in &drained {
            if let Entry::Occupied(mut ids) = self.sessions.entry(hail.session_id().clone()) {
                ids.get_mut().retain(|id| id != hail.id());
                if ids.get().is_empty() {
                    ids.remove();
                }
            }
        }
        if !drained.is_empty() {
            debug!(drained = %drained.len(), remaining = %self.hails.len(), "terminal_hails_drained");
        }
        drained
    }

    /// Redeliver side effects parked while the queue was full
    pub fn flush_pending_events(&self) -> usize {
        self.events.as_ref().map_or(0, HailEventSender::flush_outbox)
    }
}
