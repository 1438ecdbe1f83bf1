//! Hail lifecycle model
//!
//! A hail moves through a fixed set of states. Every legal move is listed in
//! one table (`HailStatus::table_targets` plus the escape states reachable from
//! any live state), so the state machine, the timeout rules and the tests all
//! read the same source of truth.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::types::{
    Actor, CustomerId, GeoPoint, HailId, OperatorId, SessionId, TaxiId, TaxiStatus,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hail lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HailStatus {
    Emitted,
    Received,
    SentToOperator,
    ReceivedByOperator,
    ReceivedByTaxi,
    AcceptedByTaxi,
    DeclinedByTaxi,
    TimeoutTaxi,
    IncidentTaxi,
    AcceptedByCustomer,
    DeclinedByCustomer,
    TimeoutAcceptedByCustomer,
    CustomerBanned,
    CustomerOnBoard,
    Finished,
    IncidentCustomer,
    Failure,
    OutdatedCustomer,
    OutdatedTaxi,
}

/// States reachable from every non-terminal state
const ESCAPE_TARGETS: [HailStatus; 4] = [
    HailStatus::IncidentCustomer,
    HailStatus::Failure,
    HailStatus::OutdatedCustomer,
    HailStatus::OutdatedTaxi,
];

impl HailStatus {
    pub const ALL: [HailStatus; 19] = [
        HailStatus::Emitted,
        HailStatus::Received,
        HailStatus::SentToOperator,
        HailStatus::ReceivedByOperator,
        HailStatus::ReceivedByTaxi,
        HailStatus::AcceptedByTaxi,
        HailStatus::DeclinedByTaxi,
        HailStatus::TimeoutTaxi,
        HailStatus::IncidentTaxi,
        HailStatus::AcceptedByCustomer,
        HailStatus::DeclinedByCustomer,
        HailStatus::TimeoutAcceptedByCustomer,
        HailStatus::CustomerBanned,
        HailStatus::CustomerOnBoard,
        HailStatus::Finished,
        HailStatus::IncidentCustomer,
        HailStatus::Failure,
        HailStatus::OutdatedCustomer,
        HailStatus::OutdatedTaxi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HailStatus::Emitted => "emitted",
            HailStatus::Received => "received",
            HailStatus::SentToOperator => "sent_to_operator",
            HailStatus::ReceivedByOperator => "received_by_operator",
            HailStatus::ReceivedByTaxi => "received_by_taxi",
            HailStatus::AcceptedByTaxi => "accepted_by_taxi",
            HailStatus::DeclinedByTaxi => "declined_by_taxi",
            HailStatus::TimeoutTaxi => "timeout_taxi",
            HailStatus::IncidentTaxi => "incident_taxi",
            HailStatus::AcceptedByCustomer => "accepted_by_customer",
            HailStatus::DeclinedByCustomer => "declined_by_customer",
            HailStatus::TimeoutAcceptedByCustomer => "timeout_accepted_by_customer",
            HailStatus::CustomerBanned => "customer_banned",
            HailStatus::CustomerOnBoard => "customer_on_board",
            HailStatus::Finished => "finished",
            HailStatus::IncidentCustomer => "incident_customer",
            HailStatus::Failure => "failure",
            HailStatus::OutdatedCustomer => "outdated_customer",
            HailStatus::OutdatedTaxi => "outdated_taxi",
        }
    }

    /// Table-specific targets (escape states excluded)
    pub fn table_targets(&self) -> &'static [HailStatus] {
        use HailStatus::*;
        match self {
            Emitted => &[Received],
            Received => &[SentToOperator],
            SentToOperator => &[ReceivedByOperator],
            ReceivedByOperator => &[ReceivedByTaxi],
            ReceivedByTaxi => &[AcceptedByTaxi, DeclinedByTaxi, TimeoutTaxi, IncidentTaxi],
            AcceptedByTaxi => &[
                AcceptedByCustomer,
                DeclinedByCustomer,
                TimeoutAcceptedByCustomer,
                CustomerBanned,
            ],
            AcceptedByCustomer => &[CustomerOnBoard],
            CustomerOnBoard => &[Finished],
            _ => &[],
        }
    }

    /// The one state whose table move leads here, if any
    pub fn table_source(&self) -> Option<HailStatus> {
        HailStatus::ALL
            .iter()
            .copied()
            .find(|from| from.table_targets().contains(self))
    }

    pub fn is_terminal(&self) -> bool {
        use HailStatus::*;
        matches!(
            self,
            DeclinedByTaxi
                | TimeoutTaxi
                | IncidentTaxi
                | DeclinedByCustomer
                | TimeoutAcceptedByCustomer
                | CustomerBanned
                | Finished
                | IncidentCustomer
                | Failure
                | OutdatedCustomer
                | OutdatedTaxi
        )
    }

    /// Whether the table permits `self -> to`
    pub fn can_transition_to(&self, to: HailStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.table_targets().contains(&to) || ESCAPE_TARGETS.contains(&to)
    }

    /// Entering these states must carry a human-readable reason
    pub fn requires_reason(&self) -> bool {
        matches!(
            self,
            HailStatus::IncidentTaxi
                | HailStatus::IncidentCustomer
                | HailStatus::DeclinedByTaxi
                | HailStatus::DeclinedByCustomer
                | HailStatus::Failure
        )
    }

    /// Taxi availability forced when a hail enters this state
    pub fn taxi_status_on_entry(&self) -> Option<TaxiStatus> {
        use HailStatus::*;
        match self {
            Received => Some(TaxiStatus::Answering),
            AcceptedByCustomer => Some(TaxiStatus::Oncoming),
            CustomerOnBoard => Some(TaxiStatus::Occupied),
            DeclinedByTaxi | TimeoutTaxi => Some(TaxiStatus::Off),
            DeclinedByCustomer
            | TimeoutAcceptedByCustomer
            | CustomerBanned
            | IncidentTaxi
            | IncidentCustomer
            | Finished
            | Failure => Some(TaxiStatus::Free),
            _ => None,
        }
    }
}

impl fmt::Display for HailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HailStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HailStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DispatchError::Validation(format!("unknown hail status {s:?}")))
    }
}

/// One entry of a hail's append-only history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    #[serde(rename = "from_status")]
    pub from: Option<HailStatus>,
    #[serde(rename = "to_status")]
    pub to: HailStatus,
    #[serde(rename = "timestamp")]
    pub at_ms: u64,
    pub actor: Actor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Parameters for a new hail
#[derive(Debug, Clone)]
pub struct NewHail {
    pub taxi_id: TaxiId,
    pub operator_id: OperatorId,
    pub customer_id: CustomerId,
    pub session_id: SessionId,
    pub pickup: GeoPoint,
    pub initial_taxi_position: Option<GeoPoint>,
}

/// A ride request bound to one taxi
///
/// Status and log are private so the log's last `to_status` always equals the
/// current status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hail {
    id: HailId,
    taxi_id: TaxiId,
    operator_id: OperatorId,
    customer_id: CustomerId,
    session_id: SessionId,
    pickup: GeoPoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_taxi_position: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    taxi_phone_number: Option<String>,
    status: HailStatus,
    created_at_ms: u64,
    log: Vec<TransitionLogEntry>,
}

impl Hail {
    /// Create a hail in `emitted`, with the creation as first log entry
    pub fn new(id: HailId, params: NewHail, actor: Actor, now_ms: u64) -> Self {
        Self {
            id,
            taxi_id: params.taxi_id,
            operator_id: params.operator_id,
            customer_id: params.customer_id,
            session_id: params.session_id,
            pickup: params.pickup,
            initial_taxi_position: params.initial_taxi_position,
            taxi_phone_number: None,
            status: HailStatus::Emitted,
            created_at_ms: now_ms,
            log: vec![TransitionLogEntry {
                from: None,
                to: HailStatus::Emitted,
                at_ms: now_ms,
                actor,
                reason: None,
            }],
        }
    }

    pub fn id(&self) -> &HailId {
        &self.id
    }

    pub fn taxi_id(&self) -> &TaxiId {
        &self.taxi_id
    }

    pub fn operator_id(&self) -> &OperatorId {
        &self.operator_id
    }

    pub fn customer_id(&self) -> &CustomerId {
        &self.customer_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn pickup(&self) -> GeoPoint {
        self.pickup
    }

    pub fn initial_taxi_position(&self) -> Option<GeoPoint> {
        self.initial_taxi_position
    }

    pub fn taxi_phone_number(&self) -> Option<&str> {
        self.taxi_phone_number.as_deref()
    }

    pub fn status(&self) -> HailStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn log(&self) -> &[TransitionLogEntry] {
        &self.log
    }

    /// When the hail entered its current status
    pub fn entered_status_at_ms(&self) -> u64 {
        self.log.last().map_or(self.created_at_ms, |entry| entry.at_ms)
    }

    pub(crate) fn set_taxi_phone_number(&mut self, phone: String) {
        self.taxi_phone_number = Some(phone);
    }

    /// Check a requested move against the table and the caller's expectation.
    ///
    /// Checks run in a fixed order: terminal, expected status, table, reason.
    /// Without an expectation, a table move whose source state the hail has
    /// already passed through means another writer got there first, and is
    /// reported as `ConcurrentModification` against that source.
    pub fn check_transition(
        &self,
        to: HailStatus,
        expected: Option<HailStatus>,
        reason: Option<&str>,
    ) -> DispatchResult<()> {
        if self.status.is_terminal() {
            return Err(DispatchError::AlreadyTerminal {
                hail_id: self.id.clone(),
                status: self.status,
            });
        }
        if let Some(expected) = expected {
            if expected != self.status {
                return Err(DispatchError::ConcurrentModification {
                    hail_id: self.id.clone(),
                    expected,
                    actual: self.status,
                });
            }
        }
        if !self.status.can_transition_to(to) {
            if expected.is_none() {
                if let Some(source) = self.passed_through_source_of(to) {
                    return Err(DispatchError::ConcurrentModification {
                        hail_id: self.id.clone(),
                        expected: source,
                        actual: self.status,
                    });
                }
            }
            return Err(DispatchError::InvalidTransition { from: self.status, to });
        }
        if to.requires_reason() && reason.map_or(true, |r| r.trim().is_empty()) {
            return Err(DispatchError::ReasonRequired { to });
        }
        Ok(())
    }

    fn passed_through_source_of(&self, to: HailStatus) -> Option<HailStatus> {
        let source = to.table_source()?;
        (source != self.status && self.log.iter().any(|entry| entry.to == source)).then_some(source)
    }

    /// Append the log entry and move to `to`; callers validate first.
    ///
    /// Timestamps never go backwards within one log.
    pub(crate) fn record(
        &mut self,
        to: HailStatus,
        actor: Actor,
        reason: Option<String>,
        now_ms: u64,
    ) -> &TransitionLogEntry {
        let at_ms = now_ms.max(self.entered_status_at_ms());
        self.log.push(TransitionLogEntry { from: Some(self.status), to, at_ms, actor, reason });
        self.status = to;
        &self.log[self.log.len() - 1]
    }
}

/// Committed transition, published while the per-hail lock is held
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HailEvent {
    pub hail_id: HailId,
    pub taxi_id: TaxiId,
    pub operator_id: OperatorId,
    pub customer_id: CustomerId,
    pub from: HailStatus,
    pub to: HailStatus,
    pub at_ms: u64,
    pub actor: Actor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HailEvent {
    pub fn from_entry(hail: &Hail, entry: &TransitionLogEntry) -> Self {
        Self {
            hail_id: hail.id.clone(),
            taxi_id: hail.taxi_id.clone(),
            operator_id: hail.operator_id.clone(),
            customer_id: hail.customer_id.clone(),
            from: entry.from.unwrap_or(HailStatus::Emitted),
            to: entry.to,
            at_ms: entry.at_ms,
            actor: entry.actor.clone(),
            reason: entry.reason.clone(),
        }
    }
}
