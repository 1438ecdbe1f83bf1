//! Dispatch error taxonomy.
//!
//! Match outcomes (no zone, no taxi) are also available as typed values from
//! the matching engine; the variants here exist for callers that flatten them
//! into a `Result`.

use crate::domain::hail::HailStatus;
use crate::domain::types::{CustomerId, HailId, OperatorId, TaxiId};

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors raised by the dispatch core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Malformed or out-of-range input
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown taxi, hail or zone
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Requested move is not in the transition table
    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition { from: HailStatus, to: HailStatus },

    /// Entering this state needs a reason
    #[error("entering {to} requires a reason")]
    ReasonRequired { to: HailStatus },

    /// Hail already reached a terminal state
    #[error("hail {hail_id} is terminal ({status})")]
    AlreadyTerminal { hail_id: HailId, status: HailStatus },

    /// Caller's expected starting status no longer holds
    #[error("hail {hail_id} expected in {expected} but is {actual}")]
    ConcurrentModification { hail_id: HailId, expected: HailStatus, actual: HailStatus },

    /// No zone containing the pickup allows the operator
    #[error("no zone containing the pickup permits operator {0}")]
    NoZonePermitsOperator(OperatorId),

    /// Pickup inside an exclusion area the restricted operator may not serve
    #[error("pickup lies in an exclusion area closed to operator {0}")]
    PickupExcluded(OperatorId),

    /// Nothing matched within the maximum radius
    #[error("no taxi available")]
    NoTaxiAvailable,

    /// Taxi already bound to a non-terminal hail
    #[error("taxi {taxi_id} already has active hail {hail_id}")]
    TaxiBusy { taxi_id: TaxiId, hail_id: HailId },

    /// Customer still serving a ban from an earlier hail
    #[error("customer {customer_id} is banned until {until_ms}")]
    CustomerBanned { customer_id: CustomerId, until_ms: u64 },

    /// Invalid timeout rule or reference data
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DispatchError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        DispatchError::NotFound { kind, id: id.to_string() }
    }

    /// Lost races that background callers drop silently
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            DispatchError::ConcurrentModification { .. } | DispatchError::AlreadyTerminal { .. }
        )
    }
}
