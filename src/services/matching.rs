//! Candidate search for a pickup point and operator
//!
//! Zone permission is checked first. The search radius then starts at the
//! configured minimum and doubles up to the effective maximum while no taxi of
//! the operator is found.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::types::{GeoPoint, OperatorId};
use crate::domain::zone::ZonePrecedence;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::position_store::{Candidate, PositionRecord, PositionStore};
use crate::services::zone_index::{ZoneIndex, ZonePermit};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MatchSettings {
    pub min_radius_m: f64,
    pub default_max_radius_m: f64,
    pub max_results: usize,
    pub precedence: ZonePrecedence,
    /// Operators refused inside exclusion areas
    pub restricted_operators: FxHashSet<OperatorId>,
}

impl MatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_radius_m: config.min_radius_m(),
            default_max_radius_m: config.default_max_radius_m(),
            max_results: config.max_results(),
            precedence: config.zone_precedence(),
            restricted_operators: config.restricted_operators().cloned().collect(),
        }
    }
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            min_radius_m: 250.0,
            default_max_radius_m: 3000.0,
            max_results: 10,
            precedence: ZonePrecedence::AnyZone,
            restricted_operators: FxHashSet::default(),
        }
    }
}

/// Match request from a booking engine
#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub pickup: GeoPoint,
    pub operator: OperatorId,
    /// Caller's radius cap; the configured default applies when absent
    pub max_radius_m: Option<f64>,
}

/// Result of a candidate search
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Nearest first, ties by taxi id; never empty
    Candidates(Vec<Candidate>),
    NoZonePermitsOperator,
    NoTaxiAvailable,
    /// Pickup inside an exclusion area for a restricted operator
    PickupExcluded,
}

impl MatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOutcome::Candidates(_) => "candidates",
            MatchOutcome::NoZonePermitsOperator => "no_zone_permits_operator",
            MatchOutcome::NoTaxiAvailable => "no_taxi_available",
            MatchOutcome::PickupExcluded => "pickup_excluded",
        }
    }

    /// Flatten into the error taxonomy for callers that want a `Result`
    pub fn into_result(self, operator: &OperatorId) -> DispatchResult<Vec<Candidate>> {
        match self {
            MatchOutcome::Candidates(candidates) => Ok(candidates),
            MatchOutcome::NoZonePermitsOperator => Err(DispatchError::NoZonePermitsOperator(operator.clone())),
            MatchOutcome::PickupExcluded => Err(DispatchError::PickupExcluded(operator.clone())),
            MatchOutcome::NoTaxiAvailable => Err(DispatchError::NoTaxiAvailable),
        }
    }
}

pub struct MatchingEngine {
    positions: Arc<PositionStore>,
    zones: Arc<ZoneIndex>,
    settings: MatchSettings,
    metrics: Arc<Metrics>,
}

impl MatchingEngine {
    pub fn new(
        positions: Arc<PositionStore>,
        zones: Arc<ZoneIndex>,
        settings: MatchSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { positions, zones, settings, metrics }
    }

    pub fn settings(&self) -> &MatchSettings {
        &self.settings
    }

    pub fn find_candidates(&self, request: &MatchRequest, now_ms: u64) -> DispatchResult<MatchOutcome> {
        self.find_candidates_where(request, now_ms, |_| true)
    }

    /// Like `find_candidates`, skipping taxis rejected by `eligible`.
    ///
    /// The filter runs inside the proximity query, before truncation to
    /// `max_results` and before the radius stops growing.
    pub fn find_candidates_where<F>(
        &self,
        request: &MatchRequest,
        now_ms: u64,
        eligible: F,
    ) -> DispatchResult<MatchOutcome>
    where
        F: Fn(&PositionRecord) -> bool,
    {
        if let Some(radius) = request.max_radius_m {
            if !radius.is_finite() || radius <= 0.0 {
                return Err(DispatchError::Validation(format!("invalid max radius {radius}")));
            }
        }

        let start = Instant::now();
        let outcome = self.search(request, now_ms, &eligible);
        self.metrics.record_match(start.elapsed().as_micros() as u64);

        match &outcome {
            MatchOutcome::Candidates(found) => {
                debug!(
                    operator = %request.operator,
                    pickup = %request.pickup,
                    candidates = %found.len(),
                    nearest_m = format!("{:.0}", found[0].distance_m),
                    "match_found"
                );
            }
            MatchOutcome::NoZonePermitsOperator => self.metrics.record_match_no_zone(),
            MatchOutcome::NoTaxiAvailable => self.metrics.record_match_no_taxi(),
            MatchOutcome::PickupExcluded => self.metrics.record_match_excluded(),
        }
        if !matches!(outcome, MatchOutcome::Candidates(_)) {
            debug!(operator = %request.operator, pickup = %request.pickup, outcome = outcome.as_str(), "match_empty");
        }
        Ok(outcome)
    }

    fn search<F>(&self, request: &MatchRequest, now_ms: u64, eligible: &F) -> MatchOutcome
    where
        F: Fn(&PositionRecord) -> bool,
    {
        if self.settings.restricted_operators.contains(&request.operator)
            && self.zones.is_excluded(request.pickup)
        {
            return MatchOutcome::PickupExcluded;
        }

        let zone_cap = match self.zones.permits(request.pickup, &request.operator, self.settings.precedence) {
            ZonePermit::Allowed { max_distance_m, .. } => max_distance_m,
            ZonePermit::OutsideZones | ZonePermit::Denied => {
                return MatchOutcome::NoZonePermitsOperator;
            }
        };

        let mut cap = request
            .max_radius_m
            .unwrap_or(self.settings.default_max_radius_m)
            .min(self.settings.default_max_radius_m);
        if let Some(zone_cap) = zone_cap {
            cap = cap.min(zone_cap);
        }
        if cap <= 0.0 {
            return MatchOutcome::NoTaxiAvailable;
        }

        let mut radius = self.settings.min_radius_m.max(1.0).min(cap);
        loop {
            let found = self.positions.query_near_where(
                request.pickup,
                radius,
                self.settings.max_results,
                now_ms,
                |record| record.operator_id == request.operator && eligible(record),
            );
            if !found.is_empty() {
                return MatchOutcome::Candidates(found);
            }
            if radius >= cap {
                return MatchOutcome::NoTaxiAvailable;
            }
            radius = (radius * 2.0).min(cap);
        }
    }
}
