//! Request-to-hail orchestration
//!
//! Turns a hail request into a hail bound to the nearest taxi that can take
//! it, and offers the caller-side transition path with bounded retries.
//! Banned customers are refused before matching; session ids are checked
//! against their owner or reused for a customer hailing again shortly.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::hail::{Hail, HailStatus, NewHail};
use crate::domain::types::{Actor, CustomerId, GeoPoint, HailId, OperatorId, SessionId};
use crate::infra::metrics::Metrics;
use crate::services::customer_bans::{CustomerBans, DEFAULT_BAN_MS};
use crate::services::hail_machine::{HailMachine, TransitionRequest};
use crate::services::matching::{MatchOutcome, MatchRequest, MatchingEngine};
use crate::services::position_store::PositionRecord;
use crate::services::sessions::{SessionTracker, DEFAULT_SESSION_REUSE_MS};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Hail request from a booking engine
#[derive(Debug, Clone, Deserialize)]
pub struct HailRequest {
    pub pickup_lat: f64,
    pub pickup_lon: f64,
    pub operator_id: OperatorId,
    pub customer_id: CustomerId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default, rename = "max_radius")]
    pub max_radius_m: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Hail created and moved to `received`
    Dispatched(Hail),
    NoZonePermitsOperator,
    NoTaxiAvailable,
    PickupExcluded,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Dispatched(_) => "dispatched",
            DispatchOutcome::NoZonePermitsOperator => "no_zone_permits_operator",
            DispatchOutcome::NoTaxiAvailable => "no_taxi_available",
            DispatchOutcome::PickupExcluded => "pickup_excluded",
        }
    }
}

pub struct Dispatcher {
    matching: Arc<MatchingEngine>,
    machine: Arc<HailMachine>,
    bans: Arc<CustomerBans>,
    sessions: SessionTracker,
    transition_retries: u32,
}

impl Dispatcher {
    pub fn new(matching: Arc<MatchingEngine>, machine: Arc<HailMachine>, transition_retries: u32) -> Self {
        Self {
            matching,
            machine,
            bans: Arc::new(CustomerBans::new(DEFAULT_BAN_MS, Arc::new(Metrics::new()))),
            sessions: SessionTracker::new(DEFAULT_SESSION_REUSE_MS),
            transition_retries,
        }
    }

    /// Share a ban table with the notification worker that fills it
    pub fn with_customer_bans(mut self, bans: Arc<CustomerBans>) -> Self {
        self.bans = bans;
        self
    }

    pub fn with_session_reuse_ms(mut self, reuse_window_ms: u64) -> Self {
        self.sessions = SessionTracker::new(reuse_window_ms);
        self
    }

    pub fn machine(&self) -> &Arc<HailMachine> {
        &self.machine
    }

    pub fn customer_bans(&self) -> &Arc<CustomerBans> {
        &self.bans
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    /// Lift a customer's ban; false if none was recorded
    pub fn lift_customer_ban(&self, customer_id: &CustomerId) -> bool {
        self.bans.lift(customer_id)
    }

    /// Match the pickup and bind a hail to the nearest candidate not engaged in another hail
    pub fn request_hail(&self, request: HailRequest, now_ms: u64) -> DispatchResult<DispatchOutcome> {
        let pickup = GeoPoint::new(request.pickup_lat, request.pickup_lon)?;
        if request.customer_id.as_str().is_empty() {
            return Err(DispatchError::Validation("empty customer id".to_string()));
        }
        self.bans.check(&request.customer_id, now_ms)?;
        let session_id =
            self.sessions
                .resolve(&request.operator_id, &request.customer_id, request.session_id, now_ms)?;

        let match_request = MatchRequest {
            pickup,
            operator: request.operator_id.clone(),
            max_radius_m: request.max_radius_m,
        };
        // Bound taxis may still report free until the worker forces their status
        let unbound = |record: &PositionRecord| self.machine.active_hail_for_taxi(&record.taxi_id).is_none();
        let candidates = match self.matching.find_candidates_where(&match_request, now_ms, unbound)? {
            MatchOutcome::Candidates(candidates) => candidates,
            MatchOutcome::NoZonePermitsOperator => return Ok(DispatchOutcome::NoZonePermitsOperator),
            MatchOutcome::NoTaxiAvailable => return Ok(DispatchOutcome::NoTaxiAvailable),
            MatchOutcome::PickupExcluded => return Ok(DispatchOutcome::PickupExcluded),
        };

        let actor = Actor::Customer(request.customer_id.clone());

        for candidate in candidates {
            let params = NewHail {
                taxi_id: candidate.taxi_id.clone(),
                operator_id: request.operator_id.clone(),
                customer_id: request.customer_id.clone(),
                session_id: session_id.clone(),
                pickup,
                initial_taxi_position: Some(candidate.point),
            };
            let hail = match self.machine.create(params, actor.clone(), now_ms) {
                Ok(hail) => hail,
                Err(DispatchError::TaxiBusy { taxi_id, hail_id }) => {
                    debug!(taxi_id = %taxi_id, hail_id = %hail_id, "candidate_busy_skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let hail = self.machine.transition(
                TransitionRequest::new(hail.id().clone(), HailStatus::Received, actor)
                    .expecting(HailStatus::Emitted),
                now_ms,
            )?;
            self.sessions.touch(&session_id, &request.operator_id, &request.customer_id, now_ms);
            info!(
                hail_id = %hail.id(),
                taxi_id = %hail.taxi_id(),
                operator = %hail.operator_id(),
                session_id = %hail.session_id(),
                distance_m = %format!("{:.0}", candidate.distance_m),
                "hail_dispatched"
            );
            return Ok(DispatchOutcome::Dispatched(hail));
        }

        Ok(DispatchOutcome::NoTaxiAvailable)
    }

    /// Caller-side transition
    ///
    /// Without an explicit expectation the request is pinned to the status
    /// observed first. When another writer moves the hail meanwhile, the
    /// request is re-pinned, up to `transition_retries` times, only while the
    /// same move is still legal from the new status; otherwise the caller gets
    /// the `ConcurrentModification`. An explicit expectation is applied once.
    pub fn apply(&self, request: TransitionRequest, now_ms: u64) -> DispatchResult<Hail> {
        if request.expected.is_some() {
            return self.machine.transition(request, now_ms);
        }

        let mut base = self.machine.status(&request.hail_id)?;
        if !base.can_transition_to(request.to) {
            return self.machine.transition(request, now_ms);
        }

        let mut attempt = 0;
        loop {
            match self.machine.transition(request.clone().expecting(base), now_ms) {
                Err(DispatchError::ConcurrentModification { actual, .. })
                    if attempt < self.transition_retries && actual.can_transition_to(request.to) =>
                {
                    attempt += 1;
                    debug!(
                        hail_id = %request.hail_id,
                        attempt = %attempt,
                        from = %base,
                        now = %actual,
                        "transition_retry"
                    );
                    base = actual;
                }
                result => return result,
            }
        }
    }

    /// Customer cancellation
    pub fn cancel(
        &self,
        hail_id: &HailId,
        customer_id: &CustomerId,
        reason: impl Into<String>,
        now_ms: u64,
    ) -> DispatchResult<Hail> {
        let request = TransitionRequest::new(
            hail_id.clone(),
            HailStatus::IncidentCustomer,
            Actor::Customer(customer_id.clone()),
        )
        .with_reason(reason);
        self.apply(request, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::{MultiPolygon, Polygon};
    use crate::domain::types::{InseeCode, TaxiId, TaxiStatus, ZoneId};
    use crate::domain::zone::{TownDef, ZoneDef};
    use crate::infra::metrics::Metrics;
    use crate::services::matching::MatchSettings;
    use crate::services::position_store::PositionStore;
    use crate::services::zone_index::ZoneIndex;

    fn square(lat0: f64, lon0: f64, lat1: f64, lon1: f64) -> MultiPolygon {
        MultiPolygon {
            polygons: vec![Polygon::new(vec![vec![
                [lon0, lat0],
                [lon1, lat0],
                [lon1, lat1],
                [lon0, lat1],
                [lon0, lat0],
            ]])],
        }
    }

    struct Fixture {
        positions: Arc<PositionStore>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(Metrics::new());
        let positions = Arc::new(PositionStore::new(30_000, 300_000, 0.01, metrics.clone()));
        let zones = Arc::new(ZoneIndex::new());
        zones
            .rebuild(
                vec![ZoneDef {
                    id: ZoneId(1),
                    name: "paris".into(),
                    parent_id: None,
                    towns: vec![InseeCode::from("75056")],
                    operators: vec![OperatorId::from("op")],
                    priority: 0,
                    max_distance_m: None,
                }],
                vec![TownDef {
                    insee: InseeCode::from("75056"),
                    name: "Paris".into(),
                    shape: square(48.80, 2.25, 48.90, 2.45),
                }],
                vec![],
            )
            .unwrap();
        let matching = Arc::new(MatchingEngine::new(
            positions.clone(),
            zones,
            MatchSettings::default(),
            metrics.clone(),
        ));
        let machine = Arc::new(HailMachine::new(metrics));
        Fixture { positions, dispatcher: Dispatcher::new(matching, machine, 3) }
    }

    fn request(operator: &str) -> HailRequest {
        HailRequest {
            pickup_lat: 48.851,
            pickup_lon: 2.351,
            operator_id: OperatorId::from(operator),
            customer_id: CustomerId::from("c1"),
            session_id: None,
            max_radius_m: Some(500.0),
        }
    }

    #[test]
    fn test_dispatches_to_nearest_free_taxi() {
        let f = fixture();
        f.positions
            .report_position(TaxiId::from("t1"), OperatorId::from("op"), 48.85, 2.35, TaxiStatus::Free, 0)
            .unwrap();

        let outcome = f.dispatcher.request_hail(request("op"), 1_000).unwrap();
        let DispatchOutcome::Dispatched(hail) = outcome else {
            panic!("expected a hail, got {outcome:?}");
        };
        assert_eq!(hail.taxi_id().as_str(), "t1");
        assert_eq!(hail.status(), HailStatus::Received);
        assert!(hail.initial_taxi_position().is_some());
        assert_eq!(hail.log().len(), 2);
    }

    #[test]
    fn test_busy_taxi_is_skipped() {
        let f = fixture();
        f.positions
            .report_position(TaxiId::from("t1"), OperatorId::from("op"), 48.85, 2.35, TaxiStatus::Free, 0)
            .unwrap();
        assert!(matches!(
            f.dispatcher.request_hail(request("op"), 1_000).unwrap(),
            DispatchOutcome::Dispatched(_)
        ));
        // t1 still reports free, but its binding keeps it out of the search
        assert_eq!(
            f.dispatcher.request_hail(request("op"), 1_000).unwrap(),
            DispatchOutcome::NoTaxiAvailable
        );
    }

    #[test]
    fn test_bound_taxis_reporting_free_do_not_hide_an_idle_taxi() {
        let f = fixture();
        for i in 0..10 {
            f.positions
                .report_position(TaxiId::new(format!("t{i}")), OperatorId::from("op"), 48.851, 2.351, TaxiStatus::Free, 0)
                .unwrap();
        }
        for i in 0..10 {
            let mut req = request("op");
            req.customer_id = CustomerId::new(format!("c{i}"));
            assert!(matches!(f.dispatcher.request_hail(req, 1_000).unwrap(), DispatchOutcome::Dispatched(_)));
        }
        assert_eq!(f.dispatcher.machine().active_count(), 10);

        // ~220m east of the pickup
        f.positions
            .report_position(TaxiId::from("idle"), OperatorId::from("op"), 48.851, 2.354, TaxiStatus::Free, 1_000)
            .unwrap();
        let outcome = f.dispatcher.request_hail(request("op"), 2_000).unwrap();
        let DispatchOutcome::Dispatched(hail) = outcome else {
            panic!("expected a hail, got {outcome:?}");
        };
        assert_eq!(hail.taxi_id().as_str(), "idle");
    }

    #[test]
    fn test_banned_customer_is_refused_until_lifted() {
        let f = fixture();
        f.positions
            .report_position(TaxiId::from("t1"), OperatorId::from("op"), 48.85, 2.35, TaxiStatus::Free, 0)
            .unwrap();
        let until = f.dispatcher.customer_bans().ban(&CustomerId::from("c1"), &HailId::from("h0"), 0);

        let err = f.dispatcher.request_hail(request("op"), 1_000).unwrap_err();
        assert_eq!(err, DispatchError::CustomerBanned { customer_id: CustomerId::from("c1"), until_ms: until });
        assert_eq!(f.dispatcher.machine().active_count(), 0);

        assert!(f.dispatcher.lift_customer_ban(&CustomerId::from("c1")));
        assert!(matches!(
            f.dispatcher.request_hail(request("op"), 1_000).unwrap(),
            DispatchOutcome::Dispatched(_)
        ));
    }

    #[test]
    fn test_sessions_are_reused_and_checked() {
        let f = fixture();
        for taxi in ["t1", "t2", "t3"] {
            f.positions
                .report_position(TaxiId::from(taxi), OperatorId::from("op"), 48.85, 2.35, TaxiStatus::Free, 0)
                .unwrap();
        }
        let DispatchOutcome::Dispatched(first) = f.dispatcher.request_hail(request("op"), 0).unwrap() else {
            panic!("expected a hail");
        };

        // Same customer moments later keeps the session
        let DispatchOutcome::Dispatched(second) = f.dispatcher.request_hail(request("op"), 20_000).unwrap()
        else {
            panic!("expected a hail");
        };
        assert_eq!(second.session_id(), first.session_id());

        // Someone else's session is refused
        let mut other = request("op");
        other.customer_id = CustomerId::from("c2");
        other.session_id = Some(first.session_id().clone());
        let err = f.dispatcher.request_hail(other, 20_000).unwrap_err();
        assert!(matches!(err, DispatchError::Validation(msg) if msg.contains("another customer")));

        let mut unknown = request("op");
        unknown.session_id = Some(SessionId::from("never-issued"));
        assert!(matches!(f.dispatcher.request_hail(unknown, 20_000), Err(DispatchError::Validation(_))));
    }

    #[test]
    fn test_concurrent_apply_loser_sees_concurrent_modification() {
        let f = fixture();
        f.positions
            .report_position(TaxiId::from("t1"), OperatorId::from("op"), 48.85, 2.35, TaxiStatus::Free, 0)
            .unwrap();
        let DispatchOutcome::Dispatched(hail) = f.dispatcher.request_hail(request("op"), 0).unwrap() else {
            panic!("expected a hail");
        };
        for to in [HailStatus::SentToOperator, HailStatus::ReceivedByOperator, HailStatus::ReceivedByTaxi] {
            f.dispatcher.apply(TransitionRequest::new(hail.id().clone(), to, Actor::System), 1).unwrap();
        }

        let dispatcher = Arc::new(f.dispatcher);
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let barrier = barrier.clone();
                let id = hail.id().clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    dispatcher.apply(TransitionRequest::new(id, HailStatus::AcceptedByTaxi, Actor::System), 2)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = results.into_iter().find_map(Result::err).unwrap();
        assert!(
            matches!(
                loser,
                DispatchError::ConcurrentModification {
                    expected: HailStatus::ReceivedByTaxi,
                    actual: HailStatus::AcceptedByTaxi,
                    ..
                }
            ),
            "{loser:?}"
        );
    }

    #[test]
    fn test_typed_outcomes() {
        let f = fixture();
        assert_eq!(
            f.dispatcher.request_hail(request("other"), 0).unwrap(),
            DispatchOutcome::NoZonePermitsOperator
        );
        assert_eq!(
            f.dispatcher.request_hail(request("op"), 0).unwrap(),
            DispatchOutcome::NoTaxiAvailable
        );
        let mut bad = request("op");
        bad.pickup_lat = 91.0;
        assert!(matches!(f.dispatcher.request_hail(bad, 0), Err(DispatchError::Validation(_))));
    }

    #[test]
    fn test_apply_and_cancel() {
        let f = fixture();
        f.positions
            .report_position(TaxiId::from("t1"), OperatorId::from("op"), 48.85, 2.35, TaxiStatus::Free, 0)
            .unwrap();
        let DispatchOutcome::Dispatched(hail) = f.dispatcher.request_hail(request("op"), 0).unwrap()
        else {
            panic!("expected a hail");
        };

        let moved = f
            .dispatcher
            .apply(
                TransitionRequest::new(hail.id().clone(), HailStatus::SentToOperator, Actor::System),
                1,
            )
            .unwrap();
        assert_eq!(moved.status(), HailStatus::SentToOperator);

        let err = f
            .dispatcher
            .apply(
                TransitionRequest::new(hail.id().clone(), HailStatus::Finished, Actor::System),
                2,
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));

        let cancelled = f.dispatcher.cancel(hail.id(), &CustomerId::from("c1"), "changed plans", 3).unwrap();
        assert_eq!(cancelled.status(), HailStatus::IncidentCustomer);
        assert_eq!(f.dispatcher.machine().active_hail_for_taxi(&TaxiId::from("t1")), None);
    }

    #[test]
    fn test_request_deserializes_with_wire_names() {
        let request: HailRequest = serde_json::from_str(
            r#"{"pickup_lat":48.85,"pickup_lon":2.35,"operator_id":"op","customer_id":"c1","max_radius":800}"#,
        )
        .unwrap();
        assert_eq!(request.max_radius_m, Some(800.0));
        assert!(request.session_id.is_none());
    }
}
