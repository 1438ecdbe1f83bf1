//! End-to-end dispatch scenarios against the shipped reference data
//!
//! Each test wires the in-memory stores the way `main` does, with a manual
//! clock and a recording notifier in place of HTTP.

use async_trait::async_trait;
use hail_dispatch::domain::{
    Actor, CustomerId, DispatchError, GeoPoint, Hail, HailEvent, HailId, HailStatus, NewHail,
    OperatorId, SessionId, TaxiId, TaxiStatus,
};
use hail_dispatch::infra::{Clock, Config, ManualClock, Metrics};
use hail_dispatch::io::{create_event_channel, HailNotifier, NotifyError, OperatorAck, ReferenceData};
use hail_dispatch::services::{
    CustomerBans, DispatchOutcome, Dispatcher, HailMachine, HailRequest, MatchOutcome, MatchRequest,
    MatchSettings, MatchingEngine, NotificationWorker, PositionStore, TimeoutRule, TimeoutRules,
    TimeoutScheduler, TransitionRequest, ZoneIndex,
};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::time::Duration;

const OPERATOR: &str = "sim-operator";
const RESTRICTED: &str = "restricted-operator";

fn dev_config() -> Config {
    Config::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml")).unwrap()
}

fn shipped_zones() -> Arc<ZoneIndex> {
    let zones = Arc::new(ZoneIndex::new());
    ReferenceData::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/zones.json"))
        .unwrap()
        .apply_to(&zones)
        .unwrap();
    zones
}

fn point(lat: f64, lon: f64) -> GeoPoint {
    GeoPoint::new(lat, lon).unwrap()
}

#[derive(Default)]
struct RecordingNotifier {
    operator_hails: Mutex<Vec<HailId>>,
    customer_events: Mutex<Vec<(HailId, HailStatus)>>,
}

#[async_trait]
impl HailNotifier for RecordingNotifier {
    async fn send_to_operator(&self, hail: &Hail) -> Result<OperatorAck, NotifyError> {
        self.operator_hails.lock().push(hail.id().clone());
        Ok(OperatorAck { taxi_phone_number: Some("+33612345678".to_string()) })
    }

    async fn notify_customer(&self, event: &HailEvent) -> Result<(), NotifyError> {
        self.customer_events.lock().push((event.hail_id.clone(), event.to));
        Ok(())
    }
}

struct Harness {
    positions: Arc<PositionStore>,
    machine: Arc<HailMachine>,
    matching: Arc<MatchingEngine>,
    dispatcher: Dispatcher,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<ManualClock>,
    worker: NotificationWorker,
}

impl Harness {
    fn new() -> Self {
        let config = dev_config();
        let metrics = Arc::new(Metrics::new());
        let clock = Arc::new(ManualClock::new(0));
        let positions = Arc::new(PositionStore::from_config(&config, metrics.clone()));
        let (sender, event_rx) = create_event_channel(64, 64, metrics.clone());
        let machine = Arc::new(HailMachine::new(metrics.clone()).with_events(sender));
        let matching = Arc::new(MatchingEngine::new(
            positions.clone(),
            shipped_zones(),
            MatchSettings::from_config(&config),
            metrics.clone(),
        ));
        let bans = Arc::new(CustomerBans::new(config.customer_ban_ms(), metrics.clone()));
        let dispatcher = Dispatcher::new(matching.clone(), machine.clone(), config.transition_retries())
            .with_customer_bans(bans.clone())
            .with_session_reuse_ms(config.session_reuse_ms());
        let notifier = Arc::new(RecordingNotifier::default());
        let worker = NotificationWorker::new(
            machine.clone(),
            positions.clone(),
            notifier.clone(),
            clock.clone(),
            event_rx,
            config.operator_dispatch_max_delay_ms(),
            metrics,
        )
        .with_concurrency(config.notify_concurrency())
        .with_customer_bans(bans);
        Self { positions, machine, matching, dispatcher, notifier, clock, worker }
    }

    fn report(&self, taxi: &str, operator: &str, lat: f64, lon: f64, status: TaxiStatus, at_ms: u64) {
        self.positions
            .report_position(TaxiId::from(taxi), OperatorId::from(operator), lat, lon, status, at_ms)
            .unwrap();
    }

    fn request(&self, operator: &str, customer: &str, lat: f64, lon: f64) -> DispatchOutcome {
        let request = HailRequest {
            pickup_lat: lat,
            pickup_lon: lon,
            operator_id: OperatorId::from(operator),
            customer_id: CustomerId::from(customer),
            session_id: None,
            max_radius_m: None,
        };
        self.dispatcher.request_hail(request, self.clock_ms()).unwrap()
    }

    fn clock_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Process queued events and their network steps until nothing is left
    async fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        loop {
            while let Ok(true) =
                tokio::time::timeout(Duration::from_millis(50), self.worker.process_next()).await
            {
                handled += 1;
            }
            self.worker.wait_idle().await;
            // Idle lanes have queued everything they will produce
            match tokio::time::timeout(Duration::from_millis(10), self.worker.process_next()).await {
                Ok(true) => handled += 1,
                _ => return handled,
            }
        }
    }

    fn taxi_status(&self, taxi: &str) -> TaxiStatus {
        self.positions.get(&TaxiId::from(taxi), self.clock_ms()).unwrap().0.status
    }
}

fn dispatched(outcome: DispatchOutcome) -> Hail {
    match outcome {
        DispatchOutcome::Dispatched(hail) => hail,
        other => panic!("expected a dispatched hail, got {}", other.as_str()),
    }
}

fn bare_hail(machine: &HailMachine, taxi: &str, at_ms: u64) -> HailId {
    machine
        .create(
            NewHail {
                taxi_id: TaxiId::from(taxi),
                operator_id: OperatorId::from(OPERATOR),
                customer_id: CustomerId::from("c1"),
                session_id: SessionId::from("s1"),
                pickup: point(48.85, 2.35),
                initial_taxi_position: None,
            },
            Actor::System,
            at_ms,
        )
        .unwrap()
        .id()
        .clone()
}

fn step(machine: &HailMachine, id: &HailId, to: HailStatus, at_ms: u64) -> Result<Hail, DispatchError> {
    machine.transition(TransitionRequest::new(id.clone(), to, Actor::System), at_ms)
}

fn advance_to_received_by_taxi(machine: &HailMachine, id: &HailId, at_ms: u64) {
    for to in [
        HailStatus::Received,
        HailStatus::SentToOperator,
        HailStatus::ReceivedByOperator,
        HailStatus::ReceivedByTaxi,
    ] {
        step(machine, id, to, at_ms).unwrap();
    }
}

#[test]
fn test_shipped_reference_data_loads() {
    let zones = shipped_zones();
    let stats = zones.stats();
    assert_eq!((stats.zones, stats.towns, stats.exclusions), (2, 2, 1));
    assert!(zones.is_excluded(point(48.845, 2.375)));
    assert!(!zones.is_excluded(point(48.85, 2.35)));
}

#[test]
fn test_fresh_taxi_found_then_stale_after_window() {
    let h = Harness::new();
    h.report("t1", OPERATOR, 48.85, 2.35, TaxiStatus::Free, 0);

    let request = MatchRequest {
        pickup: point(48.851, 2.351),
        operator: OperatorId::from(OPERATOR),
        max_radius_m: Some(500.0),
    };

    match h.matching.find_candidates(&request, 0).unwrap() {
        MatchOutcome::Candidates(candidates) => {
            assert_eq!(candidates.len(), 1);
            assert_eq!(candidates[0].taxi_id, TaxiId::from("t1"));
            assert!(candidates[0].distance_m < 500.0);
        }
        other => panic!("expected candidates, got {}", other.as_str()),
    }

    // 40 s later with a 30 s freshness window
    assert_eq!(h.matching.find_candidates(&request, 40_000).unwrap(), MatchOutcome::NoTaxiAvailable);
    assert!(h.positions.query_near(point(48.851, 2.351), 500.0, 10, 40_000).is_empty());
}

#[test]
fn test_non_free_taxis_are_never_candidates() {
    let h = Harness::new();
    h.report("t1", OPERATOR, 48.85, 2.35, TaxiStatus::Occupied, 0);
    h.report("t2", OPERATOR, 48.8502, 2.3502, TaxiStatus::Off, 0);

    assert!(h.positions.query_near(point(48.85, 2.35), 1000.0, 10, 0).is_empty());
    assert!(matches!(h.request(OPERATOR, "c1", 48.85, 2.35), DispatchOutcome::NoTaxiAvailable));
}

#[test]
fn test_received_to_customer_on_board_is_invalid() {
    let machine = HailMachine::new(Arc::new(Metrics::new()));
    let id = bare_hail(&machine, "t1", 0);
    step(&machine, &id, HailStatus::Received, 0).unwrap();

    let err = step(&machine, &id, HailStatus::CustomerOnBoard, 0).unwrap_err();
    assert_eq!(
        err,
        DispatchError::InvalidTransition { from: HailStatus::Received, to: HailStatus::CustomerOnBoard }
    );
    assert_eq!(machine.status(&id).unwrap(), HailStatus::Received);
    assert_eq!(machine.transition_log(&id).unwrap().len(), 2);
}

#[test]
fn test_timeout_fires_and_late_accept_is_terminal() {
    let machine = Arc::new(HailMachine::new(Arc::new(Metrics::new())));
    let rules = TimeoutRules::new([TimeoutRule {
        state: HailStatus::ReceivedByTaxi,
        after_ms: 60_000,
        target: HailStatus::TimeoutTaxi,
    }])
    .unwrap();
    let scheduler = TimeoutScheduler::new(machine.clone(), rules, Arc::new(Metrics::new()));

    let id = bare_hail(&machine, "t1", 0);
    advance_to_received_by_taxi(&machine, &id, 1_000);

    assert_eq!(scheduler.sweep(60_000).fired, 0);
    assert_eq!(scheduler.sweep(62_000).fired, 1);
    assert_eq!(machine.status(&id).unwrap(), HailStatus::TimeoutTaxi);
    assert_eq!(machine.active_hail_for_taxi(&TaxiId::from("t1")), None);

    let err = step(&machine, &id, HailStatus::AcceptedByTaxi, 63_000).unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyTerminal { status: HailStatus::TimeoutTaxi, .. }));
    let log = machine.transition_log(&id).unwrap();
    assert_eq!(log.last().unwrap().to, HailStatus::TimeoutTaxi);
    assert_eq!(log.last().unwrap().reason.as_deref(), Some("timeout"));
}

fn accept(id: &HailId) -> TransitionRequest {
    TransitionRequest::new(id.clone(), HailStatus::AcceptedByTaxi, Actor::Operator(OperatorId::from(OPERATOR)))
}

/// Run `accept` twice at once; returns both results
fn race_two<F>(accept: F) -> Vec<Result<Hail, DispatchError>>
where
    F: Fn() -> Result<Hail, DispatchError> + Sync,
{
    let barrier = Barrier::new(2);
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    accept()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn assert_one_winner_one_conflict(results: Vec<Result<Hail, DispatchError>>, machine: &HailMachine, id: &HailId) {
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
        "loser got {loser:?}"
    );
    let log = machine.transition_log(id).unwrap();
    assert_eq!(log.iter().filter(|e| e.to == HailStatus::AcceptedByTaxi).count(), 1);
}

#[test]
fn test_concurrent_accept_has_one_winner() {
    let machine = Arc::new(HailMachine::new(Arc::new(Metrics::new())));
    let id = bare_hail(&machine, "t1", 0);
    advance_to_received_by_taxi(&machine, &id, 0);

    let results = race_two(|| machine.transition(accept(&id), 1_000));
    assert_one_winner_one_conflict(results, &machine, &id);
}

#[test]
fn test_concurrent_accept_through_dispatcher_apply() {
    let h = Harness::new();
    h.report("t1", OPERATOR, 48.85, 2.35, TaxiStatus::Free, 0);
    let id = dispatched(h.request(OPERATOR, "c1", 48.85, 2.35)).id().clone();
    for to in [HailStatus::SentToOperator, HailStatus::ReceivedByOperator, HailStatus::ReceivedByTaxi] {
        step(&h.machine, &id, to, 0).unwrap();
    }

    let results = race_two(|| h.dispatcher.apply(accept(&id), 1_000));
    assert_one_winner_one_conflict(results, &h.machine, &id);
}

#[test]
fn test_explicit_expectation_still_single_attempt() {
    let machine = Arc::new(HailMachine::new(Arc::new(Metrics::new())));
    let id = bare_hail(&machine, "t1", 0);
    advance_to_received_by_taxi(&machine, &id, 0);

    let results = race_two(|| machine.transition(accept(&id).expecting(HailStatus::ReceivedByTaxi), 1_000));
    assert_one_winner_one_conflict(results, &machine, &id);
}

#[test]
fn test_taxi_with_active_hail_cannot_get_another() {
    let machine = HailMachine::new(Arc::new(Metrics::new()));
    let first = bare_hail(&machine, "t1", 0);

    let second = machine.create(
        NewHail {
            taxi_id: TaxiId::from("t1"),
            operator_id: OperatorId::from(OPERATOR),
            customer_id: CustomerId::from("c2"),
            session_id: SessionId::from("s2"),
            pickup: point(48.85, 2.35),
            initial_taxi_position: None,
        },
        Actor::System,
        0,
    );
    assert_eq!(
        second.unwrap_err(),
        DispatchError::TaxiBusy { taxi_id: TaxiId::from("t1"), hail_id: first }
    );
}

#[tokio::test]
async fn test_full_ride_through_dispatcher_and_worker() {
    let mut h = Harness::new();
    h.clock.set(1_000);
    h.report("t1", OPERATOR, 48.85, 2.35, TaxiStatus::Free, 1_000);
    h.report("t2", OPERATOR, 48.855, 2.355, TaxiStatus::Free, 1_000);

    let hail = dispatched(h.request(OPERATOR, "c1", 48.851, 2.351));
    assert_eq!(hail.taxi_id(), &TaxiId::from("t1"));
    assert_eq!(hail.status(), HailStatus::Received);
    assert_eq!(hail.initial_taxi_position(), Some(point(48.85, 2.35)));
    let id = hail.id().clone();

    h.drain_events().await;
    assert_eq!(h.machine.status(&id).unwrap(), HailStatus::ReceivedByOperator);
    assert_eq!(h.machine.get(&id).unwrap().taxi_phone_number(), Some("+33612345678"));
    assert_eq!(h.taxi_status("t1"), TaxiStatus::Answering);
    assert_eq!(*h.notifier.operator_hails.lock(), vec![id.clone()]);

    // t1 is answering, so the next customer gets t2
    let other = dispatched(h.request(OPERATOR, "c2", 48.851, 2.351));
    assert_eq!(other.taxi_id(), &TaxiId::from("t2"));

    let operator = Actor::Operator(OperatorId::from(OPERATOR));
    let customer = Actor::Customer(CustomerId::from("c1"));
    for (to, actor) in [
        (HailStatus::ReceivedByTaxi, operator.clone()),
        (HailStatus::AcceptedByTaxi, operator.clone()),
        (HailStatus::AcceptedByCustomer, customer),
        (HailStatus::CustomerOnBoard, operator.clone()),
        (HailStatus::Finished, operator),
    ] {
        h.dispatcher.apply(TransitionRequest::new(id.clone(), to, actor), 2_000).unwrap();
    }

    h.drain_events().await;
    assert_eq!(h.taxi_status("t1"), TaxiStatus::Free);
    assert_eq!(h.machine.active_hail_for_taxi(&TaxiId::from("t1")), None);

    let statuses: Vec<_> = h.machine.transition_log(&id).unwrap().iter().map(|e| e.to).collect();
    assert_eq!(
        statuses,
        vec![
            HailStatus::Emitted,
            HailStatus::Received,
            HailStatus::SentToOperator,
            HailStatus::ReceivedByOperator,
            HailStatus::ReceivedByTaxi,
            HailStatus::AcceptedByTaxi,
            HailStatus::AcceptedByCustomer,
            HailStatus::CustomerOnBoard,
            HailStatus::Finished,
        ]
    );

    let customer_updates: Vec<_> = h
        .notifier
        .customer_events
        .lock()
        .iter()
        .filter(|(hail_id, _)| hail_id == &id)
        .map(|(_, to)| *to)
        .collect();
    assert_eq!(customer_updates, statuses[1..].to_vec());
}

#[tokio::test]
async fn test_customer_cancel_frees_taxi() {
    let mut h = Harness::new();
    h.report("t1", OPERATOR, 48.85, 2.35, TaxiStatus::Free, 0);

    let hail = dispatched(h.request(OPERATOR, "c1", 48.85, 2.35));
    h.drain_events().await;
    assert_eq!(h.taxi_status("t1"), TaxiStatus::Answering);

    let cancelled = h
        .dispatcher
        .cancel(hail.id(), &CustomerId::from("c1"), "changed my mind", 500)
        .unwrap();
    assert_eq!(cancelled.status(), HailStatus::IncidentCustomer);

    h.drain_events().await;
    assert_eq!(h.taxi_status("t1"), TaxiStatus::Free);
    assert!(matches!(
        h.dispatcher.cancel(hail.id(), &CustomerId::from("c1"), "again", 600),
        Err(DispatchError::AlreadyTerminal { .. })
    ));
}

#[test]
fn test_restricted_operator_refused_in_exclusion_area() {
    let h = Harness::new();
    h.report("r1", RESTRICTED, 48.8445, 2.3745, TaxiStatus::Free, 0);
    h.report("s1", OPERATOR, 48.8445, 2.3745, TaxiStatus::Free, 0);

    assert!(matches!(h.request(RESTRICTED, "c1", 48.845, 2.375), DispatchOutcome::PickupExcluded));
    assert!(matches!(h.request(OPERATOR, "c2", 48.845, 2.375), DispatchOutcome::Dispatched(_)));
}

#[test]
fn test_pickup_outside_every_zone() {
    let h = Harness::new();
    h.report("t1", OPERATOR, 45.76, 4.83, TaxiStatus::Free, 0);

    assert!(matches!(h.request(OPERATOR, "c1", 45.76, 4.83), DispatchOutcome::NoZonePermitsOperator));
    assert!(matches!(
        h.request("unknown-operator", "c1", 48.85, 2.35),
        DispatchOutcome::NoZonePermitsOperator
    ));
}

#[tokio::test]
async fn test_bound_taxis_reporting_free_do_not_hide_an_idle_taxi() {
    let mut h = Harness::new();
    for i in 0..10 {
        h.report(&format!("t{i}"), OPERATOR, 48.85, 2.35, TaxiStatus::Free, 0);
    }
    for i in 0..10 {
        dispatched(h.request(OPERATOR, &format!("c{i}"), 48.85, 2.35));
    }
    h.drain_events().await;
    assert_eq!(h.taxi_status("t0"), TaxiStatus::Answering);

    // The feed overwrites the forced status with what the taxis report
    for i in 0..10 {
        h.report(&format!("t{i}"), OPERATOR, 48.85, 2.35, TaxiStatus::Free, 1_000);
    }
    // ~220m east of the pickup
    h.report("idle", OPERATOR, 48.85, 2.353, TaxiStatus::Free, 1_000);
    h.clock.set(1_000);

    let hail = dispatched(h.request(OPERATOR, "late-customer", 48.85, 2.35));
    assert_eq!(hail.taxi_id(), &TaxiId::from("idle"));
}

#[tokio::test]
async fn test_banned_customer_cannot_hail_again() {
    let mut h = Harness::new();
    h.report("t1", OPERATOR, 48.85, 2.35, TaxiStatus::Free, 0);
    h.report("t2", OPERATOR, 48.851, 2.351, TaxiStatus::Free, 0);

    let id = dispatched(h.request(OPERATOR, "c1", 48.85, 2.35)).id().clone();
    h.drain_events().await;
    for to in [HailStatus::ReceivedByTaxi, HailStatus::AcceptedByTaxi, HailStatus::CustomerBanned] {
        h.dispatcher
            .apply(TransitionRequest::new(id.clone(), to, Actor::Operator(OperatorId::from(OPERATOR))), 100)
            .unwrap();
    }
    h.drain_events().await;
    assert_eq!(h.taxi_status("t1"), TaxiStatus::Free);

    let request = HailRequest {
        pickup_lat: 48.85,
        pickup_lon: 2.35,
        operator_id: OperatorId::from(OPERATOR),
        customer_id: CustomerId::from("c1"),
        session_id: None,
        max_radius_m: None,
    };
    let err = h.dispatcher.request_hail(request, 200).unwrap_err();
    assert_eq!(
        err,
        DispatchError::CustomerBanned { customer_id: CustomerId::from("c1"), until_ms: 100 + 86_400_000 }
    );

    // Other customers are unaffected
    assert!(matches!(h.request(OPERATOR, "c2", 48.85, 2.35), DispatchOutcome::Dispatched(_)));
}
