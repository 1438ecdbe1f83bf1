//! Property tests for the hail lifecycle and the proximity query

use hail_dispatch::domain::{
    Actor, CustomerId, DispatchError, GeoPoint, HailStatus, NewHail, OperatorId, SessionId,
    TaxiId, TaxiStatus,
};
use hail_dispatch::infra::Metrics;
use hail_dispatch::services::{HailMachine, PositionStore, TransitionRequest};
use proptest::prelude::*;
use std::sync::Arc;

fn any_status() -> impl Strategy<Value = HailStatus> {
    (0..HailStatus::ALL.len()).prop_map(|i| HailStatus::ALL[i])
}

fn any_taxi_status() -> impl Strategy<Value = TaxiStatus> {
    prop_oneof![
        Just(TaxiStatus::Free),
        Just(TaxiStatus::Answering),
        Just(TaxiStatus::Oncoming),
        Just(TaxiStatus::Occupied),
        Just(TaxiStatus::Off),
    ]
}

fn new_machine_with_hail() -> (HailMachine, hail_dispatch::domain::HailId) {
    let machine = HailMachine::new(Arc::new(Metrics::new()));
    let hail = machine
        .create(
            NewHail {
                taxi_id: TaxiId::from("t1"),
                operator_id: OperatorId::from("op"),
                customer_id: CustomerId::from("c1"),
                session_id: SessionId::from("s1"),
                pickup: GeoPoint::new(48.85, 2.35).unwrap(),
                initial_taxi_position: None,
            },
            Actor::System,
            0,
        )
        .unwrap();
    let id = hail.id().clone();
    (machine, id)
}

proptest! {
    /// Whatever is requested, the log's last entry matches the status, only
    /// moves in the table are applied, and repeating a move already made is
    /// reported as a lost race
    #[test]
    fn log_tracks_status_and_only_table_moves_apply(
        steps in prop::collection::vec((any_status(), any::<bool>()), 1..30)
    ) {
        let (machine, id) = new_machine_with_hail();

        for (i, (to, with_reason)) in steps.into_iter().enumerate() {
            let before = machine.get(&id).unwrap();
            let from = before.status();
            let mut request = TransitionRequest::new(id.clone(), to, Actor::System);
            if with_reason {
                request = request.with_reason("property step");
            }

            let result = machine.transition(request, i as u64 * 1_000);
            let after = machine.get(&id).unwrap();

            match result {
                Ok(hail) => {
                    prop_assert!(from.can_transition_to(to));
                    prop_assert!(with_reason || !to.requires_reason());
                    prop_assert_eq!(hail.status(), to);
                    prop_assert_eq!(after.log().len(), before.log().len() + 1);
                }
                Err(DispatchError::AlreadyTerminal { status, .. }) => {
                    prop_assert!(from.is_terminal());
                    prop_assert_eq!(status, from);
                    prop_assert_eq!(after.log(), before.log());
                }
                Err(DispatchError::InvalidTransition { from: reported, to: requested }) => {
                    prop_assert!(!from.can_transition_to(to));
                    prop_assert_eq!((reported, requested), (from, to));
                    prop_assert_eq!(after.log(), before.log());
                }
                Err(DispatchError::ConcurrentModification { expected, actual, .. }) => {
                    // A table move whose source the hail already left
                    prop_assert!(!from.can_transition_to(to));
                    prop_assert_eq!(Some(expected), to.table_source());
                    prop_assert_eq!(actual, from);
                    prop_assert!(before.log().iter().any(|e| e.to == expected));
                    prop_assert_eq!(after.log(), before.log());
                }
                Err(DispatchError::ReasonRequired { to: requested }) => {
                    prop_assert!(!with_reason && requested.requires_reason());
                    prop_assert_eq!(after.log(), before.log());
                }
                Err(other) => prop_assert!(false, "unexpected error {}", other),
            }

            prop_assert_eq!(after.log().last().map(|e| e.to), Some(after.status()));
            let timestamps: Vec<u64> = after.log().iter().map(|e| e.at_ms).collect();
            prop_assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    /// A taxi is bound to a hail exactly while that hail is non-terminal
    #[test]
    fn taxi_binding_follows_terminality(path in prop::collection::vec(any_status(), 1..20)) {
        let (machine, id) = new_machine_with_hail();
        for (i, to) in path.into_iter().enumerate() {
            let _ = machine.transition(
                TransitionRequest::new(id.clone(), to, Actor::System).with_reason("r"),
                i as u64,
            );
            let active = machine.active_hail_for_taxi(&TaxiId::from("t1"));
            let terminal = machine.status(&id).unwrap().is_terminal();
            prop_assert_eq!(active.is_none(), terminal);
        }
    }

    /// Proximity results are free, fresh, inside the radius and nearest first
    #[test]
    fn query_near_returns_only_free_fresh_taxis(
        taxis in prop::collection::vec(
            (-0.02f64..0.02, -0.02f64..0.02, any_taxi_status(), 0u64..60_000),
            0..40,
        ),
        radius_m in 100.0f64..3_000.0,
    ) {
        let now_ms = 60_000;
        let store = PositionStore::new(30_000, 300_000, 0.01, Arc::new(Metrics::new()));
        for (i, (dlat, dlon, status, seen_ms)) in taxis.iter().enumerate() {
            store
                .report_position(
                    TaxiId::new(format!("t{i:02}")),
                    OperatorId::from("op"),
                    48.85 + dlat,
                    2.35 + dlon,
                    *status,
                    *seen_ms,
                )
                .unwrap();
        }

        let center = GeoPoint::new(48.85, 2.35).unwrap();
        let found = store.query_near(center, radius_m, 100, now_ms);

        for candidate in &found {
            prop_assert!(candidate.distance_m <= radius_m);
            prop_assert!(now_ms - candidate.last_seen_ms <= 30_000);
            let (record, _) = store.get(&candidate.taxi_id, now_ms).unwrap();
            prop_assert_eq!(record.status, TaxiStatus::Free);
        }
        let sorted = found.windows(2).all(|w| {
            (w[0].distance_m, &w[0].taxi_id) <= (w[1].distance_m, &w[1].taxi_id)
        });
        prop_assert!(sorted);
    }
}
