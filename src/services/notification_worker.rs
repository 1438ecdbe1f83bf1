//! Notification worker - applies hail side effects off the transition path
//!
//! The state machine publishes committed transitions on a bounded channel.
//! This worker consumes them, so network I/O never runs under a hail lock:
//! - taxi availability follows the state a hail entered
//! - customers are banned when a hail ends in `customer_banned`
//! - customers get every status change
//! - hails entering `received` are handed to their operator
//!
//! Taxi status and bans are applied in queue order by the receive loop. The
//! network steps run in one lane per hail: a lane handles its hail's events
//! in order, lanes run side by side, and at most `concurrency` network steps
//! are in flight at once. A slow webhook therefore only delays its own hail.

use crate::domain::error::DispatchResult;
use crate::domain::hail::{Hail, HailEvent, HailStatus};
use crate::domain::types::{Actor, HailId};
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::io::notifier::HailNotifier;
use crate::services::customer_bans::CustomerBans;
use crate::services::hail_machine::{HailMachine, TransitionRequest};
use crate::services::position_store::PositionStore;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

/// Default cap on concurrent customer/operator requests
pub const DEFAULT_NOTIFY_CONCURRENCY: usize = 64;

pub struct NotificationWorker {
    effects: Arc<SideEffects>,
    event_rx: mpsc::Receiver<HailEvent>,
    lanes: FxHashMap<HailId, mpsc::UnboundedSender<HailEvent>>,
    in_flight: Arc<Semaphore>,
    /// Events handed to a lane and not yet finished
    pending: Arc<watch::Sender<usize>>,
    bans: Option<Arc<CustomerBans>>,
}

struct SideEffects {
    machine: Arc<HailMachine>,
    positions: Arc<PositionStore>,
    notifier: Arc<dyn HailNotifier>,
    clock: Arc<dyn Clock>,
    /// Hails older than this when the operator step starts fail instead
    max_dispatch_delay_ms: u64,
    metrics: Arc<Metrics>,
}

impl NotificationWorker {
    pub fn new(
        machine: Arc<HailMachine>,
        positions: Arc<PositionStore>,
        notifier: Arc<dyn HailNotifier>,
        clock: Arc<dyn Clock>,
        event_rx: mpsc::Receiver<HailEvent>,
        max_dispatch_delay_ms: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        let effects =
            SideEffects { machine, positions, notifier, clock, max_dispatch_delay_ms, metrics };
        let (pending, _) = watch::channel(0);
        Self {
            effects: Arc::new(effects),
            event_rx,
            lanes: FxHashMap::default(),
            in_flight: Arc::new(Semaphore::new(DEFAULT_NOTIFY_CONCURRENCY)),
            pending: Arc::new(pending),
            bans: None,
        }
    }

    /// Cap the network steps running at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.in_flight = Arc::new(Semaphore::new(concurrency.max(1)));
        self
    }

    /// Ban customers whose hail ends in `customer_banned`
    pub fn with_customer_bans(mut self, bans: Arc<CustomerBans>) -> Self {
        self.bans = Some(bans);
        self
    }

    /// Run the worker, processing events until the channel closes
    pub async fn run(mut self) {
        info!("notification_worker_started");
        while self.process_next().await {}
        self.lanes.clear();
        self.wait_idle().await;
        info!("notification_worker_stopped");
    }

    /// Take one event: apply its ordered effects, queue its network step.
    /// Returns false once the channel is closed.
    pub async fn process_next(&mut self) -> bool {
        let Some(event) = self.event_rx.recv().await else {
            return false;
        };

        self.effects.apply_taxi_status(&event);
        if event.to == HailStatus::CustomerBanned {
            if let Some(bans) = &self.bans {
                bans.ban(&event.customer_id, &event.hail_id, event.at_ms);
            }
        }

        self.pending.send_modify(|n| *n += 1);
        let last = event.to.is_terminal();
        let hail_id = event.hail_id.clone();
        let event = match self.lanes.get(&hail_id) {
            Some(lane) => lane.send(event).err().map(|e| e.0),
            None => Some(event),
        };
        if let Some(event) = event {
            self.open_lane(event);
        }
        // A terminal event is the hail's last; its lane drains and exits
        if last {
            self.lanes.remove(&hail_id);
        }
        true
    }

    fn open_lane(&mut self, first: HailEvent) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hail_id = first.hail_id.clone();
        // rx is still held here, so this send cannot fail
        let _ = tx.send(first);
        tokio::spawn(run_lane(
            self.effects.clone(),
            self.in_flight.clone(),
            self.pending.clone(),
            rx,
        ));
        self.lanes.insert(hail_id, tx);
    }

    /// Wait until every queued network step has finished
    pub async fn wait_idle(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    /// Hails with an open lane
    pub fn open_lanes(&self) -> usize {
        self.lanes.len()
    }
}

async fn run_lane(
    effects: Arc<SideEffects>,
    in_flight: Arc<Semaphore>,
    pending: Arc<watch::Sender<usize>>,
    mut rx: mpsc::UnboundedReceiver<HailEvent>,
) {
    while let Some(event) = rx.recv().await {
        if let Ok(_permit) = in_flight.acquire().await {
            effects.notify(&event).await;
        }
        pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl SideEffects {
    /// Customer update, plus the operator hand-off for `received`
    async fn notify(&self, event: &HailEvent) {
        if event.to == HailStatus::Received {
            tokio::join!(self.notify_customer(event), self.dispatch_to_operator(event));
        } else {
            self.notify_customer(event).await;
        }
    }

    async fn notify_customer(&self, event: &HailEvent) {
        if let Err(e) = self.notifier.notify_customer(event).await {
            self.metrics.record_customer_notification_failed();
            warn!(hail_id = %event.hail_id, to = %event.to, error = %e, "customer_notification_failed");
        }
    }

    fn apply_taxi_status(&self, event: &HailEvent) {
        let Some(status) = event.to.taxi_status_on_entry() else {
            return;
        };
        match self.positions.set_status(&event.taxi_id, status) {
            Ok(()) => debug!(taxi_id = %event.taxi_id, status = %status, hail_id = %event.hail_id, "taxi_status_forced"),
            // Taxi reaped since it was matched
            Err(e) => debug!(taxi_id = %event.taxi_id, error = %e, "taxi_status_not_applied"),
        }
    }

    /// received -> sent_to_operator -> received_by_operator | failure
    async fn dispatch_to_operator(&self, event: &HailEvent) {
        let hail = match self.machine.get(&event.hail_id) {
            Ok(hail) => hail,
            Err(e) => {
                debug!(hail_id = %event.hail_id, error = %e, "operator_dispatch_skipped");
                return;
            }
        };

        let delay_ms = self.clock.now_ms().saturating_sub(hail.created_at_ms());
        if delay_ms > self.max_dispatch_delay_ms {
            warn!(hail_id = %hail.id(), delay_ms = %delay_ms, "operator_dispatch_too_late");
            self.commit(
                TransitionRequest::new(hail.id().clone(), HailStatus::Failure, Actor::System)
                    .with_reason(format!("operator dispatch delayed by {delay_ms} ms"))
                    .expecting(HailStatus::Received),
            );
            return;
        }

        let Some(hail) = self.commit(
            TransitionRequest::new(hail.id().clone(), HailStatus::SentToOperator, Actor::System)
                .expecting(HailStatus::Received),
        ) else {
            return;
        };

        let start = Instant::now();
        let result = self.notifier.send_to_operator(&hail).await;
        let latency_us = start.elapsed().as_micros() as u64;
        self.metrics.record_operator_request(result.is_ok());

        match result {
            Ok(ack) => {
                info!(
                    hail_id = %hail.id(),
                    operator = %hail.operator_id(),
                    latency_us = %latency_us,
                    "operator_request_accepted"
                );
                if let Some(phone) = ack.taxi_phone_number {
                    if let Err(e) = self.machine.set_taxi_phone_number(hail.id(), phone) {
                        debug!(hail_id = %hail.id(), error = %e, "taxi_phone_number_not_stored");
                    }
                }
                self.commit(
                    TransitionRequest::new(
                        hail.id().clone(),
                        HailStatus::ReceivedByOperator,
                        Actor::Operator(hail.operator_id().clone()),
                    )
                    .expecting(HailStatus::SentToOperator),
                );
            }
            Err(e) => {
                warn!(
                    hail_id = %hail.id(),
                    operator = %hail.operator_id(),
                    latency_us = %latency_us,
                    error = %e,
                    "operator_request_failed"
                );
                self.commit(
                    TransitionRequest::new(hail.id().clone(), HailStatus::Failure, Actor::System)
                        .with_reason(e.to_string())
                        .expecting(HailStatus::SentToOperator),
                );
            }
        }
    }

    /// Apply a worker-issued transition; a hail that moved on is left alone
    fn commit(&self, request: TransitionRequest) -> Option<Hail> {
        let hail_id = request.hail_id.clone();
        let to = request.to;
        match self.transition(request) {
            Ok(hail) => Some(hail),
            Err(e) if e.is_lost_race() => {
                debug!(hail_id = %hail_id, to = %to, error = %e, "worker_transition_lost_race");
                None
            }
            Err(e) => {
                warn!(hail_id = %hail_id, to = %to, error = %e, "worker_transition_failed");
                None
            }
        }
    }

    fn transition(&self, request: TransitionRequest) -> DispatchResult<Hail> {
        self.machine.transition(request, self.clock.now_ms())
    }
}
