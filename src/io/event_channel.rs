//! Bounded side-effect channel from the hail state machine to the notification worker
//!
//! Sending never blocks a transition. When the queue is full the event is
//! parked in an outbox and redelivered by `flush_outbox` (called on every
//! scheduler tick), giving at-least-once delivery up to the outbox capacity.

use crate::domain::hail::HailEvent;
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Sender handle for hail events
///
/// Clone this to share across producers; clones share one outbox.
#[derive(Clone)]
pub struct HailEventSender {
    tx: mpsc::Sender<HailEvent>,
    outbox: Arc<Mutex<VecDeque<HailEvent>>>,
    outbox_capacity: usize,
    metrics: Arc<Metrics>,
}

impl HailEventSender {
    pub fn new(tx: mpsc::Sender<HailEvent>, outbox_capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self { tx, outbox: Arc::new(Mutex::new(VecDeque::new())), outbox_capacity, metrics }
    }

    /// Enqueue an event without blocking
    ///
    /// Events queue behind any already parked ones so per-hail order holds.
    pub fn send(&self, event: HailEvent) {
        let mut outbox = self.outbox.lock();
        if !outbox.is_empty() {
            self.park(&mut outbox, event);
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => self.park(&mut outbox, event),
            Err(TrySendError::Closed(event)) => {
                debug!(hail_id = %event.hail_id, to = %event.to, "hail_event_channel_closed");
            }
        }
    }

    fn park(&self, outbox: &mut VecDeque<HailEvent>, event: HailEvent) {
        if outbox.len() >= self.outbox_capacity {
            if let Some(dropped) = outbox.pop_front() {
                self.metrics.record_event_dropped();
                warn!(hail_id = %dropped.hail_id, to = %dropped.to, "hail_event_dropped_outbox_full");
            }
        }
        outbox.push_back(event);
        self.metrics.record_event_deferred();
    }

    /// Move parked events into the queue until it fills up again; returns how many moved
    pub fn flush_outbox(&self) -> usize {
        let mut outbox = self.outbox.lock();
        let mut delivered = 0;
        while let Some(event) = outbox.pop_front() {
            match self.tx.try_send(event) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(event)) => {
                    outbox.push_front(event);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    outbox.clear();
                    break;
                }
            }
        }
        if delivered > 0 {
            debug!(delivered = %delivered, parked = %outbox.len(), "hail_outbox_flushed");
        }
        delivered
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().len()
    }
}

/// Create a new hail event channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_event_channel(
    buffer_size: usize,
    outbox_capacity: usize,
    metrics: Arc<Metrics>,
) -> (HailEventSender, mpsc::Receiver<HailEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (HailEventSender::new(tx, outbox_capacity.max(1), metrics), rx)
}
