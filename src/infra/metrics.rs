//! Dispatch counters and the periodic summary
//!
//! Position ingestion, matching, hail transitions and the side-effect
//! pipeline each bump their own `AtomicU64`. `report` drains the per-interval
//! counters and the match latency histogram into a `MetricsSummary` that is
//! logged and served to Prometheus. Counters are statistics only; nothing in
//! the dispatch path reads them back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Upper bounds of the match latency buckets, in microseconds
pub const MATCH_LATENCY_BOUNDS_US: [u64; 10] =
    [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
/// Bounded buckets plus the open-ended one
pub const MATCH_LATENCY_BUCKETS: usize = MATCH_LATENCY_BOUNDS_US.len() + 1;

/// Candidate search latency, drained on every report
struct MatchLatency {
    buckets: [AtomicU64; MATCH_LATENCY_BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl MatchLatency {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, latency_us: u64) {
        let bucket = MATCH_LATENCY_BOUNDS_US.partition_point(|&bound| bound < latency_us);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    fn drain(&self) -> MatchLatencySnapshot {
        MatchLatencySnapshot {
            buckets: std::array::from_fn(|i| self.buckets[i].swap(0, Ordering::Relaxed)),
            count: self.count.swap(0, Ordering::Relaxed),
            sum_us: self.sum_us.swap(0, Ordering::Relaxed),
            max_us: self.max_us.swap(0, Ordering::Relaxed),
        }
    }
}

struct MatchLatencySnapshot {
    buckets: [u64; MATCH_LATENCY_BUCKETS],
    count: u64,
    sum_us: u64,
    max_us: u64,
}

impl MatchLatencySnapshot {
    fn avg_us(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum_us / self.count
        }
    }

    /// Upper bound of the bucket holding quantile `q`; the open bucket reports twice the last bound
    fn quantile_us(&self, q: f64) -> u64 {
        let total: u64 = self.buckets.iter().sum();
        if total == 0 {
            return 0;
        }
        let rank = (total as f64 * q) as u64;
        let mut seen = 0u64;
        for (i, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return MATCH_LATENCY_BOUNDS_US
                    .get(i)
                    .copied()
                    .unwrap_or(MATCH_LATENCY_BOUNDS_US[MATCH_LATENCY_BOUNDS_US.len() - 1] * 2);
            }
        }
        MATCH_LATENCY_BOUNDS_US[MATCH_LATENCY_BOUNDS_US.len() - 1] * 2
    }
}

/// Shared by every component; cheap to bump from any thread
pub struct Metrics {
    positions_total: AtomicU64,
    /// Position reports since last report (reset on report)
    positions_since_report: AtomicU64,
    positions_rejected: AtomicU64,
    positions_reaped: AtomicU64,
    matches_total: AtomicU64,
    match_no_zone: AtomicU64,
    match_no_taxi: AtomicU64,
    match_excluded: AtomicU64,
    match_latency: MatchLatency,
    hails_created: AtomicU64,
    transitions_total: AtomicU64,
    /// Lost compare-and-set on the expected starting status
    transition_conflicts: AtomicU64,
    /// Invalid, terminal or reason-less transition requests
    transitions_rejected: AtomicU64,
    timeouts_fired: AtomicU64,
    timeout_races_lost: AtomicU64,
    /// Side effects parked in the outbox because the queue was full
    events_deferred: AtomicU64,
    /// Side effects dropped because the outbox overflowed
    events_dropped: AtomicU64,
    operator_requests_ok: AtomicU64,
    operator_requests_failed: AtomicU64,
    customer_notifications_failed: AtomicU64,
    customers_banned: AtomicU64,
    /// Hail requests refused because the customer is banned
    hails_refused_banned: AtomicU64,
    hails_archived: AtomicU64,
    /// When the previous summary was taken
    last_report: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            positions_total: AtomicU64::new(0),
            positions_since_report: AtomicU64::new(0),
            positions_rejected: AtomicU64::new(0),
            positions_reaped: AtomicU64::new(0),
            matches_total: AtomicU64::new(0),
            match_no_zone: AtomicU64::new(0),
            match_no_taxi: AtomicU64::new(0),
            match_excluded: AtomicU64::new(0),
            match_latency: MatchLatency::new(),
            hails_created: AtomicU64::new(0),
            transitions_total: AtomicU64::new(0),
            transition_conflicts: AtomicU64::new(0),
            transitions_rejected: AtomicU64::new(0),
            timeouts_fired: AtomicU64::new(0),
            timeout_races_lost: AtomicU64::new(0),
            events_deferred: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            operator_requests_ok: AtomicU64::new(0),
            operator_requests_failed: AtomicU64::new(0),
            customer_notifications_failed: AtomicU64::new(0),
            customers_banned: AtomicU64::new(0),
            hails_refused_banned: AtomicU64::new(0),
            hails_archived: AtomicU64::new(0),
            last_report: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_position(&self) {
        self.positions_total.fetch_add(1, Ordering::Relaxed);
        self.positions_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_rejected(&self) {
        self.positions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_positions_reaped(&self, count: u64) {
        self.positions_reaped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_match(&self, latency_us: u64) {
        self.matches_total.fetch_add(1, Ordering::Relaxed);
        self.match_latency.observe(latency_us);
    }

    #[inline]
    pub fn record_match_no_zone(&self) {
        self.match_no_zone.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_match_no_taxi(&self) {
        self.match_no_taxi.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_match_excluded(&self) {
        self.match_excluded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_hail_created(&self) {
        self.hails_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition(&self) {
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition_conflict(&self) {
        self.transition_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition_rejected(&self) {
        self.transitions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timeout_fired(&self) {
        self.timeouts_fired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timeout_race_lost(&self) {
        self.timeout_races_lost.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_deferred(&self) {
        self.events_deferred.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operator_request(&self, ok: bool) {
        if ok {
            self.operator_requests_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.operator_requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_customer_notification_failed(&self) {
        self.customer_notifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_customer_banned(&self) {
        self.customers_banned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_hail_refused_banned(&self) {
        self.hails_refused_banned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hails_archived(&self, count: u64) {
        self.hails_archived.fetch_add(count, Ordering::Relaxed);
    }

    pub fn positions_total(&self) -> u64 {
        self.positions_total.load(Ordering::Relaxed)
    }

    pub fn transitions_total(&self) -> u64 {
        self.transitions_total.load(Ordering::Relaxed)
    }

    pub fn transition_conflicts(&self) -> u64 {
        self.transition_conflicts.load(Ordering::Relaxed)
    }

    pub fn timeouts_fired(&self) -> u64 {
        self.timeouts_fired.load(Ordering::Relaxed)
    }

    pub fn events_deferred(&self) -> u64 {
        self.events_deferred.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Summarize since the previous report
    ///
    /// Position rate and match latency cover the interval and restart at
    /// zero; every other counter is a running total.
    pub fn report(&self, tracked_taxis: usize, active_hails: usize) -> MetricsSummary {
        let positions_count = self.positions_since_report.swap(0, Ordering::Relaxed);
        let latency = self.match_latency.drain();

        let elapsed = {
            let mut last = self.last_report.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let positions_per_sec = if elapsed.as_secs_f64() > 0.0 {
            positions_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            positions_total: self.positions_total.load(Ordering::Relaxed),
            positions_per_sec,
            positions_rejected: self.positions_rejected.load(Ordering::Relaxed),
            positions_reaped: self.positions_reaped.load(Ordering::Relaxed),
            matches_total: self.matches_total.load(Ordering::Relaxed),
            match_no_zone: self.match_no_zone.load(Ordering::Relaxed),
            match_no_taxi: self.match_no_taxi.load(Ordering::Relaxed),
            match_excluded: self.match_excluded.load(Ordering::Relaxed),
            match_lat_avg_us: latency.avg_us(),
            match_lat_max_us: latency.max_us,
            match_lat_p50_us: latency.quantile_us(0.50),
            match_lat_p99_us: latency.quantile_us(0.99),
            match_lat_buckets: latency.buckets,
            hails_created: self.hails_created.load(Ordering::Relaxed),
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
            transition_conflicts: self.transition_conflicts.load(Ordering::Relaxed),
            transitions_rejected: self.transitions_rejected.load(Ordering::Relaxed),
            timeouts_fired: self.timeouts_fired.load(Ordering::Relaxed),
            timeout_races_lost: self.timeout_races_lost.load(Ordering::Relaxed),
            events_deferred: self.events_deferred.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            operator_requests_ok: self.operator_requests_ok.load(Ordering::Relaxed),
            operator_requests_failed: self.operator_requests_failed.load(Ordering::Relaxed),
            customer_notifications_failed: self
                .customer_notifications_failed
                .load(Ordering::Relaxed),
            customers_banned: self.customers_banned.load(Ordering::Relaxed),
            hails_refused_banned: self.hails_refused_banned.load(Ordering::Relaxed),
            hails_archived: self.hails_archived.load(Ordering::Relaxed),
            tracked_taxis,
            active_hails,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub positions_total: u64,
    pub positions_per_sec: f64,
    pub positions_rejected: u64,
    pub positions_reaped: u64,
    pub matches_total: u64,
    pub match_no_zone: u64,
    pub match_no_taxi: u64,
    pub match_excluded: u64,
    /// Per-bucket counts for `MATCH_LATENCY_BOUNDS_US`, open bucket last
    pub match_lat_buckets: [u64; MATCH_LATENCY_BUCKETS],
    pub match_lat_avg_us: u64,
    pub match_lat_max_us: u64,
    pub match_lat_p50_us: u64,
    pub match_lat_p99_us: u64,
    pub hails_created: u64,
    pub transitions_total: u64,
    pub transition_conflicts: u64,
    pub transitions_rejected: u64,
    pub timeouts_fired: u64,
    pub timeout_races_lost: u64,
    pub events_deferred: u64,
    pub events_dropped: u64,
    pub operator_requests_ok: u64,
    pub operator_requests_failed: u64,
    pub customer_notifications_failed: u64,
    pub customers_banned: u64,
    pub hails_refused_banned: u64,
    pub hails_archived: u64,
    pub tracked_taxis: usize,
    pub active_hails: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            positions_total = %self.positions_total,
            positions_per_sec = format!("{:.1}", self.positions_per_sec),
            tracked_taxis = %self.tracked_taxis,
            matches_total = %self.matches_total,
            match_p50_us = %self.match_lat_p50_us,
            match_p99_us = %self.match_lat_p99_us,
            hails_created = %self.hails_created,
            active_hails = %self.active_hails,
            transitions = %self.transitions_total,
            conflicts = %self.transition_conflicts,
            timeouts = %self.timeouts_fired,
            events_deferred = %self.events_deferred,
            "metrics"
        );
    }
}
