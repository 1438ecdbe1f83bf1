//! Latest known position per taxi, with a grid index for proximity queries
//!
//! Records live in a `DashMap` keyed by taxi; a second map indexes taxis by
//! coarse lat/lon grid cell. A taxi's cell membership is updated while its
//! record's entry lock is held, so updates for one taxi are serialized
//! without any global lock.
//!
//! Lock order is always records then cells. Queries copy the cell contents
//! out before touching records.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::geo::{haversine_m, METERS_PER_DEGREE};
use crate::domain::types::{GeoPoint, OperatorId, TaxiId, TaxiStatus};
use crate::infra::clock::Clock;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Above this many cells a query scans every record instead
const MAX_QUERY_CELLS: i64 = 4096;

type GridCell = (i32, i32);

/// Current state of one taxi
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionRecord {
    pub taxi_id: TaxiId,
    pub operator_id: OperatorId,
    pub point: GeoPoint,
    pub status: TaxiStatus,
    pub last_seen_ms: u64,
}

impl PositionRecord {
    #[inline]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen_ms)
    }
}

/// A taxi returned by a proximity query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub taxi_id: TaxiId,
    pub operator_id: OperatorId,
    pub point: GeoPoint,
    pub distance_m: f64,
    pub last_seen_ms: u64,
}

pub struct PositionStore {
    records: DashMap<TaxiId, PositionRecord>,
    cells: DashMap<GridCell, FxHashSet<TaxiId>>,
    cell_deg: f64,
    freshness_ms: u64,
    eviction_ms: u64,
    metrics: Arc<Metrics>,
}

impl PositionStore {
    pub fn new(freshness_ms: u64, eviction_ms: u64, cell_deg: f64, metrics: Arc<Metrics>) -> Self {
        let cell_deg = if cell_deg.is_finite() && cell_deg > 0.0 { cell_deg } else { 0.01 };
        Self {
            records: DashMap::new(),
            cells: DashMap::new(),
            cell_deg,
            freshness_ms,
            eviction_ms,
            metrics,
        }
    }

    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self::new(config.freshness_ms(), config.eviction_ms(), config.grid_cell_deg(), metrics)
    }

    pub fn freshness_ms(&self) -> u64 {
        self.freshness_ms
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    fn cell_of(&self, point: GeoPoint) -> GridCell {
        (
            (point.lat() / self.cell_deg).floor() as i32,
            (point.lon() / self.cell_deg).floor() as i32,
        )
    }

    /// Upsert a taxi's position; the last write wins.
    pub fn report_position(
        &self,
        taxi_id: TaxiId,
        operator_id: OperatorId,
        lat: f64,
        lon: f64,
        status: TaxiStatus,
        now_ms: u64,
    ) -> DispatchResult<()> {
        let point = match validate_report(&taxi_id, &operator_id, lat, lon) {
            Ok(point) => point,
            Err(e) => {
                self.metrics.record_position_rejected();
                return Err(e);
            }
        };
        let new_cell = self.cell_of(point);

        match self.records.entry(taxi_id) {
            Entry::Occupied(mut occupied) => {
                let old_cell = self.cell_of(occupied.get().point);
                if old_cell != new_cell {
                    self.remove_from_cell(old_cell, occupied.key());
                    self.cells.entry(new_cell).or_default().insert(occupied.key().clone());
                }
                let record = occupied.get_mut();
                record.operator_id = operator_id;
                record.point = point;
                record.status = status;
                record.last_seen_ms = now_ms;
            }
            Entry::Vacant(vacant) => {
                let taxi_id = vacant.key().clone();
                self.cells.entry(new_cell).or_default().insert(taxi_id.clone());
                vacant.insert(PositionRecord {
                    taxi_id,
                    operator_id,
                    point,
                    status,
                    last_seen_ms: now_ms,
                });
            }
        }
        self.metrics.record_position();
        Ok(())
    }

    fn remove_from_cell(&self, cell: GridCell, taxi_id: &TaxiId) {
        if let Entry::Occupied(mut members) = self.cells.entry(cell) {
            members.get_mut().remove(taxi_id);
            if members.get().is_empty() {
                members.remove();
            }
        }
    }

    /// Latest record for a taxi and how stale it is
    pub fn get(&self, taxi_id: &TaxiId, now_ms: u64) -> DispatchResult<(PositionRecord, u64)> {
        let record = self
            .records
            .get(taxi_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| DispatchError::not_found("taxi", taxi_id))?;
        let age = record.age_ms(now_ms);
        Ok((record, age))
    }

    /// Force a taxi's availability, keeping its position and last-seen time
    pub fn set_status(&self, taxi_id: &TaxiId, status: TaxiStatus) -> DispatchResult<()> {
        let mut record = self
            .records
            .get_mut(taxi_id)
            .ok_or_else(|| DispatchError::not_found("taxi", taxi_id))?;
        record.status = status;
        Ok(())
    }

    /// Free, fresh taxis within `radius_m`, nearest first (ties by taxi id)
    pub fn query_near(
        &self,
        point: GeoPoint,
        radius_m: f64,
        max_results: usize,
        now_ms: u64,
    ) -> Vec<Candidate> {
        self.query_near_where(point, radius_m, max_results, now_ms, |_| true)
    }

    /// Like `query_near`, with an extra filter applied before truncation
    pub fn query_near_where<F>(
        &self,
        point: GeoPoint,
        radius_m: f64,
        max_results: usize,
        now_ms: u64,
        filter: F,
    ) -> Vec<Candidate>
    where
        F: Fn(&PositionRecord) -> bool,
    {
        if !radius_m.is_finite() || radius_m < 0.0 || max_results == 0 {
            return Vec::new();
        }

        let accept = |record: &PositionRecord| -> Option<Candidate> {
            if record.status != TaxiStatus::Free || record.age_ms(now_ms) > self.freshness_ms {
                return None;
            }
            if !filter(record) {
                return None;
            }
            let distance_m = haversine_m(point, record.point);
            (distance_m <= radius_m).then(|| Candidate {
                taxi_id: record.taxi_id.clone(),
                operator_id: record.operator_id.clone(),
                point: record.point,
                distance_m,
                last_seen_ms: record.last_seen_ms,
            })
        };

        let mut found: Vec<Candidate> = match self.cells_covering(point, radius_m) {
            Some(cells) => {
                let mut ids: Vec<TaxiId> = Vec::new();
                for cell in cells {
                    if let Some(members) = self.cells.get(&cell) {
                        ids.extend(members.iter().cloned());
                    }
                }
                ids.iter()
                    .filter_map(|id| self.records.get(id).and_then(|r| accept(r.value())))
                    .collect()
            }
            None => self.records.iter().filter_map(|r| accept(r.value())).collect(),
        };

        found.sort_by(|a, b| {
            a.distance_m.total_cmp(&b.distance_m).then_with(|| a.taxi_id.cmp(&b.taxi_id))
        });
        found.truncate(max_results);
        found
    }

    /// Grid cells intersecting the query circle's bounding box, or None when too many
    fn cells_covering(&self, point: GeoPoint, radius_m: f64) -> Option<Vec<GridCell>> {
        let dlat = radius_m / METERS_PER_DEGREE;
        let cos_lat = point.lat().to_radians().cos().max(0.01);
        let dlon = radius_m / (METERS_PER_DEGREE * cos_lat);

        let lat_lo = ((point.lat() - dlat) / self.cell_deg).floor() as i64;
        let lat_hi = ((point.lat() + dlat) / self.cell_deg).floor() as i64;
        let lon_lo = ((point.lon() - dlon) / self.cell_deg).floor() as i64;
        let lon_hi = ((point.lon() + dlon) / self.cell_deg).floor() as i64;

        let count = (lat_hi - lat_lo + 1).saturating_mul(lon_hi - lon_lo + 1);
        if count > MAX_QUERY_CELLS {
            return None;
        }

        let mut cells = Vec::with_capacity(count as usize);
        for lat in lat_lo..=lat_hi {
            for lon in lon_lo..=lon_hi {
                cells.push((lat as i32, lon as i32));
            }
        }
        Some(cells)
    }

    /// Evict records older than the eviction window; returns how many
    pub fn reap(&self, now_ms: u64) -> usize {
        let mut evicted = 0usize;
        self.records.retain(|taxi_id, record| {
            if record.age_ms(now_ms) > self.eviction_ms {
                self.remove_from_cell(self.cell_of(record.point), taxi_id);
                evicted += 1;
                false
            } else {
                true
            }
        });
        if evicted > 0 {
            self.metrics.record_positions_reaped(evicted as u64);
        }
        evicted
    }
}

fn validate_report(
    taxi_id: &TaxiId,
    operator_id: &OperatorId,
    lat: f64,
    lon: f64,
) -> DispatchResult<GeoPoint> {
    if taxi_id.as_str().is_empty() {
        return Err(DispatchError::Validation("empty taxi id".to_string()));
    }
    if operator_id.as_str().is_empty() {
        return Err(DispatchError::Validation(format!("empty operator id for taxi {taxi_id}")));
    }
    GeoPoint::new(lat, lon)
}

/// Periodically evict stale positions until shutdown
pub async fn run_reaper(
    store: Arc<PositionStore>,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    info!(interval_secs = %interval_secs, "position_reaper_started");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = store.reap(clock.now_ms());
                if evicted > 0 {
                    debug!(evicted = %evicted, remaining = %store.len(), "positions_reaped");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("position_reaper_stopped");
                    return;
                }
            }
        }
    }
}
