//! Service-area index: which zones contain a point, and who may serve it
//!
//! `rebuild` validates the zone tree, builds a new immutable snapshot outside
//! any lock, then swaps it in. Readers clone the current `Arc` and never see a
//! partially built index.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::geo::{BoundingBox, MultiPolygon, Polygon};
use crate::domain::types::{GeoPoint, InseeCode, OperatorId, ZoneId};
use crate::domain::zone::{ExclusionDef, TownDef, ZoneDef, ZonePrecedence};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::info;

struct ZoneEntry {
    def: ZoneDef,
    allowed: FxHashSet<OperatorId>,
    /// Own towns plus every descendant's towns
    effective_towns: usize,
}

struct TownEntry {
    insee: InseeCode,
    shape: MultiPolygon,
    bbox: BoundingBox,
}

struct ExclusionEntry {
    id: u32,
    shape: Polygon,
    bbox: BoundingBox,
}

#[derive(Default)]
struct ZoneSnapshot {
    version: u64,
    zones: FxHashMap<ZoneId, ZoneEntry>,
    towns: Vec<TownEntry>,
    /// Flattened town -> covering zones (including ancestors)
    town_zones: FxHashMap<InseeCode, SmallVec<[ZoneId; 4]>>,
    exclusions: Vec<ExclusionEntry>,
}

/// Counts describing the active snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneIndexStats {
    pub version: u64,
    pub zones: usize,
    pub towns: usize,
    pub exclusions: usize,
}

/// Whether an operator may serve a pickup point
#[derive(Debug, Clone, PartialEq)]
pub enum ZonePermit {
    /// Allowed by these zones, most specific first
    Allowed { zones: Vec<ZoneId>, max_distance_m: Option<f64> },
    /// The point lies in no zone at all
    OutsideZones,
    /// The point lies in zones, none of which admit the operator
    Denied,
}

pub struct ZoneIndex {
    snapshot: RwLock<Arc<ZoneSnapshot>>,
}

impl ZoneIndex {
    /// Empty index: every point is outside all zones
    pub fn new() -> Self {
        Self { snapshot: RwLock::new(Arc::new(ZoneSnapshot::default())) }
    }

    fn current(&self) -> Arc<ZoneSnapshot> {
        self.snapshot.read().clone()
    }

    /// Validate reference data and atomically replace the index
    ///
    /// On error the previous snapshot stays active.
    pub fn rebuild(
        &self,
        zones: Vec<ZoneDef>,
        towns: Vec<TownDef>,
        exclusions: Vec<ExclusionDef>,
    ) -> DispatchResult<ZoneIndexStats> {
        let version = self.current().version + 1;
        let snapshot = build_snapshot(version, zones, towns, exclusions)?;
        let stats = ZoneIndexStats {
            version,
            zones: snapshot.zones.len(),
            towns: snapshot.towns.len(),
            exclusions: snapshot.exclusions.len(),
        };
        *self.snapshot.write() = Arc::new(snapshot);
        info!(
            version = %stats.version,
            zones = %stats.zones,
            towns = %stats.towns,
            exclusions = %stats.exclusions,
            "zone_index_rebuilt"
        );
        Ok(stats)
    }

    pub fn stats(&self) -> ZoneIndexStats {
        let snapshot = self.current();
        ZoneIndexStats {
            version: snapshot.version,
            zones: snapshot.zones.len(),
            towns: snapshot.towns.len(),
            exclusions: snapshot.exclusions.len(),
        }
    }

    /// Zones containing the point, most specific first
    ///
    /// Ranking: fewest effective towns, then higher priority, then lower id.
    pub fn zones_containing(&self, point: GeoPoint) -> Vec<ZoneId> {
        let snapshot = self.current();
        ranked_zones(&snapshot, point).into_iter().map(|entry| entry.def.id).collect()
    }

    /// Whether the operator is on the zone's allow-list
    pub fn is_allowed(&self, zone: ZoneId, operator: &OperatorId) -> DispatchResult<bool> {
        let snapshot = self.current();
        let entry = snapshot.zones.get(&zone).ok_or_else(|| DispatchError::not_found("zone", zone))?;
        Ok(entry.allowed.contains(operator))
    }

    /// Whether the point lies inside any exclusion area
    pub fn is_excluded(&self, point: GeoPoint) -> bool {
        self.excluding_area(point).is_some()
    }

    /// Id of the first exclusion area containing the point
    pub fn excluding_area(&self, point: GeoPoint) -> Option<u32> {
        let snapshot = self.current();
        snapshot
            .exclusions
            .iter()
            .find(|e| e.bbox.contains(point) && e.shape.contains(point))
            .map(|e| e.id)
    }

    /// Decide whether `operator` may serve a pickup at `point`
    pub fn permits(
        &self,
        point: GeoPoint,
        operator: &OperatorId,
        precedence: ZonePrecedence,
    ) -> ZonePermit {
        let snapshot = self.current();
        let ranked = ranked_zones(&snapshot, point);
        if ranked.is_empty() {
            return ZonePermit::OutsideZones;
        }

        let deciding: Vec<&ZoneEntry> = match precedence {
            ZonePrecedence::AnyZone => {
                ranked.into_iter().filter(|entry| entry.allowed.contains(operator)).collect()
            }
            ZonePrecedence::MostSpecific => {
                ranked.into_iter().take(1).filter(|entry| entry.allowed.contains(operator)).collect()
            }
        };
        if deciding.is_empty() {
            return ZonePermit::Denied;
        }

        let max_distance_m = deciding
            .iter()
            .filter_map(|entry| entry.def.max_distance_m)
            .filter(|d| d.is_finite() && *d > 0.0)
            .reduce(f64::min);
        ZonePermit::Allowed { zones: deciding.iter().map(|entry| entry.def.id).collect(), max_distance_m }
    }
}

impl Default for ZoneIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn ranked_zones(snapshot: &ZoneSnapshot, point: GeoPoint) -> Vec<&ZoneEntry> {
    let mut found: FxHashSet<ZoneId> = FxHashSet::default();
    for town in &snapshot.towns {
        if town.bbox.contains(point) && town.shape.contains(point) {
            if let Some(zones) = snapshot.town_zones.get(&town.insee) {
                found.extend(zones.iter().copied());
            }
        }
    }

    let mut ranked: Vec<&ZoneEntry> =
        found.iter().filter_map(|id| snapshot.zones.get(id)).collect();
    ranked.sort_by_key(|entry| (entry.effective_towns, Reverse(entry.def.priority), entry.def.id));
    ranked
}

fn build_snapshot(
    version: u64,
    zones: Vec<ZoneDef>,
    towns: Vec<TownDef>,
    exclusions: Vec<ExclusionDef>,
) -> DispatchResult<ZoneSnapshot> {
    let invalid = |msg: String| DispatchError::Validation(msg);

    let mut town_entries = Vec::with_capacity(towns.len());
    let mut known_towns: FxHashSet<InseeCode> = FxHashSet::default();
    for town in towns {
        if !known_towns.insert(town.insee.clone()) {
            return Err(invalid(format!("duplicate town {}", town.insee)));
        }
        if !town.shape.is_valid() {
            return Err(invalid(format!("town {} has an invalid shape", town.insee)));
        }
        let bbox = town.shape.bbox();
        town_entries.push(TownEntry { insee: town.insee, shape: town.shape, bbox });
    }

    let mut defs: FxHashMap<ZoneId, ZoneDef> = FxHashMap::default();
    for zone in zones {
        if let Some(max) = zone.max_distance_m {
            if !max.is_finite() || max < 0.0 {
                return Err(invalid(format!("zone {} has an invalid max distance", zone.id)));
            }
        }
        let id = zone.id;
        if defs.insert(id, zone).is_some() {
            return Err(invalid(format!("duplicate zone {id}")));
        }
    }

    for def in defs.values() {
        if let Some(parent) = def.parent_id {
            if !defs.contains_key(&parent) {
                return Err(invalid(format!("zone {} has unknown parent {parent}", def.id)));
            }
        }
        if let Some(town) = def.towns.iter().find(|t| !known_towns.contains(*t)) {
            return Err(invalid(format!("zone {} references unknown town {town}", def.id)));
        }
    }

    // Parent chains must end at a root within |zones| steps
    for def in defs.values() {
        let mut seen: FxHashSet<ZoneId> = FxHashSet::default();
        let mut cursor = Some(def.id);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(invalid(format!("zone {} is part of a parent cycle", def.id)));
            }
            cursor = defs.get(&id).and_then(|d| d.parent_id);
        }
    }

    // Each town is covered by its zone and every ancestor of that zone
    let mut town_zones: FxHashMap<InseeCode, SmallVec<[ZoneId; 4]>> = FxHashMap::default();
    let mut effective: FxHashMap<ZoneId, FxHashSet<InseeCode>> = FxHashMap::default();
    for def in defs.values() {
        for town in &def.towns {
            let mut cursor = Some(def.id);
            while let Some(id) = cursor {
                effective.entry(id).or_default().insert(town.clone());
                let covering = town_zones.entry(town.clone()).or_default();
                if !covering.contains(&id) {
                    covering.push(id);
                }
                cursor = defs.get(&id).and_then(|d| d.parent_id);
            }
        }
    }

    let zones = defs
        .into_iter()
        .map(|(id, def)| {
            let allowed = def.operators.iter().cloned().collect();
            let effective_towns = effective.get(&id).map_or(0, |towns| towns.len());
            (id, ZoneEntry { def, allowed, effective_towns })
        })
        .collect();

    let mut exclusion_entries = Vec::with_capacity(exclusions.len());
    for exclusion in exclusions {
        if !exclusion.shape.is_valid() {
            return Err(invalid(format!("exclusion {} has an invalid shape", exclusion.id)));
        }
        let bbox = exclusion.shape.bbox();
        exclusion_entries.push(ExclusionEntry { id: exclusion.id, shape: exclusion.shape, bbox });
    }

    Ok(ZoneSnapshot { version, zones, towns: town_entries, town_zones, exclusions: exclusion_entries })
}
