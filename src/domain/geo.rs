//! Great-circle distance and polygon containment
//!
//! Polygons use GeoJSON coordinate order (`[lon, lat]`): the first ring is the
//! exterior, any further rings are holes.

use crate::domain::types::GeoPoint;
use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude (and of longitude at the equator)
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Haversine distance between two points, in meters
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat().to_radians(), a.lon().to_radians());
    let (lat2, lon2) = (b.lat().to_radians(), b.lon().to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Axis-aligned bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn empty() -> Self {
        Self {
            min_lon: f64::INFINITY,
            min_lat: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            max_lat: f64::NEG_INFINITY,
        }
    }

    pub fn extend(&mut self, lon: f64, lat: f64) {
        self.min_lon = self.min_lon.min(lon);
        self.min_lat = self.min_lat.min(lat);
        self.max_lon = self.max_lon.max(lon);
        self.max_lat = self.max_lat.max(lat);
    }

    pub fn union(&mut self, other: &BoundingBox) {
        self.min_lon = self.min_lon.min(other.min_lon);
        self.min_lat = self.min_lat.min(other.min_lat);
        self.max_lon = self.max_lon.max(other.max_lon);
        self.max_lat = self.max_lat.max(other.max_lat);
    }

    #[inline]
    pub fn contains(&self, point: GeoPoint) -> bool {
        point.lon() >= self.min_lon
            && point.lon() <= self.max_lon
            && point.lat() >= self.min_lat
            && point.lat() <= self.max_lat
    }
}

/// Polygon with optional holes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polygon {
    pub rings: Vec<Vec<[f64; 2]>>,
}

impl Polygon {
    pub fn new(rings: Vec<Vec<[f64; 2]>>) -> Self {
        Self { rings }
    }

    /// Exterior ring has at least three vertices and every vertex is finite
    pub fn is_valid(&self) -> bool {
        match self.rings.first() {
            Some(exterior) if exterior.len() >= 3 => self
                .rings
                .iter()
                .flatten()
                .all(|[lon, lat]| lon.is_finite() && lat.is_finite()),
            _ => false,
        }
    }

    pub fn bbox(&self) -> BoundingBox {
        let mut bbox = BoundingBox::empty();
        if let Some(exterior) = self.rings.first() {
            for [lon, lat] in exterior {
                bbox.extend(*lon, *lat);
            }
        }
        bbox
    }

    /// Even-odd containment: inside the exterior ring and outside every hole
    pub fn contains(&self, point: GeoPoint) -> bool {
        let Some((exterior, holes)) = self.rings.split_first() else {
            return false;
        };
        ring_contains(exterior, point) && !holes.iter().any(|hole| ring_contains(hole, point))
    }
}

/// Union of polygons (a town made of several parts)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultiPolygon {
    pub polygons: Vec<Polygon>,
}

impl MultiPolygon {
    pub fn new(polygons: Vec<Polygon>) -> Self {
        Self { polygons }
    }

    pub fn is_valid(&self) -> bool {
        !self.polygons.is_empty() && self.polygons.iter().all(Polygon::is_valid)
    }

    pub fn bbox(&self) -> BoundingBox {
        let mut bbox = BoundingBox::empty();
        for polygon in &self.polygons {
            bbox.union(&polygon.bbox());
        }
        bbox
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        self.polygons.iter().any(|p| p.contains(point))
    }
}

/// Ray casting on a single ring; open or closed rings are both accepted
fn ring_contains(ring: &[[f64; 2]], point: GeoPoint) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let (x, y) = (point.lon(), point.lat());
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
