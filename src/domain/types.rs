//! Shared identifier and value types for the dispatch core

use crate::domain::error::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Newtype wrappers for string identifiers to provide type safety
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Taxi identifier as assigned by the registry
    TaxiId
);
string_id!(
    /// Operator (fleet or dispatch company) identifier
    OperatorId
);
string_id!(
    /// Opaque customer reference supplied by the booking engine
    CustomerId
);
string_id!(
    /// Groups the hails issued from one customer session
    SessionId
);
string_id!(
    /// INSEE code of a town
    InseeCode
);
string_id!(
    /// Globally unique hail identifier
    HailId
);

impl HailId {
    pub fn generate() -> Self {
        Self(new_uuid_v7())
    }
}

impl SessionId {
    pub fn generate() -> Self {
        Self(new_uuid_v7())
    }
}

/// Newtype wrapper for zone IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ZoneId(pub u32);

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// WGS84 coordinate, validated on construction
///
/// Fields are private so every point, deserialized ones included, goes
/// through `GeoPoint::new`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGeoPoint")]
pub struct GeoPoint {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
struct RawGeoPoint {
    lat: f64,
    lon: f64,
}

impl TryFrom<RawGeoPoint> for GeoPoint {
    type Error = DispatchError;

    fn try_from(raw: RawGeoPoint) -> Result<Self, Self::Error> {
        GeoPoint::new(raw.lat, raw.lon)
    }
}

impl GeoPoint {
    /// Build a point, rejecting non-finite or out-of-range values and null island.
    ///
    /// Devices without a fix report `(0, 0)`; it is never a real pickup or taxi
    /// position in the service areas, so it is treated as missing data.
    pub fn new(lat: f64, lon: f64) -> DispatchResult<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(DispatchError::Validation(format!("non-finite coordinate ({lat}, {lon})")));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(DispatchError::Validation(format!("latitude {lat} out of range")));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(DispatchError::Validation(format!("longitude {lon} out of range")));
        }
        if lat == 0.0 && lon == 0.0 {
            return Err(DispatchError::Validation("null island coordinate (0, 0)".to_string()));
        }
        Ok(Self { lat, lon })
    }

    #[inline]
    pub fn lat(&self) -> f64 {
        self.lat
    }

    #[inline]
    pub fn lon(&self) -> f64 {
        self.lon
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6}", self.lat, self.lon)
    }
}

/// Availability status reported by (or forced onto) a taxi
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxiStatus {
    Free,
    Answering,
    Occupied,
    Oncoming,
    Off,
}

impl TaxiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxiStatus::Free => "free",
            TaxiStatus::Answering => "answering",
            TaxiStatus::Occupied => "occupied",
            TaxiStatus::Oncoming => "oncoming",
            TaxiStatus::Off => "off",
        }
    }
}

impl fmt::Display for TaxiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaxiStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(TaxiStatus::Free),
            "answering" => Ok(TaxiStatus::Answering),
            "occupied" => Ok(TaxiStatus::Occupied),
            "oncoming" => Ok(TaxiStatus::Oncoming),
            "off" => Ok(TaxiStatus::Off),
            other => Err(DispatchError::Validation(format!("unknown taxi status {other:?}"))),
        }
    }
}

/// Who requested a hail transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    System,
    Operator(OperatorId),
    Customer(CustomerId),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Operator(id) => write!(f, "operator:{id}"),
            Actor::Customer(id) => write!(f, "customer:{id}"),
        }
    }
}
