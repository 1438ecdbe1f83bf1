//! Service-area reference data: towns, zones and exclusion areas

use crate::domain::geo::{MultiPolygon, Polygon};
use crate::domain::types::{InseeCode, OperatorId, ZoneId};
use serde::{Deserialize, Serialize};

/// A town and its administrative boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TownDef {
    pub insee: InseeCode,
    #[serde(default)]
    pub name: String,
    pub shape: MultiPolygon,
}

/// A service area built from member towns
///
/// A zone covers its own towns and every descendant's towns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDef {
    pub id: ZoneId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<ZoneId>,
    #[serde(default)]
    pub towns: Vec<InseeCode>,
    /// Operators allowed to take hails with a pickup in this zone
    #[serde(default)]
    pub operators: Vec<OperatorId>,
    #[serde(default)]
    pub priority: i32,
    /// Search radius cap for pickups in this zone (meters)
    #[serde(default)]
    pub max_distance_m: Option<f64>,
}

/// Area where restricted operators may not pick up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionDef {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub shape: Polygon,
}

/// How overlapping zones decide whether an operator may serve a pickup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZonePrecedence {
    /// Allowed when any containing zone lists the operator
    #[default]
    AnyZone,
    /// Only the top-ranked containing zone decides
    MostSpecific,
}
