//! Zone reference data file
//!
//! One JSON document with the towns, zones and exclusion areas the zone index
//! is built from. Shapes use GeoJSON coordinate order (`[lon, lat]`).

use crate::domain::zone::{ExclusionDef, TownDef, ZoneDef};
use crate::services::zone_index::{ZoneIndex, ZoneIndexStats};
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReferenceData {
    pub towns: Vec<TownDef>,
    pub zones: Vec<ZoneDef>,
    pub exclusions: Vec<ExclusionDef>,
}

impl ReferenceData {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read reference data: {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("Failed to parse reference data: {}", path.display()))
    }

    pub fn from_json_str(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Validate and swap into the index; the previous snapshot stays on error
    pub fn apply_to(self, index: &ZoneIndex) -> anyhow::Result<ZoneIndexStats> {
        index
            .rebuild(self.zones, self.towns, self.exclusions)
            .context("Reference data rejected by zone index")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{GeoPoint, OperatorId};
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "towns": [
            {"insee": "75056", "name": "Paris",
             "shape": [[[[2.25, 48.80], [2.45, 48.80], [2.45, 48.90], [2.25, 48.90], [2.25, 48.80]]]]}
        ],
        "zones": [
            {"id": 1, "name": "Paris", "towns": ["75056"], "operators": ["op"], "max_distance_m": 1500}
        ],
        "exclusions": [
            {"id": 7, "name": "Gare", "shape": [[[2.37, 48.84], [2.38, 48.84], [2.38, 48.85], [2.37, 48.85]]]}
        ]
    }"#;

    #[test]
    fn test_load_and_apply() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let data = ReferenceData::from_file(file.path()).unwrap();
        assert_eq!(data.zones[0].max_distance_m, Some(1500.0));

        let index = ZoneIndex::new();
        let stats = data.apply_to(&index).unwrap();
        assert_eq!((stats.zones, stats.towns, stats.exclusions), (1, 1, 1));

        let pickup = GeoPoint::new(48.85, 2.35).unwrap();
        assert_eq!(index.zones_containing(pickup).len(), 1);
        assert!(index.is_allowed(index.zones_containing(pickup)[0], &OperatorId::from("op")).unwrap());
        assert!(index.is_excluded(GeoPoint::new(48.845, 2.375).unwrap()));
    }

    #[test]
    fn test_unknown_town_is_rejected() {
        let data = ReferenceData::from_json_str(
            r#"{"zones": [{"id": 1, "towns": ["99999"], "operators": ["op"]}]}"#,
        )
        .unwrap();
        assert!(data.apply_to(&ZoneIndex::new()).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = ReferenceData::from_file("/nonexistent/zones.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read reference data"));
    }
}
