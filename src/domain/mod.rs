//! Domain models - identifiers, geometry and the hail lifecycle
//!
//! - `types` - ids, coordinates, taxi status, actors
//! - `geo` - haversine distance, polygons, bounding boxes
//! - `zone` - zone, town and exclusion-area definitions
//! - `hail` - hail states, transition table, transition log
//! - `error` - `DispatchError` taxonomy

pub mod error;
pub mod geo;
pub mod hail;
pub mod types;
pub mod zone;

pub use error::{DispatchError, DispatchResult};
pub use hail::{Hail, HailEvent, HailStatus, NewHail, TransitionLogEntry};
pub use types::{
    Actor, CustomerId, GeoPoint, HailId, InseeCode, OperatorId, SessionId, TaxiId, TaxiStatus,
    ZoneId,
};
