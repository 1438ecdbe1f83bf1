//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `position_store` - Latest taxi positions with a grid index
//! - `zone_index` - Service-area tree and exclusion areas
//! - `matching` - Candidate search for a pickup and operator
//! - `hail_machine` - Hail lifecycle and taxi binding
//! - `timeout_scheduler` - Forced timeouts on a fixed tick
//! - `dispatcher` - Request-to-hail orchestration
//! - `customer_bans` - Bans issued by `customer_banned` outcomes
//! - `sessions` - Session ownership and reuse for returning customers
//! - `notification_worker` - Async side effects of hail transitions

pub mod customer_bans;
pub mod dispatcher;
pub mod hail_machine;
pub mod matching;
pub mod notification_worker;
pub mod position_store;
pub mod sessions;
pub mod timeout_scheduler;
pub mod zone_index;

// Re-export commonly used types
pub use customer_bans::CustomerBans;
pub use dispatcher::{DispatchOutcome, Dispatcher, HailRequest};
pub use hail_machine::{HailMachine, TransitionRequest};
pub use matching::{MatchOutcome, MatchRequest, MatchSettings, MatchingEngine};
pub use notification_worker::NotificationWorker;
pub use position_store::{Candidate, PositionRecord, PositionStore};
pub use sessions::SessionTracker;
pub use timeout_scheduler::{TimeoutRule, TimeoutRules, TimeoutScheduler};
pub use zone_index::{ZoneIndex, ZonePermit};
