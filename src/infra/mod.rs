//! Infrastructure - clock, configuration and metrics
//!
//! - `clock` - wall-clock abstraction for background services
//! - `config` - application configuration (TOML loading, defaults)
//! - `metrics` - lock-free metrics collection

pub mod clock;
pub mod config;
pub mod metrics;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use metrics::Metrics;
