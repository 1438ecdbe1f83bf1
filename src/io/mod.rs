//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT subscription for taxi position reports
//! - `event_channel` - Bounded hail event queue with overflow outbox
//! - `notifier` - HTTP notifications to operators and customers
//! - `reference_data` - Zone/town/exclusion JSON loading
//! - `archive` - Terminal hail output to file (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod archive;
pub mod event_channel;
pub mod mqtt;
pub mod notifier;
pub mod prometheus;
pub mod reference_data;

// Re-export commonly used types
pub use archive::{run_archiver, HailArchive};
pub use event_channel::{create_event_channel, HailEventSender};
pub use mqtt::{start_position_feed, PositionReport};
pub use notifier::{HailNotifier, HttpNotifier, LogNotifier, NotifyError, OperatorAck};
pub use prometheus::{start_metrics_server, MetricsSources};
pub use reference_data::ReferenceData;
