//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default: config/dev.toml).
//! Every section is optional; missing keys take the defaults below.

use crate::domain::hail::HailStatus;
use crate::domain::types::OperatorId;
use crate::domain::zone::ZonePrecedence;
use anyhow::Context;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Deployment identifier, used as the metrics `site` label
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "hail-dispatch".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PositionsConfig {
    /// Positions older than this are ignored by matching
    pub freshness_secs: u64,
    /// Positions older than this are evicted by the reaper
    pub eviction_secs: u64,
    pub reap_interval_secs: u64,
    /// Grid cell size in degrees for the proximity index
    pub grid_cell_deg: f64,
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self { freshness_secs: 30, eviction_secs: 300, reap_interval_secs: 30, grid_cell_deg: 0.01 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub min_radius_m: f64,
    pub default_max_radius_m: f64,
    pub max_results: usize,
    pub zone_precedence: ZonePrecedence,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_radius_m: 250.0,
            default_max_radius_m: 3000.0,
            max_results: 10,
            zone_precedence: ZonePrecedence::AnyZone,
        }
    }
}

/// Outbound notification transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    /// POST to operator endpoints and the customer webhook
    Http,
    /// Log only; operators are treated as having acknowledged
    Log,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HailsConfig {
    /// Bounded retries on ConcurrentModification for caller-side transitions
    pub transition_retries: u32,
    /// Hails reaching the operator step later than this fail
    pub operator_dispatch_max_delay_secs: u64,
    /// Terminal hails stay in memory this long before archiving
    pub archive_after_secs: u64,
    pub archive_interval_secs: u64,
    pub archive_file: String,
    /// Capacity of the side-effect queue to the notification worker
    pub event_buffer: usize,
    /// Events parked while the queue is full; oldest dropped beyond this
    pub outbox_capacity: usize,
    pub notifier: NotifierKind,
    pub notify_timeout_ms: u64,
    /// Customer and operator requests in flight at once
    pub notify_concurrency: usize,
    /// First ban after `customer_banned`; repeat bans double
    pub customer_ban_secs: u64,
    /// A customer hailing again within this window keeps their session
    pub session_reuse_secs: u64,
}

impl Default for HailsConfig {
    fn default() -> Self {
        Self {
            transition_retries: 3,
            operator_dispatch_max_delay_secs: 10,
            archive_after_secs: 3600,
            archive_interval_secs: 60,
            archive_file: "hails.jsonl".to_string(),
            event_buffer: 1024,
            outbox_capacity: 10_000,
            notifier: NotifierKind::Http,
            notify_timeout_ms: 5000,
            notify_concurrency: 64,
            customer_ban_secs: 24 * 3600,
            session_reuse_secs: 300,
        }
    }
}

/// One forced transition: hails sitting in `state` longer than `after_secs` move to `target`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TimeoutRuleConfig {
    pub state: HailStatus,
    pub after_secs: u64,
    pub target: HailStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub tick_ms: u64,
    pub rules: Vec<TimeoutRuleConfig>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self { tick_ms: 1000, rules: default_timeout_rules() }
    }
}

/// Default deadlines per timeout-eligible state
pub fn default_timeout_rules() -> Vec<TimeoutRuleConfig> {
    let rule = |state, after_secs, target| TimeoutRuleConfig { state, after_secs, target };
    vec![
        rule(HailStatus::SentToOperator, 10, HailStatus::Failure),
        rule(HailStatus::ReceivedByTaxi, 30, HailStatus::TimeoutTaxi),
        rule(HailStatus::AcceptedByTaxi, 30, HailStatus::TimeoutAcceptedByCustomer),
        rule(HailStatus::AcceptedByCustomer, 30 * 60, HailStatus::OutdatedTaxi),
        rule(HailStatus::CustomerOnBoard, 2 * 60 * 60, HailStatus::OutdatedTaxi),
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            topic: "taxis/positions".to_string(),
            client_id: "hail-dispatch".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10, prometheus_port: 9100 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// JSON file with towns, zones and exclusion areas
    pub zones_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CustomerConfig {
    /// Endpoint receiving hail status changes for customers
    pub webhook_url: Option<String>,
}

/// Per-operator dispatch settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub hail_endpoint: Option<String>,
    pub api_key_header: Option<String>,
    pub api_key: Option<String>,
    /// Pickups inside exclusion areas are refused for this operator
    pub restricted_dispatch: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub site: SiteConfig,
    pub positions: PositionsConfig,
    pub matching: MatchingConfig,
    pub hails: HailsConfig,
    pub timeouts: TimeoutsConfig,
    pub mqtt: MqttConfig,
    pub metrics: MetricsConfig,
    pub reference: ReferenceConfig,
    pub customer: CustomerConfig,
    pub operators: HashMap<String, OperatorConfig>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    freshness_secs: u64,
    eviction_secs: u64,
    reap_interval_secs: u64,
    grid_cell_deg: f64,
    min_radius_m: f64,
    default_max_radius_m: f64,
    max_results: usize,
    zone_precedence: ZonePrecedence,
    transition_retries: u32,
    operator_dispatch_max_delay_secs: u64,
    archive_after_secs: u64,
    archive_interval_secs: u64,
    archive_file: String,
    event_buffer: usize,
    outbox_capacity: usize,
    notifier: NotifierKind,
    notify_timeout_ms: u64,
    notify_concurrency: usize,
    customer_ban_secs: u64,
    session_reuse_secs: u64,
    timeout_tick_ms: u64,
    timeout_rules: Vec<TimeoutRuleConfig>,
    mqtt: MqttConfig,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    zones_file: Option<String>,
    customer_webhook_url: Option<String>,
    operators: FxHashMap<OperatorId, OperatorConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let operators = toml_config
            .operators
            .into_iter()
            .map(|(id, operator)| (OperatorId::new(id), operator))
            .collect();

        Self {
            site_id: toml_config.site.id,
            freshness_secs: toml_config.positions.freshness_secs,
            eviction_secs: toml_config.positions.eviction_secs,
            reap_interval_secs: toml_config.positions.reap_interval_secs,
            grid_cell_deg: toml_config.positions.grid_cell_deg,
            min_radius_m: toml_config.matching.min_radius_m,
            default_max_radius_m: toml_config.matching.default_max_radius_m,
            max_results: toml_config.matching.max_results,
            zone_precedence: toml_config.matching.zone_precedence,
            transition_retries: toml_config.hails.transition_retries,
            operator_dispatch_max_delay_secs: toml_config.hails.operator_dispatch_max_delay_secs,
            archive_after_secs: toml_config.hails.archive_after_secs,
            archive_interval_secs: toml_config.hails.archive_interval_secs,
            archive_file: toml_config.hails.archive_file,
            event_buffer: toml_config.hails.event_buffer,
            outbox_capacity: toml_config.hails.outbox_capacity,
            notifier: toml_config.hails.notifier,
            notify_timeout_ms: toml_config.hails.notify_timeout_ms,
            notify_concurrency: toml_config.hails.notify_concurrency,
            customer_ban_secs: toml_config.hails.customer_ban_secs,
            session_reuse_secs: toml_config.hails.session_reuse_secs,
            timeout_tick_ms: toml_config.timeouts.tick_ms,
            timeout_rules: toml_config.timeouts.rules,
            mqtt: toml_config.mqtt,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            zones_file: toml_config.reference.zones_file,
            customer_webhook_url: toml_config.customer.webhook_url,
            operators,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, path.display().to_string())
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, config_file: String) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;
        Ok(Self::from_toml(toml_config, config_file))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn freshness_ms(&self) -> u64 {
        self.freshness_secs * 1000
    }

    pub fn eviction_ms(&self) -> u64 {
        self.eviction_secs * 1000
    }

    pub fn reap_interval_secs(&self) -> u64 {
        self.reap_interval_secs
    }

    pub fn grid_cell_deg(&self) -> f64 {
        self.grid_cell_deg
    }

    pub fn min_radius_m(&self) -> f64 {
        self.min_radius_m
    }

    pub fn default_max_radius_m(&self) -> f64 {
        self.default_max_radius_m
    }

    pub fn max_results(&self) -> usize {
        self.max_results
    }

    pub fn zone_precedence(&self) -> ZonePrecedence {
        self.zone_precedence
    }

    pub fn transition_retries(&self) -> u32 {
        self.transition_retries
    }

    pub fn operator_dispatch_max_delay_ms(&self) -> u64 {
        self.operator_dispatch_max_delay_secs * 1000
    }

    pub fn archive_after_ms(&self) -> u64 {
        self.archive_after_secs * 1000
    }

    pub fn archive_interval_secs(&self) -> u64 {
        self.archive_interval_secs
    }

    pub fn archive_file(&self) -> &str {
        &self.archive_file
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer
    }

    pub fn outbox_capacity(&self) -> usize {
        self.outbox_capacity
    }

    pub fn notifier(&self) -> NotifierKind {
        self.notifier
    }

    pub fn notify_timeout_ms(&self) -> u64 {
        self.notify_timeout_ms
    }

    pub fn notify_concurrency(&self) -> usize {
        self.notify_concurrency.max(1)
    }

    pub fn customer_ban_ms(&self) -> u64 {
        self.customer_ban_secs * 1000
    }

    pub fn session_reuse_ms(&self) -> u64 {
        self.session_reuse_secs * 1000
    }

    pub fn timeout_tick_ms(&self) -> u64 {
        self.timeout_tick_ms
    }

    pub fn timeout_rules(&self) -> &[TimeoutRuleConfig] {
        &self.timeout_rules
    }

    pub fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn zones_file(&self) -> Option<&str> {
        self.zones_file.as_deref()
    }

    pub fn customer_webhook_url(&self) -> Option<&str> {
        self.customer_webhook_url.as_deref()
    }

    pub fn operators(&self) -> &FxHashMap<OperatorId, OperatorConfig> {
        &self.operators
    }

    pub fn operator(&self, id: &OperatorId) -> Option<&OperatorConfig> {
        self.operators.get(id)
    }

    /// Operators configured for restricted dispatch
    pub fn restricted_operators(&self) -> impl Iterator<Item = &OperatorId> {
        self.operators.iter().filter(|(_, op)| op.restricted_dispatch).map(|(id, _)| id)
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
