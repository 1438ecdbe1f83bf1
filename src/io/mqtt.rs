//! MQTT subscription feeding taxi position reports into the position store

use crate::domain::types::{OperatorId, TaxiId, TaxiStatus};
use crate::infra::clock::Clock;
use crate::infra::config::MqttConfig;
use crate::services::position_store::PositionStore;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Report timestamp: epoch ms or an RFC 3339 string
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ReportTimestamp {
    EpochMs(u64),
    Iso(String),
}

/// One taxi position report as published by operators
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PositionReport {
    pub taxi_id: TaxiId,
    pub operator_id: OperatorId,
    pub lat: f64,
    pub lon: f64,
    pub status: TaxiStatus,
    #[serde(default)]
    pub timestamp: Option<ReportTimestamp>,
}

impl PositionReport {
    /// Report time, clamped to `now_ms`; missing or unparseable times read as `now_ms`
    pub fn seen_at_ms(&self, now_ms: u64) -> u64 {
        let at = match &self.timestamp {
            Some(ReportTimestamp::EpochMs(ms)) => Some(*ms),
            Some(ReportTimestamp::Iso(s)) => parse_iso_time(s),
            None => None,
        };
        at.map_or(now_ms, |at| at.min(now_ms))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PositionPayload {
    Batch { positions: Vec<PositionReport> },
    Single(PositionReport),
}

/// Parse a single report or a `{"positions": [...]}` batch
pub fn parse_position_payload(payload: &str) -> Result<Vec<PositionReport>, serde_json::Error> {
    Ok(match serde_json::from_str::<PositionPayload>(payload)? {
        PositionPayload::Batch { positions } => positions,
        PositionPayload::Single(report) => vec![report],
    })
}

fn parse_iso_time(time_str: &str) -> Option<u64> {
    OffsetDateTime::parse(time_str, &Rfc3339)
        .ok()
        .and_then(|dt| u64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok())
}

/// Apply every report in a payload; returns (accepted, rejected)
pub fn ingest_payload(store: &PositionStore, payload: &str, now_ms: u64) -> (usize, usize) {
    let reports = match parse_position_payload(payload) {
        Ok(reports) => reports,
        Err(e) => {
            debug!(error = %e, "position_payload_unparseable");
            return (0, 1);
        }
    };

    let mut accepted = 0;
    let mut rejected = 0;
    for report in reports {
        let seen_at = report.seen_at_ms(now_ms);
        let taxi_id = report.taxi_id.clone();
        match store.report_position(
            report.taxi_id,
            report.operator_id,
            report.lat,
            report.lon,
            report.status,
            seen_at,
        ) {
            Ok(()) => accepted += 1,
            Err(e) => {
                rejected += 1;
                debug!(taxi_id = %taxi_id, error = %e, "position_report_rejected");
            }
        }
    }
    (accepted, rejected)
}

/// Subscribe to the position topic and feed reports into the store until shutdown
pub async fn start_position_feed(
    config: MqttConfig,
    store: Arc<PositionStore>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut mqttoptions = MqttOptions::new(config.client_id.as_str(), config.host.as_str(), config.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.username.as_deref(), config.password.as_deref()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

    info!(topic = %config.topic, host = %config.host, port = %config.port, "position_feed_starting");

    // Rate-limit rejection warnings to 1 per second
    let mut last_reject_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("position_feed_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Ok(payload) = std::str::from_utf8(&publish.payload) else {
                            warn!(topic = %publish.topic, "position_payload_invalid_utf8");
                            continue;
                        };
                        let (accepted, rejected) = ingest_payload(&store, payload, clock.now_ms());
                        if rejected > 0 && last_reject_warn.elapsed() > Duration::from_secs(1) {
                            warn!(accepted = %accepted, rejected = %rejected, "position_reports_rejected");
                            last_reject_warn = Instant::now();
                        }
                    }
                    // Subscribe on every (re)connect; clean sessions drop subscriptions
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        client.subscribe(config.topic.as_str(), QoS::AtMostOnce).await?;
                        info!(topic = %config.topic, "position_feed_subscribed");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}
