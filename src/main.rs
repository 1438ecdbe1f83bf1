//! Hail dispatch service
//!
//! Hosts the dispatch core: position ingestion, zone index, hail state
//! machine, timeout scheduler, notification worker and archive.
//!
//! Module structure:
//! - `domain/` - Core types (ids, geometry, hail lifecycle, errors)
//! - `io/` - External interfaces (MQTT, HTTP notifications, archive, Prometheus)
//! - `services/` - Business logic (positions, zones, matching, hails, timeouts)
//! - `infra/` - Infrastructure (Config, Metrics, Clock)

use anyhow::Context;
use clap::Parser;
use hail_dispatch::infra::config::NotifierKind;
use hail_dispatch::infra::{Clock, Config, Metrics, SystemClock};
use hail_dispatch::io::{
    create_event_channel, run_archiver, start_metrics_server, start_position_feed, HailArchive,
    HailNotifier, HttpNotifier, LogNotifier, MetricsSources, ReferenceData,
};
use hail_dispatch::services::position_store::run_reaper;
use hail_dispatch::services::{
    CustomerBans, HailMachine, NotificationWorker, PositionStore, TimeoutRules, TimeoutScheduler,
    ZoneIndex,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Hail dispatch - taxi matching and hail lifecycle service
#[derive(Parser, Debug)]
#[command(name = "hail-dispatch", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for lost races and per-report detail
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("hail-dispatch starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        freshness_ms = %config.freshness_ms(),
        default_max_radius_m = %config.default_max_radius_m(),
        zone_precedence = ?config.zone_precedence(),
        timeout_rules = %config.timeout_rules().len(),
        operators = %config.operators().len(),
        mqtt_enabled = %config.mqtt().enabled,
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let positions = Arc::new(PositionStore::from_config(&config, metrics.clone()));

    let zones = Arc::new(ZoneIndex::new());
    match config.zones_file() {
        Some(path) => {
            ReferenceData::from_file(path)?.apply_to(&zones)?;
        }
        None => warn!("no_zones_file_configured: every pickup is outside all zones"),
    }

    let (event_sender, event_rx) =
        create_event_channel(config.event_buffer(), config.outbox_capacity(), metrics.clone());
    let machine = Arc::new(HailMachine::new(metrics.clone()).with_events(event_sender));

    // Filled by the worker from customer_banned outcomes; shared with the request path
    let bans = Arc::new(CustomerBans::new(config.customer_ban_ms(), metrics.clone()));

    // Notification worker (operator flow, customer updates, taxi status, bans)
    let notifier: Arc<dyn HailNotifier> = match config.notifier() {
        NotifierKind::Http => Arc::new(HttpNotifier::from_config(&config)?),
        NotifierKind::Log => Arc::new(LogNotifier),
    };
    let worker = NotificationWorker::new(
        machine.clone(),
        positions.clone(),
        notifier,
        clock.clone(),
        event_rx,
        config.operator_dispatch_max_delay_ms(),
        metrics.clone(),
    )
    .with_concurrency(config.notify_concurrency())
    .with_customer_bans(bans.clone());
    tokio::spawn(worker.run());

    // Timeout scheduler
    let rules = TimeoutRules::from_config(&config).context("Invalid timeout rules")?;
    let scheduler = Arc::new(TimeoutScheduler::new(machine.clone(), rules, metrics.clone()));
    tokio::spawn(scheduler.run(clock.clone(), config.timeout_tick_ms(), shutdown_rx.clone()));

    // Position reaper
    tokio::spawn(run_reaper(
        positions.clone(),
        clock.clone(),
        config.reap_interval_secs(),
        shutdown_rx.clone(),
    ));

    // MQTT position feed
    if config.mqtt().enabled {
        let mqtt_config = config.mqtt().clone();
        let feed_store = positions.clone();
        let feed_clock = clock.clone();
        let feed_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_position_feed(mqtt_config, feed_store, feed_clock, feed_shutdown).await {
                tracing::error!(error = %e, "position_feed_error");
            }
        });
    }

    // Archive of terminal hails
    let archiver = tokio::spawn(run_archiver(
        machine.clone(),
        HailArchive::new(config.archive_file()),
        clock.clone(),
        config.archive_after_ms(),
        config.archive_interval_secs(),
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let sources = MetricsSources {
            metrics: metrics.clone(),
            positions: positions.clone(),
            machine: machine.clone(),
            site_id: Arc::new(config.site_id().to_string()),
        };
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(prometheus_port, sources, prom_shutdown).await {
                tracing::error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    // Metrics reporter
    let report_metrics = metrics.clone();
    let report_positions = positions.clone();
    let report_machine = machine.clone();
    let report_bans = bans.clone();
    let report_clock = clock.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut report_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(metrics_interval.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    report_metrics
                        .report(report_positions.len(), report_machine.active_count())
                        .log();
                    let expired = report_bans.prune_expired(report_clock.now_ms());
                    if expired > 0 {
                        tracing::debug!(expired = %expired, remaining = %report_bans.len(), "customer_bans_pruned");
                    }
                }
                _ = report_shutdown.changed() => {
                    if *report_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    info!("hail-dispatch running");

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Let the archiver write out finished hails
    if let Err(e) = archiver.await {
        warn!(error = %e, "hail_archiver_join_failed");
    }

    info!("hail-dispatch shutdown complete");
    Ok(())
}
