//! Prometheus metrics HTTP endpoint
//!
//! Exposes dispatch metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, MATCH_LATENCY_BOUNDS_US, MATCH_LATENCY_BUCKETS};
use crate::services::hail_machine::HailMachine;
use crate::services::position_store::PositionStore;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Shared handles the endpoint reads gauges from
#[derive(Clone)]
pub struct MetricsSources {
    pub metrics: Arc<Metrics>,
    pub positions: Arc<PositionStore>,
    pub machine: Arc<HailMachine>,
    pub site_id: Arc<String>,
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a counter split by a single label
fn write_labeled_counter(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    label: &str,
    values: &[(&str, u64)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{site=\"{site}\",{label}=\"{value}\"}} {count}");
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; MATCH_LATENCY_BUCKETS],
    bounds: &[u64],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[MATCH_LATENCY_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(
    metrics: &Metrics,
    tracked_taxis: usize,
    active_hails: usize,
    site_id: &str,
) -> String {
    let summary = metrics.report(tracked_taxis, active_hails);
    let mut output = String::with_capacity(4096);

    write_position_metrics(&mut output, site_id, &summary);
    write_match_metrics(&mut output, site_id, &summary);
    write_hail_metrics(&mut output, site_id, &summary);
    write_notification_metrics(&mut output, site_id, &summary);

    output
}

fn write_position_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "dispatch_positions_total",
        "Accepted taxi position reports",
        MetricType::Counter,
        site,
        summary.positions_total,
    );
    write_metric(
        output,
        "dispatch_positions_rejected_total",
        "Rejected taxi position reports",
        MetricType::Counter,
        site,
        summary.positions_rejected,
    );
    write_metric(
        output,
        "dispatch_positions_reaped_total",
        "Position records evicted by the reaper",
        MetricType::Counter,
        site,
        summary.positions_reaped,
    );
    write_metric(
        output,
        "dispatch_tracked_taxis",
        "Taxis with a position record",
        MetricType::Gauge,
        site,
        summary.tracked_taxis as u64,
    );
}

fn write_match_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "dispatch_matches_total",
        "Candidate searches run",
        MetricType::Counter,
        site,
        summary.matches_total,
    );
    write_labeled_counter(
        output,
        "dispatch_matches_empty_total",
        "Candidate searches without candidates by outcome",
        site,
        "outcome",
        &[
            ("no_zone_permits_operator", summary.match_no_zone),
            ("no_taxi_available", summary.match_no_taxi),
            ("pickup_excluded", summary.match_excluded),
        ],
    );
    write_histogram(
        output,
        "dispatch_match_latency_us",
        "Candidate search latency in microseconds",
        site,
        &summary.match_lat_buckets,
        &MATCH_LATENCY_BOUNDS_US,
        summary.match_lat_avg_us,
    );
    write_metric(
        output,
        "dispatch_match_latency_p99_us",
        "99th percentile candidate search latency",
        MetricType::Gauge,
        site,
        summary.match_lat_p99_us,
    );
}

fn write_hail_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "dispatch_hails_created_total",
        "Hails created",
        MetricType::Counter,
        site,
        summary.hails_created,
    );
    write_metric(
        output,
        "dispatch_active_hails",
        "Taxis bound to a non-terminal hail",
        MetricType::Gauge,
        site,
        summary.active_hails as u64,
    );
    write_metric(
        output,
        "dispatch_transitions_total",
        "Committed hail transitions",
        MetricType::Counter,
        site,
        summary.transitions_total,
    );
    write_labeled_counter(
        output,
        "dispatch_transitions_refused_total",
        "Refused hail transitions by cause",
        site,
        "cause",
        &[
            ("concurrent_modification", summary.transition_conflicts),
            ("rejected", summary.transitions_rejected),
        ],
    );
    write_metric(
        output,
        "dispatch_timeouts_fired_total",
        "Transitions forced by the timeout scheduler",
        MetricType::Counter,
        site,
        summary.timeouts_fired,
    );
    write_metric(
        output,
        "dispatch_timeout_races_lost_total",
        "Timeouts dropped because the hail moved on first",
        MetricType::Counter,
        site,
        summary.timeout_races_lost,
    );
    write_metric(
        output,
        "dispatch_hails_archived_total",
        "Terminal hails written to the archive",
        MetricType::Counter,
        site,
        summary.hails_archived,
    );
    write_metric(
        output,
        "dispatch_customers_banned_total",
        "Bans issued or extended after customer_banned",
        MetricType::Counter,
        site,
        summary.customers_banned,
    );
    write_metric(
        output,
        "dispatch_hails_refused_banned_total",
        "Hail requests refused because the customer is banned",
        MetricType::Counter,
        site,
        summary.hails_refused_banned,
    );
}

fn write_notification_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_labeled_counter(
        output,
        "dispatch_operator_requests_total",
        "Hails sent to operators by result",
        site,
        "result",
        &[("ok", summary.operator_requests_ok), ("error", summary.operator_requests_failed)],
    );
    write_metric(
        output,
        "dispatch_customer_notifications_failed_total",
        "Customer notifications that could not be delivered",
        MetricType::Counter,
        site,
        summary.customer_notifications_failed,
    );
    write_metric(
        output,
        "dispatch_events_deferred_total",
        "Side-effect events parked because the queue was full",
        MetricType::Counter,
        site,
        summary.events_deferred,
    );
    write_metric(
        output,
        "dispatch_events_dropped_total",
        "Side-effect events dropped from a full outbox",
        MetricType::Counter,
        site,
        summary.events_dropped,
    );
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    sources: MetricsSources,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(
                &sources.metrics,
                sources.positions.len(),
                sources.machine.active_count(),
                &sources.site_id,
            );
            let mut response = text_response(StatusCode::OK, body);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    sources: MetricsSources,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %sources.site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let sources = sources.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, sources.clone()));

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
