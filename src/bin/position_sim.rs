//! Position simulator - publishes synthetic taxi position reports over MQTT
//!
//! Taxis circle a center point at different radii and speeds. Every tick one
//! batch payload (`{"positions": [...]}`) is published with all taxis.
//!
//! Usage:
//!   cargo run --bin position-sim -- --taxis 50 --lat 48.8566 --lon 2.3522

use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::f64::consts::TAU;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Parser, Debug)]
#[command(name = "position-sim")]
#[command(about = "Publish synthetic taxi positions for local testing")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Topic the dispatch service subscribes to
    #[arg(long, default_value = "taxis/positions")]
    topic: String,

    /// Number of simulated taxis
    #[arg(long, default_value = "20")]
    taxis: usize,

    /// Operator id attached to every report
    #[arg(long, default_value = "sim-operator")]
    operator: String,

    /// Center latitude
    #[arg(long, default_value = "48.8566")]
    lat: f64,

    /// Center longitude
    #[arg(long, default_value = "2.3522")]
    lon: f64,

    /// Largest circle radius in meters
    #[arg(long, default_value = "3000")]
    spread_m: f64,

    /// Milliseconds between batches
    #[arg(long, default_value = "2000")]
    interval_ms: u64,

    /// Every n-th taxi reports as occupied (0 = all free)
    #[arg(long, default_value = "4")]
    occupied_every: usize,

    /// Stop after this many batches (0 = run until Ctrl+C)
    #[arg(long, default_value = "0")]
    rounds: u64,
}

/// Position of taxi `index` after `tick` ticks
fn taxi_position(args: &Args, index: usize, tick: u64) -> (f64, f64) {
    let n = args.taxis.max(1) as f64;
    let radius_m = args.spread_m * (index as f64 + 1.0) / n;
    let phase = TAU * index as f64 / n;
    // Outer taxis move slower so everyone covers similar ground per tick
    let angle = phase + tick as f64 * 0.05 * (1.0 + 1.0 / (index as f64 + 1.0));

    let dlat = radius_m * angle.sin() / METERS_PER_DEGREE;
    let dlon = radius_m * angle.cos() / (METERS_PER_DEGREE * args.lat.to_radians().cos());
    (args.lat + dlat, args.lon + dlon)
}

fn batch_payload(args: &Args, tick: u64) -> serde_json::Value {
    let timestamp = Utc::now().to_rfc3339();
    let positions: Vec<_> = (0..args.taxis)
        .map(|i| {
            let (lat, lon) = taxi_position(args, i, tick);
            let occupied = args.occupied_every > 0 && i % args.occupied_every == args.occupied_every - 1;
            json!({
                "taxi_id": format!("sim-taxi-{i:04}"),
                "operator_id": args.operator,
                "lat": lat,
                "lon": lon,
                "status": if occupied { "occupied" } else { "free" },
                "timestamp": timestamp,
            })
        })
        .collect();
    json!({ "positions": positions })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut mqtt_options = MqttOptions::new("position-sim", args.mqtt_host.as_str(), args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt_connected"),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "mqtt_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    info!(
        taxis = %args.taxis,
        topic = %args.topic,
        interval_ms = %args.interval_ms,
        "position_sim_started"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut tick = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let payload = serde_json::to_vec(&batch_payload(&args, tick))?;
                if let Err(e) = client.publish(args.topic.as_str(), QoS::AtLeastOnce, false, payload).await {
                    warn!(error = %e, "position_batch_publish_failed");
                }
                tick += 1;
                if args.rounds > 0 && tick >= args.rounds {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(batches = %tick, "position_sim_stopped");
    let _ = client.disconnect().await;
    Ok(())
}
