/**
 * BRACELET SIMULATOR - Stands in for a DeafNav bracelet on the broker
 *
 * Publishes {deviceId, distance, pulse, battery} every interval. Distance
 * walks from 300 cm down to 30 cm and starts over, pulse is drawn in
 * 70..=110 bpm. Below 50 cm the real bracelet vibrates; here it is logged.
 */

use anyhow::{Context, Result};
use clap::Parser;
use deafnav_devkit::{TelemetryMessageBuilder, topics};
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SWEEP_START_CM: u32 = 300;
const SWEEP_STEP_CM: u32 = 30;
const HAPTIC_DISTANCE_CM: u32 = 50;

#[derive(Parser, Debug)]
#[command(name = "deafnav-bracelet-sim", about = "Publishes simulated bracelet telemetry")]
struct Args {
    #[arg(long, default_value = "localhost")]
    broker: String,

    #[arg(long, default_value_t = 1883)]
    port: u16,

    #[arg(long, default_value = "BRAC-001")]
    device_id: String,

    #[arg(long, default_value = topics::TELEMETRY)]
    topic: String,

    #[arg(long, default_value_t = 2000, value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: u64,

    #[arg(long, default_value_t = 85)]
    battery: u8,
}

/// 300, 270, ..., 30, then again from 300.
fn distance_sweep() -> impl Iterator<Item = u32> {
    (1..=SWEEP_START_CM / SWEEP_STEP_CM).rev().map(|k| k * SWEEP_STEP_CM).cycle()
}

fn sample(device_id: &str, distance_cm: u32, rng: &mut impl Rng, battery: u8) -> Value {
    let pulse = rng.gen_range(70..=110);
    TelemetryMessageBuilder::telemetry(device_id, Some(f64::from(distance_cm)), Some(pulse), Some(battery))
}

fn needs_haptic(distance_cm: u32) -> bool {
    distance_cm < HAPTIC_DISTANCE_CM
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut opts = MqttOptions::new(format!("deafnav-sim-{}", args.device_id), &args.broker, args.port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    // the event loop must be polled for publishes to leave
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("[sim] MQTT error: {e}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    info!(
        "[sim] {} publishing to {}:{} on {} every {} ms",
        args.device_id, args.broker, args.port, args.topic, args.interval_ms
    );

    let mut rng = rand::thread_rng();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms));
    for distance in distance_sweep() {
        ticker.tick().await;
        let msg = sample(&args.device_id, distance, &mut rng, args.battery);
        let payload = serde_json::to_vec(&msg).context("encoding telemetry")?;
        match client.publish(args.topic.as_str(), QoS::AtLeastOnce, false, payload).await {
            Ok(()) => info!("[sim] sent {msg}"),
            Err(e) => warn!("[sim] publish failed: {e}"),
        }
        if needs_haptic(distance) {
            info!("[sim] haptic alert: obstacle at {distance} cm");
        }
    }
    Ok(())
}
