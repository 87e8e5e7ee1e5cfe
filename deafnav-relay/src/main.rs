/**
 * DEAFNAV RELAY - Service entry point
 *
 * ROLE : Wires config, MQTT ingress, provider polling, alerting and the
 * HTTP/SSE surface together, then runs until Ctrl-C.
 *
 * SHUTDOWN : Ctrl-C fires the shared token. Open event streams end, HTTP
 * drains (bounded by the grace period), then the MQTT listener, the poll
 * scheduler (bounded as well) and the health publisher are awaited.
 */

use anyhow::{Context, Result};
use deafnav_relay::alerts::AlertEngine;
use deafnav_relay::board::AlertBoard;
use deafnav_relay::broadcast::Broadcaster;
use deafnav_relay::cache::SnapshotCache;
use deafnav_relay::config::{RelayConfig, load_config};
use deafnav_relay::health::HealthTracker;
use deafnav_relay::http::{AppState, build_router, serve_with_shutdown};
use deafnav_relay::ingress::IngressAdapter;
use deafnav_relay::models::ProviderKey;
use deafnav_relay::mqtt;
use deafnav_relay::persistence::PulseLogFile;
use deafnav_relay::pipeline::TelemetryPipeline;
use deafnav_relay::poller::PollAggregator;
use deafnav_relay::providers::{HttpStatusProvider, ProviderKind};
use deafnav_relay::state::system_clock;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deafnav_relay=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Registers an HTTP provider for `kind` when a URL template is configured,
/// and returns the keys the scheduler should poll.
fn register_provider(
    aggregator: PollAggregator,
    kind: ProviderKind,
    url: Option<&str>,
    resources: &[String],
    cfg: &RelayConfig,
    polled: &mut Vec<ProviderKey>,
) -> Result<PollAggregator> {
    let Some(url) = url else {
        info!("[relay] no URL for {} provider, skipping", kind.default_id());
        return Ok(aggregator);
    };
    let provider = HttpStatusProvider::new(kind.default_id(), url, cfg.polling.fetch_timeout())
        .with_context(|| format!("building {} provider", kind.default_id()))?;
    polled.extend(resources.iter().map(|r| ProviderKey::new(kind.default_id(), r.as_str())));
    Ok(aggregator.with_provider(kind, Arc::new(provider)))
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_logging();

    let cfg = load_config().await;
    if let Err(e) = cfg.validate() {
        error!("[relay] invalid configuration: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cfg).await {
        error!("[relay] fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: RelayConfig) -> Result<()> {
    let clock = system_clock();
    let shutdown = CancellationToken::new();

    let cache = Arc::new(SnapshotCache::new());
    let broadcaster = Arc::new(Broadcaster::new(cfg.push.subscriber_buffer));
    let board = Arc::new(AlertBoard::new());
    let engine = AlertEngine::new(cfg.alerts.pulse_threshold);
    let health_tracker = HealthTracker::new();

    let pulse_log = PulseLogFile::new(&cfg.persistence.pulse_log);
    if let Err(e) = pulse_log.prepare().await {
        warn!("[relay] pulse log directory not ready: {e}");
    }

    let mut polled = Vec::new();
    let aggregator = PollAggregator::new(
        cache,
        engine,
        board.clone(),
        broadcaster.clone(),
        clock.clone(),
        cfg.polling.cache_ttl(),
        cfg.polling.fetch_timeout(),
    )
    .with_focus(cfg.providers.focus.clone());
    let aggregator = register_provider(
        aggregator,
        ProviderKind::Elevators,
        cfg.providers.elevators.url.as_deref(),
        &cfg.providers.elevators.resources,
        &cfg,
        &mut polled,
    )?;
    let aggregator = Arc::new(register_provider(
        aggregator,
        ProviderKind::Vehicles,
        cfg.providers.vehicles.url.as_deref(),
        &cfg.providers.vehicles.resources,
        &cfg,
        &mut polled,
    )?);

    let adapter = IngressAdapter::new(
        cfg.mqtt.telemetry_topic.clone(),
        cfg.mqtt.legacy_pulse_topic.clone(),
        clock.clone(),
    );
    let pipeline = Arc::new(TelemetryPipeline::new(
        adapter,
        engine,
        Arc::new(pulse_log),
        broadcaster.clone(),
        clock.clone(),
    ));

    let app_state = AppState {
        pipeline: pipeline.clone(),
        aggregator: aggregator.clone(),
        board,
        broadcaster,
        health_tracker: health_tracker.clone(),
        clock,
        shutdown: shutdown.clone(),
    };

    // one client for ingress and health publishes
    let (client, eventloop) = mqtt::create_mqtt_client(&cfg.mqtt);
    let mqtt_task = mqtt::spawn_mqtt_listener(
        client.clone(),
        eventloop,
        pipeline,
        health_tracker.clone(),
        shutdown.clone(),
    );

    let scheduler = aggregator.spawn_scheduler(polled, cfg.polling.interval(), shutdown.clone());

    let health_task = health_tracker.spawn_health_publisher(
        client,
        cfg.mqtt.health_topic.clone(),
        app_state.clone(),
        shutdown.clone(),
    );

    let app = build_router(app_state);
    let listener = TcpListener::bind(cfg.http.bind.as_str())
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!("[relay] listening on http://{}", cfg.http.bind);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("[relay] Ctrl-C received, shutting down"),
            Err(e) => error!("[relay] cannot listen for Ctrl-C: {e}"),
        }
        signal.cancel();
    });

    let grace = cfg.polling.shutdown_grace();
    let served = serve_with_shutdown(listener, app, shutdown.clone(), grace).await;
    // also reached when the server itself failed
    shutdown.cancel();

    let abort = scheduler.abort_handle();
    match tokio::time::timeout(grace, scheduler).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("[relay] poll scheduler failed: {e}"),
        Err(_) => {
            warn!("[relay] poll cycle still running after {grace:?}, aborting");
            abort.abort();
        }
    }
    let (mqtt_res, health_res) = tokio::join!(mqtt_task, health_task);
    for (task, res) in [("mqtt listener", mqtt_res), ("health publisher", health_res)] {
        if let Err(e) = res {
            error!("[relay] {task} task failed: {e}");
        }
    }

    served.context("http server")?;
    info!("[relay] stopped");
    Ok(())
}
