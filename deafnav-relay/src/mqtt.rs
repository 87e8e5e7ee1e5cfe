use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::pipeline::{HandleOutcome, TelemetryPipeline};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(2);

pub fn mqtt_options(conf: &MqttConf) -> MqttOptions {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
    opts.set_clean_session(true);
    opts
}

/// Shared client plus the event loop that drives it.
pub fn create_mqtt_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    AsyncClient::new(mqtt_options(conf), 64)
}

/// Reacts to one event-loop event. Subscriptions are (re)issued on every
/// ConnAck since the session is clean.
pub fn dispatch_event(
    event: Event,
    client: &AsyncClient,
    topics: &[String],
    pipeline: &TelemetryPipeline,
    health: &HealthTracker,
) {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => {
            info!("[mqtt] connected");
            health.mark_mqtt_connected();
            for topic in topics {
                // try_subscribe: the event loop is this task, awaiting would deadlock on a full queue
                if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                    error!("[mqtt] subscribe {topic} failed: {e}");
                }
            }
        }
        Event::Incoming(Packet::Publish(p)) => match pipeline.handle(&p.payload, &p.topic) {
            HandleOutcome::Ignored => debug!("[mqtt] ignored publish on {}", p.topic),
            HandleOutcome::Dropped | HandleOutcome::Accepted { .. } => {}
        },
        Event::Incoming(Packet::Disconnect) => {
            warn!("[mqtt] broker sent disconnect");
            health.mark_mqtt_disconnected();
        }
        _ => {}
    }
}

pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    pipeline: Arc<TelemetryPipeline>,
    health: HealthTracker,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let topics = pipeline.topics();
    info!("[mqtt] listening on {}", topics.join(", "));
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(event) => dispatch_event(event, &client, &topics, &pipeline, &health),
                Err(e) => {
                    error!("[mqtt] connection error: {e}");
                    health.mark_mqtt_disconnected();
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
        if let Err(e) = client.try_disconnect() {
            debug!("[mqtt] disconnect on shutdown: {e}");
        }
        info!("[mqtt] listener stopped");
    })
}
