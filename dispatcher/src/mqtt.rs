use crate::audit::Durable;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::errors::{Error, Result};
use crate::publish::Publisher;
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10000;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Connects, waits for the broker to accept the session and subscribes to
/// the report topic with QoS 2.
pub async fn connect(config: &Config, client_id: String) -> Result<(AsyncClient, EventLoop)> {
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        config.mqtt_broker, config.mqtt_port, client_id
    );

    let mut mqtt_options = MqttOptions::new(client_id, &config.mqtt_broker, config.mqtt_port);
    mqtt_options.set_keep_alive(KEEP_ALIVE);
    mqtt_options.set_clean_session(true);
    if let Some(user) = &config.mqtt_user {
        mqtt_options.set_credentials(user, config.mqtt_password.clone().unwrap_or_default());
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

    // The first failure here is fatal; rumqttc only retries once we are in the loop.
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
            if ack.code != ConnectReturnCode::Success {
                return Err(Error::Refused(ack.code));
            }
            break;
        }
    }

    client
        .subscribe(&config.report_topic, QoS::ExactlyOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 2", config.report_topic);

    Ok((client, eventloop))
}

/// Drives the dispatcher until the session is closed or the process is
/// interrupted.
///
/// Each iteration waits at most `idle` for one inbound event, handles it if
/// it is a report, and then runs the periodic actions. The wait doubles as
/// the idle back-off when nothing is queued. After a connection error the
/// wait is unbounded until the broker accepts a new session, so a reconnect
/// in progress is never cut short. Every new session subscribes to
/// `report_topic` again.
pub async fn run<P, W>(
    mut eventloop: EventLoop,
    client: &AsyncClient,
    report_topic: &str,
    dispatcher: &mut Dispatcher<P, W>,
    idle: Duration,
) -> Result<()>
where
    P: Publisher,
    W: Durable,
{
    info!("Dispatch loop started, idle poll {:?}", idle);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut connected = true;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                return Ok(());
            }
            polled = next_event(&mut eventloop, connected.then_some(idle)) => {
                match polled {
                    Some(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                        debug!(
                            "Received message on topic {}, size: {} bytes",
                            publish.topic,
                            publish.payload.len()
                        );
                        let body = String::from_utf8_lossy(&publish.payload);
                        dispatcher.handle(&publish.topic, &body, Utc::now());
                    }
                    Some(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                        info!("Reconnected to MQTT broker");
                        connected = true;
                        if !ack.session_present {
                            resubscribe(client, report_topic);
                        }
                    }
                    Some(Ok(Event::Incoming(Packet::Disconnect)))
                    | Some(Ok(Event::Outgoing(Outgoing::Disconnect))) => {
                        info!("MQTT session closed");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("MQTT error: {}", e);
                        connected = false;
                        // rumqttc reconnects on the next poll
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                    None => {}
                }
            }
        }

        dispatcher.tick(Utc::now());
    }
}

/// Polls for one event, giving up after `idle` when it is set.
async fn next_event(
    eventloop: &mut EventLoop,
    idle: Option<Duration>,
) -> Option<std::result::Result<Event, ConnectionError>> {
    match idle {
        Some(idle) => timeout(idle, eventloop.poll()).await.ok(),
        None => Some(eventloop.poll().await),
    }
}

fn resubscribe(client: &AsyncClient, report_topic: &str) {
    match client.try_subscribe(report_topic, QoS::ExactlyOnce) {
        Ok(()) => info!("Subscribed to {} with QoS 2", report_topic),
        Err(e) => warn!("Failed to resubscribe to {}: {}", report_topic, e),
    }
}
