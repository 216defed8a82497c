mod device;

use chrono::Utc;
use clap::Parser;
use device::{Device, InboundCommand};
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Emulates field devices: publishes reports and acknowledges switch commands.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "REPORT_TOPIC", default_value = "mcr/f/report")]
    report_topic: String,

    #[arg(long, env = "COMMAND_TOPIC", default_value = "mcr/f/command")]
    command_topic: String,

    /// Host name reported by the simulated controller
    #[arg(long, env = "SIM_HOST")]
    host: Option<String>,

    /// Switch addresses this controller answers for
    #[arg(
        long = "switch",
        env = "SWITCHES",
        value_delimiter = ',',
        default_values = ["ds/291d1823000000", "ds/124c8421000000", "ds/12398521000000", "ds/12838421000000"]
    )]
    switches: Vec<String>,

    #[arg(long, env = "SENSORS", default_value_t = 3)]
    sensors: usize,

    #[arg(long, env = "INTERVAL_MS", default_value_t = 5000)]
    interval_ms: u64,

    /// Chance of a comma-delimited record per reporting interval
    #[arg(long, env = "FLAT_RATIO", default_value_t = 0.2)]
    flat_ratio: f64,

    #[arg(long, env = "MIN_LATENCY_US", default_value_t = 400)]
    min_latency_us: u64,

    #[arg(long, env = "MAX_LATENCY_US", default_value_t = 4000)]
    max_latency_us: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut rng = rand::thread_rng();
    let host = args
        .host
        .clone()
        .unwrap_or_else(|| format!("mcr.sim-{:04x}", rng.gen::<u16>()));

    info!("Starting device simulator as {}", host);
    info!(
        "Broker: {}:{}, sensors: {}, switches: {}, interval: {}ms",
        args.mqtt_broker,
        args.mqtt_port,
        args.sensors,
        args.switches.len(),
        args.interval_ms
    );

    let latency = (
        args.min_latency_us,
        args.max_latency_us.max(args.min_latency_us),
    );
    let mut device = Device::new(host, args.sensors, &args.switches, latency);

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, &args.mqtt_broker, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    publish(&client, &args.report_topic, &device.announce()).await;

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms));
    let mut published = 0u64;

    loop {
        tokio::select! {
            polled = eventloop.poll() => {
                match polled {
                    Ok(Event::Incoming(Packet::Publish(p))) if p.topic == args.command_topic => {
                        let cmd: InboundCommand = match serde_json::from_slice(&p.payload) {
                            Ok(cmd) => cmd,
                            Err(e) => {
                                warn!("Ignoring unparsable command: {}", e);
                                continue;
                            }
                        };

                        match cmd.cmd.as_str() {
                            "time.sync" => {
                                let offset = cmd
                                    .mtime
                                    .as_deref()
                                    .and_then(|m| m.trim().parse::<i64>().ok())
                                    .map(|m| Utc::now().timestamp() - m);
                                debug!("time.sync received, offset {:?}s", offset);
                            }
                            "heartbeat" => debug!("heartbeat received"),
                            _ => {}
                        }

                        if let Some(ack) = device.apply(&cmd, &mut rng) {
                            publish(&client, &args.report_topic, &ack).await;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        // subscriptions do not survive a clean-session reconnect
                        if !ack.session_present {
                            match client.try_subscribe(&args.command_topic, QoS::AtLeastOnce) {
                                Ok(()) => info!("Subscribed to {}", args.command_topic),
                                Err(e) => error!("Failed to subscribe to {}: {}", args.command_topic, e),
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT eventloop error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            _ = ticker.tick() => {
                let now = Utc::now();
                for report in device.readings(&mut rng, now) {
                    publish(&client, &args.report_topic, &report).await;
                    published += 1;
                }

                if rng.gen_bool(args.flat_ratio.clamp(0.0, 1.0)) {
                    let record = device.flat_record(&mut rng, now);
                    if let Err(e) = client.publish(&args.report_topic, QoS::AtLeastOnce, false, record).await {
                        warn!("Failed to publish: {}", e);
                    }
                    published += 1;
                }

                if published % 100 == 0 {
                    info!("Published {} reports", published);
                }
            }
        }
    }
}

async fn publish<T: Serialize>(client: &AsyncClient, topic: &str, report: &T) {
    let payload = match serde_json::to_string(report) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize report: {}", e);
            return;
        }
    };

    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        warn!("Failed to publish: {}", e);
    }
}
