mod audit;
mod config;
mod decode;
mod dispatch;
mod errors;
mod humanize;
mod metrics;
mod model;
mod mqtt;
mod publish;
mod scheduler;
mod tracker;

use anyhow::Context;
use audit::AuditLog;
use axum::{routing::get, Router};
use chrono::Utc;
use clap::Parser;
use config::Config;
use dispatch::Dispatcher;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let format = match config.payload_format() {
        Ok(format) => format,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("Starting telemetry dispatcher");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!(
        "Reports: {}, commands: {}",
        config.report_topic, config.command_topic
    );
    info!("Exercising {} switches", config.devices.len());
    if let Some(format) = format {
        info!("Only processing {} reports", format);
    }

    metrics::init_metrics();

    if let Some(addr) = config.metrics_addr.clone() {
        tokio::spawn(serve_metrics(addr));
    }

    if let Err(e) = run(&config).await {
        error!("Dispatcher failed: {:#}", e);
        std::process::exit(2);
    }

    info!("Shutting down");
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let audit = AuditLog::open(&config.audit_log)
        .with_context(|| format!("opening audit log {}", config.audit_log.display()))?;

    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("dispatcher-{}", uuid::Uuid::new_v4()));

    let (client, eventloop) = mqtt::connect(config, client_id)
        .await
        .context("connecting to MQTT broker")?;

    let mut dispatcher = Dispatcher::new(config, client.clone(), audit, Utc::now())?;

    mqtt::run(
        eventloop,
        &client,
        &config.report_topic,
        &mut dispatcher,
        config.idle_poll(),
    )
    .await?;

    info!(
        "{} commands were still awaiting acknowledgment",
        dispatcher.tracker().len()
    );

    Ok(())
}

async fn serve_metrics(addr: String) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics endpoint to {}: {}", addr, e);
            return;
        }
    };

    info!("Metrics endpoint listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
