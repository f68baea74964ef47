//! Frame Analyzer service
//!
//! Modes:
//! - `worker` (default): consume raw frames, analyze and publish them
//! - `produce <image> [stream-id] [lat] [lng]`: publish one image as a raw frame

use anyhow::{Context, Result};
use chrono::Utc;
use frame_analyzer::config::ServiceConfig;
use frame_analyzer::frame::Position;
use frame_analyzer::imaging::encode_base64;
use frame_analyzer::prelude::*;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("worker");

    match mode {
        "worker" => run_worker(config).await,
        "produce" => run_producer(config, &args[2..]).await,
        _ => {
            print_usage();
            Ok(())
        }
    }
}

/// Consume raw frames until SIGINT or SIGTERM
async fn run_worker(config: Config) -> Result<()> {
    info!(
        service = %config.service.name,
        broker = %config.broker.endpoint(),
        "Starting frame analyzer"
    );

    if config.service.metrics_port > 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let broker = Arc::new(AmqpBroker::new(config.broker.clone()));
    broker
        .connect()
        .await
        .context("Failed to connect to broker")?;

    let inbound = &config.broker.inbound;
    broker
        .configure_inbound(&inbound.exchange, &inbound.queue, &inbound.routing_key)
        .await
        .context("Failed to configure inbound queue")?;
    if let Some(ref outbound) = config.broker.outbound {
        broker
            .configure_outbound(&outbound.exchange)
            .await
            .context("Failed to configure outbound exchange")?;
    }

    let model = ModelInfo::from(&config.detection);
    warn!(
        model = %model.name,
        "No inference backend linked, using the pass-through detector"
    );
    let detector = Arc::new(PassthroughDetector::new(model));
    let images = Arc::new(
        RasterImageOps::for_extension(&config.persistence.file_type)
            .context("Unsupported persistence.file_type")?,
    );
    let worker = Arc::new(FrameWorker::new(&config, broker.clone(), detector, images));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    info!(ack_mode = ?config.broker.ack_mode, "Frame analyzer started");

    let result = broker
        .consume(worker, config.broker.ack_mode, shutdown)
        .await;

    info!("Shutting down frame analyzer");
    if let Err(e) = broker.close().await {
        error!(error = %e, "Failed to close broker connection");
    }

    result.context("Consumer failed")?;
    info!("Frame analyzer stopped");
    Ok(())
}

/// Publish one image file to the inbound exchange as a raw frame
async fn run_producer(config: Config, args: &[String]) -> Result<()> {
    let path = args
        .first()
        .context("Usage: frame-analyzer produce <image> [stream-id] [lat] [lng]")?;
    let stream_id = args.get(1).cloned().unwrap_or_else(|| "local".to_string());
    let lat = parse_coordinate(args.get(2), "latitude")?;
    let lng = parse_coordinate(args.get(3), "longitude")?;

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path))?;

    let frame = RawFrame {
        image: encode_base64(&bytes),
        taken_at: Utc::now(),
        position: Position { lat, lng },
        stream_id,
        stream_meta: Default::default(),
    };

    let inbound = &config.broker.inbound;
    let broker = AmqpBroker::new(config.broker.clone());
    broker
        .configure_outbound(&inbound.exchange)
        .await
        .context("Failed to configure inbound exchange for publishing")?;

    let message = OutgoingMessage::new_json(&inbound.exchange, &inbound.routing_key, &frame)?
        .with_message_type("raw_frame");
    broker.publish(message).await?;

    info!(
        exchange = %inbound.exchange,
        stream_id = %frame.stream_id,
        size_bytes = bytes.len(),
        "Raw frame published"
    );

    broker.close().await?;
    Ok(())
}

fn parse_coordinate(value: Option<&String>, name: &str) -> Result<f64> {
    match value {
        Some(v) => v
            .parse()
            .with_context(|| format!("Invalid {}: {}", name, v)),
        None => Ok(0.0),
    }
}

fn print_usage() {
    println!("Usage: frame-analyzer [worker|produce]");
    println!();
    println!("Modes:");
    println!("  worker                                 - Consume, analyze and publish frames (default)");
    println!("  produce <image> [stream-id] [lat] [lng] - Publish an image file as a raw frame");
    println!();
    println!("Environment variables:");
    println!("  ANALYZER__BROKER__HOST                  - Broker host (default: localhost)");
    println!("  ANALYZER__BROKER__USERNAME              - Broker user (default: guest)");
    println!("  ANALYZER__BROKER__PASSWORD              - Broker password (default: guest)");
    println!("  ANALYZER__PERSISTENCE__SAVE_WITH        - Store frames with detections");
    println!("  ANALYZER__PERSISTENCE__SAVE_WITHOUT     - Store frames without detections");
    println!("  ANALYZER__PERSISTENCE__OUTPUT_LOCATION  - Output directory (default: output)");
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if service.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_coordinate() {
        assert_eq!(parse_coordinate(None, "latitude").unwrap(), 0.0);
        let value = "52.5".to_string();
        assert_eq!(parse_coordinate(Some(&value), "latitude").unwrap(), 52.5);
        let bad = "north".to_string();
        assert!(parse_coordinate(Some(&bad), "latitude").is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }
}
