//! Configuration for the frame analyzer worker.
//!
//! Configuration is layered: built-in defaults, then an optional config file,
//! then environment variables (`ANALYZER__BROKER__HOST` -> `broker.host`).
//! Everything is read once at startup and handed to the components by
//! reference; nothing here is read again while consuming.

use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::policy::PersistenceFlags;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Acknowledgement discipline for consumed messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Ack on receipt, before the frame is processed (at-most-once)
    #[default]
    Auto,
    /// Ack after the handler succeeds, reject without requeue on failure
    Manual,
}

/// Main configuration for the analyzer service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format: json or text
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port, 0 disables the exporter
    #[serde(default)]
    pub metrics_port: u16,
    /// Overrides the hostname reported in `img_meta`
    pub hostname: Option<String>,
}

/// Inbound topology: the queue this worker consumes and its binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    #[serde(default = "default_in_exchange")]
    pub exchange: String,
    #[serde(default = "default_in_queue")]
    pub queue: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
}

/// Outbound topology: where analyzed frames are published
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default = "default_out_exchange")]
    pub exchange: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    /// Virtual host, "/" by default
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Connect with TLS (amqps)
    #[serde(default)]
    pub tls: bool,
    /// Connection name shown in the broker management UI
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    /// Maximum unacknowledged deliveries per consumer
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default)]
    pub ack_mode: AckMode,
    /// Pause before re-establishing a lost connection
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default)]
    pub inbound: InboundConfig,
    /// Outbound exchange; results are not published when absent
    #[serde(default = "default_outbound")]
    pub outbound: Option<OutboundConfig>,
}

/// Persistence rules and output location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Save frames with detected objects
    #[serde(default)]
    pub save_with: bool,
    /// Save frames without detected objects
    #[serde(default)]
    pub save_without: bool,
    /// Also save frames that contain only privacy objects
    #[serde(default)]
    pub include_privacy: bool,
    /// Paint privacy objects out of the stored original
    #[serde(default)]
    pub blur: bool,
    /// Store a second image with bounding boxes drawn
    #[serde(default)]
    pub bbox: bool,
    /// Draw boxes around privacy objects too
    #[serde(default = "default_true")]
    pub bbox_include_privacy: bool,
    #[serde(default = "default_output_location")]
    pub output_location: String,
    #[serde(default = "default_file_type")]
    pub file_type: String,
}

/// Model identification reported in `analyser_meta`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_model_version")]
    pub model_version: String,
    /// Class names seeded with a zero count in every result
    #[serde(default)]
    pub class_names: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "frame-analyzer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_username() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_connection_name() -> String {
    "frame-analyzer".to_string()
}

fn default_prefetch_count() -> u16 {
    1
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_in_exchange() -> String {
    "exchange_raw_frames".to_string()
}

fn default_in_queue() -> String {
    "queue_raw_frames".to_string()
}

fn default_out_exchange() -> String {
    "exchange_analysed_frames".to_string()
}

fn default_routing_key() -> String {
    "frame".to_string()
}

fn default_outbound() -> Option<OutboundConfig> {
    Some(OutboundConfig::default())
}

fn default_true() -> bool {
    true
}

fn default_output_location() -> String {
    "output".to_string()
}

fn default_file_type() -> String {
    "jpg".to_string()
}

fn default_model_name() -> String {
    "unknown".to_string()
}

fn default_model_version() -> String {
    "unknown".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: 0,
            hostname: None,
        }
    }
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            exchange: default_in_exchange(),
            queue: default_in_queue(),
            routing_key: default_routing_key(),
        }
    }
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            exchange: default_out_exchange(),
            routing_key: default_routing_key(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            vhost: default_vhost(),
            tls: false,
            connection_name: default_connection_name(),
            prefetch_count: default_prefetch_count(),
            ack_mode: AckMode::default(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            inbound: InboundConfig::default(),
            outbound: default_outbound(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_with: false,
            save_without: false,
            include_privacy: false,
            blur: false,
            bbox: false,
            bbox_include_privacy: true,
            output_location: default_output_location(),
            file_type: default_file_type(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            model_version: default_model_version(),
            class_names: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Build the AMQP URI for this broker.
    ///
    /// Credentials are placed into the URI structure directly, so they never
    /// need escaping.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: if self.tls {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..Default::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// `host:port/vhost`, safe to log
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost_path())
    }

    fn vhost_path(&self) -> String {
        if self.vhost.starts_with('/') {
            self.vhost.clone()
        } else {
            format!("/{}", self.vhost)
        }
    }
}

impl PersistenceConfig {
    pub fn flags(&self) -> PersistenceFlags {
        PersistenceFlags {
            save_with: self.save_with,
            save_without: self.save_without,
            include_privacy: self.include_privacy,
        }
    }
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/analyzer").required(false))
            .add_source(config::File::with_name("/etc/frame-analyzer/analyzer").required(false))
            // ANALYZER__PERSISTENCE__SAVE_WITH=true -> persistence.save_with
            .add_source(
                config::Environment::with_prefix("ANALYZER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::MissingRequired("broker.host".to_string()));
        }

        let inbound = &self.broker.inbound;
        for (key, value) in [
            ("broker.inbound.exchange", &inbound.exchange),
            ("broker.inbound.queue", &inbound.queue),
        ] {
            if value.is_empty() {
                return Err(ConfigError::MissingRequired(key.to_string()));
            }
        }

        if let Some(ref outbound) = self.broker.outbound {
            if outbound.exchange.is_empty() {
                return Err(ConfigError::MissingRequired(
                    "broker.outbound.exchange".to_string(),
                ));
            }
        }

        if self.broker.prefetch_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "broker.prefetch_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.persistence.output_location.is_empty() {
            return Err(ConfigError::MissingRequired(
                "persistence.output_location".to_string(),
            ));
        }

        match self.persistence.file_type.to_lowercase().as_str() {
            "jpg" | "jpeg" | "png" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "persistence.file_type".to_string(),
                    message: format!("unsupported image type '{}'", other),
                })
            }
        }

        match self.service.log_format.as_str() {
            "json" | "text" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "service.log_format".to_string(),
                    message: format!("expected json or text, got '{}'", other),
                })
            }
        }

        Ok(())
    }
}
