//! Frame Analyzer - object detection worker for camera frame streams
//!
//! Consumes raw frames from a RabbitMQ queue, runs them through an object
//! detector and publishes the analyzed result. Along the way it:
//!
//! - Paints privacy objects (faces, license plates) out of a copy of the image
//! - Counts detections per class
//! - Stores images on disk according to the persistence policy
//!
//! # Example
//!
//! ```rust,no_run
//! use frame_analyzer::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let broker = Arc::new(AmqpBroker::new(config.broker.clone()));
//!     let inbound = &config.broker.inbound;
//!     broker
//!         .configure_inbound(&inbound.exchange, &inbound.queue, &inbound.routing_key)
//!         .await?;
//!
//!     let detector = Arc::new(PassthroughDetector::new(ModelInfo::from(&config.detection)));
//!     let images = Arc::new(RasterImageOps::default());
//!     let worker = Arc::new(FrameWorker::new(&config, broker.clone(), detector, images));
//!
//!     broker
//!         .consume(worker, config.broker.ack_mode, CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod detection;
pub mod frame;
pub mod imaging;
pub mod persist;
pub mod policy;
pub mod privacy;
pub mod worker;

// Re-export main types
pub use broker::{
    AckMode, AmqpBroker, Broker, BrokerError, IncomingMessage, MemoryBroker, MessageHandler,
    MessageMetadata, OutgoingMessage,
};
pub use config::{
    BrokerConfig, Config, ConfigError, DetectionConfig, InboundConfig, OutboundConfig,
    PersistenceConfig, ServiceConfig,
};
pub use detection::{DetectionError, DetectionRun, Detector, ModelInfo, PassthroughDetector};
pub use frame::{
    AnalysisMeta, AnalyzedFrame, BoundingBox, DecodeError, DetectedObject, ImageMeta,
    ObjectCounts, Position, RawFrame,
};
pub use imaging::{ImageError, ImageOps, RasterImageOps};
pub use persist::{DiskWriter, PersistError};
pub use policy::{PersistenceAction, PersistenceFlags, PersistencePolicy};
pub use privacy::PrivacyClass;
pub use worker::{FrameWorker, ProcessedFrame, Stage, WorkerError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::{AmqpBroker, Broker, IncomingMessage, MessageHandler, OutgoingMessage};
    pub use crate::config::Config;
    pub use crate::detection::{Detector, ModelInfo, PassthroughDetector};
    pub use crate::frame::{AnalyzedFrame, RawFrame};
    pub use crate::imaging::{ImageOps, RasterImageOps};
    pub use crate::worker::FrameWorker;
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}
