//! The frame worker: one inbound message in, one analyzed frame out.
//!
//! Per message: decode, detect, measure, blur, publish, then persist
//! according to the persistence policy. Publishing happens for every frame
//! that was decoded and analyzed, whatever the policy decides afterwards.
//! Failures after publishing are logged and never undo the publish.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{Broker, IncomingMessage, MessageHandler, OutgoingMessage};
use crate::config::{Config, OutboundConfig};
use crate::detection::{DetectionError, Detector};
use crate::frame::{self, AnalyzedFrame, DecodeError, ImageMeta, RawFrame};
use crate::imaging::{decode_base64, ImageError, ImageOps};
use crate::persist::{DiskWriter, PersistError};
use crate::policy::{PersistenceAction, PersistencePolicy};
use crate::privacy::{self, PrivacyClass};

/// Errors that stop a single frame from being processed
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Malformed message: {0}")]
    Decode(#[from] DecodeError),

    #[error("Detection failed: {0}")]
    Detection(#[from] DetectionError),

    #[error("Image processing failed: {0}")]
    Image(#[from] ImageError),

    #[error("Persistence failed: {0}")]
    Persist(#[from] PersistError),

    #[error("Blocking task failed: {0}")]
    Aborted(String),
}

/// Last pipeline stage a frame completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Analyzed but not published
    Annotated,
    Published,
    Persisted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Annotated => "annotated",
            Stage::Published => "published",
            Stage::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

/// Outcome of processing one frame
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub stream_id: String,
    pub stage: Stage,
    pub objects: usize,
    pub privacy: PrivacyClass,
    pub action: PersistenceAction,
    pub published: bool,
    /// Files written by persistence
    pub written: Vec<PathBuf>,
}

/// Worker settings derived from [`Config`] at construction
#[derive(Debug, Clone)]
struct WorkerSettings {
    outbound: Option<OutboundConfig>,
    blur: bool,
    bbox: bool,
    bbox_include_privacy: bool,
    hostname: String,
}

/// Processes raw frames from the broker
pub struct FrameWorker<B, D, I> {
    broker: Arc<B>,
    detector: Arc<D>,
    images: Arc<I>,
    policy: PersistencePolicy,
    writer: DiskWriter,
    settings: WorkerSettings,
}

impl<B, D, I> FrameWorker<B, D, I>
where
    B: Broker,
    D: Detector,
    I: ImageOps + 'static,
{
    pub fn new(config: &Config, broker: Arc<B>, detector: Arc<D>, images: Arc<I>) -> Self {
        let persistence = &config.persistence;
        let hostname = config
            .service
            .hostname
            .clone()
            .unwrap_or_else(system_hostname);

        if config.broker.outbound.is_none() {
            warn!("No outbound exchange configured, analyzed frames will not be published");
        }

        Self {
            broker,
            detector,
            images,
            policy: PersistencePolicy::new(persistence.flags()),
            writer: DiskWriter::new(&persistence.output_location, &persistence.file_type),
            settings: WorkerSettings {
                outbound: config.broker.outbound.clone(),
                blur: persistence.blur,
                bbox: persistence.bbox,
                bbox_include_privacy: persistence.bbox_include_privacy,
                hostname,
            },
        }
    }

    /// Run one message body through the whole pipeline.
    ///
    /// Returns an error only when the frame never reached publishing.
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    pub async fn process(&self, body: &[u8]) -> Result<ProcessedFrame, WorkerError> {
        let started = Instant::now();
        metrics::counter!("analyzer.frames.received").increment(1);

        let raw = frame::decode(body).map_err(|e| {
            metrics::counter!("analyzer.frames.decode_failed").increment(1);
            e
        })?;
        let stream_id = raw.stream_id.clone();
        debug!(stream_id = %stream_id, taken_at = %raw.taken_at, "Frame decoded");

        let analyzed = self.detect(raw).await.map_err(|e| {
            metrics::counter!("analyzer.frames.detection_failed").increment(1);
            e
        })?;
        let objects = analyzed.detected_objects.len();
        debug!(stream_id = %stream_id, objects, "Detection finished");

        let analyzed = self.annotate(analyzed).await?;

        let published = self.publish(&analyzed).await;
        let mut stage = if published {
            Stage::Published
        } else {
            Stage::Annotated
        };

        let privacy = privacy::classify(&analyzed.object_counts);
        let action = self.policy.decide(analyzed.has_detections(), privacy);

        let written = match self.persist(action, &analyzed).await {
            Ok(written) => written,
            Err(e) => {
                error!(stream_id = %stream_id, action = %action, error = %e, "Failed to persist frame");
                metrics::counter!("analyzer.frames.persist_failed").increment(1);
                Vec::new()
            }
        };
        if !written.is_empty() {
            stage = Stage::Persisted;
            metrics::counter!("analyzer.frames.persisted").increment(1);
        } else if !action.writes() {
            metrics::counter!("analyzer.frames.skipped").increment(1);
        }

        metrics::histogram!("analyzer.frame.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        Ok(ProcessedFrame {
            stream_id,
            stage,
            objects,
            privacy,
            action,
            published,
            written,
        })
    }

    async fn detect(&self, raw: RawFrame) -> Result<AnalyzedFrame, WorkerError> {
        let detector = Arc::clone(&self.detector);
        let analyzed = tokio::task::spawn_blocking(move || detector.detect(&raw))
            .await
            .map_err(|e| DetectionError::Aborted(e.to_string()))??;
        Ok(analyzed)
    }

    /// Attach image metadata and, when objects were found, the blurred image.
    ///
    /// An image that cannot be read leaves both `img_meta` and
    /// `blurred_image` empty; the frame is still published.
    async fn annotate(&self, analyzed: AnalyzedFrame) -> Result<AnalyzedFrame, WorkerError> {
        let images = Arc::clone(&self.images);
        let hostname = self.settings.hostname.clone();

        tokio::task::spawn_blocking(move || {
            let (width, height) = match images.dimensions(&analyzed.frame.image) {
                Ok(dimensions) => dimensions,
                Err(e) => {
                    metrics::counter!("analyzer.frames.unreadable_image").increment(1);
                    warn!(stream_id = %analyzed.frame.stream_id, error = %e, "Failed to read frame image");
                    return analyzed;
                }
            };
            let analyzed = analyzed.with_image_meta(ImageMeta {
                width,
                height,
                hostname,
            });

            if !analyzed.has_detections() {
                return analyzed;
            }

            match images.blur(&analyzed.frame.image, &analyzed.detected_objects) {
                Ok(blurred) => analyzed.with_blurred_image(blurred),
                Err(e) => {
                    warn!(stream_id = %analyzed.frame.stream_id, error = %e, "Failed to blur frame");
                    analyzed
                }
            }
        })
        .await
        .map_err(|e| WorkerError::Aborted(e.to_string()))
    }

    /// Publish the analyzed frame; failures are logged, never returned
    async fn publish(&self, analyzed: &AnalyzedFrame) -> bool {
        let Some(outbound) = &self.settings.outbound else {
            debug!("No outbound exchange, not publishing");
            return false;
        };

        let message = OutgoingMessage::new(
            &outbound.exchange,
            &outbound.routing_key,
            frame::encode(analyzed),
        )
        .with_content_type("application/json")
        .with_message_type("analyzed_frame");

        match self.broker.publish(message).await {
            Ok(()) => {
                metrics::counter!("analyzer.frames.published").increment(1);
                debug!(exchange = %outbound.exchange, "Analyzed frame published");
                true
            }
            Err(e) => {
                metrics::counter!("analyzer.frames.publish_failed").increment(1);
                warn!(exchange = %outbound.exchange, error = %e, "Failed to publish analyzed frame");
                false
            }
        }
    }

    async fn persist(
        &self,
        action: PersistenceAction,
        analyzed: &AnalyzedFrame,
    ) -> Result<Vec<PathBuf>, WorkerError> {
        let frame = &analyzed.frame;
        match action {
            PersistenceAction::Skip => {
                debug!(stream_id = %frame.stream_id, "Not storing frame");
                Ok(Vec::new())
            }
            PersistenceAction::SkipPrivacyOnly => {
                info!(stream_id = %frame.stream_id, "Not storing frame, only privacy objects detected");
                Ok(Vec::new())
            }
            PersistenceAction::SaveNoObjects => {
                let image = decode_base64(&frame.image)?;
                Ok(self.writer.write_no_objects(frame, &image).await?)
            }
            PersistenceAction::SaveWithObjects => {
                let (original, annotated) = self.render(analyzed).await?;
                Ok(self
                    .writer
                    .write_with_objects(frame, &original, annotated.as_deref(), self.settings.blur)
                    .await?)
            }
        }
    }

    /// Image bytes to store: the original (blurred when enabled) and the
    /// optional bounding box copy drawn on top of it
    async fn render(
        &self,
        analyzed: &AnalyzedFrame,
    ) -> Result<(Vec<u8>, Option<Vec<u8>>), WorkerError> {
        let images = Arc::clone(&self.images);
        let settings = self.settings.clone();
        let image = analyzed.frame.image.clone();
        let blurred = analyzed.blurred_image.clone();
        let objects = analyzed.detected_objects.clone();

        tokio::task::spawn_blocking(move || -> Result<_, WorkerError> {
            let original = match (settings.blur, blurred) {
                (true, Some(blurred)) => blurred,
                (true, None) => images.blur(&image, &objects)?,
                (false, _) => image,
            };

            let annotated = if settings.bbox {
                let boxed = images.draw_boxes(&original, &objects, settings.bbox_include_privacy)?;
                Some(decode_base64(&boxed)?)
            } else {
                None
            };

            Ok((decode_base64(&original)?, annotated))
        })
        .await
        .map_err(|e| WorkerError::Aborted(e.to_string()))?
    }
}

#[async_trait]
impl<B, D, I> MessageHandler for FrameWorker<B, D, I>
where
    B: Broker,
    D: Detector,
    I: ImageOps + 'static,
{
    async fn handle(&self, message: &IncomingMessage) -> anyhow::Result<()> {
        let report = self.process(&message.payload).await?;
        info!(
            stream_id = %report.stream_id,
            stage = %report.stage,
            objects = report.objects,
            privacy = ?report.privacy,
            action = %report.action,
            published = report.published,
            files = report.written.len(),
            "Frame processed"
        );
        Ok(())
    }

    async fn on_error(&self, message: &IncomingMessage, error: anyhow::Error) {
        match error.downcast_ref::<WorkerError>() {
            Some(WorkerError::Decode(e)) => warn!(
                delivery_tag = message.metadata.delivery_tag,
                message_type = message.message_type().unwrap_or("unknown"),
                size_bytes = message.payload.len(),
                error = %e,
                "Dropping malformed message"
            ),
            _ => error!(
                delivery_tag = message.metadata.delivery_tag,
                message_type = message.message_type().unwrap_or("unknown"),
                error = %error,
                "Dropping frame"
            ),
        }
    }
}

/// Hostname reported in `img_meta` when none is configured
fn system_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
